//! The digit classifier: three convolutional blocks followed by a dense head.

mod layout;

pub use layout::*;

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    prelude::*,
    tensor::activation::softmax,
};

/// Filters and number of convolutions of each convolutional block.
pub const CONV_BLOCKS: [(usize, usize); 3] = [(32, 2), (64, 2), (128, 1)];

/// Units of the hidden dense layers.
pub const DENSE_UNITS: [usize; 2] = [256, 128];

#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 10)]
    pub num_classes: usize,
    #[config(default = 1)]
    pub channels: usize,
    #[config(default = 28)]
    pub image_size: usize,
    #[config(default = 0.25)]
    pub conv_dropout: f64,
    #[config(default = 0.5)]
    pub dense_dropout: f64,
    /// Batch-norm epsilon.
    #[config(default = 1e-3)]
    pub norm_epsilon: f64,
    /// Weight of the current batch statistics in the running averages.
    #[config(default = 0.01)]
    pub norm_momentum: f64,
}

/// Convolution, activation and batch normalization.
#[derive(Module, Debug)]
pub struct ConvUnit<B: Backend> {
    pub(crate) conv: Conv2d<B>,
    pub(crate) norm: BatchNorm<B, 2>,
    activation: Relu,
}

/// A stack of convolution units closed by pooling and dropout.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub(crate) units: Vec<ConvUnit<B>>,
    pool: MaxPool2d,
    dropout: Dropout,
}

/// Dense layer, activation, batch normalization and dropout.
#[derive(Module, Debug)]
pub struct DenseBlock<B: Backend> {
    pub(crate) linear: Linear<B>,
    pub(crate) norm: BatchNorm<B, 0>,
    activation: Relu,
    dropout: Dropout,
}

#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    pub(crate) blocks: Vec<ConvBlock<B>>,
    pub(crate) hidden: Vec<DenseBlock<B>>,
    pub(crate) output: Linear<B>,
}

impl<B: Backend> ConvUnit<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = self.activation.forward(x);

        self.norm.forward(x)
    }
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input;

        for unit in self.units.iter() {
            x = unit.forward(x);
        }

        let x = self.pool.forward(x);
        self.dropout.forward(x)
    }
}

impl<B: Backend> DenseBlock<B> {
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.linear.forward(input);
        let x = self.activation.forward(x);
        let x = self.norm.forward(x);

        self.dropout.forward(x)
    }
}

impl<B: Backend> Model<B> {
    /// Class logits.
    ///
    /// # Shapes
    ///   - Images [batch_size, channels, height, width]
    ///   - Output [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;

        for block in self.blocks.iter() {
            x = block.forward(x);
        }

        let mut x = x.flatten::<2>(1, 3);

        for dense in self.hidden.iter() {
            x = dense.forward(x);
        }

        self.output.forward(x)
    }

    /// Class probabilities.
    pub fn infer(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }
}

impl ModelConfig {
    /// Side length of the feature maps entering the dense head.
    pub fn feature_size(&self) -> usize {
        CONV_BLOCKS
            .iter()
            .fold(self.image_size, |size, _| size / 2)
    }

    /// Number of features produced by the flatten layer.
    pub fn flatten_features(&self) -> usize {
        let (filters, _) = CONV_BLOCKS[CONV_BLOCKS.len() - 1];
        filters * self.feature_size() * self.feature_size()
    }

    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        let mut in_channels = self.channels;
        let blocks = CONV_BLOCKS
            .iter()
            .map(|&(filters, convs)| {
                let units = (0..convs)
                    .map(|_| {
                        let unit = ConvUnit {
                            conv: Conv2dConfig::new([in_channels, filters], [3, 3])
                                .with_padding(PaddingConfig2d::Same)
                                .init(device),
                            norm: self.norm_config(filters).init(device),
                            activation: Relu::new(),
                        };
                        in_channels = filters;
                        unit
                    })
                    .collect();

                ConvBlock {
                    units,
                    pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
                    dropout: DropoutConfig::new(self.conv_dropout).init(),
                }
            })
            .collect();

        let mut in_features = self.flatten_features();
        let hidden = DENSE_UNITS
            .iter()
            .map(|&units| {
                let block = DenseBlock {
                    linear: LinearConfig::new(in_features, units).init(device),
                    norm: self.norm_config(units).init(device),
                    activation: Relu::new(),
                    dropout: DropoutConfig::new(self.dense_dropout).init(),
                };
                in_features = units;
                block
            })
            .collect();

        Model {
            blocks,
            hidden,
            output: LinearConfig::new(in_features, self.num_classes).init(device),
        }
    }

    fn norm_config(&self, num_features: usize) -> BatchNormConfig {
        BatchNormConfig::new(num_features)
            .with_epsilon(self.norm_epsilon)
            .with_momentum(self.norm_momentum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TestAutodiffBackend, TestBackend};

    #[test]
    fn forward_yields_one_logit_per_class() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::zeros([2, 1, 28, 28], &device);

        assert_eq!(model.forward(images).dims(), [2, 10]);
    }

    #[test]
    fn infer_returns_probabilities() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::ones([3, 1, 28, 28], &device);

        let sums = model.infer(images).sum_dim(1).into_data().to_vec::<f32>().unwrap();
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn training_forward_accepts_batches() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestAutodiffBackend>(&device);
        let images = Tensor::<TestAutodiffBackend, 4>::random(
            [4, 1, 28, 28],
            burn::tensor::Distribution::Default,
            &device,
        );

        assert_eq!(model.forward(images).dims(), [4, 10]);
    }

    #[test]
    fn flatten_size_follows_pooling() {
        let config = ModelConfig::new();

        assert_eq!(config.feature_size(), 3);
        assert_eq!(config.flatten_features(), 1152);
    }
}
