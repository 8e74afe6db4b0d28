use core::fmt;
use std::collections::HashMap;

use super::{ModelConfig, CONV_BLOCKS, DENSE_UNITS};

/// Activation fused into a layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Softmax,
}

impl Activation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Activation::Relu => "relu",
            Activation::Softmax => "softmax",
        }
    }
}

/// Layer of the network as seen by the summary and the web export.
#[derive(Clone, Debug, PartialEq)]
pub enum LayerKind {
    Input,
    Conv2d {
        in_channels: usize,
        filters: usize,
        kernel_size: usize,
    },
    BatchNorm {
        features: usize,
        epsilon: f64,
        momentum: f64,
    },
    MaxPool {
        pool_size: usize,
    },
    Dropout {
        rate: f64,
    },
    Flatten,
    Dense {
        inputs: usize,
        units: usize,
        activation: Activation,
        /// Channels-first `[channels, height, width]` shape flattened into the inputs.
        flattened_from: Option<[usize; 3]>,
    },
}

/// One named layer with its channels-last output shape (batch dimension omitted).
#[derive(Clone, Debug, PartialEq)]
pub struct LayerSpec {
    pub name: String,
    pub kind: LayerKind,
    pub output_shape: Vec<usize>,
}

impl LayerKind {
    /// Keras class name.
    pub fn class_name(&self) -> &'static str {
        match self {
            LayerKind::Input => "InputLayer",
            LayerKind::Conv2d { .. } => "Conv2D",
            LayerKind::BatchNorm { .. } => "BatchNormalization",
            LayerKind::MaxPool { .. } => "MaxPooling2D",
            LayerKind::Dropout { .. } => "Dropout",
            LayerKind::Flatten => "Flatten",
            LayerKind::Dense { .. } => "Dense",
        }
    }

    fn base_name(&self) -> &'static str {
        match self {
            LayerKind::Input => "input",
            LayerKind::Conv2d { .. } => "conv2d",
            LayerKind::BatchNorm { .. } => "batch_normalization",
            LayerKind::MaxPool { .. } => "max_pooling2d",
            LayerKind::Dropout { .. } => "dropout",
            LayerKind::Flatten => "flatten",
            LayerKind::Dense { .. } => "dense",
        }
    }

    /// Number of stored values, moving statistics included.
    pub fn num_params(&self) -> usize {
        match self {
            LayerKind::Conv2d {
                in_channels,
                filters,
                kernel_size,
            } => kernel_size * kernel_size * in_channels * filters + filters,
            LayerKind::BatchNorm { features, .. } => 4 * features,
            LayerKind::Dense { inputs, units, .. } => inputs * units + units,
            _ => 0,
        }
    }

    /// Moving statistics, which are not updated by the optimizer.
    pub fn non_trainable_params(&self) -> usize {
        match self {
            LayerKind::BatchNorm { features, .. } => 2 * features,
            _ => 0,
        }
    }
}

/// Ordered layers of the network described by `config`.
pub fn layout(config: &ModelConfig) -> Vec<LayerSpec> {
    let mut builder = LayoutBuilder::default();
    let mut size = config.image_size;
    let mut channels = config.channels;

    builder.push(LayerKind::Input, vec![size, size, channels]);

    for (filters, convs) in CONV_BLOCKS {
        for _ in 0..convs {
            builder.push(
                LayerKind::Conv2d {
                    in_channels: channels,
                    filters,
                    kernel_size: 3,
                },
                vec![size, size, filters],
            );
            builder.push(config.norm_kind(filters), vec![size, size, filters]);
            channels = filters;
        }

        size /= 2;
        builder.push(LayerKind::MaxPool { pool_size: 2 }, vec![size, size, channels]);
        builder.push(
            LayerKind::Dropout {
                rate: config.conv_dropout,
            },
            vec![size, size, channels],
        );
    }

    let mut inputs = channels * size * size;
    builder.push(LayerKind::Flatten, vec![inputs]);

    let mut flattened_from = Some([channels, size, size]);
    for units in DENSE_UNITS {
        builder.push(
            LayerKind::Dense {
                inputs,
                units,
                activation: Activation::Relu,
                flattened_from: flattened_from.take(),
            },
            vec![units],
        );
        builder.push(config.norm_kind(units), vec![units]);
        builder.push(
            LayerKind::Dropout {
                rate: config.dense_dropout,
            },
            vec![units],
        );
        inputs = units;
    }

    builder.push(
        LayerKind::Dense {
            inputs,
            units: config.num_classes,
            activation: Activation::Softmax,
            flattened_from: None,
        },
        vec![config.num_classes],
    );

    builder.layers
}

impl ModelConfig {
    fn norm_kind(&self, features: usize) -> LayerKind {
        LayerKind::BatchNorm {
            features,
            epsilon: self.norm_epsilon,
            momentum: self.norm_momentum,
        }
    }
}

/// Names layers the way Keras does: `dense`, `dense_1`, `dense_2`, ...
#[derive(Default)]
struct LayoutBuilder {
    counters: HashMap<&'static str, usize>,
    layers: Vec<LayerSpec>,
}

impl LayoutBuilder {
    fn push(&mut self, kind: LayerKind, output_shape: Vec<usize>) {
        let base = kind.base_name();
        let count = self.counters.entry(base).or_insert(0);
        let name = match *count {
            0 => base.to_string(),
            n => format!("{base}_{n}"),
        };
        *count += 1;

        self.layers.push(LayerSpec {
            name,
            kind,
            output_shape,
        });
    }
}

/// Printable table of the layers, their output shapes and parameter counts.
pub struct Summary<'a> {
    layers: &'a [LayerSpec],
}

impl<'a> Summary<'a> {
    pub fn new(layers: &'a [LayerSpec]) -> Self {
        Self { layers }
    }

    pub fn total_params(&self) -> usize {
        self.layers.iter().map(|layer| layer.kind.num_params()).sum()
    }

    pub fn non_trainable_params(&self) -> usize {
        self.layers
            .iter()
            .map(|layer| layer.kind.non_trainable_params())
            .sum()
    }
}

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(72);
        writeln!(f, "{:<40}{:<20}{:>12}", "Layer (type)", "Output Shape", "Param #")?;
        writeln!(f, "{rule}")?;

        for layer in self.layers.iter() {
            let shape = layer
                .output_shape
                .iter()
                .map(|dim| dim.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(
                f,
                "{:<40}{:<20}{:>12}",
                format!("{} ({})", layer.name, layer.kind.class_name()),
                format!("(None, {shape})"),
                layer.kind.num_params()
            )?;
        }

        let total = self.total_params();
        let non_trainable = self.non_trainable_params();
        writeln!(f, "{rule}")?;
        writeln!(f, "Total params: {total}")?;
        writeln!(f, "Trainable params: {}", total - non_trainable)?;
        write!(f, "Non-trainable params: {non_trainable}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_count_matches_topology() {
        let layers = layout(&ModelConfig::new());
        let summary = Summary::new(&layers);

        assert_eq!(summary.total_params(), 471_018);
        assert_eq!(summary.non_trainable_params(), 1_408);
    }

    #[test]
    fn layers_are_named_like_keras() {
        let layers = layout(&ModelConfig::new());
        let names: Vec<&str> = layers.iter().map(|layer| layer.name.as_str()).collect();

        assert_eq!(names[0], "input");
        assert_eq!(names[1], "conv2d");
        assert_eq!(names[2], "batch_normalization");
        assert_eq!(names[3], "conv2d_1");
        assert!(names.contains(&"conv2d_4"));
        assert!(names.contains(&"max_pooling2d_2"));
        assert_eq!(names[names.len() - 1], "dense_2");
        assert_eq!(layers.len(), 25);
    }

    #[test]
    fn first_dense_layer_knows_the_flattened_shape() {
        let layers = layout(&ModelConfig::new());
        let flattened: Vec<_> = layers
            .iter()
            .filter_map(|layer| match layer.kind {
                LayerKind::Dense { flattened_from, .. } => Some(flattened_from),
                _ => None,
            })
            .collect();

        assert_eq!(flattened, vec![Some([128, 3, 3]), None, None]);
    }

    #[test]
    fn summary_lists_every_layer() {
        let layers = layout(&ModelConfig::new());
        let table = Summary::new(&layers).to_string();

        assert!(table.contains("conv2d_4 (Conv2D)"));
        assert!(table.contains("(None, 3, 3, 128)"));
        assert!(table.contains("Total params: 471018"));
    }
}
