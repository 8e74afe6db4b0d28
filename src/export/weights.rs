use burn::{module::Param, nn::Linear, prelude::*};

use super::ExportError;
use crate::model::{LayerKind, LayerSpec, Model};

/// A tensor in web-runtime layout.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedWeight {
    /// `<layer>/<parameter>`, e.g. `conv2d_1/kernel`.
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl NamedWeight {
    fn new(layer: &str, param: &str, shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self {
            name: format!("{layer}/{param}"),
            shape,
            values,
        }
    }

    pub fn num_bytes(&self) -> usize {
        self.values.len() * core::mem::size_of::<f32>()
    }
}

/// Values of one weighted layer, still in burn layout.
enum LayerValues {
    Conv {
        kernel: Vec<f32>,
        kernel_shape: [usize; 4],
        bias: Vec<f32>,
    },
    Norm {
        gamma: Vec<f32>,
        beta: Vec<f32>,
        mean: Vec<f32>,
        var: Vec<f32>,
    },
    Dense {
        kernel: Vec<f32>,
        kernel_shape: [usize; 2],
        bias: Vec<f32>,
    },
}

/// Collect the weights of `model` in channels-last layout, named after `layers`.
pub fn collect<B: Backend>(
    model: &Model<B>,
    layers: &[LayerSpec],
) -> Result<Vec<NamedWeight>, ExportError> {
    let values = layer_values(model)?;
    let weighted: Vec<&LayerSpec> = layers
        .iter()
        .filter(|layer| layer.kind.num_params() > 0)
        .collect();

    if weighted.len() != values.len() {
        return Err(ExportError::LayoutMismatch(format!(
            "layout describes {} weighted layers, the model has {}",
            weighted.len(),
            values.len()
        )));
    }

    let mut weights = Vec::new();
    for (layer, values) in weighted.into_iter().zip(values) {
        match (&layer.kind, values) {
            (
                LayerKind::Conv2d { .. },
                LayerValues::Conv {
                    kernel,
                    kernel_shape,
                    bias,
                },
            ) => {
                let [out, inp, kh, kw] = kernel_shape;
                weights.push(NamedWeight::new(
                    &layer.name,
                    "kernel",
                    vec![kh, kw, inp, out],
                    conv_kernel_to_hwio(&kernel, kernel_shape),
                ));
                weights.push(NamedWeight::new(&layer.name, "bias", vec![out], bias));
            }
            (
                LayerKind::BatchNorm { features, .. },
                LayerValues::Norm {
                    gamma,
                    beta,
                    mean,
                    var,
                },
            ) => {
                let shape = vec![*features];
                weights.push(NamedWeight::new(&layer.name, "gamma", shape.clone(), gamma));
                weights.push(NamedWeight::new(&layer.name, "beta", shape.clone(), beta));
                weights.push(NamedWeight::new(&layer.name, "moving_mean", shape.clone(), mean));
                weights.push(NamedWeight::new(&layer.name, "moving_variance", shape, var));
            }
            (
                LayerKind::Dense { flattened_from, .. },
                LayerValues::Dense {
                    kernel,
                    kernel_shape,
                    bias,
                },
            ) => {
                let [inputs, units] = kernel_shape;
                let kernel = match flattened_from {
                    Some(shape) => channels_last_rows(&kernel, *shape, units),
                    None => kernel,
                };
                weights.push(NamedWeight::new(
                    &layer.name,
                    "kernel",
                    vec![inputs, units],
                    kernel,
                ));
                weights.push(NamedWeight::new(&layer.name, "bias", vec![units], bias));
            }
            (kind, _) => {
                return Err(ExportError::LayoutMismatch(format!(
                    "layer {} ({}) does not match the model parameters",
                    layer.name,
                    kind.class_name()
                )))
            }
        }
    }

    Ok(weights)
}

fn layer_values<B: Backend>(model: &Model<B>) -> Result<Vec<LayerValues>, ExportError> {
    let mut layers = Vec::new();

    for block in model.blocks.iter() {
        for unit in block.units.iter() {
            let kernel = unit.conv.weight.val();
            let kernel_shape = kernel.dims();
            layers.push(LayerValues::Conv {
                kernel: values(kernel)?,
                kernel_shape,
                bias: bias_values(&unit.conv.bias, kernel_shape[0])?,
            });
            layers.push(norm_values(&unit.norm.gamma, &unit.norm.beta, {
                let norm = &unit.norm;
                (norm.running_mean.value(), norm.running_var.value())
            })?);
        }
    }

    for dense in model.hidden.iter() {
        layers.push(dense_values(&dense.linear)?);
        layers.push(norm_values(&dense.norm.gamma, &dense.norm.beta, {
            let norm = &dense.norm;
            (norm.running_mean.value(), norm.running_var.value())
        })?);
    }

    layers.push(dense_values(&model.output)?);

    Ok(layers)
}

fn dense_values<B: Backend>(linear: &Linear<B>) -> Result<LayerValues, ExportError> {
    let kernel = linear.weight.val();
    let kernel_shape = kernel.dims();

    Ok(LayerValues::Dense {
        kernel: values(kernel)?,
        kernel_shape,
        bias: bias_values(&linear.bias, kernel_shape[1])?,
    })
}

fn norm_values<B: Backend>(
    gamma: &Param<Tensor<B, 1>>,
    beta: &Param<Tensor<B, 1>>,
    (mean, var): (Tensor<B, 1>, Tensor<B, 1>),
) -> Result<LayerValues, ExportError> {
    Ok(LayerValues::Norm {
        gamma: values(gamma.val())?,
        beta: values(beta.val())?,
        mean: values(mean)?,
        var: values(var)?,
    })
}

fn bias_values<B: Backend>(
    bias: &Option<Param<Tensor<B, 1>>>,
    size: usize,
) -> Result<Vec<f32>, ExportError> {
    match bias {
        Some(bias) => values(bias.val()),
        None => Ok(vec![0.0; size]),
    }
}

fn values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>, ExportError> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| ExportError::TensorData(format!("{err:?}")))
}

/// Reorder a convolution kernel from `[out, in, kh, kw]` to `[kh, kw, in, out]`.
pub fn conv_kernel_to_hwio(values: &[f32], [out, inp, kh, kw]: [usize; 4]) -> Vec<f32> {
    let mut hwio = vec![0.0; values.len()];

    for o in 0..out {
        for i in 0..inp {
            for h in 0..kh {
                for w in 0..kw {
                    let src = ((o * inp + i) * kh + h) * kw + w;
                    let dst = ((h * kw + w) * inp + i) * out + o;
                    hwio[dst] = values[src];
                }
            }
        }
    }

    hwio
}

/// Reorder the rows of a `[c * h * w, units]` kernel fed by a channels-first flatten
/// so it expects a channels-last flatten instead.
pub fn channels_last_rows(values: &[f32], [c, h, w]: [usize; 3], units: usize) -> Vec<f32> {
    let mut reordered = vec![0.0; values.len()];

    for ch in 0..c {
        for y in 0..h {
            for x in 0..w {
                let src = (ch * h + y) * w + x;
                let dst = (y * w + x) * c + ch;
                reordered[dst * units..(dst + 1) * units]
                    .copy_from_slice(&values[src * units..(src + 1) * units]);
            }
        }
    }

    reordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{layout, ModelConfig};
    use crate::TestBackend;

    #[test]
    fn conv_kernel_moves_to_hwio() {
        // out=2, in=1, 1x2 kernel: values indexed [o][i][h][w].
        let oihw = [1.0, 2.0, 3.0, 4.0];
        let hwio = conv_kernel_to_hwio(&oihw, [2, 1, 1, 2]);

        // [h][w][i][o]: w=0 -> (o0, o1) = (1, 3), w=1 -> (2, 4).
        assert_eq!(hwio, vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn flatten_rows_follow_channels_last_order() {
        // c=2, h=1, w=2, one unit: channels-first rows are [c0w0, c0w1, c1w0, c1w1].
        let rows = [10.0, 11.0, 20.0, 21.0];
        let reordered = channels_last_rows(&rows, [2, 1, 2], 1);

        assert_eq!(reordered, vec![10.0, 20.0, 11.0, 21.0]);
    }

    #[test]
    fn collects_every_parameter_with_keras_names() {
        let config = ModelConfig::new();
        let device = Default::default();
        let model = config.init::<TestBackend>(&device);
        let layers = layout(&config);

        let weights = collect(&model, &layers).unwrap();
        let total: usize = weights.iter().map(|weight| weight.values.len()).sum();

        assert_eq!(total, 471_018);
        assert_eq!(weights[0].name, "conv2d/kernel");
        assert_eq!(weights[0].shape, vec![3, 3, 1, 32]);
        assert_eq!(weights[2].name, "batch_normalization/gamma");
        assert_eq!(weights[5].name, "batch_normalization/moving_variance");

        let flatten_dense = weights
            .iter()
            .find(|weight| weight.name == "dense/kernel")
            .unwrap();
        assert_eq!(flatten_dense.shape, vec![1152, 256]);

        let last = weights.last().unwrap();
        assert_eq!(last.name, "dense_2/bias");
        assert_eq!(last.shape, vec![10]);

        for weight in weights.iter() {
            assert_eq!(weight.values.len(), weight.shape.iter().product::<usize>());
        }
    }

    #[test]
    fn fresh_norm_layers_export_unit_variance() {
        let config = ModelConfig::new();
        let device = Default::default();
        let model = config.init::<TestBackend>(&device);
        let weights = collect(&model, &layout(&config)).unwrap();

        let var = weights
            .iter()
            .find(|weight| weight.name == "batch_normalization_6/moving_variance")
            .unwrap();
        assert_eq!(var.shape, vec![128]);
        assert!(var.values.iter().all(|value| *value == 1.0));
    }

    #[test]
    fn mismatched_layout_is_rejected() {
        let config = ModelConfig::new();
        let device = Default::default();
        let model = config.init::<TestBackend>(&device);
        let mut layers = layout(&config);
        layers.truncate(4);

        assert!(matches!(
            collect(&model, &layers),
            Err(ExportError::LayoutMismatch(_))
        ));
    }
}
