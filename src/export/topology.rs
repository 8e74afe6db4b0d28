use serde_json::{json, Value};

use crate::model::{LayerKind, LayerSpec};

/// Keras version advertised in the topology.
pub const KERAS_VERSION: &str = "2.15.0";

/// The `modelTopology` entry describing `layers` as a Keras `Sequential` model.
///
/// Layers are channels-last, the input layer is folded into the first entry of the
/// sequential config the way Keras serializes it.
pub fn model_topology(layers: &[LayerSpec]) -> Value {
    json!({
        "keras_version": KERAS_VERSION,
        "backend": "tensorflow",
        "model_config": {
            "class_name": "Sequential",
            "config": {
                "name": "sequential",
                "layers": layers.iter().map(layer_config).collect::<Vec<_>>(),
            },
        },
    })
}

fn layer_config(layer: &LayerSpec) -> Value {
    let name = layer.name.as_str();
    let config = match &layer.kind {
        LayerKind::Input => {
            let mut shape = vec![Value::Null];
            shape.extend(layer.output_shape.iter().map(|dim| json!(dim)));
            json!({
                "batch_input_shape": shape,
                "dtype": "float32",
                "sparse": false,
                "ragged": false,
                "name": name,
            })
        }
        LayerKind::Conv2d {
            filters,
            kernel_size,
            ..
        } => json!({
            "name": name,
            "trainable": true,
            "dtype": "float32",
            "filters": filters,
            "kernel_size": [kernel_size, kernel_size],
            "strides": [1, 1],
            "padding": "same",
            "data_format": "channels_last",
            "dilation_rate": [1, 1],
            "groups": 1,
            "activation": "relu",
            "use_bias": true,
        }),
        LayerKind::BatchNorm {
            epsilon, momentum, ..
        } => json!({
            "name": name,
            "trainable": true,
            "dtype": "float32",
            "axis": -1,
            // Keras weighs the running average, burn weighs the new batch.
            "momentum": 1.0 - momentum,
            "epsilon": epsilon,
            "center": true,
            "scale": true,
        }),
        LayerKind::MaxPool { pool_size } => json!({
            "name": name,
            "trainable": true,
            "dtype": "float32",
            "pool_size": [pool_size, pool_size],
            "padding": "valid",
            "strides": [pool_size, pool_size],
            "data_format": "channels_last",
        }),
        LayerKind::Dropout { rate } => json!({
            "name": name,
            "trainable": true,
            "dtype": "float32",
            "rate": rate,
        }),
        LayerKind::Flatten => json!({
            "name": name,
            "trainable": true,
            "dtype": "float32",
            "data_format": "channels_last",
        }),
        LayerKind::Dense {
            units, activation, ..
        } => json!({
            "name": name,
            "trainable": true,
            "dtype": "float32",
            "units": units,
            "activation": activation.as_str(),
            "use_bias": true,
        }),
    };

    json!({
        "class_name": layer.kind.class_name(),
        "config": config,
    })
}
