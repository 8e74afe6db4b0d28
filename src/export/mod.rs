//! Conversion of a trained model to the layers-model format loaded by web runtimes.
//!
//! The export writes `model.json`, holding a Keras `Sequential` topology and the
//! weights manifest, next to binary shards of little-endian `f32` values.

mod shards;
mod topology;
mod weights;

pub use shards::*;
pub use topology::*;
pub use weights::*;

use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::model::{layout, Model, ModelConfig};

pub const MODEL_JSON: &str = "model.json";

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("cannot read tensor values: {0}")]
    TensorData(String),
    #[error("model does not match its layout: {0}")]
    LayoutMismatch(String),
    #[error("shard size of {0} bytes cannot hold a single value")]
    ShardSize(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Content of `model.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelJson {
    pub format: String,
    pub generated_by: String,
    pub converted_by: String,
    pub model_topology: serde_json::Value,
    pub weights_manifest: Vec<WeightGroup>,
}

/// Files produced by [export_web_model].
#[derive(Clone, Debug)]
pub struct WebExport {
    pub model_json: PathBuf,
    pub shards: Vec<PathBuf>,
    pub num_weights: usize,
}

/// Write `model` to `dir` in layers-model format, with shards of the default size.
pub fn export_web_model<B: Backend>(
    model: &Model<B>,
    config: &ModelConfig,
    dir: &Path,
) -> Result<WebExport, ExportError> {
    export_web_model_sharded(model, config, dir, DEFAULT_SHARD_BYTES)
}

pub fn export_web_model_sharded<B: Backend>(
    model: &Model<B>,
    config: &ModelConfig,
    dir: &Path,
    shard_bytes: usize,
) -> Result<WebExport, ExportError> {
    let layers = layout(config);
    let weights = collect(model, &layers)?;

    fs::create_dir_all(dir)?;
    let (group, shards) = write_shards(&weights, dir, shard_bytes)?;

    let model_json = ModelJson {
        format: "layers-model".to_string(),
        generated_by: format!("keras v{KERAS_VERSION}"),
        converted_by: format!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        model_topology: model_topology(&layers),
        weights_manifest: vec![group],
    };

    let path = dir.join(MODEL_JSON);
    serde_json::to_writer(BufWriter::new(File::create(&path)?), &model_json)?;

    log::info!(
        "Exported {} weights to {} ({} shard(s))",
        weights.len(),
        dir.display(),
        shards.len()
    );

    Ok(WebExport {
        model_json: path,
        shards,
        num_weights: weights.len(),
    })
}
