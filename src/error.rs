use std::path::PathBuf;

use crate::data::idx::IdxError;
use crate::export::ExportError;

/// Result alias used across the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors raised while training, evaluating or persisting a model.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration is out of range or could not be read.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The dataset could not be loaded.
    #[error("failed to load dataset: {0}")]
    Dataset(String),

    /// An IDX file could not be parsed.
    #[error("failed to read {path}: {source}")]
    Idx {
        /// File being parsed.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: IdxError,
    },

    /// A model record could not be saved or restored.
    #[error("model record {path}: {reason}")]
    Record {
        /// Path of the record, without extension.
        path: PathBuf,
        /// Recorder message.
        reason: String,
    },

    /// No usable compute device.
    #[error("device unavailable: {0}")]
    Device(String),

    /// Web-format export failed.
    #[error(transparent)]
    Export(#[from] ExportError),

    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Serialization of history or config failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn record(path: impl Into<PathBuf>, reason: impl core::fmt::Display) -> Self {
        Self::Record {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
