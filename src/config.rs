use std::path::{Path, PathBuf};

use burn::{config::Config, optim::AdamConfig};
use serde::{Deserialize, Serialize};

use crate::callback::{EarlyStoppingConfig, Monitor, PlateauConfig};
use crate::data::augment::AugmentationConfig;
use crate::error::Error;
use crate::model::ModelConfig;

/// Where training artifacts are written.
///
/// Record paths have no extension, the recorder appends its own.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Best model seen during training.
    pub checkpoint: PathBuf,
    /// Final model.
    pub model: PathBuf,
    /// Directory receiving `model.json` and the weight shards.
    pub web_model_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            checkpoint: PathBuf::from("best_mnist_model"),
            model: PathBuf::from("models/mnist_model"),
            web_model_dir: PathBuf::from("static/model"),
        }
    }
}

impl OutputConfig {
    /// Every output path resolved against `root`.
    pub fn rooted_at(&self, root: &Path) -> Self {
        Self {
            checkpoint: root.join(&self.checkpoint),
            model: root.join(&self.model),
            web_model_dir: root.join(&self.web_model_dir),
        }
    }

    /// Directory holding the final model, its config and the training history.
    pub fn model_dir(&self) -> PathBuf {
        self.model
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }
}

#[derive(Config)]
pub struct TrainingConfig {
    #[config(default = "ModelConfig::new()")]
    pub model: ModelConfig,
    #[config(default = "AdamConfig::new().with_epsilon(1e-7)")]
    pub optimizer: AdamConfig,
    #[config(default = "AugmentationConfig::new()")]
    pub augmentation: AugmentationConfig,
    #[config(default = "PlateauConfig::new()")]
    pub plateau: PlateauConfig,
    #[config(default = "EarlyStoppingConfig::new()")]
    pub early_stopping: EarlyStoppingConfig,
    /// Metric deciding which epoch is saved as the best checkpoint.
    #[config(default = "Monitor::ValidAccuracy")]
    pub checkpoint_monitor: Monitor,
    #[config(default = "OutputConfig::default()")]
    pub output: OutputConfig,
    #[config(default = 30)]
    pub num_epochs: usize,
    #[config(default = 128)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    /// Trailing fraction of the training set held out for validation.
    #[config(default = 0.15)]
    pub validation_split: f64,
    #[config(default = true)]
    pub augment: bool,
}

impl TrainingConfig {
    /// Load a configuration file, or the defaults when `path` is `None`.
    pub fn from_file(path: Option<&Path>) -> crate::Result<Self> {
        let config = match path {
            Some(path) => Self::load(path)
                .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?,
            None => Self::new(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the training loop cannot work with.
    pub fn validate(&self) -> crate::Result<()> {
        if !(self.validation_split > 0.0 && self.validation_split < 1.0) {
            return Err(Error::Config(format!(
                "validation_split must be within (0, 1), got {}",
                self.validation_split
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if self.num_epochs == 0 {
            return Err(Error::Config("num_epochs must be positive".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_reference_run() {
        let config = TrainingConfig::new();

        assert_eq!(config.num_epochs, 30);
        assert_eq!(config.batch_size, 128);
        assert_eq!(config.validation_split, 0.15);
        assert_eq!(config.learning_rate, 1e-3);
        assert_eq!(config.plateau.patience, 3);
        assert_eq!(config.early_stopping.patience, 8);
        assert_eq!(config.checkpoint_monitor, Monitor::ValidAccuracy);
        assert_eq!(config.output.web_model_dir, PathBuf::from("static/model"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(TrainingConfig::new()
            .with_validation_split(1.0)
            .validate()
            .is_err());
        assert!(TrainingConfig::new().with_batch_size(0).validate().is_err());
        assert!(TrainingConfig::new().with_num_epochs(0).validate().is_err());
        assert!(TrainingConfig::new()
            .with_learning_rate(-1.0)
            .validate()
            .is_err());
    }

    #[test]
    fn saves_and_loads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = TrainingConfig::new().with_num_epochs(3).with_augment(false);

        config.save(&path).unwrap();
        let loaded = TrainingConfig::from_file(Some(&path)).unwrap();

        assert_eq!(loaded.num_epochs, 3);
        assert!(!loaded.augment);
        assert_eq!(loaded.output, OutputConfig::default());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let result = TrainingConfig::from_file(Some(Path::new("does/not/exist.json")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn outputs_resolve_against_a_root() {
        let output = OutputConfig::default().rooted_at(Path::new("/tmp/run"));

        assert_eq!(output.model, PathBuf::from("/tmp/run/models/mnist_model"));
        assert_eq!(output.model_dir(), PathBuf::from("/tmp/run/models"));
    }
}
