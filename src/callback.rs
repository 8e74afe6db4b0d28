//! Epoch-end callbacks driving the learning rate, early stopping and best checkpoints.

use burn::config::Config;
use serde::{Deserialize, Serialize};

use crate::training::EpochSummary;

/// Quantity watched by a callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Monitor {
    TrainLoss,
    TrainAccuracy,
    ValidLoss,
    ValidAccuracy,
}

/// Whether lower or higher values are better.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Lowest,
    Highest,
}

impl Monitor {
    pub fn name(&self) -> &'static str {
        match self {
            Monitor::TrainLoss => "loss",
            Monitor::TrainAccuracy => "accuracy",
            Monitor::ValidLoss => "val_loss",
            Monitor::ValidAccuracy => "val_accuracy",
        }
    }

    /// Losses improve downwards, accuracies upwards.
    pub fn direction(&self) -> Direction {
        match self {
            Monitor::TrainLoss | Monitor::ValidLoss => Direction::Lowest,
            Monitor::TrainAccuracy | Monitor::ValidAccuracy => Direction::Highest,
        }
    }

    pub fn value(&self, summary: &EpochSummary) -> f64 {
        match self {
            Monitor::TrainLoss => summary.train.loss,
            Monitor::TrainAccuracy => summary.train.accuracy,
            Monitor::ValidLoss => summary.valid.loss,
            Monitor::ValidAccuracy => summary.valid.accuracy,
        }
    }

    fn worst(&self) -> f64 {
        match self.direction() {
            Direction::Lowest => f64::INFINITY,
            Direction::Highest => f64::NEG_INFINITY,
        }
    }

    /// True when `current` beats `best` by more than `min_delta`.
    pub fn improves(&self, current: f64, best: f64, min_delta: f64) -> bool {
        match self.direction() {
            Direction::Lowest => current < best - min_delta,
            Direction::Highest => current - min_delta > best,
        }
    }
}

/// Configuration to create a [ReduceLrOnPlateau] callback.
#[derive(Config, Debug)]
pub struct PlateauConfig {
    #[config(default = "Monitor::ValidLoss")]
    pub monitor: Monitor,
    /// Multiplier applied to the learning rate on a plateau.
    #[config(default = 0.5)]
    pub factor: f64,
    /// Epochs without improvement before reducing.
    #[config(default = 3)]
    pub patience: usize,
    #[config(default = 1e-4)]
    pub min_delta: f64,
    /// Epochs to wait after a reduction before counting again.
    #[config(default = 0)]
    pub cooldown: usize,
    #[config(default = 1e-5)]
    pub min_lr: f64,
}

/// Configuration to create an [EarlyStopping] callback.
#[derive(Config, Debug)]
pub struct EarlyStoppingConfig {
    #[config(default = "Monitor::ValidAccuracy")]
    pub monitor: Monitor,
    #[config(default = 8)]
    pub patience: usize,
    #[config(default = 0.0)]
    pub min_delta: f64,
    /// Keep the weights of the best epoch once training ends.
    #[config(default = true)]
    pub restore_best_weights: bool,
}

/// Multiplies the learning rate by a factor when the monitored value stops improving.
#[derive(Clone, Debug)]
pub struct ReduceLrOnPlateau {
    config: PlateauConfig,
    best: f64,
    wait: usize,
    cooldown_counter: usize,
}

impl PlateauConfig {
    pub fn init(&self) -> ReduceLrOnPlateau {
        ReduceLrOnPlateau {
            best: self.monitor.worst(),
            config: self.clone(),
            wait: 0,
            cooldown_counter: 0,
        }
    }
}

impl ReduceLrOnPlateau {
    /// Returns the learning rate to use for the next epoch.
    pub fn on_epoch_end(&mut self, summary: &EpochSummary, lr: f64) -> f64 {
        let current = self.config.monitor.value(summary);

        if !current.is_finite() {
            log::warn!(
                "{} is not finite; skipping the plateau update",
                self.config.monitor.name()
            );
            return lr;
        }

        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.wait = 0;
        }

        if self
            .config
            .monitor
            .improves(current, self.best, self.config.min_delta)
        {
            self.best = current;
            self.wait = 0;
            return lr;
        }

        if self.cooldown_counter > 0 {
            return lr;
        }

        self.wait += 1;
        if self.wait < self.config.patience {
            return lr;
        }

        if lr <= self.config.min_lr {
            return lr;
        }

        let reduced = (lr * self.config.factor).max(self.config.min_lr);
        self.cooldown_counter = self.config.cooldown;
        self.wait = 0;
        log::info!(
            "Epoch {}: ReduceLROnPlateau reducing learning rate to {reduced:e}.",
            summary.epoch
        );

        reduced
    }
}

/// What the trainer should do after an epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoppingDecision {
    /// The epoch is the best so far.
    Improved,
    Continue,
    Stop,
}

/// Stops training once the monitored value fails to improve for `patience` epochs.
#[derive(Clone, Debug)]
pub struct EarlyStopping {
    config: EarlyStoppingConfig,
    best: f64,
    best_epoch: Option<usize>,
    wait: usize,
}

impl EarlyStoppingConfig {
    pub fn init(&self) -> EarlyStopping {
        EarlyStopping {
            best: self.monitor.worst(),
            config: self.clone(),
            best_epoch: None,
            wait: 0,
        }
    }
}

impl EarlyStopping {
    pub fn on_epoch_end(&mut self, summary: &EpochSummary) -> StoppingDecision {
        let current = self.config.monitor.value(summary);
        self.wait += 1;

        if self
            .config
            .monitor
            .improves(current, self.best, self.config.min_delta)
        {
            self.best = current;
            self.best_epoch = Some(summary.epoch);
            self.wait = 0;
            return StoppingDecision::Improved;
        }

        if self.wait >= self.config.patience && summary.epoch > 1 {
            log::info!("Epoch {}: early stopping", summary.epoch);
            return StoppingDecision::Stop;
        }

        StoppingDecision::Continue
    }

    /// Epoch holding the best monitored value.
    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn restores_best_weights(&self) -> bool {
        self.config.restore_best_weights
    }
}

/// Decides when the model beats every previously saved checkpoint.
#[derive(Clone, Debug)]
pub struct BestCheckpoint {
    monitor: Monitor,
    best: f64,
}

impl BestCheckpoint {
    pub fn new(monitor: Monitor) -> Self {
        Self {
            monitor,
            best: monitor.worst(),
        }
    }

    /// True when the model of this epoch should be saved.
    pub fn on_epoch_end(&mut self, summary: &EpochSummary, path: &std::path::Path) -> bool {
        let current = self.monitor.value(summary);

        if self.monitor.improves(current, self.best, 0.0) {
            log::info!(
                "Epoch {}: {} improved from {:.5} to {current:.5}, saving model to {}",
                summary.epoch,
                self.monitor.name(),
                self.best,
                path.display()
            );
            self.best = current;
            return true;
        }

        log::info!(
            "Epoch {}: {} did not improve from {:.5}",
            summary.epoch,
            self.monitor.name(),
            self.best
        );
        false
    }

    pub fn best(&self) -> f64 {
        self.best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::EpochMetrics;
    use std::path::Path;

    fn summary(epoch: usize, valid_loss: f64, valid_accuracy: f64) -> EpochSummary {
        EpochSummary {
            epoch,
            train: EpochMetrics::new(1.0, 0.5),
            valid: EpochMetrics::new(valid_loss, valid_accuracy),
            learning_rate: 1e-3,
        }
    }

    #[test]
    fn monitor_directions() {
        assert!(Monitor::ValidLoss.improves(0.5, 0.6, 0.0));
        assert!(!Monitor::ValidLoss.improves(0.59995, 0.6, 1e-4));
        assert!(Monitor::ValidAccuracy.improves(0.91, 0.9, 0.0));
        assert!(!Monitor::ValidAccuracy.improves(0.9, 0.9, 0.0));
    }

    #[test]
    fn plateau_halves_after_patience() {
        let mut plateau = PlateauConfig::new().init();
        let mut lr = 1e-3;

        lr = plateau.on_epoch_end(&summary(1, 0.5, 0.9), lr);
        for epoch in 2..4 {
            lr = plateau.on_epoch_end(&summary(epoch, 0.5, 0.9), lr);
            assert_eq!(lr, 1e-3);
        }

        lr = plateau.on_epoch_end(&summary(4, 0.5, 0.9), lr);
        assert_eq!(lr, 5e-4);

        // The wait counter restarts after a reduction.
        lr = plateau.on_epoch_end(&summary(5, 0.5, 0.9), lr);
        assert_eq!(lr, 5e-4);
    }

    #[test]
    fn plateau_resets_on_improvement() {
        let mut plateau = PlateauConfig::new().init();
        let mut lr = 1e-3;

        for (epoch, loss) in [0.5, 0.5, 0.5, 0.4, 0.4, 0.4].into_iter().enumerate() {
            lr = plateau.on_epoch_end(&summary(epoch + 1, loss, 0.9), lr);
        }

        assert_eq!(lr, 1e-3);
    }

    #[test]
    fn plateau_respects_min_lr() {
        let mut plateau = PlateauConfig::new().with_patience(1).init();
        let mut lr = 3e-5;

        lr = plateau.on_epoch_end(&summary(1, 0.5, 0.9), lr);
        lr = plateau.on_epoch_end(&summary(2, 0.5, 0.9), lr);
        assert_eq!(lr, 1.5e-5);

        lr = plateau.on_epoch_end(&summary(3, 0.5, 0.9), lr);
        assert_eq!(lr, 1e-5);

        lr = plateau.on_epoch_end(&summary(4, 0.5, 0.9), lr);
        assert_eq!(lr, 1e-5);
    }

    #[test]
    fn plateau_ignores_non_finite_values() {
        let mut plateau = PlateauConfig::new().with_patience(1).init();

        let lr = plateau.on_epoch_end(&summary(1, f64::NAN, 0.9), 1e-3);
        assert_eq!(lr, 1e-3);
    }

    #[test]
    fn early_stopping_after_patience() {
        let mut stopping = EarlyStoppingConfig::new().with_patience(2).init();

        assert_eq!(
            stopping.on_epoch_end(&summary(1, 0.3, 0.90)),
            StoppingDecision::Improved
        );
        assert_eq!(
            stopping.on_epoch_end(&summary(2, 0.3, 0.95)),
            StoppingDecision::Improved
        );
        assert_eq!(
            stopping.on_epoch_end(&summary(3, 0.3, 0.95)),
            StoppingDecision::Continue
        );
        assert_eq!(
            stopping.on_epoch_end(&summary(4, 0.3, 0.94)),
            StoppingDecision::Stop
        );
        assert_eq!(stopping.best_epoch(), Some(2));
        assert!(stopping.restores_best_weights());
    }

    #[test]
    fn checkpoint_saves_strict_improvements_only() {
        let mut checkpoint = BestCheckpoint::new(Monitor::ValidAccuracy);
        let path = Path::new("best_mnist_model");

        assert!(checkpoint.on_epoch_end(&summary(1, 0.3, 0.97), path));
        assert!(!checkpoint.on_epoch_end(&summary(2, 0.3, 0.97), path));
        assert!(checkpoint.on_epoch_end(&summary(3, 0.3, 0.98), path));
        assert!(!checkpoint.on_epoch_end(&summary(4, 0.3, 0.96), path));
        assert_eq!(checkpoint.best(), 0.98);
    }
}
