//! The training loop: fit with epoch-end callbacks, evaluate, save and export.

use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::{vision::MnistItem, Dataset},
    },
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{GradientsParams, Optimizer},
    prelude::*,
    record::DefaultRecorder,
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};

use crate::callback::{BestCheckpoint, StoppingDecision};
use crate::config::{OutputConfig, TrainingConfig};
use crate::data::{split_validation, MnistBatch, MnistBatcher, MnistSplits};
use crate::error::{Error, Result};
use crate::export::{export_web_model, WebExport};
use crate::model::{layout, Model, ModelConfig, Summary};

pub const CONFIG_FILE: &str = "config.json";
pub const HISTORY_FILE: &str = "history.json";

/// Loss and accuracy averaged over every sample of an epoch.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

impl EpochMetrics {
    pub fn new(loss: f64, accuracy: f64) -> Self {
        Self { loss, accuracy }
    }
}

/// Metrics of one epoch, as stored in the training history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    /// One-based epoch number.
    pub epoch: usize,
    pub train: EpochMetrics,
    pub valid: EpochMetrics,
    /// Learning rate used during the epoch.
    pub learning_rate: f64,
}

/// Sums batch losses weighted by batch size and counts correct predictions.
#[derive(Default, Debug)]
struct MetricsAccumulator {
    loss_sum: f64,
    correct: usize,
    items: usize,
}

impl MetricsAccumulator {
    fn update<B: Backend>(&mut self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>, loss: f64) {
        let batch_size = targets.dims()[0];
        let predictions = logits.argmax(1).squeeze::<1>(1);
        let correct = predictions
            .equal(targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();

        self.loss_sum += loss * batch_size as f64;
        self.correct += correct as usize;
        self.items += batch_size;
    }

    fn finish(&self) -> EpochMetrics {
        if self.items == 0 {
            return EpochMetrics::new(f64::NAN, 0.0);
        }

        EpochMetrics::new(
            self.loss_sum / self.items as f64,
            self.correct as f64 / self.items as f64,
        )
    }
}

/// Result of [fit].
#[derive(Debug)]
pub struct TrainingOutcome<B: Backend> {
    /// Final weights, restored from the best epoch when early stopping asks for it.
    pub model: Model<B>,
    pub history: Vec<EpochSummary>,
    /// Epoch with the best early-stopping metric.
    pub best_epoch: Option<usize>,
    pub stopped_early: bool,
}

/// Train `model` until `num_epochs` or early stopping, saving the best checkpoint
/// to `checkpoint` whenever the monitored metric improves.
pub fn fit<B: AutodiffBackend>(
    config: &TrainingConfig,
    mut model: Model<B>,
    dataloader_train: &dyn DataLoader<B, MnistBatch<B>>,
    dataloader_valid: &dyn DataLoader<B::InnerBackend, MnistBatch<B::InnerBackend>>,
    checkpoint: &Path,
) -> Result<TrainingOutcome<B::InnerBackend>> {
    let mut optim = config.optimizer.init::<B, Model<B>>();
    let mut plateau = config.plateau.init();
    let mut stopping = config.early_stopping.init();
    let mut best_checkpoint = BestCheckpoint::new(config.checkpoint_monitor);

    let mut lr = config.learning_rate;
    let mut history = Vec::with_capacity(config.num_epochs);
    let mut best_model = None;
    let mut stopped_early = false;

    log::info!(
        "Training on {} samples, validating on {} samples",
        dataloader_train.num_items(),
        dataloader_valid.num_items()
    );

    for epoch in 1..config.num_epochs + 1 {
        let start = Instant::now();
        let mut train_metrics = MetricsAccumulator::default();

        for batch in dataloader_train.iter() {
            let logits = model.forward(batch.images);
            let loss = CrossEntropyLossConfig::new()
                .init(&logits.device())
                .forward(logits.clone(), batch.targets.clone());
            let loss_value = loss.clone().into_scalar().elem::<f64>();

            train_metrics.update(logits, batch.targets, loss_value);

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(lr, model, grads);
        }

        let valid_model = model.valid();
        let summary = EpochSummary {
            epoch,
            train: train_metrics.finish(),
            valid: evaluate(&valid_model, dataloader_valid),
            learning_rate: lr,
        };

        log::info!(
            "Epoch {}/{} - {:.0}s - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4} - lr: {:.1e}",
            epoch,
            config.num_epochs,
            start.elapsed().as_secs_f64(),
            summary.train.loss,
            summary.train.accuracy,
            summary.valid.loss,
            summary.valid.accuracy,
            lr
        );

        lr = plateau.on_epoch_end(&summary, lr);
        let decision = stopping.on_epoch_end(&summary);

        if decision == StoppingDecision::Improved && stopping.restores_best_weights() {
            best_model = Some(valid_model.clone());
        }
        if best_checkpoint.on_epoch_end(&summary, checkpoint) {
            save_model(&valid_model, checkpoint)?;
        }

        history.push(summary);

        if decision == StoppingDecision::Stop {
            stopped_early = true;
            break;
        }
    }

    let model = match best_model {
        Some(best) => {
            if let Some(epoch) = stopping.best_epoch() {
                log::info!("Restoring model weights from the end of the best epoch: {epoch}.");
            }
            best
        }
        None => model.valid(),
    };

    Ok(TrainingOutcome {
        model,
        history,
        best_epoch: stopping.best_epoch(),
        stopped_early,
    })
}

/// Loss and accuracy of `model` over every batch of `dataloader`.
pub fn evaluate<B: Backend>(
    model: &Model<B>,
    dataloader: &dyn DataLoader<B, MnistBatch<B>>,
) -> EpochMetrics {
    let mut metrics = MetricsAccumulator::default();

    for batch in dataloader.iter() {
        let logits = model.forward(batch.images);
        let loss = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits.clone(), batch.targets.clone());

        metrics.update(logits, batch.targets, loss.into_scalar().elem::<f64>());
    }

    metrics.finish()
}

/// Build a data loader over `dataset` placing batches on `device`.
pub fn dataloader<B, D>(
    batcher: MnistBatcher,
    dataset: D,
    config: &TrainingConfig,
    device: &B::Device,
    shuffle: bool,
) -> Arc<dyn DataLoader<B, MnistBatch<B>>>
where
    B: Backend,
    D: Dataset<MnistItem> + 'static,
{
    let mut builder = DataLoaderBuilder::new(batcher)
        .batch_size(config.batch_size)
        .set_device(device.clone());

    if shuffle {
        builder = builder.shuffle(config.seed);
    }
    if config.num_workers > 0 {
        builder = builder.num_workers(config.num_workers);
    }

    builder.build(dataset)
}

/// Save `model` to `path`; the recorder adds the file extension.
pub fn save_model<B: Backend>(model: &Model<B>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    model
        .clone()
        .save_file(path, &DefaultRecorder::new())
        .map_err(|err| Error::record(path, format!("{err:?}")))
}

/// Load a model saved with [save_model].
pub fn load_model<B: Backend>(
    config: &ModelConfig,
    path: &Path,
    device: &B::Device,
) -> Result<Model<B>> {
    config
        .init::<B>(device)
        .load_file(path, &DefaultRecorder::new(), device)
        .map_err(|err| Error::record(path, format!("{err:?}")))
}

/// Everything a training run produced.
#[derive(Debug)]
pub struct TrainingReport {
    pub history: Vec<EpochSummary>,
    pub best_epoch: Option<usize>,
    pub stopped_early: bool,
    /// Final model on the test set.
    pub test: EpochMetrics,
    /// Best checkpoint on the test set.
    pub checkpoint_test: Option<EpochMetrics>,
    pub output: OutputConfig,
    /// `None` when the web export failed.
    pub web_export: Option<WebExport>,
}

/// Train on `splits`, evaluate on the test set and write every artifact to
/// `config.output`.
pub fn run<B: AutodiffBackend>(
    config: &TrainingConfig,
    splits: MnistSplits,
    device: B::Device,
) -> Result<TrainingReport> {
    config.validate()?;
    B::seed(config.seed);

    let split = split_validation(splits.train, config.validation_split)?;
    log::info!(
        "Dataset: {} training, {} validation, {} test samples",
        split.train.len(),
        split.valid.len(),
        splits.test.len()
    );

    let batcher_train = match (config.augment, config.augmentation.init()) {
        (true, Ok(augmentation)) => MnistBatcher::with_augmentation(augmentation, config.seed),
        (true, Err(err)) => {
            log::warn!("Data augmentation disabled: {err}");
            MnistBatcher::default()
        }
        (false, _) => MnistBatcher::default(),
    };

    let dataloader_train: Arc<dyn DataLoader<B, MnistBatch<B>>> =
        dataloader(batcher_train, split.train, config, &device, true);
    let dataloader_valid: Arc<dyn DataLoader<B::InnerBackend, MnistBatch<B::InnerBackend>>> =
        dataloader(MnistBatcher::default(), split.valid, config, &device, false);
    let dataloader_test: Arc<dyn DataLoader<B::InnerBackend, MnistBatch<B::InnerBackend>>> =
        dataloader(MnistBatcher::default(), splits.test, config, &device, false);

    log::info!("Model summary:\n{}", Summary::new(&layout(&config.model)));

    let output = &config.output;
    let model = config.model.init::<B>(&device);
    let outcome = fit(
        config,
        model,
        dataloader_train.as_ref(),
        dataloader_valid.as_ref(),
        &output.checkpoint,
    )?;

    let test = evaluate(&outcome.model, dataloader_test.as_ref());
    log::info!(
        "Test accuracy: {:.4} - test loss: {:.4}",
        test.accuracy,
        test.loss
    );

    let best = match load_model::<B::InnerBackend>(&config.model, &output.checkpoint, &device) {
        Ok(best) => Some(best),
        Err(err) => {
            log::warn!("Could not reload the best checkpoint, keeping the final weights: {err}");
            None
        }
    };
    let checkpoint_test = best.as_ref().map(|best| {
        let metrics = evaluate(best, dataloader_test.as_ref());
        log::info!(
            "Best checkpoint test accuracy: {:.4} - test loss: {:.4}",
            metrics.accuracy,
            metrics.loss
        );
        metrics
    });

    // The saved and exported model is the best checkpoint.
    let model = best.unwrap_or(outcome.model);

    save_model(&model, &output.model)?;
    save_artifacts(config, &outcome.history, &output.model_dir())?;
    log::info!("Model saved to {}", output.model.display());

    let web_export = match export_web_model(&model, &config.model, &output.web_model_dir) {
        Ok(export) => Some(export),
        Err(err) => {
            log::warn!(
                "Web export failed: {err}. Convert manually with `{} convert --model {} --out {}`",
                env!("CARGO_PKG_NAME"),
                output.model.display(),
                output.web_model_dir.display()
            );
            None
        }
    };

    Ok(TrainingReport {
        history: outcome.history,
        best_epoch: outcome.best_epoch,
        stopped_early: outcome.stopped_early,
        test,
        checkpoint_test,
        output: output.clone(),
        web_export,
    })
}

/// Write the training config and the history next to the final model.
fn save_artifacts(config: &TrainingConfig, history: &[EpochSummary], dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    config.save(dir.join(CONFIG_FILE))?;

    let path: PathBuf = dir.join(HISTORY_FILE);
    serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), history)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::idx::IMAGE_SIZE;
    use crate::{TestAutodiffBackend, TestBackend};
    use burn::data::dataset::InMemDataset;

    fn items(count: usize) -> Vec<MnistItem> {
        (0..count)
            .map(|i| {
                let label = (i % 2) as u8;
                MnistItem {
                    image: [[label as f32 * 255.0; IMAGE_SIZE]; IMAGE_SIZE],
                    label,
                }
            })
            .collect()
    }

    fn tiny_config() -> TrainingConfig {
        TrainingConfig::new()
            .with_num_epochs(2)
            .with_batch_size(4)
            .with_num_workers(0)
            .with_augment(false)
    }

    #[test]
    fn accumulator_weights_losses_by_batch_size() {
        let device = Default::default();
        let mut metrics = MetricsAccumulator::default();

        let logits = Tensor::<TestBackend, 2>::from_floats([[2.0, 0.0], [0.0, 2.0]], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0, 0], &device);
        metrics.update(logits, targets, 1.0);

        let logits = Tensor::<TestBackend, 2>::from_floats([[0.0, 2.0]], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([1], &device);
        metrics.update(logits, targets, 4.0);

        let result = metrics.finish();
        assert_eq!(result.loss, 2.0);
        assert!((result.accuracy - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn empty_epoch_has_no_loss() {
        let metrics = MetricsAccumulator::default().finish();

        assert!(metrics.loss.is_nan());
        assert_eq!(metrics.accuracy, 0.0);
    }

    #[test]
    fn evaluate_covers_every_sample() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.model.init::<TestBackend>(&device);
        let loader: Arc<dyn DataLoader<TestBackend, MnistBatch<TestBackend>>> = dataloader(
            MnistBatcher::default(),
            InMemDataset::new(items(10)),
            &config,
            &device,
            false,
        );

        let metrics = evaluate(&model, loader.as_ref());

        assert!(metrics.loss.is_finite());
        assert!((0.0..=1.0).contains(&metrics.accuracy));
    }

    #[test]
    fn fit_records_history_and_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = tiny_config();
        let checkpoint = dir.path().join("best");

        let train: Arc<dyn DataLoader<TestAutodiffBackend, MnistBatch<TestAutodiffBackend>>> =
            dataloader(
                MnistBatcher::default(),
                InMemDataset::new(items(8)),
                &config,
                &device,
                true,
            );
        let valid: Arc<dyn DataLoader<TestBackend, MnistBatch<TestBackend>>> = dataloader(
            MnistBatcher::default(),
            InMemDataset::new(items(4)),
            &config,
            &device,
            false,
        );

        let model = config.model.init::<TestAutodiffBackend>(&device);
        let outcome = fit(&config, model, train.as_ref(), valid.as_ref(), &checkpoint).unwrap();

        assert_eq!(outcome.history.len(), 2);
        assert_eq!(outcome.history[0].epoch, 1);
        assert_eq!(outcome.history[0].learning_rate, 1e-3);
        assert!(!outcome.stopped_early);
        assert!(outcome.best_epoch.is_some());
        assert!(load_model::<TestBackend>(&config.model, &checkpoint, &device).is_ok());
    }

    #[test]
    fn saved_models_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = ModelConfig::new();
        let path = dir.path().join("nested/model");
        let model = config.init::<TestBackend>(&device);

        save_model(&model, &path).unwrap();
        let loaded = load_model::<TestBackend>(&config, &path, &device).unwrap();

        let images = Tensor::<TestBackend, 4>::ones([1, 1, 28, 28], &device);
        let expected = model.forward(images.clone()).into_data();
        loaded.forward(images).into_data().assert_eq(&expected, true);
    }

    #[test]
    fn loading_a_missing_record_fails() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();

        let err = load_model::<TestBackend>(&ModelConfig::new(), &dir.path().join("nope"), &device)
            .unwrap_err();

        assert!(matches!(err, Error::Record { .. }));
    }
}
