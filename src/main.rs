#![recursion_limit = "256"]

use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::{backend::Autodiff, prelude::*};
use clap::{Parser, Subcommand};
use mnist_cnn::{
    backend::{CpuBackend, SelectedDevice},
    config::TrainingConfig,
    data::{DatasetSource, MnistBatch, MnistBatcher, MnistSplits},
    export::export_web_model,
    model::ModelConfig,
    training::{self, CONFIG_FILE},
};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "wgpu")]
use mnist_cnn::backend::GpuBackend;

#[derive(Parser, Debug)]
#[command(name = "mnist-cnn", version, about = "Train and export an MNIST digit classifier")]
struct Cli {
    /// Training configuration file (JSON), defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Run on the CPU even when a GPU is available.
    #[arg(long, global = true)]
    cpu: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train, evaluate, save and export the model (default).
    Train {
        /// Directory holding the MNIST IDX files instead of downloading them.
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Disable random rotation, zoom and translation.
        #[arg(long)]
        no_augmentation: bool,
        /// Override the number of epochs.
        #[arg(long)]
        epochs: Option<usize>,
    },
    /// Evaluate a saved model on the test set.
    Evaluate {
        /// Model record, without extension.
        #[arg(long)]
        model: PathBuf,
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Convert a saved model to the web layers-model format.
    Convert {
        /// Model record, without extension.
        #[arg(long)]
        model: PathBuf,
        /// Output directory for `model.json` and the weight shards.
        #[arg(long)]
        out: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match SelectedDevice::select(cli.cpu) {
        SelectedDevice::Cpu(device) => execute::<CpuBackend>(cli, device),
        #[cfg(feature = "wgpu")]
        SelectedDevice::Gpu(device) => execute::<GpuBackend>(cli, device),
    }
}

fn execute<B: Backend>(cli: Cli, device: B::Device) -> anyhow::Result<()> {
    let command = cli.command.unwrap_or(Command::Train {
        data_dir: None,
        no_augmentation: false,
        epochs: None,
    });

    match command {
        Command::Train {
            data_dir,
            no_augmentation,
            epochs,
        } => {
            let mut config = TrainingConfig::from_file(cli.config.as_deref())?;
            if no_augmentation {
                config.augment = false;
            }
            if let Some(epochs) = epochs {
                config.num_epochs = epochs;
            }
            config.validate()?;

            train::<B>(config, source(data_dir), device)
        }
        Command::Evaluate { model, data_dir } => {
            let config = training_config_for(&model, cli.config.as_deref())?;
            evaluate::<B>(&config, &model, source(data_dir), device)
        }
        Command::Convert { model, out } => {
            let config = training_config_for(&model, cli.config.as_deref())?;
            convert::<B>(&config.model, &model, &out, device)
        }
    }
}

fn source(data_dir: Option<PathBuf>) -> DatasetSource {
    data_dir.map(DatasetSource::Directory).unwrap_or_default()
}

/// The explicit config, or the one saved next to `model`, or the defaults.
fn training_config_for(model: &Path, explicit: Option<&Path>) -> anyhow::Result<TrainingConfig> {
    let saved = model.parent().map(|dir| dir.join(CONFIG_FILE));
    let path = explicit.or(saved.as_deref().filter(|path| path.exists()));

    if let Some(path) = path {
        log::info!("Using configuration {}", path.display());
    }

    Ok(TrainingConfig::from_file(path)?)
}

fn train<B: Backend>(
    config: TrainingConfig,
    source: DatasetSource,
    device: B::Device,
) -> anyhow::Result<()> {
    let splits = MnistSplits::load(&source).context("loading MNIST")?;
    let report = training::run::<Autodiff<B>>(&config, splits, device)?;
    let output = &report.output;

    println!();
    println!("Training finished after {} epoch(s)", report.history.len());
    if report.stopped_early {
        println!("Stopped early, best epoch: {:?}", report.best_epoch);
    }
    println!("Test accuracy: {:.4}", report.test.accuracy);
    println!("Test loss: {:.4}", report.test.loss);
    if let Some(best) = report.checkpoint_test {
        println!("Best checkpoint test accuracy: {:.4}", best.accuracy);
    }

    println!();
    println!("Files written:");
    println!("  best checkpoint: {}", output.checkpoint.display());
    println!("  final model:     {}", output.model.display());
    println!("  config, history: {}", output.model_dir().display());
    match &report.web_export {
        Some(export) => {
            println!("  web model:       {}", export.model_json.display());
            for shard in export.shards.iter() {
                println!("                   {}", shard.display());
            }
        }
        None => println!(
            "  web model:       not exported, run `mnist-cnn convert --model {} --out {}`",
            output.model.display(),
            output.web_model_dir.display()
        ),
    }

    println!();
    println!("Next steps:");
    println!(
        "  serve {} and load model.json with tf.loadLayersModel",
        output.web_model_dir.display()
    );

    Ok(())
}

fn evaluate<B: Backend>(
    config: &TrainingConfig,
    model: &Path,
    source: DatasetSource,
    device: B::Device,
) -> anyhow::Result<()> {
    let model = training::load_model::<B>(&config.model, model, &device)?;
    let splits = MnistSplits::load(&source).context("loading MNIST")?;
    let dataloader: std::sync::Arc<dyn burn::data::dataloader::DataLoader<B, MnistBatch<B>>> =
        training::dataloader(MnistBatcher::default(), splits.test, config, &device, false);

    let metrics = training::evaluate(&model, dataloader.as_ref());
    println!("Test accuracy: {:.4}", metrics.accuracy);
    println!("Test loss: {:.4}", metrics.loss);

    Ok(())
}

fn convert<B: Backend>(
    config: &ModelConfig,
    model: &Path,
    out: &Path,
    device: B::Device,
) -> anyhow::Result<()> {
    let model = training::load_model::<B>(config, model, &device)?;
    let export = export_web_model(&model, config, out)
        .with_context(|| format!("exporting to {}", out.display()))?;

    println!("Web model written to {}", export.model_json.display());
    Ok(())
}
