//! MNIST loading, train/validation splitting and batching.

pub mod augment;
mod batcher;
pub mod idx;

pub use batcher::*;

use std::panic;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::data::dataset::transform::PartialDataset;
use burn::data::dataset::vision::{MnistDataset, MnistItem};
use burn::data::dataset::{Dataset, InMemDataset};

use crate::error::{Error, Result};

const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

/// Shared, type-erased MNIST dataset.
pub type SharedDataset = Arc<dyn Dataset<MnistItem>>;

/// Where the MNIST files come from.
#[derive(Clone, Debug, Default)]
pub enum DatasetSource {
    /// burn's built-in loader, downloading into its cache directory.
    #[default]
    Download,
    /// A directory holding the four IDX files, optionally gzip compressed.
    Directory(PathBuf),
}

/// The train and test splits of MNIST.
#[derive(Clone)]
pub struct MnistSplits {
    /// Training set, validation samples included.
    pub train: SharedDataset,
    /// Held-out test set.
    pub test: SharedDataset,
}

impl MnistSplits {
    /// Splits built from in-memory items.
    pub fn from_items(train: Vec<MnistItem>, test: Vec<MnistItem>) -> Self {
        Self {
            train: Arc::new(InMemDataset::new(train)),
            test: Arc::new(InMemDataset::new(test)),
        }
    }

    /// Load both splits from `source`.
    pub fn load(source: &DatasetSource) -> Result<Self> {
        match source {
            DatasetSource::Download => {
                log::info!("Loading MNIST dataset with the built-in loader...");
                // The built-in loader panics when the download fails.
                let (train, test) =
                    panic::catch_unwind(|| (MnistDataset::train(), MnistDataset::test()))
                        .map_err(|payload| Error::Dataset(panic_message(payload.as_ref())))?;

                Ok(Self {
                    train: Arc::new(train),
                    test: Arc::new(test),
                })
            }
            DatasetSource::Directory(root) => {
                log::info!("Loading MNIST dataset from {}...", root.display());
                let train = read_split(root, TRAIN_IMAGES, TRAIN_LABELS)?;
                let test = read_split(root, TEST_IMAGES, TEST_LABELS)?;

                Ok(Self::from_items(train, test))
            }
        }
    }
}

fn read_split(root: &Path, images: &str, labels: &str) -> Result<Vec<MnistItem>> {
    let images = read_idx(root, images, idx::parse_images)?;
    let labels = read_idx(root, labels, idx::parse_labels)?;

    idx::to_items(images, labels).map_err(|source| Error::Idx {
        path: root.to_path_buf(),
        source,
    })
}

fn read_idx<T>(
    root: &Path,
    name: &str,
    parse: fn(&[u8]) -> core::result::Result<T, idx::IdxError>,
) -> Result<T> {
    let plain = root.join(name);
    let path = if plain.exists() {
        plain
    } else {
        root.join(format!("{name}.gz"))
    };

    idx::read_file(&path)
        .and_then(|bytes| parse(&bytes))
        .map_err(|source| Error::Idx { path, source })
}

fn panic_message(payload: &(dyn core::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "dataset loader panicked".to_string()
    }
}

/// Training and validation partitions of the training set.
pub struct TrainValidSplit {
    /// Samples used to fit the model.
    pub train: PartialDataset<SharedDataset, MnistItem>,
    /// Trailing samples held out for validation.
    pub valid: PartialDataset<SharedDataset, MnistItem>,
}

/// Index at which the trailing `fraction` of `len` samples starts.
pub fn split_index(len: usize, fraction: f64) -> usize {
    (len as f64 * (1.0 - fraction)).floor() as usize
}

/// Hold out the last `fraction` of `dataset`, in its original order, for validation.
pub fn split_validation(dataset: SharedDataset, fraction: f64) -> Result<TrainValidSplit> {
    let len = dataset.len();
    let split = split_index(len, fraction);

    if split == 0 || split == len {
        return Err(Error::Dataset(format!(
            "a validation split of {fraction} over {len} samples leaves an empty partition"
        )));
    }

    Ok(TrainValidSplit {
        train: PartialDataset::new(dataset.clone(), 0, split),
        valid: PartialDataset::new(dataset, split, len),
    })
}
