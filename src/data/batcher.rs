use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::vision::MnistItem},
    prelude::*,
};
use rand::{rngs::StdRng, SeedableRng};

use super::augment::Augmentation;
use super::idx::IMAGE_SIZE;

/// Turns MNIST items into normalized image and target tensors.
#[derive(Clone, Debug, Default)]
pub struct MnistBatcher {
    augmentation: Option<Augmentation>,
    seed: u64,
    /// Batches produced so far, shared by every clone handed to a worker.
    batches: Arc<AtomicU64>,
}

#[derive(Clone, Debug)]
pub struct MnistBatch<B: Backend> {
    /// Images in `[0, 1]`, shape `[batch_size, 1, 28, 28]`.
    pub images: Tensor<B, 4>,
    /// Class indices, shape `[batch_size]`.
    pub targets: Tensor<B, 1, Int>,
}

impl MnistBatcher {
    /// Batcher that augments every image before normalization.
    ///
    /// Batch `n` samples its transforms from a generator seeded with `seed + n`, so a
    /// single-worker run replays the same augmentations.
    pub fn with_augmentation(augmentation: Augmentation, seed: u64) -> Self {
        Self {
            augmentation: Some(augmentation),
            seed,
            batches: Arc::default(),
        }
    }

    /// True when images are augmented.
    pub fn augments(&self) -> bool {
        self.augmentation.is_some()
    }
}

impl<B: Backend> Batcher<B, MnistItem, MnistBatch<B>> for MnistBatcher {
    fn batch(&self, items: Vec<MnistItem>, device: &B::Device) -> MnistBatch<B> {
        let index = self.batches.fetch_add(1, Ordering::Relaxed);
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(index));

        let images = items
            .iter()
            .map(|item| match &self.augmentation {
                Some(augmentation) => augmentation.apply(&item.image, &mut rng),
                None => item.image,
            })
            .map(|image| TensorData::from(image).convert::<B::FloatElem>())
            .map(|data| Tensor::<B, 2>::from_data(data, device))
            .map(|tensor| tensor.reshape([1, 1, IMAGE_SIZE, IMAGE_SIZE]))
            // Pixels come in as 0..=255.
            .map(|tensor| tensor / 255)
            .collect();

        let targets = items
            .iter()
            .map(|item| {
                Tensor::<B, 1, Int>::from_data(
                    [(item.label as i64).elem::<B::IntElem>()],
                    device,
                )
            })
            .collect();

        let images = Tensor::cat(images, 0);
        let targets = Tensor::cat(targets, 0);

        MnistBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::augment::AugmentationConfig;
    use crate::TestBackend;

    fn item(value: f32, label: u8) -> MnistItem {
        MnistItem {
            image: [[value; IMAGE_SIZE]; IMAGE_SIZE],
            label,
        }
    }

    #[test]
    fn batches_normalized_images_and_targets() {
        let device = Default::default();
        let batch: MnistBatch<TestBackend> =
            MnistBatcher::default().batch(vec![item(255.0, 4), item(51.0, 9)], &device);

        assert_eq!(batch.images.dims(), [2, 1, IMAGE_SIZE, IMAGE_SIZE]);

        let max = batch.images.clone().max().into_scalar();
        let min = batch.images.min().into_scalar();
        assert!((max - 1.0).abs() < 1e-6);
        assert!((min - 0.2).abs() < 1e-6);

        let targets = batch.targets.into_data().to_vec::<i64>().unwrap();
        assert_eq!(targets, vec![4, 9]);
    }

    #[test]
    fn augmentation_keeps_shape_and_range() {
        let device = Default::default();
        let augmentation = AugmentationConfig::new().init().unwrap();
        let batcher = MnistBatcher::with_augmentation(augmentation, 42);
        assert!(batcher.augments());

        let batch: MnistBatch<TestBackend> = batcher.batch(vec![item(128.0, 1); 3], &device);

        assert_eq!(batch.images.dims(), [3, 1, IMAGE_SIZE, IMAGE_SIZE]);
        assert!(batch.images.max().into_scalar() <= 1.0 + 1e-6);
    }

    fn gradient_item() -> MnistItem {
        let mut image = [[0.0; IMAGE_SIZE]; IMAGE_SIZE];
        for (y, row) in image.iter_mut().enumerate() {
            for (x, pixel) in row.iter_mut().enumerate() {
                *pixel = ((x * 7 + y * 3) % 256) as f32;
            }
        }
        MnistItem { image, label: 3 }
    }

    fn augmented(batcher: &MnistBatcher) -> Vec<f32> {
        let device = Default::default();
        let batch: MnistBatch<TestBackend> = batcher.batch(vec![gradient_item(); 2], &device);
        batch.images.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn seeded_augmentation_is_reproducible() {
        let augmentation = AugmentationConfig::new().init().unwrap();
        let first = MnistBatcher::with_augmentation(augmentation.clone(), 7);
        let second = MnistBatcher::with_augmentation(augmentation.clone(), 7);
        let other = MnistBatcher::with_augmentation(augmentation, 8);

        let batch = augmented(&first);
        assert_eq!(batch, augmented(&second));
        assert_ne!(batch, augmented(&other));

        // The next batch draws from a fresh generator.
        assert_ne!(batch, augmented(&first));
    }
}
