//! Random geometric augmentation of digit images.
//!
//! Rotation, zoom and translation are sampled per image and folded into a single
//! inverse affine map, so every output pixel is interpolated once from the source.

use burn::config::Config;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::idx::IMAGE_SIZE;

/// A single grayscale digit, row major.
pub type Image = [[f32; IMAGE_SIZE]; IMAGE_SIZE];

/// How pixels sampled outside the image are filled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillMode {
    /// Mirror about the edge of the last pixel (`d c b a | a b c d | d c b a`).
    #[default]
    Reflect,
    /// Fill with zeros.
    Constant,
}

/// Configuration to create an [augmentation](Augmentation) pipeline.
#[derive(Config, Debug)]
pub struct AugmentationConfig {
    /// Maximum rotation as a fraction of a full turn.
    #[config(default = 0.1)]
    pub rotation_factor: f64,
    /// Maximum relative zoom in or out.
    #[config(default = 0.1)]
    pub zoom_factor: f64,
    /// Maximum vertical shift as a fraction of the image height.
    #[config(default = 0.1)]
    pub height_shift: f64,
    /// Maximum horizontal shift as a fraction of the image width.
    #[config(default = 0.1)]
    pub width_shift: f64,
    /// Fill mode for pixels sampled outside the source image.
    #[config(default = "FillMode::Reflect")]
    pub fill_mode: FillMode,
}

/// Invalid augmentation factor.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AugmentationError {
    /// A factor is NaN, infinite or outside its range.
    #[error("{name} must be within [0, {max}], got {value}")]
    OutOfRange {
        /// Name of the factor.
        name: &'static str,
        /// Upper bound accepted.
        max: f64,
        /// Value received.
        value: f64,
    },
}

impl AugmentationConfig {
    /// Validate the factors and build the pipeline.
    pub fn init(&self) -> Result<Augmentation, AugmentationError> {
        let rotation = check("rotation_factor", self.rotation_factor, 1.0)?;
        let zoom = check("zoom_factor", self.zoom_factor, 0.99)?;
        let height_shift = check("height_shift", self.height_shift, 1.0)?;
        let width_shift = check("width_shift", self.width_shift, 1.0)?;

        Ok(Augmentation {
            max_angle: rotation * core::f32::consts::TAU,
            max_zoom: zoom,
            max_dy: height_shift * IMAGE_SIZE as f32,
            max_dx: width_shift * IMAGE_SIZE as f32,
            fill_mode: self.fill_mode,
        })
    }
}

fn check(name: &'static str, value: f64, max: f64) -> Result<f32, AugmentationError> {
    if value.is_finite() && (0.0..=max).contains(&value) {
        Ok(value as f32)
    } else {
        Err(AugmentationError::OutOfRange { name, max, value })
    }
}

/// Parameters of one sampled transform.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineParams {
    /// Rotation in radians.
    pub angle: f32,
    /// Sampling scale, values above one zoom out.
    pub zoom: f32,
    /// Horizontal shift in pixels.
    pub dx: f32,
    /// Vertical shift in pixels.
    pub dy: f32,
}

impl AffineParams {
    /// The identity transform.
    pub const IDENTITY: Self = Self {
        angle: 0.0,
        zoom: 1.0,
        dx: 0.0,
        dy: 0.0,
    };
}

/// Random rotation, zoom and translation applied to training images.
#[derive(Clone, Debug)]
pub struct Augmentation {
    max_angle: f32,
    max_zoom: f32,
    max_dx: f32,
    max_dy: f32,
    fill_mode: FillMode,
}

impl Augmentation {
    /// Sample transform parameters.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> AffineParams {
        AffineParams {
            angle: symmetric(rng, self.max_angle),
            zoom: 1.0 + symmetric(rng, self.max_zoom),
            dx: symmetric(rng, self.max_dx),
            dy: symmetric(rng, self.max_dy),
        }
    }

    /// Augment an image with freshly sampled parameters.
    pub fn apply<R: Rng + ?Sized>(&self, image: &Image, rng: &mut R) -> Image {
        let params = self.sample(rng);
        self.transform(image, params)
    }

    /// Resample `image` through the given transform.
    pub fn transform(&self, image: &Image, params: AffineParams) -> Image {
        let center = (IMAGE_SIZE as f32 - 1.0) / 2.0;
        let (sin, cos) = params.angle.sin_cos();
        let mut output = [[0f32; IMAGE_SIZE]; IMAGE_SIZE];

        for (y, row) in output.iter_mut().enumerate() {
            for (x, pixel) in row.iter_mut().enumerate() {
                // Undo the shift, then the zoom and the rotation about the center.
                let u = (x as f32 - params.dx - center) * params.zoom;
                let v = (y as f32 - params.dy - center) * params.zoom;
                let src_x = cos * u - sin * v + center;
                let src_y = sin * u + cos * v + center;

                *pixel = self.bilinear(image, src_x, src_y);
            }
        }

        output
    }

    fn bilinear(&self, image: &Image, x: f32, y: f32) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (x0, y0) = (x0 as i64, y0 as i64);

        let top = self.pixel(image, x0, y0) * (1.0 - fx) + self.pixel(image, x0 + 1, y0) * fx;
        let bottom =
            self.pixel(image, x0, y0 + 1) * (1.0 - fx) + self.pixel(image, x0 + 1, y0 + 1) * fx;

        top * (1.0 - fy) + bottom * fy
    }

    fn pixel(&self, image: &Image, x: i64, y: i64) -> f32 {
        match self.fill_mode {
            FillMode::Reflect => {
                image[reflect_index(y, IMAGE_SIZE)][reflect_index(x, IMAGE_SIZE)]
            }
            FillMode::Constant => {
                let range = 0..IMAGE_SIZE as i64;
                if range.contains(&x) && range.contains(&y) {
                    image[y as usize][x as usize]
                } else {
                    0.0
                }
            }
        }
    }
}

fn symmetric<R: Rng + ?Sized>(rng: &mut R, max: f32) -> f32 {
    if max > 0.0 {
        rng.random_range(-max..=max)
    } else {
        0.0
    }
}

/// Map any integer index into `0..size` by mirroring about the edges.
pub fn reflect_index(index: i64, size: usize) -> usize {
    let size = size as i64;
    let period = index.rem_euclid(2 * size);

    if period >= size {
        (2 * size - 1 - period) as usize
    } else {
        period as usize
    }
}
