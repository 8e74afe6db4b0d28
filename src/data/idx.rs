//! Reader for the IDX files MNIST is distributed in.
//!
//! An IDX file starts with a big-endian magic number whose third byte encodes the
//! element type (`0x08` for unsigned bytes) and whose fourth byte is the number of
//! dimensions, followed by one big-endian `u32` per dimension and the payload.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use burn::data::dataset::vision::MnistItem;
use flate2::read::GzDecoder;

/// Width and height of an MNIST digit.
pub const IMAGE_SIZE: usize = 28;

const LABELS_MAGIC: u32 = 0x0000_0801;
const IMAGES_MAGIC: u32 = 0x0000_0803;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// IDX parsing failure.
#[derive(Debug, thiserror::Error)]
pub enum IdxError {
    /// Unexpected magic number.
    #[error("bad magic number {found:#010x}, expected {expected:#010x}")]
    BadMagic {
        /// Magic number for the requested file kind.
        expected: u32,
        /// Magic number read from the file.
        found: u32,
    },

    /// Images are not 28x28.
    #[error("images are {rows}x{cols}, expected {IMAGE_SIZE}x{IMAGE_SIZE}")]
    ImageShape {
        /// Rows per image.
        rows: usize,
        /// Columns per image.
        cols: usize,
    },

    /// The payload is shorter than the header announces.
    #[error("payload truncated: expected {expected} bytes, got {found}")]
    Truncated {
        /// Bytes announced by the header.
        expected: usize,
        /// Bytes available.
        found: usize,
    },

    /// The image and label files disagree on the number of items.
    #[error("{images} images but {labels} labels")]
    CountMismatch {
        /// Number of images.
        images: usize,
        /// Number of labels.
        labels: usize,
    },

    /// A label outside `0..=9`.
    #[error("label {label} at index {index} is not a digit")]
    InvalidLabel {
        /// Offending label.
        label: u8,
        /// Position in the label file.
        index: usize,
    },

    /// Read failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parse an IDX image file into raw 28x28 byte images.
pub fn parse_images(bytes: &[u8]) -> Result<Vec<Vec<u8>>, IdxError> {
    let (dims, payload) = parse_header(bytes, IMAGES_MAGIC, 3)?;
    let [count, rows, cols] = [dims[0], dims[1], dims[2]];

    if rows != IMAGE_SIZE || cols != IMAGE_SIZE {
        return Err(IdxError::ImageShape { rows, cols });
    }

    let pixels = rows * cols;
    let payload = take_payload(payload, count * pixels)?;

    Ok(payload.chunks(pixels).map(|chunk| chunk.to_vec()).collect())
}

/// Parse an IDX label file.
pub fn parse_labels(bytes: &[u8]) -> Result<Vec<u8>, IdxError> {
    let (dims, payload) = parse_header(bytes, LABELS_MAGIC, 1)?;
    let labels = take_payload(payload, dims[0])?.to_vec();

    if let Some((index, label)) = labels.iter().enumerate().find(|(_, label)| **label > 9) {
        return Err(IdxError::InvalidLabel {
            label: *label,
            index,
        });
    }

    Ok(labels)
}

/// Pair raw images with their labels as dataset items.
pub fn to_items(images: Vec<Vec<u8>>, labels: Vec<u8>) -> Result<Vec<MnistItem>, IdxError> {
    if images.len() != labels.len() {
        return Err(IdxError::CountMismatch {
            images: images.len(),
            labels: labels.len(),
        });
    }

    Ok(images
        .into_iter()
        .zip(labels)
        .map(|(bytes, label)| {
            let mut image = [[0f32; IMAGE_SIZE]; IMAGE_SIZE];
            for (i, pixel) in bytes.iter().enumerate() {
                image[i / IMAGE_SIZE][i % IMAGE_SIZE] = *pixel as f32;
            }
            MnistItem { image, label }
        })
        .collect())
}

/// Read a whole file, transparently decompressing gzip content.
pub fn read_file(path: &Path) -> Result<Vec<u8>, IdxError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;

    if bytes.starts_with(&GZIP_MAGIC) {
        let mut decoded = Vec::new();
        GzDecoder::new(&bytes[..]).read_to_end(&mut decoded)?;
        return Ok(decoded);
    }

    Ok(bytes)
}

fn parse_header(bytes: &[u8], magic: u32, num_dims: usize) -> Result<(Vec<usize>, &[u8]), IdxError> {
    let header_len = 4 * (num_dims + 1);
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .take(num_dims + 1)
        .map(|word| u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
        .collect();

    match words.first() {
        Some(found) if *found != magic => {
            return Err(IdxError::BadMagic {
                expected: magic,
                found: *found,
            })
        }
        _ if words.len() <= num_dims => {
            return Err(IdxError::Truncated {
                expected: header_len,
                found: bytes.len(),
            })
        }
        _ => {}
    }

    let dims = words[1..].iter().map(|dim| *dim as usize).collect();
    Ok((dims, &bytes[header_len..]))
}

fn take_payload(payload: &[u8], expected: usize) -> Result<&[u8], IdxError> {
    if payload.len() < expected {
        return Err(IdxError::Truncated {
            expected,
            found: payload.len(),
        });
    }
    Ok(&payload[..expected])
}
