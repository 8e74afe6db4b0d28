use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use super::{ExportError, NamedWeight};

/// Largest shard written by the web converter.
pub const DEFAULT_SHARD_BYTES: usize = 4 * 1024 * 1024;

/// One entry of `weightsManifest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightGroup {
    pub paths: Vec<String>,
    pub weights: Vec<WeightEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightEntry {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: String,
}

/// Shard file names for `count` shards.
pub fn shard_names(count: usize) -> Vec<String> {
    (1..=count)
        .map(|index| format!("group1-shard{index}of{count}.bin"))
        .collect()
}

/// True for file names written by [write_shards].
fn is_shard(name: &str) -> bool {
    name.starts_with("group1-shard") && name.ends_with(".bin")
}

/// Delete shards left in `dir` by an earlier export.
fn remove_stale_shards(dir: &Path) -> Result<(), ExportError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let stale = entry.file_name().to_str().is_some_and(is_shard);

        if stale && entry.file_type()?.is_file() {
            log::debug!("Removing stale shard {}", entry.path().display());
            std::fs::remove_file(entry.path())?;
        }
    }

    Ok(())
}

/// Concatenate the weights as little-endian `f32` and split them into shards of at most
/// `shard_bytes` bytes inside `dir`.
pub fn write_shards(
    weights: &[NamedWeight],
    dir: &Path,
    shard_bytes: usize,
) -> Result<(WeightGroup, Vec<PathBuf>), ExportError> {
    if shard_bytes < core::mem::size_of::<f32>() {
        return Err(ExportError::ShardSize(shard_bytes));
    }

    let mut bytes = Vec::with_capacity(weights.iter().map(NamedWeight::num_bytes).sum());
    for weight in weights.iter() {
        for value in weight.values.iter() {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }

    remove_stale_shards(dir)?;

    let names = shard_names(bytes.len().div_ceil(shard_bytes));
    let mut paths = Vec::with_capacity(names.len());

    for (name, chunk) in names.iter().zip(bytes.chunks(shard_bytes)) {
        let path = dir.join(name);
        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(chunk)?;
        writer.flush()?;
        paths.push(path);
    }

    log::debug!(
        "Wrote {} bytes of weights in {} shard(s)",
        bytes.len(),
        paths.len()
    );

    let group = WeightGroup {
        paths: names,
        weights: weights
            .iter()
            .map(|weight| WeightEntry {
                name: weight.name.clone(),
                shape: weight.shape.clone(),
                dtype: "float32".to_string(),
            })
            .collect(),
    };

    Ok((group, paths))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weight(name: &str, values: Vec<f32>) -> NamedWeight {
        NamedWeight {
            name: name.to_string(),
            shape: vec![values.len()],
            values,
        }
    }

    #[test]
    fn names_count_from_one() {
        assert_eq!(
            shard_names(2),
            vec!["group1-shard1of2.bin", "group1-shard2of2.bin"]
        );
    }

    #[test]
    fn splits_at_the_byte_limit() {
        let dir = tempfile::tempdir().unwrap();
        let weights = vec![
            weight("dense/kernel", vec![1.0, 2.0, 3.0]),
            weight("dense/bias", vec![4.0, 5.0]),
        ];

        let (group, paths) = write_shards(&weights, dir.path(), 8).unwrap();

        assert_eq!(group.paths.len(), 3);
        assert_eq!(group.weights[1].name, "dense/bias");
        assert_eq!(group.weights[0].dtype, "float32");

        let sizes: Vec<u64> = paths
            .iter()
            .map(|path| std::fs::metadata(path).unwrap().len())
            .collect();
        assert_eq!(sizes, vec![8, 8, 4]);
    }

    #[test]
    fn shards_hold_little_endian_floats_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let weights = vec![weight("a", vec![1.5]), weight("b", vec![-2.0, 0.25])];

        let (_, paths) = write_shards(&weights, dir.path(), DEFAULT_SHARD_BYTES).unwrap();
        assert_eq!(paths.len(), 1);

        let bytes = std::fs::read(&paths[0]).unwrap();
        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        assert_eq!(values, vec![1.5, -2.0, 0.25]);
    }

    #[test]
    fn rewriting_removes_shards_of_the_previous_export() {
        let dir = tempfile::tempdir().unwrap();
        let weights = vec![weight("dense/kernel", vec![1.0, 2.0, 3.0, 4.0])];
        std::fs::write(dir.path().join("model.json"), "{}").unwrap();

        let (first, _) = write_shards(&weights, dir.path(), 4).unwrap();
        assert_eq!(first.paths.len(), 4);

        let (second, _) = write_shards(&weights, dir.path(), DEFAULT_SHARD_BYTES).unwrap();

        let mut files: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        files.sort();

        assert_eq!(second.paths, vec!["group1-shard1of1.bin"]);
        assert_eq!(files, vec!["group1-shard1of1.bin", "model.json"]);
    }

    #[test]
    fn rejects_shards_smaller_than_a_value() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            write_shards(&[], dir.path(), 2),
            Err(ExportError::ShardSize(2))
        ));
    }
}
