//! Checkpoint weight access
//!
//! Layers pull their parameters by name from a [`WeightSource`]. The
//! production source is [`SafeTensorStore`], which memory-maps one or more
//! `.safetensors` shards and converts F32/F16/BF16 tensors to `f32` on
//! demand. [`MapSource`] holds tensors in memory.
//!
//! OPT checkpoints are not consistent about the `model.` prefix
//! (`model.decoder.layers.0.fc1.weight` vs `decoder.layers.0.fc1.weight`),
//! so lookups try both spellings.

use crate::error::{Error, Result};
use crate::tensor::Tensor;
use half::{bf16, f16};
use memmap2::Mmap;
use safetensors::{Dtype, SafeTensors};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Source of named parameter tensors
pub trait WeightSource {
    /// Whether a tensor with exactly this name exists
    fn contains(&self, name: &str) -> bool;

    /// Load a tensor with exactly this name
    fn load(&self, name: &str) -> Result<Tensor>;

    /// Load `name`, falling back to the spelling with the `model.` prefix
    /// added or removed
    fn tensor(&self, name: &str) -> Result<Tensor> {
        match resolve_name(self, name) {
            Some(resolved) => self.load(&resolved),
            None => Err(Error::MissingWeight(name.to_string())),
        }
    }

    /// Load `name` if present under either spelling
    fn optional(&self, name: &str) -> Result<Option<Tensor>> {
        match resolve_name(self, name) {
            Some(resolved) => self.load(&resolved).map(Some),
            None => Ok(None),
        }
    }
}

fn resolve_name<S: WeightSource + ?Sized>(source: &S, name: &str) -> Option<String> {
    if source.contains(name) {
        return Some(name.to_string());
    }
    let alternate = match name.strip_prefix("model.") {
        Some(stripped) => stripped.to_string(),
        None => format!("model.{name}"),
    };
    source.contains(&alternate).then_some(alternate)
}

/// In-memory weights keyed by name
#[derive(Debug, Default, Clone)]
pub struct MapSource {
    tensors: HashMap<String, Tensor>,
}

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }
}

impl WeightSource for MapSource {
    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    fn load(&self, name: &str) -> Result<Tensor> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| Error::MissingWeight(name.to_string()))
    }
}

/// `model.safetensors.index.json` for sharded checkpoints
#[derive(Debug, Deserialize)]
struct ShardIndex {
    weight_map: HashMap<String, String>,
}

/// Memory-mapped safetensors checkpoint, possibly split over several shards
pub struct SafeTensorStore {
    shards: Vec<Mmap>,
    /// Tensor name to shard position
    index: HashMap<String, usize>,
}

impl SafeTensorStore {
    /// Open the given shard files
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut shards = Vec::with_capacity(paths.len());
        let mut index = HashMap::new();

        for (shard_idx, path) in paths.iter().enumerate() {
            let file = File::open(path.as_ref())?;
            // SAFETY: the checkpoint is opened read-only and is not modified
            // while the store is alive.
            let mmap = unsafe { Mmap::map(&file)? };
            let tensors = SafeTensors::deserialize(&mmap)?;
            for name in tensors.names() {
                index.insert(name.to_string(), shard_idx);
            }
            debug!(
                path = %path.as_ref().display(),
                tensors = tensors.len(),
                "opened safetensors shard"
            );
            shards.push(mmap);
        }

        info!(shards = shards.len(), tensors = index.len(), "checkpoint opened");
        Ok(Self { shards, index })
    }

    /// Shard file names listed by a `model.safetensors.index.json`, in order
    pub fn shards_from_index(index_path: impl AsRef<Path>) -> Result<Vec<String>> {
        let json = fs::read_to_string(index_path.as_ref())?;
        let index: ShardIndex = serde_json::from_str(&json)?;
        let files: BTreeSet<String> = index.weight_map.into_values().collect();
        Ok(files.into_iter().collect())
    }

    /// Open a checkpoint directory: sharded index if present, else
    /// `model.safetensors`
    pub fn open_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let index_path = dir.join("model.safetensors.index.json");
        let paths: Vec<PathBuf> = if index_path.exists() {
            Self::shards_from_index(&index_path)?
                .into_iter()
                .map(|file| dir.join(file))
                .collect()
        } else {
            vec![dir.join("model.safetensors")]
        };
        Self::open(&paths)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl WeightSource for SafeTensorStore {
    fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn load(&self, name: &str) -> Result<Tensor> {
        let shard = *self
            .index
            .get(name)
            .ok_or_else(|| Error::MissingWeight(name.to_string()))?;
        let tensors = SafeTensors::deserialize(&self.shards[shard])?;
        let view = tensors.tensor(name)?;
        let data = to_f32(name, view.dtype(), view.data())?;
        Ok(Tensor::new(data, view.shape().to_vec()))
    }
}

/// Decode little-endian checkpoint bytes to `f32`
fn to_f32(name: &str, dtype: Dtype, bytes: &[u8]) -> Result<Vec<f32>> {
    let values = match dtype {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        other => {
            return Err(Error::UnsupportedDtype {
                name: name.to_string(),
                dtype: format!("{other:?}"),
            })
        }
    };
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use safetensors::tensor::TensorView;

    fn write_checkpoint(path: &Path) {
        let f32_bytes: Vec<u8> = [1.0f32, -2.0, 0.5, 4.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let f16_bytes: Vec<u8> = [0.25f32, -1.0]
            .iter()
            .flat_map(|v| f16::from_f32(*v).to_le_bytes())
            .collect();
        let tensors = vec![
            (
                "model.decoder.layers.0.fc1.weight",
                TensorView::new(Dtype::F32, vec![2, 2], &f32_bytes).unwrap(),
            ),
            (
                "decoder.layers.0.fc1.bias",
                TensorView::new(Dtype::F16, vec![2], &f16_bytes).unwrap(),
            ),
        ];
        let bytes = safetensors::tensor::serialize(tensors, &None).unwrap();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_store_reads_f32_and_f16() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_checkpoint(&path);

        let store = SafeTensorStore::open_dir(dir.path()).unwrap();
        assert_eq!(store.len(), 2);

        let weight = store.tensor("model.decoder.layers.0.fc1.weight").unwrap();
        assert_eq!(weight.shape, vec![2, 2]);
        assert_eq!(weight.data, vec![1.0, -2.0, 0.5, 4.0]);

        // Stored without the `model.` prefix
        let bias = store.tensor("model.decoder.layers.0.fc1.bias").unwrap();
        assert_eq!(bias.data, vec![0.25, -1.0]);
    }

    #[test]
    fn test_missing_weight_is_reported() {
        let source = MapSource::new();
        assert!(matches!(
            source.tensor("lm_head.weight"),
            Err(Error::MissingWeight(name)) if name == "lm_head.weight"
        ));
        assert!(source.optional("lm_head.weight").unwrap().is_none());
    }

    #[test]
    fn test_shard_index_lists_unique_files() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("model.safetensors.index.json");
        fs::write(
            &index,
            r#"{"metadata": {}, "weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors"}}"#,
        )
        .unwrap();
        let shards = SafeTensorStore::shards_from_index(&index).unwrap();
        assert_eq!(
            shards,
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string()
            ]
        );
    }
}
