//! Locating model files
//!
//! A model id is either a local directory holding a Hugging Face checkpoint
//! or a Hub repository id such as `facebook/opt-13b`. Hub files are fetched
//! through the hf-hub sync API, which caches them under `HF_HOME`.

use crate::error::{Error, Result};
use crate::weights::SafeTensorStore;
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use std::path::{Path, PathBuf};
use tracing::info;

const CONFIG: &str = "config.json";
const WEIGHTS: &str = "model.safetensors";
const WEIGHTS_INDEX: &str = "model.safetensors.index.json";

/// Where the tokenizer for a model lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenizerFiles {
    /// A serialized `tokenizer.json`
    Json(PathBuf),
    /// GPT-2 style `vocab.json` + `merges.txt`
    VocabMerges { vocab: PathBuf, merges: PathBuf },
}

/// Resolved local paths for everything needed to run a model
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub weights: Vec<PathBuf>,
    pub tokenizer: TokenizerFiles,
}

impl ModelFiles {
    /// Resolve `model_id` to a local directory if one exists, else to the Hub
    pub fn resolve(model_id: &str) -> Result<Self> {
        let dir = Path::new(model_id);
        if dir.is_dir() {
            Self::from_dir(dir)
        } else {
            Self::from_hub(model_id)
        }
    }

    /// Files from a local checkpoint directory
    pub fn from_dir(dir: &Path) -> Result<Self> {
        info!(dir = %dir.display(), "using local model directory");
        let config = dir.join(CONFIG);
        if !config.exists() {
            return Err(Error::config(format!("{} not found", config.display())));
        }

        let index = dir.join(WEIGHTS_INDEX);
        let weights = if index.exists() {
            SafeTensorStore::shards_from_index(&index)?
                .into_iter()
                .map(|file| dir.join(file))
                .collect()
        } else {
            vec![dir.join(WEIGHTS)]
        };

        let tokenizer_json = dir.join("tokenizer.json");
        let tokenizer = if tokenizer_json.exists() {
            TokenizerFiles::Json(tokenizer_json)
        } else {
            TokenizerFiles::VocabMerges {
                vocab: dir.join("vocab.json"),
                merges: dir.join("merges.txt"),
            }
        };

        Ok(Self {
            config,
            weights,
            tokenizer,
        })
    }

    /// Files from a Hub repository, downloaded on first use
    pub fn from_hub(model_id: &str) -> Result<Self> {
        info!(model = model_id, "resolving model on the Hugging Face Hub");
        let api = Api::new().map_err(hub_error)?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config = fetch(&repo, CONFIG)?;

        let weights = match repo.get(WEIGHTS_INDEX) {
            Ok(index) => {
                let shards = SafeTensorStore::shards_from_index(&index)?;
                info!(shards = shards.len(), "downloading sharded checkpoint");
                shards
                    .iter()
                    .map(|shard| fetch(&repo, shard))
                    .collect::<Result<Vec<_>>>()?
            }
            Err(_) => vec![fetch(&repo, WEIGHTS)?],
        };

        // OPT repos ship vocab.json + merges.txt; newer uploads add tokenizer.json
        let tokenizer = match repo.get("tokenizer.json") {
            Ok(path) => TokenizerFiles::Json(path),
            Err(_) => TokenizerFiles::VocabMerges {
                vocab: fetch(&repo, "vocab.json")?,
                merges: fetch(&repo, "merges.txt")?,
            },
        };

        Ok(Self {
            config,
            weights,
            tokenizer,
        })
    }
}

fn fetch(repo: &ApiRepo, file: &str) -> Result<PathBuf> {
    repo.get(file)
        .map_err(|e| Error::Hub(format!("failed to fetch {file}: {e}")))
}

fn hub_error(e: hf_hub::api::sync::ApiError) -> Error {
    Error::Hub(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_local_dir_with_shards() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG), "{}").unwrap();
        fs::write(
            dir.path().join(WEIGHTS_INDEX),
            r#"{"weight_map": {"a": "model-00002.safetensors", "b": "model-00001.safetensors", "c": "model-00001.safetensors"}}"#,
        )
        .unwrap();
        fs::write(dir.path().join("tokenizer.json"), "{}").unwrap();

        let files = ModelFiles::resolve(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(
            files.weights,
            vec![
                dir.path().join("model-00001.safetensors"),
                dir.path().join("model-00002.safetensors"),
            ]
        );
        assert_eq!(
            files.tokenizer,
            TokenizerFiles::Json(dir.path().join("tokenizer.json"))
        );
    }

    #[test]
    fn test_local_dir_defaults_to_vocab_merges() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG), "{}").unwrap();
        let files = ModelFiles::from_dir(dir.path()).unwrap();
        assert_eq!(files.weights, vec![dir.path().join(WEIGHTS)]);
        assert!(matches!(files.tokenizer, TokenizerFiles::VocabMerges { .. }));
    }

    #[test]
    fn test_local_dir_without_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ModelFiles::from_dir(dir.path()),
            Err(Error::Config(_))
        ));
    }
}
