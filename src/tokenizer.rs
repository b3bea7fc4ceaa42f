//! OPT Tokenizer
//!
//! OPT uses the GPT-2 byte-level BPE vocabulary. Checkpoints ship either a
//! serialized `tokenizer.json` or the classic `vocab.json` + `merges.txt`
//! pair; both are loaded through the `tokenizers` crate.
//!
//! ## BOS handling
//!
//! OPT's tokenizer prepends `</s>` (id 2) to every encoded text. Encoding
//! here adds no template-driven special tokens and prepends the BOS id
//! explicitly, so both file formats produce the same ids.
//!
//! ## Example
//!
//! ```rust,no_run
//! use opt_sparsity::{OptTokenizer, TokenizerFiles};
//! use std::path::PathBuf;
//!
//! let files = TokenizerFiles::VocabMerges {
//!     vocab: PathBuf::from("vocab.json"),
//!     merges: PathBuf::from("merges.txt"),
//! };
//! let tokenizer = OptTokenizer::from_files(&files, 2).unwrap();
//! let ids = tokenizer.encode("Hello, world!").unwrap();
//! assert_eq!(ids[0], 2);
//! ```

use crate::error::{Error, Result};
use crate::hub::TokenizerFiles;
use std::path::Path;
use tokenizers::decoders::byte_level::ByteLevel as ByteLevelDecoder;
use tokenizers::models::bpe::BPE;
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::Tokenizer;
use tracing::debug;

/// Byte-level BPE tokenizer with OPT's BOS convention
pub struct OptTokenizer {
    inner: Tokenizer,
    bos_token_id: usize,
}

impl OptTokenizer {
    /// Load from whichever tokenizer files the model provides
    pub fn from_files(files: &TokenizerFiles, bos_token_id: usize) -> Result<Self> {
        let inner = match files {
            TokenizerFiles::Json(path) => Tokenizer::from_file(path).map_err(tokenizer_error)?,
            TokenizerFiles::VocabMerges { vocab, merges } => byte_level_bpe(vocab, merges)?,
        };
        debug!(
            vocab = inner.get_vocab_size(true),
            bos = bos_token_id,
            "tokenizer loaded"
        );
        Ok(Self {
            inner,
            bos_token_id,
        })
    }

    /// Encode text, prepending the BOS token
    pub fn encode(&self, text: &str) -> Result<Vec<usize>> {
        let mut ids = Vec::with_capacity(text.len() / 3 + 1);
        ids.push(self.bos_token_id);
        ids.extend(self.encode_raw(text)?);
        Ok(ids)
    }

    /// Encode text without any special tokens
    pub fn encode_raw(&self, text: &str) -> Result<Vec<usize>> {
        let encoding = self.inner.encode(text, false).map_err(tokenizer_error)?;
        Ok(encoding.get_ids().iter().map(|&id| id as usize).collect())
    }

    /// Decode token IDs back to text
    pub fn decode(&self, ids: &[usize]) -> Result<String> {
        let ids: Vec<u32> = ids.iter().map(|&id| id as u32).collect();
        self.inner.decode(&ids, true).map_err(tokenizer_error)
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn bos_token_id(&self) -> usize {
        self.bos_token_id
    }
}

/// GPT-2 byte-level BPE from `vocab.json` and `merges.txt`
fn byte_level_bpe(vocab: &Path, merges: &Path) -> Result<Tokenizer> {
    let vocab = path_str(vocab)?;
    let merges = path_str(merges)?;
    let bpe = BPE::from_file(vocab, merges)
        .build()
        .map_err(tokenizer_error)?;

    let mut tokenizer = Tokenizer::new(bpe);
    tokenizer
        .with_pre_tokenizer(Some(ByteLevel::new(false, true, true)))
        .with_decoder(Some(ByteLevelDecoder::default()));
    Ok(tokenizer)
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::Tokenizer(format!("non UTF-8 path {}", path.display())))
}

fn tokenizer_error(e: impl std::fmt::Display) -> Error {
    Error::Tokenizer(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Tiny byte-level vocabulary: "h", "i", "hi", "Ġ", "Ġhi"
    fn tiny_files(dir: &Path) -> TokenizerFiles {
        let vocab = dir.join("vocab.json");
        let merges = dir.join("merges.txt");
        fs::write(
            &vocab,
            r#"{"</s>": 2, "h": 10, "i": 11, "hi": 12, "Ġ": 13, "Ġhi": 15}"#,
        )
        .unwrap();
        fs::write(&merges, "#version: 0.2\nh i\nĠ hi\n").unwrap();
        TokenizerFiles::VocabMerges { vocab, merges }
    }

    #[test]
    fn test_bos_is_prepended() {
        let dir = tempfile::tempdir().unwrap();
        let tokenizer = OptTokenizer::from_files(&tiny_files(dir.path()), 2).unwrap();
        assert_eq!(tokenizer.encode("hi").unwrap(), vec![2, 12]);
        assert_eq!(tokenizer.encode_raw("hi hi").unwrap(), vec![12, 15]);
    }

    #[test]
    fn test_decode_inverts_encode() {
        let dir = tempfile::tempdir().unwrap();
        let tokenizer = OptTokenizer::from_files(&tiny_files(dir.path()), 2).unwrap();
        let ids = tokenizer.encode_raw("hi hi").unwrap();
        assert_eq!(tokenizer.decode(&ids).unwrap(), "hi hi");
    }

    #[test]
    fn test_missing_files_are_tokenizer_errors() {
        let dir = tempfile::tempdir().unwrap();
        let files = TokenizerFiles::Json(dir.path().join("tokenizer.json"));
        assert!(matches!(
            OptTokenizer::from_files(&files, 2),
            Err(Error::Tokenizer(_))
        ));
    }
}
