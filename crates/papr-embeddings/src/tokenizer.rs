//! Fixed-shape tokenizer adapter.
//!
//! Every input becomes exactly `seq_len` ids: longer inputs are truncated,
//! shorter ones right-padded with the pad token. Batch size is always 1.

use std::path::Path;

use tokenizers::Tokenizer;
use tracing::debug;

use crate::error::EmbeddingError;

/// Default fixed sequence length.
pub const DEFAULT_SEQ_LEN: usize = 32;

/// Tokenizer output with shape `[1, L]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedInput {
    pub input_ids: Vec<i32>,
    pub attention_mask: Vec<i32>,
    /// Count of non-pad positions
    pub active_tokens: usize,
}

impl TokenizedInput {
    /// Sequence length `L`.
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Shape as `(batch, L)`.
    pub fn shape(&self) -> (usize, usize) {
        (1, self.input_ids.len())
    }
}

/// Wraps a HuggingFace tokenizer with fixed-length output.
pub struct TokenizerAdapter {
    tokenizer: Tokenizer,
    seq_len: usize,
    pad_id: u32,
}

impl TokenizerAdapter {
    pub fn from_file(path: &Path, seq_len: usize) -> Result<Self, EmbeddingError> {
        let tokenizer =
            Tokenizer::from_file(path).map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;
        Self::new(tokenizer, seq_len)
    }

    pub fn from_bytes(bytes: &[u8], seq_len: usize) -> Result<Self, EmbeddingError> {
        let tokenizer =
            Tokenizer::from_bytes(bytes).map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;
        Self::new(tokenizer, seq_len)
    }

    pub fn new(tokenizer: Tokenizer, seq_len: usize) -> Result<Self, EmbeddingError> {
        if seq_len == 0 {
            return Err(EmbeddingError::InvalidInput(
                "sequence length must be > 0".to_string(),
            ));
        }
        let pad_id = resolve_pad_id(&tokenizer);
        debug!(seq_len, pad_id, "Tokenizer ready");
        Ok(Self {
            tokenizer,
            seq_len,
            pad_id,
        })
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    /// Tokenize to exactly `seq_len` positions.
    ///
    /// Blank input yields an all-pad sequence.
    pub fn tokenize(&self, text: &str) -> Result<TokenizedInput, EmbeddingError> {
        if text.trim().is_empty() {
            return Ok(pad_and_truncate(&[], &[], self.seq_len, self.pad_id));
        }

        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;

        Ok(pad_and_truncate(
            encoding.get_ids(),
            encoding.get_attention_mask(),
            self.seq_len,
            self.pad_id,
        ))
    }
}

fn resolve_pad_id(tokenizer: &Tokenizer) -> u32 {
    if let Some(padding) = tokenizer.get_padding() {
        return padding.pad_id;
    }
    ["[PAD]", "<pad>", "<|endoftext|>"]
        .iter()
        .find_map(|tok| tokenizer.token_to_id(tok))
        .unwrap_or(0)
}

/// Truncate or right-pad ids and mask to `len`.
pub fn pad_and_truncate(ids: &[u32], mask: &[u32], len: usize, pad_id: u32) -> TokenizedInput {
    let mut input_ids = Vec::with_capacity(len);
    let mut attention_mask = Vec::with_capacity(len);

    for (i, &id) in ids.iter().take(len).enumerate() {
        input_ids.push(id as i32);
        // Some tokenizers arrive with padding configured; honor their mask
        let m = mask.get(i).copied().unwrap_or(1);
        attention_mask.push(if m > 0 { 1 } else { 0 });
    }

    let active_tokens = attention_mask.iter().filter(|&&m| m == 1).count();

    input_ids.resize(len, pad_id as i32);
    attention_mask.resize(len, 0);

    TokenizedInput {
        input_ids,
        attention_mask,
        active_tokens,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TEST_TOKENIZER: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": {"type": "Lowercase"},
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"[PAD]": 0, "[UNK]": 1, "buy": 2, "milk": 3, "hello": 4, "world": 5},
            "unk_token": "[UNK]"
        }
    }"#;

    pub(crate) fn test_adapter(seq_len: usize) -> TokenizerAdapter {
        TokenizerAdapter::from_bytes(TEST_TOKENIZER.as_bytes(), seq_len).unwrap()
    }

    #[test]
    fn test_pads_short_input() {
        let adapter = test_adapter(6);
        let out = adapter.tokenize("buy milk").unwrap();
        assert_eq!(out.input_ids, vec![2, 3, 0, 0, 0, 0]);
        assert_eq!(out.attention_mask, vec![1, 1, 0, 0, 0, 0]);
        assert_eq!(out.active_tokens, 2);
        assert_eq!(out.shape(), (1, 6));
    }

    #[test]
    fn test_truncates_long_input() {
        let adapter = test_adapter(3);
        let out = adapter.tokenize("hello world buy milk").unwrap();
        assert_eq!(out.input_ids, vec![4, 5, 2]);
        assert_eq!(out.attention_mask, vec![1, 1, 1]);
        assert_eq!(out.active_tokens, 3);
    }

    #[test]
    fn test_unknown_words_map_to_unk() {
        let adapter = test_adapter(4);
        let out = adapter.tokenize("Hello stranger").unwrap();
        assert_eq!(out.input_ids, vec![4, 1, 0, 0]);
    }

    #[test]
    fn test_empty_input_is_all_pad() {
        let adapter = test_adapter(DEFAULT_SEQ_LEN);
        let out = adapter.tokenize("").unwrap();
        assert_eq!(out.len(), DEFAULT_SEQ_LEN);
        assert!(out.input_ids.iter().all(|&id| id == 0));
        assert!(out.attention_mask.iter().all(|&m| m == 0));
        assert_eq!(out.active_tokens, 0);
    }

    #[test]
    fn test_pad_id_from_vocab() {
        assert_eq!(test_adapter(4).pad_id(), 0);
    }

    #[test]
    fn test_zero_seq_len_rejected() {
        assert!(TokenizerAdapter::from_bytes(TEST_TOKENIZER.as_bytes(), 0).is_err());
    }

    #[test]
    fn test_pad_and_truncate_respects_mask() {
        let out = pad_and_truncate(&[7, 8, 9], &[1, 1, 0], 4, 9);
        assert_eq!(out.input_ids, vec![7, 8, 9, 9]);
        assert_eq!(out.attention_mask, vec![1, 1, 0, 0]);
        assert_eq!(out.active_tokens, 2);
    }
}
