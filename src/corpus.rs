//! Token corpus: fixed-length token sequences consumed by the shuffle buffer

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokenizers::Tokenizer;
use tracing::info;

use crate::config::CorpusPolicy;
use crate::error::SaeError;

/// Tensor name used for the token matrix in corpus safetensors files.
pub const TOKENS_KEY: &str = "tokens";

/// Ordered, immutable collection of `(n_sequences, seq_len)` token ids plus a
/// read cursor.
#[derive(Debug, Clone)]
pub struct TokenCorpus {
    /// u32 token ids, shape (n_sequences, seq_len), kept on CPU
    tokens: Tensor,
    /// Index of the next unread sequence
    token_pointer: usize,
    policy: CorpusPolicy,
    /// How many times the cursor wrapped (only with `CorpusPolicy::Wrap`)
    wraps: usize,
}

impl TokenCorpus {
    /// Wrap an existing 2D token tensor.
    pub fn from_tensor(tokens: Tensor) -> Result<Self> {
        anyhow::ensure!(
            tokens.rank() == 2,
            "Token corpus must be 2D (n_sequences, seq_len), got {:?}",
            tokens.dims()
        );
        let tokens = tokens.to_device(&Device::Cpu)?.to_dtype(DType::U32)?;
        Ok(Self {
            tokens,
            token_pointer: 0,
            policy: CorpusPolicy::Error,
            wraps: 0,
        })
    }

    /// Reshape a flat token stream into rows of `seq_len`, dropping the
    /// incomplete tail.
    pub fn from_flat(tokens: &[u32], seq_len: usize) -> Result<Self> {
        anyhow::ensure!(seq_len > 0, "seq_len must be > 0");
        let n_rows = tokens.len() / seq_len;
        anyhow::ensure!(
            n_rows > 0,
            "Need at least {seq_len} tokens to build one sequence, got {}",
            tokens.len()
        );
        let data = tokens[..n_rows * seq_len].to_vec();
        Self::from_tensor(Tensor::from_vec(data, (n_rows, seq_len), &Device::Cpu)?)
    }

    /// Load a safetensors file containing a 2D `tokens` tensor.
    pub fn load(path: &Path) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("Failed to read corpus {}", path.display()))?;
        let tokens = tensors
            .remove(TOKENS_KEY)
            .with_context(|| format!("No '{TOKENS_KEY}' tensor in {}", path.display()))?;
        let corpus = Self::from_tensor(tokens)?;
        info!(
            "Loaded corpus: {} sequences of {} tokens",
            corpus.len(),
            corpus.seq_len()
        );
        Ok(corpus)
    }

    /// Tokenize a text file (one document per line) with a HuggingFace
    /// tokenizer, concatenate, and cut into `seq_len` rows.
    pub fn from_text(path: &Path, tokenizer: &Tokenizer, seq_len: usize) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read text corpus {}", path.display()))?;
        let mut ids: Vec<u32> = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let encoding = tokenizer
                .encode(line, false)
                .map_err(|e| anyhow::anyhow!("Tokenization failed: {e}"))?;
            ids.extend_from_slice(encoding.get_ids());
        }
        info!("Tokenized {} tokens from {}", ids.len(), path.display());
        Self::from_flat(&ids, seq_len)
    }

    /// Save the token matrix to a safetensors file readable by [`TokenCorpus::load`].
    pub fn save(&self, path: &Path) -> Result<()> {
        let tensors = std::collections::HashMap::from([(TOKENS_KEY, self.tokens.clone())]);
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("Failed to write corpus {}", path.display()))?;
        Ok(())
    }

    pub fn with_policy(mut self, policy: CorpusPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Overwrite the first token of every sequence with `bos_id`.
    pub fn with_bos(self, bos_id: u32) -> Result<Self> {
        let (n, seq_len) = self.tokens.dims2()?;
        let bos = Tensor::full(bos_id, (n, 1), &Device::Cpu)?;
        let tokens = if seq_len > 1 {
            Tensor::cat(&[&bos, &self.tokens.narrow(1, 1, seq_len - 1)?], 1)?
        } else {
            bos
        };
        Ok(Self { tokens, ..self })
    }

    /// Shuffle sequences (documents) with a seeded permutation.
    pub fn shuffle_documents(self, seed: u64) -> Result<Self> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut perm: Vec<u32> = (0..self.len() as u32).collect();
        perm.shuffle(&mut rng);
        let n = perm.len();
        let idx = Tensor::from_vec(perm, n, &Device::Cpu)?;
        let tokens = self.tokens.index_select(&idx, 0)?;
        Ok(Self { tokens, ..self })
    }

    /// Take the next `n` sequences and advance the cursor.
    ///
    /// With [`CorpusPolicy::Error`] an exhausted corpus yields
    /// [`SaeError::CorpusExhausted`] and the cursor does not move.
    pub fn next_chunk(&mut self, n: usize) -> Result<Tensor> {
        let available = self.len() - self.token_pointer;
        if n > available {
            match self.policy {
                CorpusPolicy::Error => {
                    return Err(SaeError::CorpusExhausted {
                        cursor: self.token_pointer,
                        needed: n,
                        available,
                    }
                    .into());
                }
                CorpusPolicy::Wrap => {
                    anyhow::ensure!(
                        n <= self.len(),
                        "Chunk of {n} sequences exceeds corpus of {}",
                        self.len()
                    );
                    self.wraps += 1;
                    info!(
                        "Token corpus exhausted at sequence {}, wrapping (wrap #{})",
                        self.token_pointer, self.wraps
                    );
                    self.token_pointer = 0;
                }
            }
        }
        let chunk = self.tokens.narrow(0, self.token_pointer, n)?;
        self.token_pointer += n;
        Ok(chunk)
    }

    /// Number of sequences.
    pub fn len(&self) -> usize {
        self.tokens.dims()[0]
    }

    /// Check if corpus is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn seq_len(&self) -> usize {
        self.tokens.dims()[1]
    }

    pub fn token_pointer(&self) -> usize {
        self.token_pointer
    }

    pub fn remaining(&self) -> usize {
        self.len() - self.token_pointer
    }

    pub fn wraps(&self) -> usize {
        self.wraps
    }

    pub fn tokens(&self) -> &Tensor {
        &self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus(n: usize, seq_len: usize) -> TokenCorpus {
        let flat: Vec<u32> = (0..(n * seq_len) as u32).collect();
        TokenCorpus::from_flat(&flat, seq_len).unwrap()
    }

    #[test]
    fn test_from_flat_drops_tail() {
        let c = TokenCorpus::from_flat(&[1, 2, 3, 4, 5, 6, 7], 3).unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c.seq_len(), 3);
    }

    #[test]
    fn test_next_chunk_advances() {
        let mut c = corpus(6, 2);
        let chunk = c.next_chunk(2).unwrap();
        assert_eq!(chunk.to_vec2::<u32>().unwrap(), vec![vec![0, 1], vec![2, 3]]);
        assert_eq!(c.token_pointer(), 2);
        assert_eq!(c.remaining(), 4);
    }

    #[test]
    fn test_exhaustion_is_typed_and_leaves_cursor() {
        let mut c = corpus(5, 2);
        c.next_chunk(4).unwrap();
        let err = c.next_chunk(2).unwrap_err();
        assert_eq!(
            err.downcast_ref::<SaeError>(),
            Some(&SaeError::CorpusExhausted {
                cursor: 4,
                needed: 2,
                available: 1
            })
        );
        assert_eq!(c.token_pointer(), 4);
    }

    #[test]
    fn test_wrap_policy() {
        let mut c = corpus(5, 2).with_policy(CorpusPolicy::Wrap);
        c.next_chunk(4).unwrap();
        let chunk = c.next_chunk(2).unwrap();
        assert_eq!(chunk.to_vec2::<u32>().unwrap()[0], vec![0, 1]);
        assert_eq!(c.token_pointer(), 2);
        assert_eq!(c.wraps(), 1);
    }

    #[test]
    fn test_bos_and_shuffle() {
        let c = corpus(8, 3).with_bos(99).unwrap();
        let rows = c.tokens().to_vec2::<u32>().unwrap();
        assert!(rows.iter().all(|r| r[0] == 99));
        assert_eq!(rows[1], vec![99, 4, 5]);

        let a = corpus(8, 3).shuffle_documents(7).unwrap();
        let b = corpus(8, 3).shuffle_documents(7).unwrap();
        let rows_a = a.tokens().to_vec2::<u32>().unwrap();
        assert_eq!(rows_a, b.tokens().to_vec2::<u32>().unwrap());
        // Same rows, possibly reordered
        let mut sorted = rows_a.clone();
        sorted.sort();
        assert_eq!(sorted, corpus(8, 3).tokens().to_vec2::<u32>().unwrap());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.safetensors");
        let c = corpus(4, 3);
        c.save(&path).unwrap();
        let loaded = TokenCorpus::load(&path).unwrap();
        assert_eq!(
            loaded.tokens().to_vec2::<u32>().unwrap(),
            c.tokens().to_vec2::<u32>().unwrap()
        );
    }
}
