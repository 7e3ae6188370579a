//! Autoencoder + buffer configuration
//!
//! A [`SaeConfig`] is built from user-facing fields, then [`SaeConfig::derive`]
//! fills in the derived sizes and validates every cross-field constraint.
//! The derived record is treated as immutable for the rest of the run and is
//! what gets written next to every saved parameter file.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::invalid_config;
use crate::nonlinearity::Nonlinearity;
use crate::source::Site;

/// Precision used for autoencoder parameters and compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
}

impl Precision {
    pub fn dtype(&self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

/// What the token cursor does when it reaches the end of the corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorpusPolicy {
    /// Raise [`crate::SaeError::CorpusExhausted`].
    #[default]
    Error,
    /// Restart from the first sequence.
    Wrap,
}

/// Cosine modulation of the L1 coefficient over training steps:
/// `l1 * (1 + range * cos(2π step / period))`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CosineL1 {
    pub period: usize,
    pub range: f64,
}

impl CosineL1 {
    pub fn scale_at(&self, step: usize) -> f64 {
        let phase = 2.0 * std::f64::consts::PI * (step % self.period) as f64 / self.period as f64;
        1.0 + self.range * phase.cos()
    }
}

/// How dead features get new directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResampleStrategy {
    /// Sample residual vectors with probability proportional to squared norm.
    #[default]
    ResidualSampling,
    /// Residual sampling, then orthogonalize each new direction against the
    /// `trail` most frequently used decoder rows and against each other.
    GramSchmidt { trail: usize },
}

/// Full autoencoder, buffer and sweep configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaeConfig {
    pub seed: u64,
    /// Activation vectors per training batch
    pub batch_size: usize,
    /// Buffer capacity in batches
    pub buffer_mult: usize,
    /// Learning rates swept in one pass
    pub lrs: Vec<f64>,
    /// L1 coefficients swept in one pass
    pub l1_coeffs: Vec<f64>,
    pub beta1: f64,
    pub beta2: f64,
    pub weight_decay: f64,
    pub dict_mult: usize,
    /// Tokens per sequence in the corpus
    pub seq_len: usize,
    pub layer: usize,
    /// Hook name, e.g. "z", "resid_pre", "mlp_out", "embed"
    pub site: String,
    pub model_name: String,
    pub enc_dtype: Precision,
    /// Flatten `(head, d_head)` into one feature axis
    pub flatten_heads: bool,
    /// Heads at the site (only used when `flatten_heads`)
    pub n_heads: usize,
    /// Per-head width when `flatten_heads`, otherwise the full activation width
    pub d_head: usize,
    /// Fraction of the buffer refilled per refresh, in (0, 1]
    pub buffer_refresh_ratio: f64,
    pub nonlinearity: Nonlinearity,
    pub cosine_l1: Option<CosineL1>,
    pub corpus_policy: CorpusPolicy,
    pub resample_strategy: ResampleStrategy,
    /// Upper bound on features re-initialized per resampling pass (per variant)
    pub num_to_resample: usize,
    /// Pre-activation of a resampled feature for an input of the batch's mean
    /// norm lying along its new direction
    pub resample_encoder_scale: f64,

    // --- Derived (filled by `derive`) ---
    /// Sequences per forward pass; derived from `batch_size / seq_len * 16`
    /// unless set explicitly
    pub model_batch_size: Option<usize>,
    pub act_size: usize,
    pub buffer_size: usize,
    pub buffer_batches: usize,
    pub dict_size: usize,
    pub act_name: String,
    pub name: String,
}

impl Default for SaeConfig {
    fn default() -> Self {
        Self {
            seed: 49,
            batch_size: 256,
            buffer_mult: 10_000,
            lrs: vec![3e-4],
            l1_coeffs: vec![8e-4],
            beta1: 0.9,
            beta2: 0.99,
            weight_decay: 0.01,
            dict_mult: 32,
            seq_len: 128,
            layer: 0,
            site: "z".to_string(),
            model_name: "gelu-1l".to_string(),
            enc_dtype: Precision::Fp32,
            flatten_heads: true,
            n_heads: 8,
            d_head: 64,
            buffer_refresh_ratio: 0.1,
            nonlinearity: Nonlinearity::Relu,
            cosine_l1: None,
            corpus_policy: CorpusPolicy::Error,
            resample_strategy: ResampleStrategy::ResidualSampling,
            num_to_resample: usize::MAX,
            resample_encoder_scale: 0.2,
            model_batch_size: None,
            act_size: 0,
            buffer_size: 0,
            buffer_batches: 0,
            dict_size: 0,
            act_name: String::new(),
            name: String::new(),
        }
    }
}

impl SaeConfig {
    /// Fill derived fields and validate. Idempotent: deriving a derived
    /// config yields the same record.
    pub fn derive(mut self) -> Result<Self> {
        if self.batch_size == 0 || self.buffer_mult == 0 || self.seq_len == 0 {
            return Err(invalid_config(
                "batch_size, buffer_mult and seq_len must all be > 0",
            ));
        }
        if self.dict_mult == 0 {
            return Err(invalid_config("dict_mult must be > 0"));
        }
        if self.lrs.is_empty() || self.l1_coeffs.is_empty() {
            return Err(invalid_config("lrs and l1_coeffs must be non-empty"));
        }
        if self.lrs.iter().any(|lr| !lr.is_finite() || *lr <= 0.0) {
            return Err(invalid_config(format!("learning rates must be > 0: {:?}", self.lrs)));
        }
        if self.l1_coeffs.iter().any(|c| !c.is_finite() || *c < 0.0) {
            return Err(invalid_config(format!(
                "l1 coefficients must be >= 0: {:?}",
                self.l1_coeffs
            )));
        }
        if !(self.buffer_refresh_ratio > 0.0 && self.buffer_refresh_ratio <= 1.0) {
            return Err(invalid_config(format!(
                "buffer_refresh_ratio must be in (0, 1], got {}",
                self.buffer_refresh_ratio
            )));
        }
        if let Some(cos) = &self.cosine_l1 {
            if cos.period == 0 {
                return Err(invalid_config("cosine_l1.period must be > 0"));
            }
        }
        if self.num_to_resample == 0 {
            return Err(invalid_config("num_to_resample must be > 0"));
        }
        self.nonlinearity
            .validate()
            .map_err(|e| invalid_config(e.to_string()))?;

        self.act_size = if self.flatten_heads {
            self.n_heads * self.d_head
        } else {
            self.d_head
        };
        if self.act_size == 0 {
            return Err(invalid_config("activation width must be > 0"));
        }

        let model_batch_size = match self.model_batch_size {
            Some(n) => n,
            None => self.batch_size / self.seq_len * 16,
        };
        if model_batch_size == 0 {
            return Err(invalid_config(format!(
                "model_batch_size derived as 0 (batch_size={}, seq_len={}); set it explicitly",
                self.batch_size, self.seq_len
            )));
        }
        self.model_batch_size = Some(model_batch_size);

        self.buffer_size = self.batch_size * self.buffer_mult;
        if self.buffer_size % self.seq_len != 0 {
            return Err(invalid_config(format!(
                "buffer_size {} is not a multiple of seq_len {}",
                self.buffer_size, self.seq_len
            )));
        }
        self.buffer_batches = self.buffer_size / self.seq_len;
        let chunk_rows = model_batch_size * self.seq_len;
        if self.buffer_size % chunk_rows != 0 {
            return Err(invalid_config(format!(
                "buffer_size {} is not a multiple of model_batch_size * seq_len = {chunk_rows}",
                self.buffer_size
            )));
        }

        let refresh_rows = (self.buffer_size as f64 * self.buffer_refresh_ratio).floor() as usize;
        if refresh_rows <= self.batch_size {
            return Err(invalid_config(format!(
                "refresh window of {refresh_rows} rows must exceed batch_size {}",
                self.batch_size
            )));
        }
        // A partial refresh must bring in at least as many rows as were
        // served before it triggers, or served rows survive as the tail.
        let partial_sequences =
            (self.buffer_batches as f64 * self.buffer_refresh_ratio).floor() as usize;
        if partial_sequences == 0 {
            return Err(invalid_config(format!(
                "refresh ratio {} of {} buffer sequences fetches no new sequences",
                self.buffer_refresh_ratio, self.buffer_batches
            )));
        }
        let fresh_rows = partial_sequences.div_ceil(model_batch_size) * chunk_rows;
        if fresh_rows < refresh_rows {
            return Err(invalid_config(format!(
                "partial refresh writes {fresh_rows} rows but up to {refresh_rows} are served before it"
            )));
        }

        self.dict_size = self.act_size * self.dict_mult;
        self.act_name = self.site().act_name();
        self.name = format!(
            "{}_{}_{}_{}",
            self.model_name, self.layer, self.dict_size, self.site
        );
        Ok(self)
    }

    /// Sequences per forward pass. Only meaningful after `derive`.
    pub fn model_batch_size(&self) -> usize {
        self.model_batch_size.unwrap_or(0)
    }

    pub fn site(&self) -> Site {
        Site::new(&self.site, self.layer)
    }

    pub fn n_variants(&self) -> usize {
        self.lrs.len() * self.l1_coeffs.len()
    }

    /// `(lr, l1_coeff)` for a flat variant index, lr-major.
    pub fn variant_hparams(&self, index: usize) -> (f64, f64) {
        let n_l1 = self.l1_coeffs.len();
        (self.lrs[index / n_l1], self.l1_coeffs[index % n_l1])
    }

    /// Load a JSON config and derive it.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let cfg: SaeConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        cfg.derive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SaeError;

    fn small() -> SaeConfig {
        SaeConfig {
            batch_size: 4,
            buffer_mult: 16,
            seq_len: 4,
            n_heads: 2,
            d_head: 4,
            dict_mult: 2,
            buffer_refresh_ratio: 0.5,
            model_batch_size: Some(2),
            ..Default::default()
        }
    }

    fn config_error(cfg: SaeConfig) -> SaeError {
        cfg.derive()
            .unwrap_err()
            .downcast_ref::<SaeError>()
            .cloned()
            .expect("typed config error")
    }

    #[test]
    fn test_default_derivation_sizes() {
        let cfg = SaeConfig::default().derive().unwrap();
        assert_eq!(cfg.act_size, 512);
        assert_eq!(cfg.buffer_size, 256 * 10_000);
        assert_eq!(cfg.buffer_batches, 256 * 10_000 / 128);
        assert_eq!(cfg.model_batch_size(), 32);
        assert_eq!(cfg.dict_size, 512 * 32);
        assert_eq!(cfg.act_name, "blocks.0.attn.hook_z");
        assert_eq!(cfg.name, "gelu-1l_0_16384_z");
    }

    #[test]
    fn test_derive_is_idempotent() {
        let once = small().derive().unwrap();
        let twice = once.clone().derive().unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_unflattened_width() {
        let cfg = SaeConfig {
            flatten_heads: false,
            d_head: 12,
            ..small()
        }
        .derive()
        .unwrap();
        assert_eq!(cfg.act_size, 12);
        assert_eq!(cfg.dict_size, 24);
    }

    #[test]
    fn test_empty_variant_lists_rejected() {
        let err = config_error(SaeConfig {
            lrs: vec![],
            ..small()
        });
        assert!(matches!(err, SaeError::InvalidConfig(_)));
        let err = config_error(SaeConfig {
            l1_coeffs: vec![],
            ..small()
        });
        assert!(matches!(err, SaeError::InvalidConfig(_)));
    }

    #[test]
    fn test_non_divisible_chunks_rejected() {
        // 64 rows, chunk = 3 * 4 = 12 rows
        let err = config_error(SaeConfig {
            model_batch_size: Some(3),
            ..small()
        });
        assert!(matches!(err, SaeError::InvalidConfig(_)));
    }

    #[test]
    fn test_refresh_ratio_bounds() {
        assert!(SaeConfig {
            buffer_refresh_ratio: 0.0,
            ..small()
        }
        .derive()
        .is_err());
        assert!(SaeConfig {
            buffer_refresh_ratio: 1.5,
            ..small()
        }
        .derive()
        .is_err());
        // 64 * 0.05 = 3 rows < batch_size
        assert!(SaeConfig {
            buffer_refresh_ratio: 0.05,
            ..small()
        }
        .derive()
        .is_err());
    }

    #[test]
    fn test_partial_refresh_without_sequences_rejected() {
        // 64 rows of 16 tokens = 4 sequences, floor(4 * 0.2) = 0
        let err = config_error(SaeConfig {
            seq_len: 16,
            model_batch_size: Some(1),
            buffer_refresh_ratio: 0.2,
            ..small()
        });
        assert!(matches!(err, SaeError::InvalidConfig(_)));
    }

    #[test]
    fn test_partial_refresh_shorter_than_window_rejected() {
        // Window floor(64 * 0.3) = 19 rows, refresh floor(16 * 0.3) = 4
        // sequences in one chunk of 4 = 16 rows
        let err = config_error(SaeConfig {
            model_batch_size: Some(4),
            buffer_refresh_ratio: 0.3,
            ..small()
        });
        assert!(matches!(err, SaeError::InvalidConfig(_)));

        // 16-row window, 4 sequences in two chunks of 2 = 16 rows
        let cfg = SaeConfig {
            buffer_refresh_ratio: 0.25,
            ..small()
        }
        .derive()
        .unwrap();
        assert_eq!(cfg.buffer_batches, 16);
    }

    #[test]
    fn test_variant_hparams_lr_major() {
        let cfg = SaeConfig {
            lrs: vec![1e-3, 1e-4],
            l1_coeffs: vec![0.1, 0.2, 0.3],
            ..small()
        }
        .derive()
        .unwrap();
        assert_eq!(cfg.n_variants(), 6);
        assert_eq!(cfg.variant_hparams(0), (1e-3, 0.1));
        assert_eq!(cfg.variant_hparams(2), (1e-3, 0.3));
        assert_eq!(cfg.variant_hparams(4), (1e-4, 0.2));
    }

    #[test]
    fn test_cosine_l1_scale() {
        let cos = CosineL1 {
            period: 100,
            range: 0.5,
        };
        assert!((cos.scale_at(0) - 1.5).abs() < 1e-12);
        assert!((cos.scale_at(50) - 0.5).abs() < 1e-12);
        assert!((cos.scale_at(100) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_json_round_trip() {
        let cfg = small().derive().unwrap();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: SaeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }
}
