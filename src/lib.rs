// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `w_enc`/`b_enc`
#![allow(clippy::module_name_repetitions)] // SaeConfig in config.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::unused_self)] // &self for API consistency
#![allow(clippy::struct_field_names)] // field postfix patterns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! SAE-rs: sparse autoencoders on transformer activations
//!
//! Trains a sweep of sparse autoencoders (one per learning rate x L1
//! coefficient pair) on activations streamed through a shuffle buffer.
//!
//! ## Architecture
//!
//! - `config`: SaeConfig with derived sizes and validation
//! - `corpus`: Fixed-length token sequences and the token cursor
//! - `source`: ActivationSource trait, hook naming, head flattening
//! - `embedding`: Token-embedding activation source from safetensors weights
//! - `buffer`: Shuffle buffer with partial refresh and full re-permutation
//! - `nonlinearity`: ReLU, leaky ReLU and undying ReLU
//! - `sae`: Multi-variant autoencoder, unit-norm decoder, dead-feature states
//! - `resample`: Direction selection for resampled features
//! - `optim`: AdamW with per-feature moment resets
//! - `storage`: Versioned safetensors + JSON checkpoints
//! - `metrics`: Metric records, logged and written as JSONL
//! - `trainer`: Training loop, resampling schedule, save on exit

pub mod buffer;
pub mod config;
pub mod corpus;
pub mod embedding;
pub mod error;
pub mod metrics;
pub mod nonlinearity;
pub mod optim;
pub mod resample;
pub mod sae;
pub mod source;
pub mod storage;
pub mod trainer;

pub use buffer::{ShuffleBuffer, BUFFER_DTYPE};
pub use config::{CorpusPolicy, CosineL1, Precision, ResampleStrategy, SaeConfig};
pub use corpus::TokenCorpus;
pub use embedding::EmbeddingSource;
pub use error::SaeError;
pub use metrics::{read_records, MetricRecord, MetricsWriter};
pub use nonlinearity::Nonlinearity;
pub use optim::{FeatureAdamW, SaeOptimizer};
pub use sae::{
    EncodeOptions, FeatureState, ResampleReport, SparseAutoencoder, Variant, VariantStats,
};
pub use source::{flatten_activations, ActivationSource, Site};
pub use storage::ArtifactStore;
pub use trainer::{TrainSummary, Trainer, TrainerConfig};
