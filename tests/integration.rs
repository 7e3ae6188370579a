//! Integration tests for sae-rs
//!
//! Note: Tests marked with #[ignore] require a model download.
//! Run them explicitly with: cargo test --ignored

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use sae_rs::{
    read_records, ActivationSource, ArtifactStore, CorpusPolicy, EmbeddingSource, MetricRecord,
    SaeConfig, SaeError, ShuffleBuffer, SparseAutoencoder, TokenCorpus, Trainer, TrainerConfig,
};
use tempfile::NamedTempFile;

const VOCAB: usize = 50;

fn small_config() -> SaeConfig {
    SaeConfig {
        batch_size: 4,
        buffer_mult: 16,
        seq_len: 4,
        n_heads: 2,
        d_head: 4,
        dict_mult: 2,
        lrs: vec![1e-3, 3e-4],
        l1_coeffs: vec![1e-3],
        buffer_refresh_ratio: 0.5,
        model_batch_size: Some(2),
        corpus_policy: CorpusPolicy::Wrap,
        ..Default::default()
    }
    .derive()
    .unwrap()
}

/// Write a fake model weight file with an 8-wide embedding table.
fn write_weights(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("model.safetensors");
    let table = Tensor::randn(0f32, 1f32, (VOCAB, 8), &Device::Cpu).unwrap();
    let tensors = HashMap::from([
        ("transformer.wte.weight", table),
        (
            "transformer.ln_f.weight",
            Tensor::ones(8, DType::F32, &Device::Cpu).unwrap(),
        ),
    ]);
    candle_core::safetensors::save(&tensors, &path).unwrap();
    path
}

fn write_corpus(dir: &Path, seq_len: usize) -> std::path::PathBuf {
    let path = dir.join("tokens.safetensors");
    let tokens: Vec<u32> = (0..800).map(|t| (t * 7 % VOCAB) as u32).collect();
    TokenCorpus::from_flat(&tokens, seq_len)
        .unwrap()
        .save(&path)
        .unwrap();
    path
}

fn schedule(dir: &Path, num_tokens: usize) -> TrainerConfig {
    TrainerConfig {
        num_tokens,
        log_every: 5,
        freq_log_every: 10,
        first_freq_reset: 7,
        resample_every: 10,
        resample_apply_every: 4,
        resample_apply_offset: 3,
        dead_threshold: 0.05,
        save_dir: dir.join("checkpoints"),
        metrics_file: Some(dir.join("metrics.jsonl")),
        freshen_factor: None,
    }
}

/// Test config defaults and derived sizes
#[test]
fn test_config_defaults() {
    let cfg = SaeConfig::default().derive().unwrap();
    assert_eq!(cfg.seed, 49);
    assert_eq!(cfg.act_size, 512);
    assert_eq!(cfg.dict_size, 512 * 32);
    assert_eq!(cfg.n_variants(), 1);
    assert_eq!(cfg.name, "gelu-1l_0_16384_z");

    let trainer = TrainerConfig::default();
    assert_eq!(trainer.log_every, 100);
    assert_eq!(trainer.resample_apply_every, 200);
}

/// Test loading a partial config from JSON
#[test]
fn test_config_from_json_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{
        "batch_size": 8,
        "buffer_mult": 8,
        "seq_len": 8,
        "flatten_heads": false,
        "d_head": 16,
        "lrs": [1e-3, 1e-4],
        "l1_coeffs": [1e-3, 2e-3, 3e-3],
        "model_batch_size": 2,
        "buffer_refresh_ratio": 0.5,
        "nonlinearity": {{"name": "undying_relu", "l": 0.001, "k": 0.1}}
    }}"#
    )
    .unwrap();

    let cfg = SaeConfig::load(file.path()).unwrap();
    assert_eq!(cfg.act_size, 16);
    assert_eq!(cfg.buffer_size, 64);
    assert_eq!(cfg.n_variants(), 6);
    assert_eq!(cfg.nonlinearity.name(), "undying_relu");

    let mut bad = NamedTempFile::new().unwrap();
    writeln!(bad, r#"{{"buffer_refresh_ratio": 1.5}}"#).unwrap();
    let err = SaeConfig::load(bad.path()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SaeError>(),
        Some(SaeError::InvalidConfig(_))
    ));
}

/// End to end: weights file -> embedding source -> buffer -> trainer -> checkpoints
#[test]
fn test_train_from_files_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = small_config();
    let weights = write_weights(dir.path());
    let corpus = TokenCorpus::load(&write_corpus(dir.path(), cfg.seq_len)).unwrap();

    let source = EmbeddingSource::from_file(&weights, None, cfg.n_heads, &Device::Cpu).unwrap();
    assert!(source.describe().contains("transformer.wte.weight"));
    let buffer = ShuffleBuffer::new(&cfg, corpus, source, &Device::Cpu).unwrap();
    let sae = SparseAutoencoder::new(&cfg, &Device::Cpu).unwrap();

    let mut trainer = Trainer::new(schedule(dir.path(), 4 * 30), sae, buffer).unwrap();
    let summary = trainer.run().unwrap();
    assert_eq!(summary.steps, 30);
    assert!(summary.final_loss.unwrap().is_finite());

    // Checkpoints at steps 17 and 27, then the final save
    let store = ArtifactStore::open(dir.path().join("checkpoints")).unwrap();
    assert_eq!(store.versions().unwrap(), vec![0, 1, 2]);
    assert_eq!(summary.saved_version, Some(2));

    let loaded = SparseAutoencoder::load(&store, 2, &Device::Cpu).unwrap();
    assert_eq!(loaded.cfg(), &cfg);
    for (a, b) in trainer.sae().variants().iter().zip(loaded.variants()) {
        let a: Vec<Vec<f32>> = a.w_dec().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = b.w_dec().to_vec2().unwrap();
        assert_eq!(a, b);
    }

    let records = read_records(&dir.path().join("metrics.jsonl")).unwrap();
    let first_step = records
        .iter()
        .find_map(|r| match r {
            MetricRecord::Step { variants, .. } => Some(variants.len()),
            _ => None,
        })
        .unwrap();
    assert_eq!(first_step, 2);
}

/// Source width disagreeing with the config fails the first refresh
#[test]
fn test_width_mismatch_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = SaeConfig {
        d_head: 8,
        ..small_config()
    }
    .derive()
    .unwrap();
    let weights = write_weights(dir.path());
    let corpus = TokenCorpus::load(&write_corpus(dir.path(), cfg.seq_len)).unwrap();
    let source = EmbeddingSource::from_file(&weights, None, cfg.n_heads, &Device::Cpu).unwrap();

    let err = ShuffleBuffer::new(&cfg, corpus, source, &Device::Cpu)
        .err()
        .unwrap();
    assert_eq!(
        err.downcast_ref::<SaeError>(),
        Some(&SaeError::WidthMismatch {
            expected: 16,
            actual: 8
        })
    );
}

/// A short corpus with the default policy runs dry; the run still saves
#[test]
fn test_exhausted_corpus_stops_run_and_saves() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = SaeConfig {
        corpus_policy: CorpusPolicy::Error,
        ..small_config()
    }
    .derive()
    .unwrap();
    let weights = write_weights(dir.path());
    // 16 sequences for the first fill + 8 for one refresh
    let tokens: Vec<u32> = (0..24 * 4).map(|t| (t % VOCAB) as u32).collect();
    let corpus = TokenCorpus::from_flat(&tokens, cfg.seq_len).unwrap();
    let source = EmbeddingSource::from_file(&weights, None, cfg.n_heads, &Device::Cpu).unwrap();
    let buffer = ShuffleBuffer::new(&cfg, corpus, source, &Device::Cpu).unwrap();
    let sae = SparseAutoencoder::new(&cfg, &Device::Cpu).unwrap();

    let mut trainer = Trainer::new(schedule(dir.path(), 4 * 30), sae, buffer).unwrap();
    let err = trainer.run().unwrap_err();
    assert!(err
        .chain()
        .any(|e| matches!(e.downcast_ref::<SaeError>(), Some(SaeError::CorpusExhausted { .. }))));
    assert_eq!(trainer.step(), 16);
    assert_eq!(trainer.buffer().token_pointer(), 24);
    assert_eq!(trainer.store().latest().unwrap(), Some(0));
}

/// Model-download test: embedding of a real model
#[test]
#[ignore = "requires model download"]
fn test_embedding_from_hub() {
    let source =
        EmbeddingSource::from_hub("gpt2", "model.safetensors", None, 1, &Device::Cpu).unwrap();
    assert_eq!(source.vocab_size(), 50257);
    assert_eq!(source.d_model(), 768);
}
