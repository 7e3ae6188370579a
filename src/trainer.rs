//! Training driver
//!
//! Pulls batches from the shuffle buffer, steps every autoencoder variant,
//! and runs the dead-feature schedule:
//!
//! - frequencies are reset once at `first_freq_reset`
//! - every `resample_every` steps after that (same phase) a checkpoint is
//!   saved, features below `dead_threshold` are flagged and frequencies reset
//! - every `resample_apply_every` steps (at `resample_apply_offset`) flagged
//!   features are resampled from the current batch's residuals
//!
//! A final save is attempted on every exit path; if the trainer is dropped
//! mid-run (panic unwinding through `run`), `Drop` makes the attempt.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::buffer::ShuffleBuffer;
use crate::error::{invalid_config, SaeError};
use crate::metrics::{MetricRecord, MetricsWriter};
use crate::optim::SaeOptimizer;
use crate::sae::{EncodeOptions, SparseAutoencoder};
use crate::source::ActivationSource;
use crate::storage::ArtifactStore;

/// Schedule and output settings for one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Activation vectors to train on; steps = `num_tokens / batch_size`
    pub num_tokens: usize,
    pub log_every: usize,
    pub freq_log_every: usize,
    pub first_freq_reset: usize,
    pub resample_every: usize,
    pub resample_apply_every: usize,
    pub resample_apply_offset: usize,
    /// Features firing less often than this are flagged as dead
    pub dead_threshold: f64,
    pub save_dir: PathBuf,
    /// JSONL metrics output; `None` logs only
    pub metrics_file: Option<PathBuf>,
    /// Extra refreshes before the first step (see [`ShuffleBuffer::freshen`])
    pub freshen_factor: Option<f64>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            num_tokens: 2_000_000_000,
            log_every: 100,
            freq_log_every: 5000,
            first_freq_reset: 13_501,
            resample_every: 15_000,
            resample_apply_every: 200,
            resample_apply_offset: 99,
            dead_threshold: 10f64.powf(-5.5),
            save_dir: PathBuf::from("checkpoints"),
            metrics_file: None,
            freshen_factor: None,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.log_every == 0 || self.freq_log_every == 0 {
            return Err(invalid_config("log intervals must be > 0"));
        }
        if self.resample_every == 0 || self.resample_apply_every == 0 {
            return Err(invalid_config("resample intervals must be > 0"));
        }
        if self.resample_apply_offset >= self.resample_apply_every {
            return Err(invalid_config("resample_apply_offset must be < resample_apply_every"));
        }
        if !(self.dead_threshold > 0.0 && self.dead_threshold < 1.0) {
            return Err(invalid_config("dead_threshold must be in (0, 1)"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub steps: usize,
    pub final_loss: Option<f32>,
    /// Version written by the final save
    pub saved_version: Option<u32>,
    pub features_resampled: usize,
    pub refresh_count: usize,
    pub time_refreshing: Duration,
    pub elapsed: Duration,
}

pub struct Trainer<S: ActivationSource> {
    config: TrainerConfig,
    sae: SparseAutoencoder,
    optimizer: SaeOptimizer,
    buffer: ShuffleBuffer<S>,
    store: ArtifactStore,
    metrics: MetricsWriter,
    step: usize,
    started: bool,
    final_saved: bool,
    features_resampled: usize,
    last_loss: Option<f32>,
}

impl<S: ActivationSource> Trainer<S> {
    pub fn new(
        config: TrainerConfig,
        sae: SparseAutoencoder,
        buffer: ShuffleBuffer<S>,
    ) -> Result<Self> {
        config.validate()?;
        if buffer.cfg().act_size != sae.cfg().act_size {
            return Err(SaeError::WidthMismatch {
                expected: sae.cfg().act_size,
                actual: buffer.cfg().act_size,
            }
            .into());
        }
        let store = ArtifactStore::open(&config.save_dir)?;
        let metrics = match &config.metrics_file {
            Some(path) => MetricsWriter::create(path)?,
            None => MetricsWriter::log_only(),
        };
        let optimizer = sae.optimizer()?;
        Ok(Self {
            config,
            sae,
            optimizer,
            buffer,
            store,
            metrics,
            step: 0,
            started: false,
            final_saved: false,
            features_resampled: 0,
            last_loss: None,
        })
    }

    pub fn sae(&self) -> &SparseAutoencoder {
        &self.sae
    }

    pub fn buffer(&self) -> &ShuffleBuffer<S> {
        &self.buffer
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Steps completed so far.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn num_steps(&self) -> usize {
        self.config.num_tokens / self.sae.cfg().batch_size
    }

    /// Train for `num_tokens / batch_size` steps, then save.
    ///
    /// The final save is attempted even when training fails; the training
    /// error takes precedence over a save error.
    pub fn run(&mut self) -> Result<TrainSummary> {
        let num_steps = self.num_steps();
        info!(
            "Training {} for {num_steps} steps ({} variant(s), batch {})",
            self.sae.cfg().name,
            self.sae.variants().len(),
            self.sae.cfg().batch_size
        );
        self.started = true;
        let t0 = Instant::now();

        let trained = self.train_steps(num_steps, t0);
        let saved = self.save_final();
        let saved_version = match (trained, saved) {
            (Ok(()), Ok(v)) => v,
            (Err(e), Ok(_)) => return Err(e),
            (Ok(()), Err(e)) => return Err(e),
            (Err(e), Err(save_err)) => {
                error!("Final save failed: {save_err:#}");
                return Err(e);
            }
        };

        let summary = TrainSummary {
            steps: self.step,
            final_loss: self.last_loss,
            saved_version: Some(saved_version),
            features_resampled: self.features_resampled,
            refresh_count: self.buffer.refresh_count(),
            time_refreshing: self.buffer.time_refreshing(),
            elapsed: t0.elapsed(),
        };
        info!(
            "Finished {} steps in {:.1?} ({:.1?} refreshing), saved version {saved_version}",
            summary.steps, summary.elapsed, summary.time_refreshing
        );
        Ok(summary)
    }

    fn train_steps(&mut self, num_steps: usize, t0: Instant) -> Result<()> {
        if let Some(factor) = self.config.freshen_factor {
            self.buffer.freshen(factor, true)?;
        }
        while self.step < num_steps {
            let i = self.step;
            self.train_step(i, t0)
                .with_context(|| format!("Training step {i}"))?;
            self.step += 1;
        }
        Ok(())
    }

    fn train_step(&mut self, i: usize, t0: Instant) -> Result<()> {
        let cfg = &self.config;
        let x = self.buffer.next_as(self.sae.dtype())?;
        if let Some(cosine) = self.sae.cfg().cosine_l1 {
            self.sae.set_l1_scale(cosine.scale_at(i));
        }

        let log_now = i % cfg.log_every == 0;
        let opts = EncodeOptions {
            record_frequency: true,
            cache_l0: log_now,
            cache_codes: false,
        };
        let recons = self.sae.encode_decode(&x, opts)?;
        let loss = self.sae.loss()?;
        let mut grads = loss.backward()?;
        self.sae.enforce_unit_decoder_norm(&mut grads)?;
        self.optimizer.step(&grads)?;

        let waiting = self.sae.pending_resample_count();
        if i % cfg.resample_apply_every == cfg.resample_apply_offset && waiting > 0 {
            let report = self.sae.resample(&x, &recons, &mut self.optimizer)?;
            self.features_resampled += report.total();
            self.metrics.record(&MetricRecord::Resample {
                step: i,
                waiting,
                reset: report.total(),
            })?;
        }

        if log_now {
            let loss = loss.to_scalar::<f32>()?;
            self.last_loss = Some(loss);
            let variants = self.sae.variant_stats()?;
            let n = variants.len() as f32;
            let l0 = variants
                .iter()
                .map(|v| v.l0)
                .sum::<Option<f32>>()
                .map(|s| s / n);
            self.metrics.record(&MetricRecord::Step {
                step: i,
                loss,
                mse: variants.iter().map(|v| v.mse).sum::<f32>() / n,
                l1: variants.iter().map(|v| v.l1).sum::<f32>() / n,
                l0,
                l1_scale: self.sae.l1_scale(),
                variants,
            })?;
        }

        if i % self.config.freq_log_every == 0 {
            let below = self
                .sae
                .fraction_below(&[f64::MIN_POSITIVE, 1e-6, 1e-5])?;
            self.metrics.record(&MetricRecord::Frequency {
                step: i,
                dead: below[0],
                below_1e_6: below[1],
                below_1e_5: below[2],
                refresh_count: self.buffer.refresh_count(),
                refresh_secs: self.buffer.time_refreshing().as_secs_f64(),
                wall_secs: t0.elapsed().as_secs_f64(),
            })?;
        }

        let cfg = &self.config;
        if i == cfg.first_freq_reset {
            self.sae.reset_activation_frequencies()?;
        } else if i % cfg.resample_every == cfg.first_freq_reset % cfg.resample_every
            && i > cfg.first_freq_reset
        {
            let t1 = Instant::now();
            let threshold = cfg.dead_threshold;
            let saved_version = Some(self.sae.save(&self.store)?);
            let flagged = self.sae.flag_dead(threshold)?;
            self.sae.reset_activation_frequencies()?;
            self.metrics.record(&MetricRecord::Flag {
                step: i,
                flagged,
                saved_version,
                elapsed_secs: t1.elapsed().as_secs_f64(),
            })?;
        }
        Ok(())
    }

    fn save_final(&mut self) -> Result<u32> {
        let version = self.sae.save(&self.store)?;
        self.final_saved = true;
        Ok(version)
    }
}

impl<S: ActivationSource> Drop for Trainer<S> {
    fn drop(&mut self) {
        if self.started && !self.final_saved {
            warn!("Trainer dropped mid-run at step {}, saving", self.step);
            if let Err(e) = self.save_final() {
                error!("Save on drop failed: {e:#}");
            }
        }
    }
}
