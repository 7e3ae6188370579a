//! Sparse autoencoder over a grid of (learning rate, L1 coefficient) variants
//!
//! Every variant sees the same input batch. Parameters are kept as one record
//! per variant, index `i` mapping to `(lrs[i / n_l1], l1_coeffs[i % n_l1])`.
//! On disk they are stacked with two leading axes `(n_lrs, n_l1, ...)`:
//!
//! | name    | shape                              |
//! |---------|------------------------------------|
//! | `W_enc` | `(n_lrs, n_l1, act_size, dict_size)` |
//! | `b_enc` | `(n_lrs, n_l1, 1, dict_size)`      |
//! | `W_dec` | `(n_lrs, n_l1, dict_size, act_size)` |
//! | `b_dec` | `(n_lrs, n_l1, 1, act_size)`       |
//!
//! Dead features move through `Healthy -> Flagged -> Resampling -> Healthy`.
//! Flagging and resampling are separate calls so the driver decides when each
//! happens.

use std::collections::HashMap;

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::ParamsAdamW;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SaeConfig;
use crate::error::SaeError;
use crate::nonlinearity::Nonlinearity;
use crate::optim::SaeOptimizer;
use crate::resample::{choose_directions, l2_norm};
use crate::storage::ArtifactStore;

pub const W_ENC: &str = "W_enc";
pub const B_ENC: &str = "b_enc";
pub const W_DEC: &str = "W_dec";
pub const B_DEC: &str = "b_dec";

const ADAM_EPS: f64 = 1e-8;

/// Lifecycle of one feature with respect to resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeatureState {
    #[default]
    Healthy,
    /// Activation rate fell below the dead threshold; waiting for `resample`.
    Flagged,
    /// Being re-initialized (only observable inside `resample`).
    Resampling,
}

/// Parameters and bookkeeping of one (lr, l1) variant.
pub struct Variant {
    pub lr: f64,
    pub l1_coeff: f64,
    /// (act_size, dict_size)
    w_enc: Var,
    /// (dict_size)
    b_enc: Var,
    /// (dict_size, act_size), rows unit norm
    w_dec: Var,
    /// (act_size)
    b_dec: Var,
    /// Summed per-batch firing fraction of each feature, F32 (dict_size)
    frequency: Var,
    states: Vec<FeatureState>,
}

impl Variant {
    fn from_tensors(
        lr: f64,
        l1_coeff: f64,
        w_enc: &Tensor,
        b_enc: &Tensor,
        w_dec: &Tensor,
        b_dec: &Tensor,
    ) -> Result<Self> {
        let dict_size = b_enc.dims1()?;
        Ok(Self {
            lr,
            l1_coeff,
            w_enc: Var::from_tensor(w_enc)?,
            b_enc: Var::from_tensor(b_enc)?,
            w_dec: Var::from_tensor(w_dec)?,
            b_dec: Var::from_tensor(b_dec)?,
            frequency: Var::zeros(dict_size, DType::F32, w_enc.device())?,
            states: vec![FeatureState::Healthy; dict_size],
        })
    }

    pub fn w_enc(&self) -> &Var {
        &self.w_enc
    }

    pub fn b_enc(&self) -> &Var {
        &self.b_enc
    }

    pub fn w_dec(&self) -> &Var {
        &self.w_dec
    }

    pub fn b_dec(&self) -> &Var {
        &self.b_dec
    }

    pub fn states(&self) -> &[FeatureState] {
        &self.states
    }

    /// Trainable parameters, in optimizer order.
    pub fn vars(&self) -> Vec<Var> {
        vec![
            self.w_enc.clone(),
            self.b_enc.clone(),
            self.w_dec.clone(),
            self.b_dec.clone(),
        ]
    }

    /// Returns `(codes, reconstruction)`.
    fn forward(&self, x: &Tensor, nonlinearity: &Nonlinearity) -> Result<(Tensor, Tensor)> {
        let x_cent = x.broadcast_sub(self.b_dec.as_tensor())?;
        let pre = x_cent
            .matmul(self.w_enc.as_tensor())?
            .broadcast_add(self.b_enc.as_tensor())?;
        let acts = nonlinearity.apply(&pre)?;
        let recon = acts
            .matmul(self.w_dec.as_tensor())?
            .broadcast_add(self.b_dec.as_tensor())?;
        Ok((acts, recon))
    }
}

/// What `encode_decode` records besides the reconstructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncodeOptions {
    /// Add this batch to the activation frequency counters.
    pub record_frequency: bool,
    /// Cache the mean L0 of the codes.
    pub cache_l0: bool,
    /// Keep the codes themselves (see [`SparseAutoencoder::codes`]).
    pub cache_codes: bool,
}

impl EncodeOptions {
    /// Options for a training step: frequencies and L0, no codes.
    pub fn training() -> Self {
        Self {
            record_frequency: true,
            cache_l0: true,
            cache_codes: false,
        }
    }
}

/// Scalar tensors of the last batch, still attached to the graph.
struct CachedStats {
    mse: Tensor,
    l1: Tensor,
    l0: Option<Tensor>,
}

/// Host copy of one variant's last-batch statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantStats {
    pub lr: f64,
    pub l1_coeff: f64,
    pub mse: f32,
    pub l1: f32,
    pub l0: Option<f32>,
    /// `mse + l1_coeff * l1_scale * l1`
    pub loss: f32,
}

/// Outcome of one `resample` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResampleReport {
    /// Features re-initialized, per variant
    pub resampled: Vec<Vec<usize>>,
    /// Features still flagged after this pass (all variants)
    pub still_flagged: usize,
}

impl ResampleReport {
    pub fn total(&self) -> usize {
        self.resampled.iter().map(Vec::len).sum()
    }
}

pub struct SparseAutoencoder {
    cfg: SaeConfig,
    variants: Vec<Variant>,
    device: Device,
    steps_since_reset: usize,
    l1_scale: f64,
    cached: Vec<CachedStats>,
    codes: Option<Vec<Tensor>>,
    rng: StdRng,
}

impl SparseAutoencoder {
    /// Fresh autoencoder: Kaiming-uniform weights seeded from `cfg.seed`,
    /// unit-norm decoder rows, zero biases.
    pub fn new(cfg: &SaeConfig, device: &Device) -> Result<Self> {
        anyhow::ensure!(
            cfg.act_size > 0 && cfg.dict_size > 0,
            "SaeConfig must be derived before building an autoencoder"
        );
        let (act, dict) = (cfg.act_size, cfg.dict_size);
        let dtype = cfg.enc_dtype.dtype();
        let mut rng = StdRng::seed_from_u64(cfg.seed);

        let mut variants = Vec::with_capacity(cfg.n_variants());
        for i in 0..cfg.n_variants() {
            let (lr, l1_coeff) = cfg.variant_hparams(i);
            let w_enc = kaiming_uniform(&mut rng, act * dict, act);
            let mut w_dec = kaiming_uniform(&mut rng, dict * act, dict);
            for row in w_dec.chunks_mut(act) {
                let norm = l2_norm(row);
                row.iter_mut().for_each(|v| *v /= norm);
            }
            let w_enc = Tensor::from_vec(w_enc, (act, dict), device)?.to_dtype(dtype)?;
            let w_dec = Tensor::from_vec(w_dec, (dict, act), device)?.to_dtype(dtype)?;
            let b_enc = Tensor::zeros(dict, dtype, device)?;
            let b_dec = Tensor::zeros(act, dtype, device)?;
            variants.push(Variant::from_tensors(
                lr, l1_coeff, &w_enc, &b_enc, &w_dec, &b_dec,
            )?);
        }
        info!(
            "Autoencoder {}: {} variant(s), act_size={act}, dict_size={dict}, {}",
            cfg.name,
            variants.len(),
            cfg.nonlinearity
        );

        Ok(Self {
            cfg: cfg.clone(),
            variants,
            device: device.clone(),
            steps_since_reset: 0,
            l1_scale: 1.0,
            cached: Vec::new(),
            codes: None,
            rng,
        })
    }

    pub fn cfg(&self) -> &SaeConfig {
        &self.cfg
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.cfg.enc_dtype.dtype()
    }

    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    pub fn variant(&self, index: usize) -> Option<&Variant> {
        self.variants.get(index)
    }

    pub fn steps_since_reset(&self) -> usize {
        self.steps_since_reset
    }

    pub fn l1_scale(&self) -> f64 {
        self.l1_scale
    }

    /// Multiplier applied to every variant's L1 coefficient (cosine schedule).
    pub fn set_l1_scale(&mut self, scale: f64) {
        self.l1_scale = scale;
    }

    /// Codes of the last batch, if requested with `cache_codes`.
    pub fn codes(&self) -> Option<&[Tensor]> {
        self.codes.as_deref()
    }

    /// Fresh optimizer state, one AdamW per variant with that variant's lr.
    pub fn optimizer(&self) -> Result<SaeOptimizer> {
        let groups = self
            .variants
            .iter()
            .map(|v| {
                let params = ParamsAdamW {
                    lr: v.lr,
                    beta1: self.cfg.beta1,
                    beta2: self.cfg.beta2,
                    eps: ADAM_EPS,
                    weight_decay: self.cfg.weight_decay,
                };
                (v.vars(), params)
            })
            .collect();
        SaeOptimizer::new(groups)
    }

    /// Run every variant on `x` (batch, act_size). Returns one reconstruction
    /// per variant and caches the loss terms for [`Self::loss`].
    pub fn encode_decode(&mut self, x: &Tensor, opts: EncodeOptions) -> Result<Vec<Tensor>> {
        let (_, width) = x.dims2()?;
        if width != self.cfg.act_size {
            return Err(SaeError::WidthMismatch {
                expected: self.cfg.act_size,
                actual: width,
            }
            .into());
        }
        let x = x.to_device(&self.device)?.to_dtype(self.dtype())?;
        let x32 = x.to_dtype(DType::F32)?;

        let mut recons = Vec::with_capacity(self.variants.len());
        let mut cached = Vec::with_capacity(self.variants.len());
        let mut codes = opts.cache_codes.then(Vec::new);
        for variant in &self.variants {
            let (acts, recon) = variant.forward(&x, &self.cfg.nonlinearity)?;
            let acts32 = acts.to_dtype(DType::F32)?;
            let mse = (recon.to_dtype(DType::F32)? - &x32)?.sqr()?.mean_all()?;
            let l1 = acts32.abs()?.sum(1)?.mean_all()?;

            let fired = if opts.record_frequency || opts.cache_l0 {
                Some(acts32.gt(0f64)?.to_dtype(DType::F32)?)
            } else {
                None
            };
            let l0 = match (&fired, opts.cache_l0) {
                (Some(f), true) => Some(f.sum(1)?.mean_all()?),
                _ => None,
            };
            if let (Some(f), true) = (&fired, opts.record_frequency) {
                let updated = (variant.frequency.as_tensor() + f.mean(0)?)?;
                variant.frequency.set(&updated)?;
            }

            if let Some(codes) = codes.as_mut() {
                codes.push(acts);
            }
            cached.push(CachedStats { mse, l1, l0 });
            recons.push(recon);
        }
        if opts.record_frequency {
            self.steps_since_reset += 1;
        }
        self.cached = cached;
        self.codes = codes;
        Ok(recons)
    }

    /// Total loss of the last batch: `Σ_v mse_v + l1_coeff_v * l1_scale * l1_v`.
    pub fn loss(&self) -> Result<Tensor> {
        let mut total: Option<Tensor> = None;
        for (variant, stats) in self.variants.iter().zip(&self.cached) {
            let term = (&stats.mse + (&stats.l1 * (variant.l1_coeff * self.l1_scale))?)?;
            total = Some(match total {
                Some(t) => (t + term)?,
                None => term,
            });
        }
        total.context("loss() called before encode_decode()")
    }

    /// Per-variant statistics of the last batch.
    pub fn variant_stats(&self) -> Result<Vec<VariantStats>> {
        anyhow::ensure!(
            !self.cached.is_empty(),
            "variant_stats() called before encode_decode()"
        );
        self.variants
            .iter()
            .zip(&self.cached)
            .map(|(variant, stats)| {
                let mse = stats.mse.to_scalar::<f32>()?;
                let l1 = stats.l1.to_scalar::<f32>()?;
                let l0 = stats
                    .l0
                    .as_ref()
                    .map(|t| t.to_scalar::<f32>())
                    .transpose()?;
                let coeff = (variant.l1_coeff * self.l1_scale) as f32;
                Ok(VariantStats {
                    lr: variant.lr,
                    l1_coeff: variant.l1_coeff,
                    mse,
                    l1,
                    l0,
                    loss: mse + coeff * l1,
                })
            })
            .collect()
    }

    /// Project out the gradient component parallel to each decoder row, then
    /// renormalize the rows. Call between `backward` and the optimizer step.
    pub fn enforce_unit_decoder_norm(&self, grads: &mut GradStore) -> Result<()> {
        for variant in &self.variants {
            let w = variant.w_dec.as_tensor();
            let norms = w.sqr()?.sum_keepdim(1)?.sqrt()?;
            let normed = w.broadcast_div(&norms)?;
            let projected = match grads.get(w) {
                Some(g) => {
                    let parallel = (g * &normed)?.sum_keepdim(1)?.broadcast_mul(&normed)?;
                    Some((g - parallel)?)
                }
                None => None,
            };
            if let Some(g) = projected {
                grads.insert(w, g);
            }
            variant.w_dec.set(&normed)?;
        }
        Ok(())
    }

    /// Firing rate of every feature since the last reset, per variant.
    pub fn activation_frequencies(&self) -> Result<Vec<Vec<f32>>> {
        let steps = self.steps_since_reset.max(1) as f64;
        self.variants
            .iter()
            .map(|v| Ok((v.frequency.as_tensor() / steps)?.to_vec1::<f32>()?))
            .collect()
    }

    pub fn reset_activation_frequencies(&mut self) -> Result<()> {
        for variant in &self.variants {
            let zeros = variant.frequency.as_tensor().zeros_like()?;
            variant.frequency.set(&zeros)?;
        }
        debug!(
            "Reset activation frequencies after {} steps",
            self.steps_since_reset
        );
        self.steps_since_reset = 0;
        Ok(())
    }

    /// Fraction of features (over all variants) firing less often than each
    /// threshold.
    pub fn fraction_below(&self, thresholds: &[f64]) -> Result<Vec<f64>> {
        let freqs = self.activation_frequencies()?;
        let total = freqs.iter().map(Vec::len).sum::<usize>().max(1) as f64;
        Ok(thresholds
            .iter()
            .map(|t| {
                let below = freqs
                    .iter()
                    .flatten()
                    .filter(|f| f64::from(**f) < *t)
                    .count();
                below as f64 / total
            })
            .collect())
    }

    /// Flag every healthy feature whose rate is below `threshold`.
    /// Returns the number of newly flagged features.
    pub fn flag_dead(&mut self, threshold: f64) -> Result<usize> {
        if self.steps_since_reset == 0 {
            warn!("flag_dead called with no recorded steps; nothing flagged");
            return Ok(0);
        }
        let freqs = self.activation_frequencies()?;
        let mut flagged = 0;
        for (variant, rates) in self.variants.iter_mut().zip(&freqs) {
            for (state, rate) in variant.states.iter_mut().zip(rates) {
                if *state == FeatureState::Healthy && f64::from(*rate) < threshold {
                    *state = FeatureState::Flagged;
                    flagged += 1;
                }
            }
        }
        info!(
            "Flagged {flagged} dead feature(s) (threshold {threshold:.2e}, {} steps)",
            self.steps_since_reset
        );
        Ok(flagged)
    }

    pub fn pending_resample_count(&self) -> usize {
        self.variants
            .iter()
            .flat_map(|v| v.states.iter())
            .filter(|s| **s == FeatureState::Flagged)
            .count()
    }

    /// Re-initialize up to `num_to_resample` flagged features per variant.
    ///
    /// * `batch` - the inputs of the last `encode_decode` call
    /// * `reconstructions` - its outputs, one per variant
    ///
    /// New decoder rows are unit directions chosen from the residuals; the
    /// encoder column is the same direction scaled by
    /// `resample_encoder_scale / mean input norm`, so an input of typical norm
    /// along it pre-activates at about `resample_encoder_scale`. The encoder
    /// bias is zero and the optimizer moments of those entries are cleared.
    pub fn resample(
        &mut self,
        batch: &Tensor,
        reconstructions: &[Tensor],
        optimizer: &mut SaeOptimizer,
    ) -> Result<ResampleReport> {
        anyhow::ensure!(
            reconstructions.len() == self.variants.len() && optimizer.len() == self.variants.len(),
            "Expected {} reconstructions and optimizer groups, got {} and {}",
            self.variants.len(),
            reconstructions.len(),
            optimizer.len()
        );
        anyhow::ensure!(
            batch.dim(0)? > 0,
            "Cannot resample from an empty batch"
        );
        let mut report = ResampleReport::default();
        if self.pending_resample_count() == 0 {
            report.resampled = vec![Vec::new(); self.variants.len()];
            return Ok(report);
        }

        let (act, dict) = (self.cfg.act_size, self.cfg.dict_size);
        let dtype = self.dtype();
        let freqs = self.activation_frequencies()?;
        let x32 = batch.to_device(&self.device)?.to_dtype(DType::F32)?;
        let mean_input_norm = x32.sqr()?.sum(1)?.sqrt()?.mean_all()?.to_scalar::<f32>()?;
        let mean_input_norm = if mean_input_norm.is_finite() && mean_input_norm > 0.0 {
            mean_input_norm
        } else {
            1.0
        };
        let enc_norm = self.cfg.resample_encoder_scale as f32 / mean_input_norm;

        for (i, variant) in self.variants.iter_mut().enumerate() {
            let targets: Vec<usize> = variant
                .states
                .iter()
                .enumerate()
                .filter(|(_, s)| **s == FeatureState::Flagged)
                .map(|(f, _)| f)
                .take(self.cfg.num_to_resample)
                .collect();
            if targets.is_empty() {
                report.resampled.push(targets);
                continue;
            }
            for &f in &targets {
                variant.states[f] = FeatureState::Resampling;
            }

            let residuals: Vec<Vec<f32>> = (&x32 - reconstructions[i].to_dtype(DType::F32)?)?
                .to_vec2()?;
            let mut w_enc: Vec<Vec<f32>> = variant.w_enc.to_dtype(DType::F32)?.to_vec2()?;
            let mut w_dec: Vec<Vec<f32>> = variant.w_dec.to_dtype(DType::F32)?.to_vec2()?;
            let mut b_enc: Vec<f32> = variant.b_enc.to_dtype(DType::F32)?.to_vec1()?;

            let directions = choose_directions(
                self.cfg.resample_strategy,
                &residuals,
                act,
                &targets,
                &w_dec,
                &freqs[i],
                &mut self.rng,
            );
            for (&f, dir) in targets.iter().zip(&directions) {
                w_dec[f].clone_from(dir);
                for (row, d) in w_enc.iter_mut().zip(dir) {
                    row[f] = d * enc_norm;
                }
                b_enc[f] = 0.0;
            }

            let w_enc = Tensor::from_vec(w_enc.concat(), (act, dict), &self.device)?;
            let w_dec = Tensor::from_vec(w_dec.concat(), (dict, act), &self.device)?;
            let b_enc = Tensor::from_vec(b_enc, dict, &self.device)?;
            variant.w_enc.set(&w_enc.to_dtype(dtype)?)?;
            variant.w_dec.set(&w_dec.to_dtype(dtype)?)?;
            variant.b_enc.set(&b_enc.to_dtype(dtype)?)?;

            let mut keep = vec![1f32; dict];
            for &f in &targets {
                keep[f] = 0.0;
            }
            let keep = Tensor::from_vec(keep, dict, &self.device)?;
            let opt = optimizer
                .variant_mut(i)
                .with_context(|| format!("No optimizer group for variant {i}"))?;
            opt.reset_moments(&variant.w_enc, &keep.reshape((1, dict))?)?;
            opt.reset_moments(&variant.w_dec, &keep.reshape((dict, 1))?)?;
            opt.reset_moments(&variant.b_enc, &keep)?;

            for &f in &targets {
                variant.states[f] = FeatureState::Healthy;
            }
            debug!(
                "Variant {i} (lr={}, l1={}): resampled {} feature(s), encoder norm {enc_norm:.4}",
                variant.lr,
                variant.l1_coeff,
                targets.len()
            );
            report.resampled.push(targets);
        }

        report.still_flagged = self.pending_resample_count();
        info!(
            "Resampled {} feature(s), {} still flagged",
            report.total(),
            report.still_flagged
        );
        Ok(report)
    }

    /// Parameters stacked with the leading `(n_lrs, n_l1)` axes.
    pub fn to_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let (n_lrs, n_l1) = (self.cfg.lrs.len(), self.cfg.l1_coeffs.len());
        let (act, dict) = (self.cfg.act_size, self.cfg.dict_size);
        let stack = |get: fn(&Variant) -> &Var, rows: usize, cols: usize| -> Result<Tensor> {
            let parts: Vec<Tensor> = self
                .variants
                .iter()
                .map(|v| get(v).as_tensor().reshape((rows, cols)))
                .collect::<candle_core::Result<_>>()?;
            Ok(Tensor::stack(&parts, 0)?.reshape((n_lrs, n_l1, rows, cols))?)
        };
        Ok(HashMap::from([
            (W_ENC.to_string(), stack(Variant::w_enc, act, dict)?),
            (B_ENC.to_string(), stack(Variant::b_enc, 1, dict)?),
            (W_DEC.to_string(), stack(Variant::w_dec, dict, act)?),
            (B_DEC.to_string(), stack(Variant::b_dec, 1, act)?),
        ]))
    }

    /// Rebuild from stacked tensors, checking every shape against `cfg`.
    pub fn from_tensors(
        cfg: &SaeConfig,
        tensors: &HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self> {
        let (n_lrs, n_l1) = (cfg.lrs.len(), cfg.l1_coeffs.len());
        let (act, dict) = (cfg.act_size, cfg.dict_size);
        let n = cfg.n_variants();
        let dtype = cfg.enc_dtype.dtype();

        let unstack = |name: &str, rows: usize, cols: usize| -> Result<Vec<Tensor>> {
            let t = tensors
                .get(name)
                .ok_or_else(|| SaeError::ArtifactMismatch(format!("missing tensor {name}")))?;
            let expected = [n_lrs, n_l1, rows, cols];
            if t.dims() != expected {
                return Err(SaeError::ArtifactMismatch(format!(
                    "{name} has shape {:?}, config implies {expected:?}",
                    t.dims()
                ))
                .into());
            }
            let t = t
                .to_device(device)?
                .to_dtype(dtype)?
                .reshape((n, rows, cols))?;
            (0..n).map(|i| Ok(t.get(i)?)).collect()
        };
        let w_enc = unstack(W_ENC, act, dict)?;
        let b_enc = unstack(B_ENC, 1, dict)?;
        let w_dec = unstack(W_DEC, dict, act)?;
        let b_dec = unstack(B_DEC, 1, act)?;

        let mut variants = Vec::with_capacity(n);
        for i in 0..n {
            let (lr, l1_coeff) = cfg.variant_hparams(i);
            variants.push(Variant::from_tensors(
                lr,
                l1_coeff,
                &w_enc[i],
                &b_enc[i].reshape(dict)?,
                &w_dec[i],
                &b_dec[i].reshape(act)?,
            )?);
        }

        Ok(Self {
            cfg: cfg.clone(),
            variants,
            device: device.clone(),
            steps_since_reset: 0,
            l1_scale: 1.0,
            cached: Vec::new(),
            codes: None,
            rng: StdRng::seed_from_u64(cfg.seed),
        })
    }

    /// Write parameters and config as the store's next version.
    pub fn save(&self, store: &ArtifactStore) -> Result<u32> {
        store.save(&self.to_tensors()?, &self.cfg)
    }

    pub fn load(store: &ArtifactStore, version: u32, device: &Device) -> Result<Self> {
        let (tensors, cfg) = store.load(version, device)?;
        Self::from_tensors(&cfg, &tensors, device)
            .with_context(|| format!("Version {version} in {}", store.dir().display()))
    }
}

/// `n` draws from U(-b, b) with `b = sqrt(6 / fan_in)`.
fn kaiming_uniform<R: Rng>(rng: &mut R, n: usize, fan_in: usize) -> Vec<f32> {
    let bound = (6.0 / fan_in as f64).sqrt() as f32;
    (0..n).map(|_| rng.gen_range(-bound..bound)).collect()
}
