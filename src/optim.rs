//! AdamW with per-feature moment resets
//!
//! Same update rule as `candle_nn::AdamW`, but the moment buffers are
//! reachable so that resampled features can start from clean optimizer state.
//!
//! One optimizer instance per autoencoder variant; each instance carries that
//! variant's learning rate, which is how a lr sweep shares one batch.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{Optimizer, ParamsAdamW};

struct MomentSlot {
    param: Var,
    first_moment: Var,
    second_moment: Var,
}

pub struct FeatureAdamW {
    slots: Vec<MomentSlot>,
    step_t: usize,
    params: ParamsAdamW,
}

impl Optimizer for FeatureAdamW {
    type Config = ParamsAdamW;

    fn new(vars: Vec<Var>, params: ParamsAdamW) -> candle_core::Result<Self> {
        let slots = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|param| {
                let first_moment = Var::zeros(param.dims(), param.dtype(), param.device())?;
                let second_moment = Var::zeros(param.dims(), param.dtype(), param.device())?;
                Ok(MomentSlot {
                    param,
                    first_moment,
                    second_moment,
                })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            slots,
            step_t: 0,
            params,
        })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step_t += 1;
        let p = &self.params;
        let lr = p.lr;
        let lr_lambda = lr * p.weight_decay;
        let scale_m = 1f64 / (1f64 - p.beta1.powi(self.step_t as i32));
        let scale_v = 1f64 / (1f64 - p.beta2.powi(self.step_t as i32));
        for slot in &self.slots {
            let theta = &slot.param;
            let Some(g) = grads.get(theta) else {
                continue;
            };
            let m = &slot.first_moment;
            let v = &slot.second_moment;
            let next_m = ((m.as_tensor() * p.beta1)? + (g * (1.0 - p.beta1))?)?;
            let next_v = ((v.as_tensor() * p.beta2)? + (g.sqr()? * (1.0 - p.beta2))?)?;
            let m_hat = (&next_m * scale_m)?;
            let v_hat = (&next_v * scale_v)?;
            let decayed = (theta.as_tensor() * (1f64 - lr_lambda))?;
            let adjusted = (m_hat / (v_hat.sqrt()? + p.eps)?)?;
            let next_theta = (decayed - (adjusted * lr)?)?;
            m.set(&next_m)?;
            v.set(&next_v)?;
            theta.set(&next_theta)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

impl FeatureAdamW {
    /// Multiply the moments of `param` by `keep_mask` (broadcast), zeroing
    /// the entries of resampled features.
    ///
    /// Returns an error if `param` is not managed by this optimizer.
    pub fn reset_moments(&mut self, param: &Var, keep_mask: &Tensor) -> Result<()> {
        let slot = self
            .slots
            .iter()
            .find(|s| s.param.id() == param.id())
            .ok_or_else(|| anyhow::anyhow!("Parameter {:?} not tracked by optimizer", param.id()))?;
        let mask = keep_mask.to_dtype(slot.param.dtype())?;
        let m = slot.first_moment.as_tensor().broadcast_mul(&mask)?;
        let v = slot.second_moment.as_tensor().broadcast_mul(&mask)?;
        slot.first_moment.set(&m)?;
        slot.second_moment.set(&v)?;
        Ok(())
    }

    /// Current first/second moments of `param` (for inspection and tests).
    pub fn moments(&self, param: &Var) -> Option<(Tensor, Tensor)> {
        self.slots.iter().find(|s| s.param.id() == param.id()).map(|s| {
            (
                s.first_moment.as_tensor().clone(),
                s.second_moment.as_tensor().clone(),
            )
        })
    }

    pub fn step_count(&self) -> usize {
        self.step_t
    }

    pub fn params(&self) -> &ParamsAdamW {
        &self.params
    }
}

/// One [`FeatureAdamW`] per autoencoder variant, stepped together.
pub struct SaeOptimizer {
    variants: Vec<FeatureAdamW>,
}

impl SaeOptimizer {
    /// `groups[i]` holds the parameters and hyperparameters of variant `i`.
    pub fn new(groups: Vec<(Vec<Var>, ParamsAdamW)>) -> Result<Self> {
        let variants = groups
            .into_iter()
            .map(|(vars, params)| FeatureAdamW::new(vars, params))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { variants })
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        for opt in &mut self.variants {
            opt.step(grads)?;
        }
        Ok(())
    }

    pub fn variant(&self, index: usize) -> Option<&FeatureAdamW> {
        self.variants.get(index)
    }

    pub fn variant_mut(&mut self, index: usize) -> Option<&mut FeatureAdamW> {
        self.variants.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}
