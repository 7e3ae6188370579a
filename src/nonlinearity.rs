//! Code nonlinearities for the autoencoder encoder.
//!
//! Selected by name plus parameters at configuration time:
//!
//! ```text
//! relu:          max(x, 0)
//! leaky_relu:    x            if x > 0
//!                slope * x    otherwise
//! undying_relu:  x            if x > 0
//!                l * x        if -k < x <= 0
//!                0            otherwise
//! ```
//!
//! `undying_relu` keeps a small gradient for units that sit just below zero,
//! so a feature that stops firing can still be pulled back.

use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Closed set of supported nonlinearities.
///
/// Serialized as `{"name": "undying_relu", "l": 0.001, "k": 0.1}`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Nonlinearity {
    #[default]
    Relu,
    LeakyRelu {
        negative_slope: f64,
    },
    UndyingRelu {
        /// Slope inside the window below zero
        l: f64,
        /// Window width below zero
        k: f64,
    },
}

impl Nonlinearity {
    /// Apply to pre-activations. Differentiable wherever candle tracks the ops.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        match *self {
            Nonlinearity::Relu => Ok(x.relu()?),
            Nonlinearity::LeakyRelu { negative_slope } => {
                let neg = (x.minimum(0f64)? * negative_slope)?;
                Ok((x.relu()? + neg)?)
            }
            Nonlinearity::UndyingRelu { l, k } => {
                // Comparison masks are integer tensors and carry no gradient.
                let dtype = x.dtype();
                let above = x.gt(-k)?.to_dtype(dtype)?;
                let non_pos = x.le(0f64)?.to_dtype(dtype)?;
                let window = (above * non_pos)?;
                let leak = ((x * &window)? * l)?;
                Ok((x.relu()? + leak)?)
            }
        }
    }

    /// Check parameters for obviously broken values.
    pub fn validate(&self) -> Result<()> {
        match *self {
            Nonlinearity::Relu => {}
            Nonlinearity::LeakyRelu { negative_slope } => {
                anyhow::ensure!(
                    negative_slope.is_finite() && negative_slope >= 0.0,
                    "leaky_relu negative_slope must be finite and >= 0, got {negative_slope}"
                );
            }
            Nonlinearity::UndyingRelu { l, k } => {
                anyhow::ensure!(
                    l.is_finite() && l >= 0.0,
                    "undying_relu l must be finite and >= 0, got {l}"
                );
                anyhow::ensure!(k.is_finite() && k > 0.0, "undying_relu k must be > 0, got {k}");
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Nonlinearity::Relu => "relu",
            Nonlinearity::LeakyRelu { .. } => "leaky_relu",
            Nonlinearity::UndyingRelu { .. } => "undying_relu",
        }
    }
}

impl std::fmt::Display for Nonlinearity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Nonlinearity::Relu => write!(f, "relu"),
            Nonlinearity::LeakyRelu { negative_slope } => {
                write!(f, "leaky_relu(slope={negative_slope})")
            }
            Nonlinearity::UndyingRelu { l, k } => write!(f, "undying_relu(l={l}, k={k})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn apply(nl: Nonlinearity, xs: &[f32]) -> Vec<f32> {
        let t = Tensor::new(xs, &Device::Cpu).unwrap();
        nl.apply(&t).unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_relu() {
        assert_eq!(apply(Nonlinearity::Relu, &[-1.0, 0.0, 2.0]), vec![0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_leaky_relu() {
        let out = apply(
            Nonlinearity::LeakyRelu {
                negative_slope: 0.5,
            },
            &[-2.0, 3.0],
        );
        assert_eq!(out, vec![-1.0, 3.0]);
    }

    #[test]
    fn test_undying_relu_window() {
        let nl = Nonlinearity::UndyingRelu { l: 0.5, k: 1.0 };
        let out = apply(nl, &[-2.0, -0.5, 0.0, 1.5]);
        assert_eq!(out, vec![0.0, -0.25, 0.0, 1.5]);
    }

    #[test]
    fn test_serde_tagged() {
        let nl: Nonlinearity =
            serde_json::from_str(r#"{"name": "undying_relu", "l": 0.001, "k": 0.1}"#).unwrap();
        assert_eq!(nl, Nonlinearity::UndyingRelu { l: 0.001, k: 0.1 });

        let relu: Nonlinearity = serde_json::from_str(r#"{"name": "relu"}"#).unwrap();
        assert_eq!(relu, Nonlinearity::Relu);

        assert!(serde_json::from_str::<Nonlinearity>(r#"{"name": "gelu"}"#).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(Nonlinearity::UndyingRelu { l: 0.1, k: 0.0 }.validate().is_err());
        assert!(Nonlinearity::LeakyRelu {
            negative_slope: -1.0
        }
        .validate()
        .is_err());
        assert!(Nonlinearity::Relu.validate().is_ok());
    }
}
