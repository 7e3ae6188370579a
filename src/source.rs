//! Activation sources: the frozen model seen as `tokens -> activations at a site`.
//!
//! The buffer never needs more than a single forward call per token chunk, so
//! the interface is deliberately one method wide. Sites with a head axis return
//! `(batch, pos, head, d_head)`; everything else returns `(batch, pos, d_act)`.

use anyhow::Result;
use candle_core::Tensor;

use crate::error::SaeError;

/// Produces activations for a batch of token sequences.
///
/// Errors are propagated to the caller unchanged; a failed forward pass is
/// treated as a data or resource problem, not something worth retrying.
pub trait ActivationSource {
    /// Run the model on `tokens` (shape `(batch, seq_len)`, u32) and return the
    /// activations at this source's site.
    fn forward(&mut self, tokens: &Tensor) -> Result<Tensor>;

    /// Human-readable description for logs.
    fn describe(&self) -> String {
        "activation source".to_string()
    }
}

impl<S: ActivationSource + ?Sized> ActivationSource for Box<S> {
    fn forward(&mut self, tokens: &Tensor) -> Result<Tensor> {
        (**self).forward(tokens)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// A named hook point in the transformer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Site {
    pub name: String,
    pub layer: usize,
}

impl Site {
    pub fn new(name: &str, layer: usize) -> Self {
        Self {
            name: name.to_string(),
            layer,
        }
    }

    /// Full hook name in TransformerLens convention.
    pub fn act_name(&self) -> String {
        let l = self.layer;
        match self.name.as_str() {
            "embed" | "pos_embed" => format!("hook_{}", self.name),
            "q" | "k" | "v" | "z" | "pattern" | "attn_scores" | "result" => {
                format!("blocks.{l}.attn.hook_{}", self.name)
            }
            "pre" | "post" => format!("blocks.{l}.mlp.hook_{}", self.name),
            other => format!("blocks.{l}.hook_{other}"),
        }
    }

    /// Whether activations at this site carry a head axis.
    pub fn has_head_axis(&self) -> bool {
        matches!(self.name.as_str(), "q" | "k" | "v" | "z" | "result")
    }
}

impl std::fmt::Display for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.act_name())
    }
}

/// Flatten source output into `(batch * pos, width)` rows.
///
/// With `flatten_heads`, a `(batch, pos, head, d_head)` tensor becomes
/// `(batch * pos, head * d_head)` in head-major order (head 0's features
/// first), which is a plain row-major reshape.
pub fn flatten_activations(acts: &Tensor, flatten_heads: bool) -> Result<Tensor> {
    let dims = acts.dims();
    match (flatten_heads, dims.len()) {
        (true, 4) => {
            let (b, p, h, d) = acts.dims4()?;
            Ok(acts.reshape((b * p, h * d))?)
        }
        (false, 3) => {
            let (b, p, d) = acts.dims3()?;
            Ok(acts.reshape((b * p, d))?)
        }
        (true, n) => anyhow::bail!(
            "Expected (batch, pos, head, d_head) activations with flatten_heads, got {n}D {dims:?}"
        ),
        (false, n) => anyhow::bail!(
            "Expected (batch, pos, d_act) activations without flatten_heads, got {n}D {dims:?}"
        ),
    }
}

/// Flatten and check the feature width against the configured activation width.
pub fn flatten_checked(acts: &Tensor, flatten_heads: bool, expected: usize) -> Result<Tensor> {
    let flat = flatten_activations(acts, flatten_heads)?;
    let actual = flat.dim(1)?;
    if actual != expected {
        return Err(SaeError::WidthMismatch { expected, actual }.into());
    }
    Ok(flat)
}
