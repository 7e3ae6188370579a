//! Token-embedding activation source (`hook_embed`)
//!
//! Reads a single embedding matrix out of a pretrained model's safetensors
//! weights and serves `embed[tokens]` as activations. This is the cheapest
//! real site of a frozen transformer and lets the whole pipeline run without
//! a full forward pass implementation.
//!
//! Only the embedding tensor is materialized: the weight file is parsed with
//! `SafeTensors::deserialize` and every other tensor is skipped.
//!
//! With `n_heads > 1` the embedding width is split into equal slices and the
//! output gets a head axis, `(batch, pos, head, d_model / head)`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use safetensors::tensor::SafeTensors;
use tracing::info;

use crate::source::ActivationSource;

/// Embedding-table names tried in order when none is given.
pub const DEFAULT_EMBEDDING_NAMES: [&str; 4] = [
    "model.embed_tokens.weight",
    "transformer.wte.weight",
    "embed.W_E",
    "wte.weight",
];

pub struct EmbeddingSource {
    /// (vocab, d_model)
    weight: Tensor,
    n_heads: usize,
    device: Device,
    origin: String,
}

impl EmbeddingSource {
    /// Load from a local safetensors file.
    ///
    /// # Arguments
    /// * `tensor_name` - embedding tensor name; `None` tries [`DEFAULT_EMBEDDING_NAMES`]
    /// * `n_heads` - split the width into this many head slices (1 = no head axis)
    pub fn from_file(
        path: &Path,
        tensor_name: Option<&str>,
        n_heads: usize,
        device: &Device,
    ) -> Result<Self> {
        anyhow::ensure!(n_heads > 0, "n_heads must be > 0");
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read weights {}", path.display()))?;
        let st = SafeTensors::deserialize(&data)
            .with_context(|| format!("Failed to deserialize {}", path.display()))?;

        let name = match tensor_name {
            Some(name) => name.to_string(),
            None => DEFAULT_EMBEDDING_NAMES
                .iter()
                .find(|n| st.tensor(n).is_ok())
                .map(|n| n.to_string())
                .with_context(|| {
                    format!(
                        "No embedding tensor found in {} (tried {:?})",
                        path.display(),
                        DEFAULT_EMBEDDING_NAMES
                    )
                })?,
        };
        let view = st
            .tensor(&name)
            .with_context(|| format!("Tensor '{name}' not found in {}", path.display()))?;
        let weight = tensor_from_view(&view, device)?.to_dtype(DType::F32)?;
        let (vocab, d_model) = weight.dims2()?;
        anyhow::ensure!(
            d_model % n_heads == 0,
            "Embedding width {d_model} not divisible by n_heads {n_heads}"
        );
        info!(
            "Embedding source: '{name}' vocab={vocab}, d_model={d_model}, heads={n_heads}"
        );

        Ok(Self {
            weight,
            n_heads,
            device: device.clone(),
            origin: format!("{}:{name}", path.display()),
        })
    }

    /// Download `filename` from a HuggingFace model repo and load it.
    pub fn from_hub(
        model_id: &str,
        filename: &str,
        tensor_name: Option<&str>,
        n_heads: usize,
        device: &Device,
    ) -> Result<Self> {
        let api = Api::new().context("Failed to create HuggingFace API")?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        info!("Downloading {filename} from {model_id}");
        let path: PathBuf = repo
            .get(filename)
            .with_context(|| format!("Failed to download {filename} from {model_id}"))?;
        let mut source = Self::from_file(&path, tensor_name, n_heads, device)?;
        source.origin = format!("{model_id}/{filename}");
        Ok(source)
    }

    /// Wrap an in-memory `(vocab, d_model)` table.
    pub fn from_tensor(weight: Tensor, n_heads: usize) -> Result<Self> {
        let (_, d_model) = weight.dims2()?;
        anyhow::ensure!(
            n_heads > 0 && d_model % n_heads == 0,
            "Embedding width {d_model} not divisible by n_heads {n_heads}"
        );
        Ok(Self {
            device: weight.device().clone(),
            weight,
            n_heads,
            origin: "in-memory".to_string(),
        })
    }

    pub fn d_model(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn n_heads(&self) -> usize {
        self.n_heads
    }
}

impl ActivationSource for EmbeddingSource {
    fn forward(&mut self, tokens: &Tensor) -> Result<Tensor> {
        let (batch, seq_len) = tokens.dims2()?;
        let ids = tokens
            .to_device(&self.device)?
            .to_dtype(DType::U32)?
            .flatten_all()?;
        let max_id = ids.max(0)?.to_scalar::<u32>()? as usize;
        anyhow::ensure!(
            max_id < self.vocab_size(),
            "Token id {max_id} out of range for vocab of {}",
            self.vocab_size()
        );
        let acts = self.weight.index_select(&ids, 0)?;
        let d_model = self.d_model();
        if self.n_heads > 1 {
            let d_head = d_model / self.n_heads;
            Ok(acts.reshape((batch, seq_len, self.n_heads, d_head))?)
        } else {
            Ok(acts.reshape((batch, seq_len, d_model))?)
        }
    }

    fn describe(&self) -> String {
        format!("hook_embed from {}", self.origin)
    }
}

/// Convert a safetensors `TensorView` to a candle `Tensor` on the given device.
fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        other => anyhow::bail!("Unsupported embedding dtype: {other:?}"),
    };
    let tensor = Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?;
    Ok(tensor)
}
