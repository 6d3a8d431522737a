//! Encoder seam: the trait the classifier core consumes, plus a bundled
//! pooled-embedding encoder.
//!
//! The transformer encoder proper is an external collaborator; the core
//! only needs `encode(input_ids, input_mask, segment_ids) -> hidden`. The
//! bundled [`PooledEncoder`] (token + segment embeddings, masked mean
//! pooling, spectrally-normalized tanh pooler) keeps the full pipeline
//! exercisable end-to-end and in tests.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Module, Tensor};
use candle_nn::{Embedding, VarMap};
use rand_chacha::ChaCha8Rng;

use crate::config::SngpConfig;
use crate::error::SngpResult;
use crate::gp::seeded_normal;
use crate::spectral::SpectralLinear;

/// Interface between the data pipeline and the uncertainty core: one hidden
/// vector per example.
pub trait Encoder {
    /// Encode a batch into `[batch, hidden_dim]`.
    fn encode(
        &mut self,
        input_ids: &Tensor,
        input_mask: &Tensor,
        segment_ids: &Tensor,
        training: bool,
    ) -> SngpResult<Tensor>;

    fn hidden_dim(&self) -> usize;

    /// Re-apply spectral normalization after an optimizer step, where the
    /// encoder carries spectrally-wrapped matrices.
    fn renormalize(&mut self) -> SngpResult<()> {
        Ok(())
    }

    /// Non-trainable state for checkpointing (power-iteration vectors).
    fn aux_state(&self) -> Vec<(String, Tensor)> {
        Vec::new()
    }

    fn load_aux_state(&mut self, _state: &HashMap<String, Tensor>) -> SngpResult<()> {
        Ok(())
    }
}

/// Remapping from pretrained-checkpoint tensor names to this crate's
/// parameter names. Dense kernels are stored input-major in the source
/// convention and are transposed on load (third column).
pub const PRETRAINED_REMAP: &[(&str, &str, bool)] = &[
    (
        "bert/embeddings/word_embeddings",
        "encoder.word_embeddings.weight",
        false,
    ),
    (
        "bert/embeddings/token_type_embeddings",
        "encoder.token_type_embeddings.weight",
        false,
    ),
    (
        "bert/pooler/dense/kernel",
        "encoder.pooler.dense.weight",
        true,
    ),
    ("bert/pooler/dense/bias", "encoder.pooler.dense.bias", false),
];

/// Load pretrained encoder weights from a safetensors file, applying
/// [`PRETRAINED_REMAP`]. Missing tensors keep their fresh initialization
/// and are logged; returns the number of tensors loaded.
pub fn load_pretrained_encoder(
    varmap: &VarMap,
    path: &Path,
    device: &Device,
) -> SngpResult<usize> {
    let tensors = candle_core::safetensors::load(path, device)?;
    let data = varmap.data().lock().unwrap();
    let mut loaded = 0;
    for (source, target, transpose) in PRETRAINED_REMAP {
        let Some(var) = data.get(*target) else {
            continue;
        };
        let Some(tensor) = tensors.get(*source) else {
            tracing::warn!(
                "pretrained checkpoint has no tensor '{source}'; keeping fresh init for '{target}'"
            );
            continue;
        };
        let tensor = if *transpose {
            tensor.t()?.contiguous()?
        } else {
            tensor.clone()
        };
        if tensor.dims() != var.dims() {
            tracing::warn!(
                "pretrained tensor '{source}' has shape {:?}, expected {:?}; skipping",
                tensor.dims(),
                var.dims()
            );
            continue;
        }
        var.set(&tensor)?;
        loaded += 1;
    }
    tracing::info!("loaded {loaded} pretrained encoder tensors from {}", path.display());
    Ok(loaded)
}

/// Embedding-pool encoder: token + segment embeddings, masked mean pooling
/// over the sequence, then a tanh pooler dense that is optionally
/// spectrally normalized.
pub struct PooledEncoder {
    word_embeddings: Embedding,
    token_type_embeddings: Embedding,
    pooler: SpectralLinear,
    use_spec_norm: bool,
    hidden_dim: usize,
}

impl PooledEncoder {
    pub fn new(
        config: &SngpConfig,
        varmap: &VarMap,
        rng: &mut ChaCha8Rng,
        device: &Device,
    ) -> SngpResult<Self> {
        let hidden = config.hidden_size;
        let embed_std = 0.02;

        let word_weight = crate::model::register_var(
            varmap,
            "encoder.word_embeddings.weight",
            seeded_normal(rng, (config.vocab_size, hidden), embed_std, device)?,
        )?;
        let type_weight = crate::model::register_var(
            varmap,
            "encoder.token_type_embeddings.weight",
            seeded_normal(rng, (config.type_vocab_size, hidden), embed_std, device)?,
        )?;

        let pooler = SpectralLinear::new(
            hidden,
            hidden,
            config.spec_norm_bound,
            config.spec_norm_iteration,
            true,
            "encoder.pooler.dense",
            varmap,
            rng,
            device,
        )?;

        Ok(Self {
            word_embeddings: Embedding::new(word_weight, hidden),
            token_type_embeddings: Embedding::new(type_weight, hidden),
            pooler,
            use_spec_norm: config.use_spec_norm_pooler,
            hidden_dim: hidden,
        })
    }
}

impl Encoder for PooledEncoder {
    fn encode(
        &mut self,
        input_ids: &Tensor,
        input_mask: &Tensor,
        segment_ids: &Tensor,
        training: bool,
    ) -> SngpResult<Tensor> {
        let word = self.word_embeddings.forward(input_ids)?;
        let segment = self.token_type_embeddings.forward(segment_ids)?;
        let embedded = (word + segment)?;

        // Masked mean over the sequence dimension.
        let mask = input_mask.unsqueeze(2)?;
        let summed = embedded.broadcast_mul(&mask)?.sum(1)?;
        let counts = input_mask.sum(1)?.unsqueeze(1)?.maximum(1.0)?;
        let mean = summed.broadcast_div(&counts)?;

        let pooled = self
            .pooler
            .forward(&mean, training && self.use_spec_norm)?;
        Ok(pooled.tanh()?)
    }

    fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    fn renormalize(&mut self) -> SngpResult<()> {
        if self.use_spec_norm {
            self.pooler.renormalize()?;
        }
        Ok(())
    }

    fn aux_state(&self) -> Vec<(String, Tensor)> {
        self.pooler.aux_state()
    }

    fn load_aux_state(&mut self, state: &HashMap<String, Tensor>) -> SngpResult<()> {
        self.pooler.load_aux_state(state)
    }
}
