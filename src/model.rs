//! The SNGP classifier: encoder plus distance-aware output head.
//!
//! The model owns the run's `VarMap` so the optimizer, checkpointing and
//! pretrained loading all see one parameter namespace. The output head is
//! either the random-feature GP (default) or a plain dense baseline; both
//! produce a [`LayerOutput`] so downstream code never inspects which one is
//! configured.

use std::collections::HashMap;

use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::{LossType, SngpConfig};
use crate::data::TextBatch;
use crate::encoder::{Encoder, PooledEncoder};
use crate::error::SngpResult;
use crate::gp::{seeded_normal, LayerOutput, RandomFeatureGp};
use crate::spectral::SpectralLinear;

/// Register a freshly-initialized trainable tensor in the `VarMap` and
/// return a handle sharing its storage.
pub(crate) fn register_var(varmap: &VarMap, name: &str, init: Tensor) -> SngpResult<Tensor> {
    let var = Var::from_tensor(&init)?;
    let tensor = var.as_tensor().clone();
    varmap.data().lock().unwrap().insert(name.to_string(), var);
    Ok(tensor)
}

/// Plain dense classifier head used in the non-GP baseline mode.
struct DenseHead {
    weight: Tensor,
    bias: Tensor,
}

impl DenseHead {
    fn new(
        hidden_dim: usize,
        num_outputs: usize,
        varmap: &VarMap,
        rng: &mut ChaCha8Rng,
        device: &Device,
    ) -> SngpResult<Self> {
        let std = (1.0 / hidden_dim as f64).sqrt();
        let weight = register_var(
            varmap,
            "classifier.weight",
            seeded_normal(rng, (num_outputs, hidden_dim), std, device)?,
        )?;
        let bias = register_var(
            varmap,
            "classifier.bias",
            Tensor::zeros((num_outputs,), candle_core::DType::F32, device)?,
        )?;
        Ok(Self { weight, bias })
    }

    fn forward(&self, hidden: &Tensor) -> SngpResult<Tensor> {
        Ok(hidden
            .matmul(&self.weight.t()?)?
            .broadcast_add(&self.bias)?)
    }
}

enum ClassifierHead {
    Gp(RandomFeatureGp),
    Dense(DenseHead),
}

/// Result of one model forward over a batch (or shard).
pub struct StepOutput {
    /// Logits and, at evaluation time, the posterior covariance
    pub output: LayerOutput,
    /// Unreduced precision-matrix contribution (training + GP mode only)
    pub precision_contribution: Option<Tensor>,
}

/// Encoder + SNGP head with a shared parameter namespace.
pub struct SngpModel {
    encoder: Box<dyn Encoder>,
    head: ClassifierHead,
    var_map: VarMap,
    device: Device,
    config: SngpConfig,
}

impl SngpModel {
    /// Build a model with the bundled [`PooledEncoder`].
    pub fn new(config: &SngpConfig, device: &Device) -> SngpResult<Self> {
        let var_map = VarMap::new();
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let encoder = PooledEncoder::new(config, &var_map, &mut rng, device)?;
        Self::with_encoder(config, Box::new(encoder), var_map, &mut rng, device)
    }

    /// Build a model around an externally-supplied encoder whose parameters
    /// already live in `var_map`.
    pub fn with_encoder(
        config: &SngpConfig,
        encoder: Box<dyn Encoder>,
        var_map: VarMap,
        rng: &mut ChaCha8Rng,
        device: &Device,
    ) -> SngpResult<Self> {
        let hidden = encoder.hidden_dim();
        let head = if config.use_gp_layer {
            ClassifierHead::Gp(RandomFeatureGp::new(
                hidden,
                config.gp_hidden_dim,
                1,
                config.gp_scale,
                config.gp_bias,
                config.gp_input_normalization,
                config.gp_cov_ridge_penalty,
                config.gp_cov_discount_factor,
                &var_map,
                rng,
                device,
            )?)
        } else {
            ClassifierHead::Dense(DenseHead::new(hidden, 1, &var_map, rng, device)?)
        };

        Ok(Self {
            encoder,
            head,
            var_map,
            device: device.clone(),
            config: config.clone(),
        })
    }

    /// Forward a batch through encoder and head.
    pub fn forward(&mut self, batch: &TextBatch, training: bool) -> SngpResult<StepOutput> {
        let hidden = self.encoder.encode(
            &batch.input_ids,
            &batch.input_mask,
            &batch.segment_ids,
            training,
        )?;
        match &mut self.head {
            ClassifierHead::Gp(gp) => {
                let (output, precision_contribution) = gp.forward(&hidden, training)?;
                Ok(StepOutput {
                    output,
                    precision_contribution,
                })
            }
            ClassifierHead::Dense(dense) => Ok(StepOutput {
                output: LayerOutput {
                    logits: dense.forward(&hidden)?,
                    covariance: None,
                },
                precision_contribution: None,
            }),
        }
    }

    /// Mean loss over a batch for the configured loss type.
    pub fn compute_loss(
        &self,
        logits: &Tensor,
        labels: &Tensor,
        loss_type: LossType,
    ) -> SngpResult<Tensor> {
        let logits = logits.squeeze(1)?;
        match loss_type {
            LossType::CrossEntropy => Ok(bce_with_logits(&logits, labels)?.mean_all()?),
            LossType::Mse => {
                let probs = candle_nn::ops::sigmoid(&logits)?;
                Ok((probs - labels)?.sqr()?.mean_all()?)
            }
            LossType::Mae => {
                let probs = candle_nn::ops::sigmoid(&logits)?;
                Ok((probs - labels)?.abs()?.mean_all()?)
            }
        }
    }

    /// Re-apply spectral normalization after an optimizer step.
    pub fn renormalize(&mut self) -> SngpResult<()> {
        self.encoder.renormalize()
    }

    /// Apply the replica-reduced precision contribution for one step.
    pub fn apply_precision_update(
        &mut self,
        contribution: &Tensor,
        batch_size: usize,
    ) -> SngpResult<()> {
        match &mut self.head {
            ClassifierHead::Gp(gp) => gp.apply_precision_update(contribution, batch_size),
            ClassifierHead::Dense(_) => Ok(()),
        }
    }

    /// Reset the precision accumulator to its ridge prior (epoch start).
    pub fn reset_precision(&mut self) -> SngpResult<()> {
        match &mut self.head {
            ClassifierHead::Gp(gp) => gp.reset_precision(),
            ClassifierHead::Dense(_) => Ok(()),
        }
    }

    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config(&self) -> &SngpConfig {
        &self.config
    }

    /// Save trainable weights (safetensors).
    pub fn save(&self, path: &std::path::Path) -> SngpResult<()> {
        self.var_map.save(path)?;
        Ok(())
    }

    /// Load trainable weights saved by [`Self::save`].
    pub fn load_weights(&mut self, path: &std::path::Path) -> SngpResult<()> {
        self.var_map.load(path)?;
        Ok(())
    }

    /// All non-trainable state (precision matrix, power-iteration vectors)
    /// that must round-trip through checkpoints.
    pub fn aux_state(&self) -> HashMap<String, Tensor> {
        let mut state: HashMap<String, Tensor> = self.encoder.aux_state().into_iter().collect();
        if let ClassifierHead::Gp(gp) = &self.head {
            state.extend(gp.aux_state());
        }
        state
    }

    /// Restore state written by [`Self::aux_state`].
    pub fn load_aux_state(&mut self, state: &HashMap<String, Tensor>) -> SngpResult<()> {
        self.encoder.load_aux_state(state)?;
        if let ClassifierHead::Gp(gp) = &mut self.head {
            gp.load_aux_state(state)?;
        }
        Ok(())
    }

    /// Number of trainable parameters.
    pub fn parameter_count(&self) -> usize {
        let data = self.var_map.data().lock().unwrap();
        data.values().map(|v| v.as_tensor().elem_count()).sum()
    }
}

/// Numerically stable elementwise sigmoid cross-entropy with logits:
/// `max(z, 0) - z*y + ln(1 + exp(-|z|))`.
pub fn bce_with_logits(logits: &Tensor, labels: &Tensor) -> SngpResult<Tensor> {
    let relu = logits.relu()?;
    let zy = (logits * labels)?;
    let softplus = (logits.abs()?.neg()?.exp()? + 1.0)?.log()?;
    Ok(((relu - zy)? + softplus)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::batch_from_parts;

    fn model(use_gp: bool) -> SngpModel {
        let mut config = SngpConfig::test();
        config.use_gp_layer = use_gp;
        SngpModel::new(&config, &Device::Cpu).unwrap()
    }

    fn batch(n: usize) -> TextBatch {
        let config = SngpConfig::test();
        batch_from_parts(
            (0..n * config.max_seq_length)
                .map(|i| (i % config.vocab_size) as u32)
                .collect(),
            (0..n).map(|i| if i % 2 == 0 { 0.9 } else { 0.1 }).collect(),
            n,
            config.max_seq_length,
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn test_training_forward_gp() {
        let mut model = model(true);
        let out = model.forward(&batch(4), true).unwrap();
        assert_eq!(out.output.logits.dims(), &[4, 1]);
        assert!(out.output.covariance.is_none());
        assert!(out.precision_contribution.is_some());
    }

    #[test]
    fn test_eval_forward_gp_has_covariance() {
        let mut model = model(true);
        let out = model.forward(&batch(4), false).unwrap();
        assert_eq!(out.output.covariance.unwrap().dims(), &[4, 4]);
        assert!(out.precision_contribution.is_none());
    }

    #[test]
    fn test_baseline_mode_no_covariance() {
        let mut model = model(false);
        let out = model.forward(&batch(4), false).unwrap();
        assert_eq!(out.output.logits.dims(), &[4, 1]);
        assert!(out.output.covariance.is_none());
        assert!(out.precision_contribution.is_none());
    }

    #[test]
    fn test_bce_known_values() {
        let device = Device::Cpu;
        let logits = Tensor::from_vec(vec![2.0f32, -2.0, 2.0, -2.0], (4,), &device).unwrap();
        let labels = Tensor::from_vec(vec![1.0f32, 0.0, 1.0, 0.0], (4,), &device).unwrap();
        let ce = bce_with_logits(&logits, &labels)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let expected = (1.0f64 + (-2.0f64).exp()).ln() as f32;
        for v in ce {
            assert!((v - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_loss_types_finite() {
        let model = model(true);
        let device = Device::Cpu;
        let logits = Tensor::from_vec(vec![0.3f32, -1.0], (2, 1), &device).unwrap();
        let labels = Tensor::from_vec(vec![1.0f32, 0.0], (2,), &device).unwrap();
        for loss_type in [LossType::CrossEntropy, LossType::Mse, LossType::Mae] {
            let loss = model
                .compute_loss(&logits, &labels, loss_type)
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(loss.is_finite() && loss >= 0.0);
        }
    }

    #[test]
    fn test_aux_state_roundtrip() {
        let mut model = model(true);
        // Advance the precision matrix so the state is nontrivial.
        let out = model.forward(&batch(4), true).unwrap();
        model
            .apply_precision_update(&out.precision_contribution.unwrap(), 4)
            .unwrap();

        let state = model.aux_state();
        assert!(state.contains_key("gp.precision"));
        assert!(state.contains_key("encoder.pooler.dense.u"));

        let mut fresh = SngpModel::new(&SngpConfig::test(), &Device::Cpu).unwrap();
        fresh.load_aux_state(&state).unwrap();
        let restored = fresh.aux_state();
        assert_eq!(
            state["gp.precision"].to_vec2::<f32>().unwrap(),
            restored["gp.precision"].to_vec2::<f32>().unwrap()
        );
    }
}
