//! Random-feature Gaussian process output layer with a Laplace-approximated
//! posterior covariance.
//!
//! The layer maps a hidden representation to class logits through a fixed
//! random cosine feature expansion followed by a learned linear output map.
//! During training it additionally accumulates a precision matrix over the
//! feature dimension (the Laplace approximation to the GP posterior, with a
//! logistic-regression curvature weight per example). During evaluation the
//! precision matrix is frozen, inverted once, and used to report a
//! batch-by-batch posterior covariance over logits.

use std::collections::HashMap;

use candle_core::{Device, Module, Tensor, Var};
use candle_nn::{LayerNorm, VarMap};
use rand_distr::{Distribution, Normal};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::error::{SngpError, SngpResult};

/// Output of a classifier head: logits plus, at evaluation time, the
/// posterior covariance over the batch. `covariance = None` means no
/// posterior estimate is available (training mode, or the non-GP baseline).
#[derive(Debug, Clone)]
pub struct LayerOutput {
    /// Class logits, `[batch, num_outputs]`
    pub logits: Tensor,
    /// Posterior covariance over the batch, `[batch, batch]`
    pub covariance: Option<Tensor>,
}

/// Identity matrix helper.
pub(crate) fn eye(n: usize, device: &Device) -> SngpResult<Tensor> {
    let mut data = vec![0.0f32; n * n];
    for i in 0..n {
        data[i * n + i] = 1.0;
    }
    Ok(Tensor::from_vec(data, (n, n), device)?)
}

/// Seeded normal tensor, used for all fixed random state so that a given
/// config seed reproduces the same feature map and power-iteration init.
pub(crate) fn seeded_normal(
    rng: &mut ChaCha8Rng,
    dims: (usize, usize),
    std: f64,
    device: &Device,
) -> SngpResult<Tensor> {
    let normal = Normal::new(0.0f64, std)
        .map_err(|e| SngpError::numerical(format!("normal init: {e}")))?;
    let data: Vec<f32> = (0..dims.0 * dims.1)
        .map(|_| normal.sample(rng) as f32)
        .collect();
    Ok(Tensor::from_vec(data, dims, device)?)
}

/// Invert a symmetric positive-definite matrix via Cholesky factorization.
///
/// Computation happens in f64 on the host; the result is materialized back
/// on the input's device. Fails with a numerical error if the matrix is not
/// positive definite, which the ridge term rules out in normal operation.
pub(crate) fn invert_spd(a: &Tensor) -> SngpResult<Tensor> {
    let (n, m) = a.dims2()?;
    if n != m {
        return Err(SngpError::shape_mismatch("square matrix", format!("[{n}, {m}]")));
    }
    let rows = a.to_vec2::<f32>()?;

    // A = L L^T
    let mut l = vec![0.0f64; n * n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = rows[i][j] as f64;
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                if sum <= 0.0 {
                    return Err(SngpError::numerical(format!(
                        "matrix not positive definite at pivot {i} ({sum})"
                    )));
                }
                l[i * n + i] = sum.sqrt();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }

    // Forward-solve L X = I for X = L^{-1}
    let mut linv = vec![0.0f64; n * n];
    for col in 0..n {
        for i in col..n {
            let mut sum = if i == col { 1.0 } else { 0.0 };
            for k in col..i {
                sum -= l[i * n + k] * linv[k * n + col];
            }
            linv[i * n + col] = sum / l[i * n + i];
        }
    }

    // A^{-1} = L^{-T} L^{-1}
    let mut out = vec![0.0f32; n * n];
    for i in 0..n {
        for j in 0..n {
            let mut sum = 0.0f64;
            for k in i.max(j)..n {
                sum += linv[k * n + i] * linv[k * n + j];
            }
            out[i * n + j] = sum as f32;
        }
    }
    Ok(Tensor::from_vec(out, (n, n), a.device())?)
}

/// Online Laplace approximation to the GP posterior precision.
///
/// The matrix starts at `ridge * I` and absorbs one momentum-discounted
/// batch update per training step. The posterior covariance is the lazy
/// inverse of the frozen matrix (ridge re-added to the diagonal first) and
/// is cached until the next update or reset invalidates it.
pub struct LaplacePrecision {
    matrix: Tensor,
    ridge: f64,
    momentum: f64,
    dim: usize,
    device: Device,
    covariance_cache: Option<Tensor>,
}

impl LaplacePrecision {
    pub fn new(dim: usize, ridge: f64, momentum: f64, device: &Device) -> SngpResult<Self> {
        let matrix = (eye(dim, device)? * ridge)?;
        Ok(Self {
            matrix,
            ridge,
            momentum,
            dim,
            device: device.clone(),
            covariance_cache: None,
        })
    }

    /// Reset to `ridge * I` (start of an epoch, when configured).
    pub fn reset(&mut self) -> SngpResult<()> {
        self.matrix = (eye(self.dim, &self.device)? * self.ridge)?;
        self.covariance_cache = None;
        Ok(())
    }

    /// The unnormalized batch contribution `phi^T diag(p(1-p)) phi`.
    pub fn batch_contribution(phi: &Tensor, probs: &Tensor) -> SngpResult<Tensor> {
        let one_minus = ((probs * -1.0)? + 1.0)?;
        let curvature = (probs * &one_minus)?;
        let weighted = phi.broadcast_mul(&curvature.sqrt()?)?;
        Ok(weighted.t()?.matmul(&weighted)?)
    }

    /// Apply one momentum-discounted update from a (replica-reduced)
    /// contribution covering `batch_size` examples.
    pub fn apply_update(&mut self, contribution: &Tensor, batch_size: usize) -> SngpResult<()> {
        let batch_mean = (contribution / batch_size as f64)?;
        self.matrix = ((&self.matrix * self.momentum)? + (batch_mean * (1.0 - self.momentum))?)?;
        self.covariance_cache = None;
        Ok(())
    }

    /// Posterior covariance over the feature dimension, `(Sigma^-1 + ridge I)^-1`.
    ///
    /// Inverted lazily on first evaluation use and cached; any update or
    /// reset invalidates the cache. The ridge addition guarantees
    /// invertibility regardless of batch composition.
    pub fn covariance(&mut self) -> SngpResult<Tensor> {
        if self.covariance_cache.is_none() {
            let ridge_eye = (eye(self.dim, &self.device)? * self.ridge)?;
            let regularized = (&self.matrix + &ridge_eye)?;
            self.covariance_cache = Some(invert_spd(&regularized)?);
        }
        Ok(self.covariance_cache.as_ref().unwrap().clone())
    }

    pub fn matrix(&self) -> &Tensor {
        &self.matrix
    }

    pub fn set_matrix(&mut self, matrix: Tensor) -> SngpResult<()> {
        let (n, m) = matrix.dims2()?;
        if n != self.dim || m != self.dim {
            return Err(SngpError::shape_mismatch(
                format!("[{0}, {0}]", self.dim),
                format!("[{n}, {m}]"),
            ));
        }
        self.matrix = matrix;
        self.covariance_cache = None;
        Ok(())
    }
}

/// Random-feature GP classifier head.
pub struct RandomFeatureGp {
    /// Fixed random projection, `[feature_dim, hidden]`
    projection: Tensor,
    /// Fixed random phases, `[feature_dim]`
    phase: Tensor,
    /// Learned output map, `[num_outputs, feature_dim]`
    output_weight: Var,
    /// Configured constant added to logits
    output_bias: f64,
    /// Optional layer normalization of the GP input
    input_norm: Option<LayerNorm>,
    /// `1 / sqrt(kernel_scale)`
    input_scale: f64,
    /// `sqrt(2 / feature_dim)`
    feature_scale: f64,
    precision: LaplacePrecision,
}

impl RandomFeatureGp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hidden_dim: usize,
        feature_dim: usize,
        num_outputs: usize,
        kernel_scale: f64,
        output_bias: f64,
        input_normalization: bool,
        ridge: f64,
        momentum: f64,
        varmap: &VarMap,
        rng: &mut ChaCha8Rng,
        device: &Device,
    ) -> SngpResult<Self> {
        let projection = seeded_normal(rng, (feature_dim, hidden_dim), 1.0, device)?;
        let phases: Vec<f32> = (0..feature_dim)
            .map(|_| (rng.random::<f64>() * std::f64::consts::TAU) as f32)
            .collect();
        let phase = Tensor::from_vec(phases, (feature_dim,), device)?;

        let std = (1.0 / feature_dim as f64).sqrt();
        let output_weight =
            Var::from_tensor(&seeded_normal(rng, (num_outputs, feature_dim), std, device)?)?;

        let input_norm = if input_normalization {
            let weight = Var::from_tensor(&Tensor::ones(
                (hidden_dim,),
                candle_core::DType::F32,
                device,
            )?)?;
            let bias = Var::from_tensor(&Tensor::zeros(
                (hidden_dim,),
                candle_core::DType::F32,
                device,
            )?)?;
            {
                let mut data = varmap.data().lock().unwrap();
                data.insert("gp.input_norm.weight".to_string(), weight.clone());
                data.insert("gp.input_norm.bias".to_string(), bias.clone());
            }
            Some(LayerNorm::new(
                weight.as_tensor().clone(),
                bias.as_tensor().clone(),
                1e-12,
            ))
        } else {
            None
        };

        {
            let mut data = varmap.data().lock().unwrap();
            data.insert("gp.output.weight".to_string(), output_weight.clone());
        }

        Ok(Self {
            projection,
            phase,
            output_weight,
            output_bias,
            input_norm,
            input_scale: 1.0 / kernel_scale.sqrt(),
            feature_scale: (2.0 / feature_dim as f64).sqrt(),
            precision: LaplacePrecision::new(feature_dim, ridge, momentum, device)?,
        })
    }

    /// Random cosine features: `sqrt(2/D) cos((h / sqrt(scale)) W^T + b)`.
    pub fn features(&self, hidden: &Tensor) -> SngpResult<Tensor> {
        let hidden = match &self.input_norm {
            Some(norm) => norm.forward(hidden)?,
            None => hidden.clone(),
        };
        let scaled = (hidden * self.input_scale)?;
        let pre = scaled
            .matmul(&self.projection.t()?)?
            .broadcast_add(&self.phase)?;
        Ok((pre.cos()? * self.feature_scale)?)
    }

    fn logits(&self, phi: &Tensor) -> SngpResult<Tensor> {
        let logits = phi.matmul(&self.output_weight.as_tensor().t()?)?;
        Ok((logits + self.output_bias)?)
    }

    /// Forward pass.
    ///
    /// Training returns `(output, Some(precision_contribution))`: the
    /// contribution is the unnormalized `phi^T diag(p(1-p)) phi` for this
    /// shard, which the trainer reduces across replicas and applies through
    /// [`Self::apply_precision_update`] exactly once per step. Evaluation
    /// returns the logits together with the posterior covariance
    /// `phi Sigma phi^T` computed from the frozen precision matrix.
    pub fn forward(
        &mut self,
        hidden: &Tensor,
        training: bool,
    ) -> SngpResult<(LayerOutput, Option<Tensor>)> {
        let phi = self.features(hidden)?;
        let logits = self.logits(&phi)?;
        if training {
            let probs = candle_nn::ops::sigmoid(&logits.detach())?;
            let contribution = LaplacePrecision::batch_contribution(&phi.detach(), &probs)?;
            Ok((
                LayerOutput {
                    logits,
                    covariance: None,
                },
                Some(contribution),
            ))
        } else {
            let sigma = self.precision.covariance()?;
            let covariance = phi.detach().matmul(&sigma)?.matmul(&phi.detach().t()?)?;
            Ok((
                LayerOutput {
                    logits,
                    covariance: Some(covariance),
                },
                None,
            ))
        }
    }

    /// Apply the replica-reduced precision contribution for one step.
    pub fn apply_precision_update(
        &mut self,
        contribution: &Tensor,
        batch_size: usize,
    ) -> SngpResult<()> {
        self.precision.apply_update(contribution, batch_size)
    }

    /// Reset the precision accumulator to its ridge prior.
    pub fn reset_precision(&mut self) -> SngpResult<()> {
        self.precision.reset()
    }

    /// Auxiliary (non-trainable) state for checkpointing: the precision
    /// matrix. The random projection and phases are regenerated from the
    /// config seed and do not need to be persisted.
    pub fn aux_state(&self) -> Vec<(String, Tensor)> {
        vec![("gp.precision".to_string(), self.precision.matrix().clone())]
    }

    pub fn load_aux_state(&mut self, state: &HashMap<String, Tensor>) -> SngpResult<()> {
        match state.get("gp.precision") {
            Some(m) => self.precision.set_matrix(m.clone()),
            None => Err(SngpError::checkpoint(
                "gp.precision missing from checkpoint auxiliary state",
            )),
        }
    }

    pub fn precision(&self) -> &LaplacePrecision {
        &self.precision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn gp(hidden: usize, features: usize) -> RandomFeatureGp {
        let varmap = VarMap::new();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        RandomFeatureGp::new(
            hidden,
            features,
            1,
            2.0,
            0.0,
            true,
            1e-3,
            0.999,
            &varmap,
            &mut rng,
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn test_feature_map_deterministic_per_seed() {
        let a = gp(8, 16);
        let b = gp(8, 16);
        let h = Tensor::randn(0.0f32, 1.0, (2, 8), &Device::Cpu).unwrap();
        let fa = a.features(&h).unwrap().to_vec2::<f32>().unwrap();
        let fb = b.features(&h).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(fa, fb);
    }

    #[test]
    fn test_training_forward_returns_contribution() {
        let mut layer = gp(8, 16);
        let h = Tensor::randn(0.0f32, 1.0, (4, 8), &Device::Cpu).unwrap();
        let (out, contrib) = layer.forward(&h, true).unwrap();
        assert_eq!(out.logits.dims(), &[4, 1]);
        assert!(out.covariance.is_none());
        assert_eq!(contrib.unwrap().dims(), &[16, 16]);
    }

    #[test]
    fn test_eval_forward_returns_covariance() {
        let mut layer = gp(8, 16);
        let h = Tensor::randn(0.0f32, 1.0, (4, 8), &Device::Cpu).unwrap();
        let (out, contrib) = layer.forward(&h, false).unwrap();
        assert!(contrib.is_none());
        let cov = out.covariance.unwrap();
        assert_eq!(cov.dims(), &[4, 4]);

        // Symmetric with positive diagonal.
        let rows = cov.to_vec2::<f32>().unwrap();
        for i in 0..4 {
            assert!(rows[i][i] > 0.0);
            for j in 0..4 {
                assert!((rows[i][j] - rows[j][i]).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_precision_stays_positive_definite() {
        let device = Device::Cpu;
        let mut precision = LaplacePrecision::new(8, 1e-3, 0.999, &device).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..20 {
            let phi = seeded_normal(&mut rng, (4, 8), 1.0, &device).unwrap();
            let probs = Tensor::from_vec(vec![0.2f32, 0.5, 0.9, 0.01], (4, 1), &device).unwrap();
            let contrib = LaplacePrecision::batch_contribution(&phi, &probs).unwrap();
            precision.apply_update(&contrib, 4).unwrap();

            // Symmetry of the accumulator.
            let m = precision.matrix().to_vec2::<f32>().unwrap();
            for i in 0..8 {
                for j in 0..8 {
                    assert!((m[i][j] - m[j][i]).abs() < 1e-4);
                }
            }
            // The regularized matrix must always be invertible.
            precision.covariance().unwrap();
        }
    }

    #[test]
    fn test_covariance_cache_invalidated_by_update() {
        let device = Device::Cpu;
        let mut precision = LaplacePrecision::new(4, 1e-3, 0.9, &device).unwrap();
        let before = precision.covariance().unwrap().to_vec2::<f32>().unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let phi = seeded_normal(&mut rng, (2, 4), 1.0, &device).unwrap();
        let probs = Tensor::from_vec(vec![0.5f32, 0.5], (2, 1), &device).unwrap();
        let contrib = LaplacePrecision::batch_contribution(&phi, &probs).unwrap();
        precision.apply_update(&contrib, 2).unwrap();

        let after = precision.covariance().unwrap().to_vec2::<f32>().unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_invert_spd_matches_known_inverse() {
        let device = Device::Cpu;
        // [[2, 1], [1, 2]] has inverse 1/3 [[2, -1], [-1, 2]]
        let a = Tensor::from_vec(vec![2.0f32, 1.0, 1.0, 2.0], (2, 2), &device).unwrap();
        let inv = invert_spd(&a).unwrap().to_vec2::<f32>().unwrap();
        assert!((inv[0][0] - 2.0 / 3.0).abs() < 1e-5);
        assert!((inv[0][1] + 1.0 / 3.0).abs() < 1e-5);
        assert!((inv[1][1] - 2.0 / 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_invert_spd_rejects_indefinite() {
        let device = Device::Cpu;
        let a = Tensor::from_vec(vec![0.0f32, 1.0, 1.0, 0.0], (2, 2), &device).unwrap();
        assert!(invert_spd(&a).is_err());
    }

    #[test]
    fn test_reset_restores_ridge_prior() {
        let device = Device::Cpu;
        let mut precision = LaplacePrecision::new(3, 0.5, 0.9, &device).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let phi = seeded_normal(&mut rng, (2, 3), 1.0, &device).unwrap();
        let probs = Tensor::from_vec(vec![0.5f32, 0.5], (2, 1), &device).unwrap();
        let contrib = LaplacePrecision::batch_contribution(&phi, &probs).unwrap();
        precision.apply_update(&contrib, 2).unwrap();

        precision.reset().unwrap();
        let m = precision.matrix().to_vec2::<f32>().unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 0.5 } else { 0.0 };
                assert!((m[i][j] - expected).abs() < 1e-6);
            }
        }
    }
}
