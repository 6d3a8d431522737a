//! Spectral normalization of dense weight matrices via power iteration.
//!
//! A [`SpectralLinear`] is a dense transform whose weight matrix is kept
//! Lipschitz-bounded: after every optimizer update the trainer calls
//! [`SpectralLinear::renormalize`], which estimates the top singular value
//! with a few power-iteration steps and rescales the matrix in place when
//! the estimate exceeds the configured bound. The power-iteration vectors
//! persist across calls, so a single iteration per step converges over the
//! course of training instead of paying for a full SVD.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use rand_chacha::ChaCha8Rng;

use crate::error::SngpResult;
use crate::gp::seeded_normal;

/// Dense layer with a spectral-norm bound on its weight matrix.
///
/// The weight and bias are registered in the run's `VarMap` under
/// `<name>.weight` / `<name>.bias` so the optimizer and checkpointing see
/// them like any other trainable parameter. The power-iteration vectors
/// `(u, v)` are not trainable; they are carried in checkpoints as auxiliary
/// state so a restored run continues the same normalization trajectory.
pub struct SpectralLinear {
    weight: Var,
    bias: Option<Var>,
    /// Left singular vector estimate, `[1, out]`
    u: Tensor,
    /// Right singular vector estimate, `[1, in]`
    v: Tensor,
    bound: f64,
    iterations: usize,
    name: String,
}

impl SpectralLinear {
    /// Create a new spectrally-normalized dense layer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        bound: f64,
        iterations: usize,
        with_bias: bool,
        name: &str,
        varmap: &VarMap,
        rng: &mut ChaCha8Rng,
        device: &Device,
    ) -> SngpResult<Self> {
        let std = (1.0 / in_dim as f64).sqrt();
        let weight = Var::from_tensor(&seeded_normal(rng, (out_dim, in_dim), std, device)?)?;
        let bias = if with_bias {
            Some(Var::from_tensor(&Tensor::zeros(
                (out_dim,),
                DType::F32,
                device,
            )?)?)
        } else {
            None
        };
        {
            let mut data = varmap.data().lock().unwrap();
            data.insert(format!("{name}.weight"), weight.clone());
            if let Some(b) = &bias {
                data.insert(format!("{name}.bias"), b.clone());
            }
        }

        // Random unit vectors; refined in place by every power-iteration pass.
        let u = normalize_row(&seeded_normal(rng, (1, out_dim), 1.0, device)?)?
            .unwrap_or(Tensor::zeros((1, out_dim), DType::F32, device)?);
        let v = normalize_row(&seeded_normal(rng, (1, in_dim), 1.0, device)?)?
            .unwrap_or(Tensor::zeros((1, in_dim), DType::F32, device)?);

        Ok(Self {
            weight,
            bias,
            u,
            v,
            bound,
            iterations,
            name: name.to_string(),
        })
    }

    /// Dense forward: `y = x W^T + b`.
    ///
    /// In training mode this also advances the power iteration by one step,
    /// amortizing the singular-value estimate across training.
    pub fn forward(&mut self, x: &Tensor, training: bool) -> SngpResult<Tensor> {
        if training {
            self.power_iterate(1)?;
        }
        let y = x.matmul(&self.weight.as_tensor().t()?)?;
        match &self.bias {
            Some(b) => Ok(y.broadcast_add(b.as_tensor())?),
            None => Ok(y),
        }
    }

    /// Run `steps` power-iteration updates on `(u, v)` and return the
    /// current estimate of the top singular value.
    ///
    /// A degenerate (all-zero) weight matrix yields an estimate of zero and
    /// leaves the vectors untouched; the caller must not rescale in that
    /// case.
    fn power_iterate(&mut self, steps: usize) -> SngpResult<f64> {
        let w = self.weight.as_tensor().detach();
        let wt = w.t()?;
        let mut sigma = 0.0f64;
        for _ in 0..steps {
            // v <- normalize(W^T u)
            let v_new = self.u.matmul(&w)?;
            let Some(v) = normalize_row(&v_new)? else {
                return Ok(0.0);
            };
            self.v = v;
            // u <- normalize(W v)
            let u_new = self.v.matmul(&wt)?;
            let Some(u) = normalize_row(&u_new)? else {
                return Ok(0.0);
            };
            self.u = u;
            // sigma = u^T W v
            sigma = (&self.u * self.v.matmul(&wt)?)?
                .sum_all()?
                .to_scalar::<f32>()? as f64;
        }
        Ok(sigma)
    }

    /// Estimate the top singular value and rescale the weight in place when
    /// it exceeds the bound: `W <- W * min(1, bound / sigma)`.
    ///
    /// Returns the (pre-rescale) singular value estimate.
    pub fn renormalize(&mut self) -> SngpResult<f64> {
        let sigma = self.power_iterate(self.iterations)?;
        if sigma > self.bound {
            let scaled = (self.weight.as_tensor() * (self.bound / sigma))?;
            self.weight.set(&scaled)?;
        }
        Ok(sigma)
    }

    /// Current singular-value estimate without mutating `(u, v)`.
    pub fn estimate(&self) -> SngpResult<f64> {
        let w = self.weight.as_tensor().detach();
        let sigma = (&self.u * self.v.matmul(&w.t()?)?)?
            .sum_all()?
            .to_scalar::<f32>()? as f64;
        Ok(sigma)
    }

    /// Auxiliary (non-trainable) state for checkpointing.
    pub fn aux_state(&self) -> Vec<(String, Tensor)> {
        vec![
            (format!("{}.u", self.name), self.u.clone()),
            (format!("{}.v", self.name), self.v.clone()),
        ]
    }

    /// Restore auxiliary state written by [`Self::aux_state`].
    pub fn load_aux_state(
        &mut self,
        state: &std::collections::HashMap<String, Tensor>,
    ) -> SngpResult<()> {
        if let Some(u) = state.get(&format!("{}.u", self.name)) {
            self.u = u.clone();
        }
        if let Some(v) = state.get(&format!("{}.v", self.name)) {
            self.v = v.clone();
        }
        Ok(())
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    pub fn bound(&self) -> f64 {
        self.bound
    }
}

/// Normalize a `[1, n]` row vector to unit length. Returns `None` for a
/// zero vector rather than dividing by zero.
fn normalize_row(t: &Tensor) -> SngpResult<Option<Tensor>> {
    let norm = t.sqr()?.sum_all()?.to_scalar::<f32>()?.sqrt() as f64;
    if norm == 0.0 || !norm.is_finite() {
        return Ok(None);
    }
    Ok(Some((t / norm)?))
}
