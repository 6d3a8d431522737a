//! Mean-field calibration of GP logits.
//!
//! Converts a posterior over logits into calibrated class probabilities
//! without sampling: each logit is shrunk by the posterior variance of its
//! example, `logit / sqrt(1 + factor * var)`. A negative factor selects the
//! posterior mode (logits pass through unchanged).

use candle_core::{Tensor, D};

use crate::error::SngpResult;

/// Apply the mean-field approximation to a batch of logits.
///
/// * `logits` — `[batch, num_outputs]`
/// * `covariance` — posterior covariance over the batch, `[batch, batch]`;
///   `None` means no posterior estimate is available and the logits are
///   returned unchanged (training path and non-GP baseline).
/// * `mean_field_factor` — multiplicative factor on the variance; `< 0`
///   selects posterior-mode behavior (passthrough), `0` ignores uncertainty.
///
/// Pure: neither input is mutated.
pub fn mean_field_logits(
    logits: &Tensor,
    covariance: Option<&Tensor>,
    mean_field_factor: f64,
) -> SngpResult<Tensor> {
    if mean_field_factor < 0.0 {
        return Ok(logits.clone());
    }
    let covariance = match covariance {
        Some(c) => c,
        None => return Ok(logits.clone()),
    };

    // variances = diag(covariance), [batch]
    let variances = covariance_diagonal(covariance)?;
    // scale = sqrt(1 + factor * var), broadcast over output columns
    let scale = ((variances * mean_field_factor)? + 1.0)?.sqrt()?;
    let scale = scale.unsqueeze(D::Minus1)?;
    Ok(logits.broadcast_div(&scale)?)
}

/// Extract the diagonal of a square covariance matrix as a `[batch]` vector.
pub fn covariance_diagonal(covariance: &Tensor) -> SngpResult<Tensor> {
    let (n, m) = covariance.dims2()?;
    debug_assert_eq!(n, m);
    let eye = crate::gp::eye(n, covariance.device())?;
    Ok((covariance * &eye)?.sum(D::Minus1)?)
}

/// Per-example posterior standard deviation, `sqrt(diag(covariance))`.
pub fn posterior_stddev(covariance: &Tensor) -> SngpResult<Tensor> {
    Ok(covariance_diagonal(covariance)?.sqrt()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits_2x1(device: &Device) -> Tensor {
        Tensor::from_vec(vec![2.0f32, -1.5], (2, 1), device).unwrap()
    }

    #[test]
    fn test_negative_factor_is_passthrough() {
        let device = Device::Cpu;
        let logits = logits_2x1(&device);
        let cov = Tensor::from_vec(vec![4.0f32, 0.0, 0.0, 9.0], (2, 2), &device).unwrap();
        let out = mean_field_logits(&logits, Some(&cov), -1.0).unwrap();
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            logits.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_zero_covariance_is_identity() {
        let device = Device::Cpu;
        let logits = logits_2x1(&device);
        let cov = Tensor::zeros((2, 2), candle_core::DType::F32, &device).unwrap();
        let out = mean_field_logits(&logits, Some(&cov), 3.0).unwrap();
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            logits.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_missing_covariance_is_identity() {
        let device = Device::Cpu;
        let logits = logits_2x1(&device);
        let out = mean_field_logits(&logits, None, 1.0).unwrap();
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            logits.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_variance_shrinks_logits() {
        let device = Device::Cpu;
        let logits = logits_2x1(&device);
        // var = [3, 8]; factor 1 => scale = [2, 3]
        let cov = Tensor::from_vec(vec![3.0f32, 0.5, 0.5, 8.0], (2, 2), &device).unwrap();
        let out = mean_field_logits(&logits, Some(&cov), 1.0).unwrap();
        let out = out.to_vec2::<f32>().unwrap();
        assert!((out[0][0] - 1.0).abs() < 1e-6);
        assert!((out[1][0] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_posterior_stddev() {
        let device = Device::Cpu;
        let cov = Tensor::from_vec(vec![4.0f32, 1.0, 1.0, 9.0], (2, 2), &device).unwrap();
        let std = posterior_stddev(&cov).unwrap().to_vec1::<f32>().unwrap();
        assert!((std[0] - 2.0).abs() < 1e-6);
        assert!((std[1] - 3.0).abs() < 1e-6);
    }
}
