//! Run configuration for SNGP training and evaluation.
//!
//! Collects the spectral-normalization, Gaussian-process, optimization and
//! evaluation options into one serializable struct. [`SngpConfig::validate`]
//! is the fail-fast gate: nothing is allowed to allocate tensors or open a
//! run directory before it passes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{SngpError, SngpResult};

/// Loss function applied to the single toxicity logit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossType {
    /// Sigmoid cross-entropy on the raw logit
    CrossEntropy,
    /// Mean squared error on the sigmoid probability
    Mse,
    /// Mean absolute error on the sigmoid probability
    Mae,
}

impl std::str::FromStr for LossType {
    type Err = SngpError;

    fn from_str(s: &str) -> SngpResult<Self> {
        match s {
            "cross_entropy" => Ok(Self::CrossEntropy),
            "mse" => Ok(Self::Mse),
            "mae" => Ok(Self::Mae),
            other => Err(SngpError::invalid_config(format!(
                "unknown loss type '{other}' (expected cross_entropy|mse|mae)"
            ))),
        }
    }
}

/// Scope over which the oracle referral fraction is applied.
///
/// The referral policy defers the most-uncertain fraction of examples to a
/// perfect oracle. Applying the fraction per batch and applying it over the
/// whole evaluation set give different results at small batch sizes, so both
/// are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralMode {
    /// Refer the fraction most-uncertain examples of every batch
    PerBatch,
    /// Accumulate confidence histograms and refer the global fraction at finalize
    Global,
}

/// Configuration for the SNGP model, trainer and metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SngpConfig {
    // Model dimensions
    /// Token vocabulary size of the bundled encoder
    pub vocab_size: usize,
    /// Number of token type (segment) ids
    pub type_vocab_size: usize,
    /// Encoder hidden dimension
    pub hidden_size: usize,
    /// Fixed sequence length of every batch
    pub max_seq_length: usize,

    // Spectral normalization
    /// Apply spectral normalization to the encoder pooler dense
    pub use_spec_norm_pooler: bool,
    /// Upper bound on the top singular value of wrapped weight matrices
    pub spec_norm_bound: f64,
    /// Power-iteration steps per normalization pass
    pub spec_norm_iteration: usize,

    // Gaussian process output layer
    /// Use the random-feature GP head (false = plain dense baseline)
    pub use_gp_layer: bool,
    /// Number of random features approximating the GP
    pub gp_hidden_dim: usize,
    /// Length-scale of the approximated RBF kernel
    pub gp_scale: f64,
    /// Constant bias added to GP logits
    pub gp_bias: f64,
    /// Layer-normalize the GP input
    pub gp_input_normalization: bool,
    /// Ridge penalty added to the precision diagonal before inversion
    pub gp_cov_ridge_penalty: f64,
    /// Discount factor for the precision-matrix moving average, in [0, 1)
    pub gp_cov_discount_factor: f64,
    /// Mean-field factor for posterior calibration; negative = posterior mode
    pub gp_mean_field_factor: f64,
    /// Reset the precision matrix to ridge*I at the start of every epoch
    pub gp_reset_covariance_per_epoch: bool,

    // Optimization
    /// Random seed for fixed random state (feature map, power-iteration init)
    pub seed: u64,
    /// Examples per logical batch (across all replicas)
    pub batch_size: usize,
    /// Number of data-parallel replicas a batch is sharded over
    pub num_replicas: usize,
    /// Base learning rate
    pub learning_rate: f64,
    /// Proportion of total steps spent in linear warmup
    pub warmup_proportion: f64,
    /// Number of training epochs
    pub train_epochs: usize,
    /// Optional cap on steps per epoch (None = run the provider dry)
    pub steps_per_epoch: Option<usize>,
    /// Loss function
    pub loss_type: LossType,

    // Evaluation and metrics
    /// Epochs between evaluation passes
    pub evaluation_interval: usize,
    /// Epochs between checkpoints; negative = never checkpoint
    pub checkpoint_interval: i64,
    /// Number of equal-width confidence bins for ECE
    pub num_bins: usize,
    /// Threshold converting a toxicity score into a binary label
    pub ece_label_threshold: f32,
    /// Referral fractions for oracle-collaborative accuracy
    pub fractions: Vec<f64>,
    /// Referral scope for oracle-collaborative accuracy
    pub referral_mode: ReferralMode,
    /// Monte Carlo forward passes per evaluation batch
    pub num_mc_samples: usize,

    // Run layout
    /// Output directory for checkpoints, summaries and predictions
    pub output_dir: PathBuf,
    /// Pretrained encoder weights (safetensors), loaded on fresh start
    pub pretrained_encoder: Option<PathBuf>,
    /// Prediction-only mode: skip training, export raw predictions, exit
    pub prediction_mode: bool,
    /// Checkpoint directory to restore from in prediction mode
    pub eval_checkpoint_dir: Option<PathBuf>,
}

impl Default for SngpConfig {
    fn default() -> Self {
        Self {
            vocab_size: 30_522,
            type_vocab_size: 2,
            hidden_size: 768,
            max_seq_length: 512,
            use_spec_norm_pooler: true,
            spec_norm_bound: 0.95,
            spec_norm_iteration: 1,
            use_gp_layer: true,
            gp_hidden_dim: 768,
            gp_scale: 2.0,
            gp_bias: 0.0,
            gp_input_normalization: true,
            gp_cov_ridge_penalty: 1e-3,
            gp_cov_discount_factor: 0.999,
            gp_mean_field_factor: 1e-4,
            gp_reset_covariance_per_epoch: true,
            seed: 42,
            batch_size: 32,
            num_replicas: 1,
            learning_rate: 5e-5,
            warmup_proportion: 0.1,
            train_epochs: 3,
            steps_per_epoch: None,
            loss_type: LossType::CrossEntropy,
            evaluation_interval: 1,
            checkpoint_interval: 3,
            num_bins: 15,
            ece_label_threshold: 0.7,
            fractions: vec![0.0, 0.01, 0.05, 0.1, 0.15, 0.2],
            referral_mode: ReferralMode::PerBatch,
            num_mc_samples: 1,
            output_dir: PathBuf::from("/tmp/toxic_comments"),
            pretrained_encoder: None,
            prediction_mode: false,
            eval_checkpoint_dir: None,
        }
    }
}

impl SngpConfig {
    /// Minimal configuration for unit tests.
    pub fn test() -> Self {
        Self {
            vocab_size: 128,
            type_vocab_size: 2,
            hidden_size: 16,
            max_seq_length: 8,
            gp_hidden_dim: 32,
            batch_size: 4,
            train_epochs: 1,
            checkpoint_interval: -1,
            num_mc_samples: 1,
            fractions: vec![0.0, 0.5, 1.0],
            output_dir: PathBuf::from("/tmp/sngp-test"),
            ..Self::default()
        }
    }

    /// Validate the configuration. Called before any computation; every
    /// violation here is irrecoverable.
    pub fn validate(&self) -> SngpResult<()> {
        if self.hidden_size == 0 || self.vocab_size == 0 || self.max_seq_length == 0 {
            return Err(SngpError::invalid_config(
                "vocab_size, hidden_size and max_seq_length must be nonzero",
            ));
        }
        if self.batch_size == 0 {
            return Err(SngpError::invalid_config("batch_size must be nonzero"));
        }
        if self.num_replicas == 0 || self.batch_size % self.num_replicas != 0 {
            return Err(SngpError::invalid_config(format!(
                "batch_size ({}) must be divisible by num_replicas ({})",
                self.batch_size, self.num_replicas
            )));
        }
        if self.spec_norm_bound <= 0.0 {
            return Err(SngpError::invalid_config("spec_norm_bound must be > 0"));
        }
        if self.spec_norm_iteration == 0 {
            return Err(SngpError::invalid_config("spec_norm_iteration must be >= 1"));
        }
        if self.use_gp_layer && self.gp_hidden_dim == 0 {
            return Err(SngpError::invalid_config("gp_hidden_dim must be nonzero"));
        }
        if self.gp_scale <= 0.0 {
            return Err(SngpError::invalid_config("gp_scale must be > 0"));
        }
        if self.gp_cov_ridge_penalty <= 0.0 {
            return Err(SngpError::invalid_config(
                "gp_cov_ridge_penalty must be > 0 to guarantee invertibility",
            ));
        }
        if !(0.0..1.0).contains(&self.gp_cov_discount_factor) {
            return Err(SngpError::invalid_config(
                "gp_cov_discount_factor must be in [0, 1)",
            ));
        }
        if !(0.0..=1.0).contains(&self.warmup_proportion) {
            return Err(SngpError::invalid_config(
                "warmup_proportion must be in [0, 1]",
            ));
        }
        if self.num_bins < 2 {
            return Err(SngpError::invalid_config("num_bins must be >= 2"));
        }
        if !(0.0..=1.0).contains(&(self.ece_label_threshold as f64)) {
            return Err(SngpError::invalid_config(
                "ece_label_threshold must be in [0, 1]",
            ));
        }
        for f in &self.fractions {
            if !(0.0..=1.0).contains(f) {
                return Err(SngpError::invalid_config(format!(
                    "referral fraction {f} outside [0, 1]"
                )));
            }
        }
        if self.num_mc_samples == 0 {
            return Err(SngpError::invalid_config("num_mc_samples must be >= 1"));
        }
        if self.evaluation_interval == 0 {
            return Err(SngpError::invalid_config("evaluation_interval must be >= 1"));
        }
        if self.prediction_mode && self.eval_checkpoint_dir.is_none() {
            return Err(SngpError::invalid_config(
                "eval_checkpoint_dir must be provided in prediction mode",
            ));
        }
        Ok(())
    }

    /// Per-replica batch size.
    pub fn per_replica_batch_size(&self) -> usize {
        self.batch_size / self.num_replicas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        SngpConfig::default().validate().unwrap();
        SngpConfig::test().validate().unwrap();
    }

    #[test]
    fn test_prediction_mode_requires_checkpoint_dir() {
        let mut config = SngpConfig::test();
        config.prediction_mode = true;
        config.eval_checkpoint_dir = None;
        assert!(config.validate().is_err());

        config.eval_checkpoint_dir = Some(PathBuf::from("/tmp/ckpt"));
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_numerics() {
        let mut config = SngpConfig::test();
        config.gp_cov_ridge_penalty = 0.0;
        assert!(config.validate().is_err());

        let mut config = SngpConfig::test();
        config.gp_cov_discount_factor = 1.0;
        assert!(config.validate().is_err());

        let mut config = SngpConfig::test();
        config.fractions = vec![0.0, 1.5];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_replica_divisibility() {
        let mut config = SngpConfig::test();
        config.batch_size = 6;
        config.num_replicas = 4;
        assert!(config.validate().is_err());

        config.num_replicas = 2;
        config.validate().unwrap();
        assert_eq!(config.per_replica_batch_size(), 3);
    }

    #[test]
    fn test_loss_type_parse() {
        assert_eq!("mse".parse::<LossType>().unwrap(), LossType::Mse);
        assert!("huber".parse::<LossType>().is_err());
    }
}
