//! SNGP toxicity classifier in pure Rust.
//!
//! This crate implements calibrated predictive uncertainty for a binary
//! text-toxicity classifier by pairing a Lipschitz-bounded encoder head
//! (spectral normalization via power iteration) with a distance-aware
//! output layer (a random-feature approximation to a Gaussian process),
//! plus the calibration and selective-prediction metrics needed to judge
//! the result: ECE, AUROC/AUPR, Brier, MC-ensembled NLL and
//! oracle-collaborative accuracy across in-domain and out-of-domain
//! evaluation datasets.
//!
//! # Example
//!
//! ```no_run
//! use candle_core::Device;
//! use sngp_model_rs::{SngpConfig, SngpTrainer};
//! use sngp_model_rs::data::SyntheticDataset;
//!
//! let config = SngpConfig::default();
//! let device = Device::Cpu;
//! let mut trainer = SngpTrainer::new(config.clone(), &device).unwrap();
//!
//! let mut train = SyntheticDataset::new(
//!     config.seed, 100, config.batch_size, config.max_seq_length,
//!     config.vocab_size, false, device.clone(),
//! );
//! let mut evals: Vec<sngp_model_rs::trainer::EvalDataset> = vec![];
//! trainer.run(&mut train, &mut evals).unwrap();
//! ```

pub mod calibrate;
pub mod config;
pub mod data;
pub mod encoder;
pub mod error;
pub mod gp;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod replica;
pub mod spectral;
pub mod summary;
pub mod trainer;

pub use calibrate::mean_field_logits;
pub use config::{LossType, ReferralMode, SngpConfig};
pub use error::{SngpError, SngpResult};
pub use gp::{LaplacePrecision, LayerOutput, RandomFeatureGp};
pub use metrics::MetricsRegistry;
pub use model::{SngpModel, StepOutput};
pub use spectral::SpectralLinear;
pub use trainer::SngpTrainer;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::calibrate::mean_field_logits;
    pub use crate::config::{LossType, ReferralMode, SngpConfig};
    pub use crate::data::{BatchProvider, TextBatch};
    pub use crate::error::{SngpError, SngpResult};
    pub use crate::model::SngpModel;
    pub use crate::trainer::SngpTrainer;
}
