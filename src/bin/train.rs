//! SNGP toxicity training binary.
//!
//! Usage:
//!   train [OPTIONS]
//!
//! Examples:
//!   # Train on a JSONL dataset with in-domain eval
//!   train --train-data data/wikipedia_train.jsonl \
//!         --ind-data data/wikipedia_test.jsonl \
//!         --ood-data data/civil_comments_test.jsonl \
//!         --identity-data data/civil_comments_identities_test.jsonl \
//!         --output-dir runs/sngp
//!
//!   # Prediction-only mode from an existing checkpoint
//!   train --prediction-mode --eval-checkpoint-dir runs/sngp \
//!         --ind-data data/wikipedia_test.jsonl --output-dir runs/predict

use std::path::PathBuf;

use candle_core::Device;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sngp_model_rs::data::{BatchProvider, JsonlToxicityDataset, SyntheticDataset};
use sngp_model_rs::trainer::EvalDataset;
use sngp_model_rs::{LossType, ReferralMode, SngpConfig, SngpTrainer};

#[derive(Parser)]
#[command(name = "train")]
#[command(about = "SNGP training and evaluation for toxicity classification")]
#[command(version)]
struct Args {
    /// Path to the in-domain training dataset (JSONL)
    #[arg(long)]
    train_data: Option<PathBuf>,

    /// Path to the in-domain test dataset (JSONL)
    #[arg(long)]
    ind_data: Option<PathBuf>,

    /// Path to the out-of-domain test dataset (JSONL)
    #[arg(long)]
    ood_data: Option<PathBuf>,

    /// Path to the out-of-domain test dataset with identity labels (JSONL)
    #[arg(long)]
    identity_data: Option<PathBuf>,

    /// Pretrained encoder weights (safetensors), loaded on fresh start
    #[arg(long)]
    pretrained_encoder: Option<PathBuf>,

    /// Output directory for checkpoints, summaries and predictions
    #[arg(short = 'o', long, default_value = "/tmp/toxic_comments")]
    output_dir: PathBuf,

    /// Random seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Batch size (across all replicas)
    #[arg(short = 'b', long, default_value = "32")]
    batch_size: usize,

    /// Number of data-parallel replicas
    #[arg(long, default_value = "1")]
    num_replicas: usize,

    /// Base learning rate
    #[arg(short = 'l', long, default_value = "5e-5")]
    learning_rate: f64,

    /// Number of training epochs
    #[arg(long, default_value = "3")]
    train_epochs: usize,

    /// Optional cap on steps per epoch
    #[arg(long)]
    steps_per_epoch: Option<usize>,

    /// Proportion of training spent in linear LR warmup
    #[arg(long, default_value = "0.1")]
    warmup_proportion: f64,

    /// Epochs between checkpoints (-1 to never checkpoint)
    #[arg(long, default_value = "3")]
    checkpoint_interval: i64,

    /// Epochs between evaluation passes
    #[arg(long, default_value = "1")]
    evaluation_interval: usize,

    /// Loss type: cross_entropy, mse or mae
    #[arg(long, default_value = "cross_entropy")]
    loss_type: String,

    /// Upper bound on the spectral norm of wrapped weight matrices
    #[arg(long, default_value = "0.95")]
    spec_norm_bound: f64,

    /// Power iterations per spectral normalization pass
    #[arg(long, default_value = "1")]
    spec_norm_iteration: usize,

    /// Disable the GP output layer (plain dense baseline)
    #[arg(long)]
    no_gp_layer: bool,

    /// GP random feature dimension
    #[arg(long, default_value = "768")]
    gp_hidden_dim: usize,

    /// GP kernel length-scale
    #[arg(long, default_value = "2.0")]
    gp_scale: f64,

    /// GP output bias
    #[arg(long, default_value = "0.0")]
    gp_bias: f64,

    /// Ridge penalty for the GP posterior precision
    #[arg(long, default_value = "1e-3")]
    gp_cov_ridge_penalty: f64,

    /// Discount factor for the precision moving average
    #[arg(long, default_value = "0.999")]
    gp_cov_discount_factor: f64,

    /// Mean-field factor (-1 for posterior mode)
    #[arg(long, default_value = "1e-4")]
    gp_mean_field_factor: f64,

    /// Number of ECE bins
    #[arg(long, default_value = "15")]
    num_bins: usize,

    /// Threshold converting toxicity scores into binary labels
    #[arg(long, default_value = "0.7")]
    ece_label_threshold: f32,

    /// Referral fractions for oracle-collaborative accuracy
    #[arg(long, value_delimiter = ',', default_value = "0.0,0.01,0.05,0.1,0.15,0.2")]
    fractions: Vec<f64>,

    /// Apply referral fractions globally instead of per batch
    #[arg(long)]
    global_referral: bool,

    /// Monte Carlo forward passes per evaluation batch
    #[arg(long, default_value = "1")]
    num_mc_samples: usize,

    /// Fixed sequence length
    #[arg(long, default_value = "512")]
    max_seq_length: usize,

    /// Prediction-only mode: restore a checkpoint, export predictions, exit
    #[arg(long)]
    prediction_mode: bool,

    /// Checkpoint directory to restore from in prediction mode
    #[arg(long)]
    eval_checkpoint_dir: Option<PathBuf>,

    /// Use CUDA device
    #[arg(long)]
    cuda: bool,

    /// CUDA device index
    #[arg(long, default_value = "0")]
    cuda_device: usize,
}

fn open_dataset(
    path: &Option<PathBuf>,
    config: &SngpConfig,
    with_identity: bool,
    device: &Device,
) -> anyhow::Result<Option<Box<dyn BatchProvider>>> {
    match path {
        Some(path) => Ok(Some(Box::new(JsonlToxicityDataset::new(
            path,
            config.max_seq_length,
            config.batch_size,
            with_identity,
            device.clone(),
        )?))),
        None => Ok(None),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("sngp_model_rs=debug".parse()?),
        )
        .init();

    let loss_type: LossType = args.loss_type.parse()?;

    let config = SngpConfig {
        seed: args.seed,
        batch_size: args.batch_size,
        num_replicas: args.num_replicas,
        learning_rate: args.learning_rate,
        train_epochs: args.train_epochs,
        steps_per_epoch: args.steps_per_epoch,
        warmup_proportion: args.warmup_proportion,
        checkpoint_interval: args.checkpoint_interval,
        evaluation_interval: args.evaluation_interval,
        loss_type,
        use_spec_norm_pooler: true,
        spec_norm_bound: args.spec_norm_bound,
        spec_norm_iteration: args.spec_norm_iteration,
        use_gp_layer: !args.no_gp_layer,
        gp_hidden_dim: args.gp_hidden_dim,
        gp_scale: args.gp_scale,
        gp_bias: args.gp_bias,
        gp_cov_ridge_penalty: args.gp_cov_ridge_penalty,
        gp_cov_discount_factor: args.gp_cov_discount_factor,
        gp_mean_field_factor: args.gp_mean_field_factor,
        num_bins: args.num_bins,
        ece_label_threshold: args.ece_label_threshold,
        fractions: args.fractions.clone(),
        referral_mode: if args.global_referral {
            ReferralMode::Global
        } else {
            ReferralMode::PerBatch
        },
        num_mc_samples: args.num_mc_samples,
        max_seq_length: args.max_seq_length,
        output_dir: args.output_dir.clone(),
        pretrained_encoder: args.pretrained_encoder.clone(),
        prediction_mode: args.prediction_mode,
        eval_checkpoint_dir: args.eval_checkpoint_dir.clone(),
        ..SngpConfig::default()
    };
    // Fail fast on configuration errors before building anything.
    config.validate()?;

    let device = if args.cuda {
        #[cfg(feature = "cuda")]
        {
            tracing::info!("initializing CUDA device {}", args.cuda_device);
            Device::new_cuda(args.cuda_device)?
        }
        #[cfg(not(feature = "cuda"))]
        {
            anyhow::bail!(
                "CUDA requested but not compiled with the cuda feature; \
                 rebuild with --features cuda or drop --cuda"
            );
        }
    } else {
        Device::Cpu
    };

    tracing::info!("=== SNGP toxicity training ===");
    tracing::info!("device: {:?}", device);
    tracing::info!("use_gp_layer={}", config.use_gp_layer);
    tracing::info!("spec_norm_bound={}", config.spec_norm_bound);
    tracing::info!("loss_type={:?}", config.loss_type);
    tracing::info!("output dir: {}", config.output_dir.display());

    let mut evals: Vec<EvalDataset> = Vec::new();
    if let Some(ds) = open_dataset(&args.ind_data, &config, false, &device)? {
        evals.push(("ind".to_string(), ds));
    }
    if let Some(ds) = open_dataset(&args.ood_data, &config, false, &device)? {
        evals.push(("ood".to_string(), ds));
    }
    if let Some(ds) = open_dataset(&args.identity_data, &config, true, &device)? {
        evals.push(("ood_identity".to_string(), ds));
    }

    let mut trainer = SngpTrainer::new(config.clone(), &device)?;

    if args.prediction_mode {
        trainer.predict(&mut evals)?;
        return Ok(());
    }

    let mut train: Box<dyn BatchProvider> = match &args.train_data {
        Some(path) => Box::new(JsonlToxicityDataset::new(
            path,
            config.max_seq_length,
            config.batch_size,
            false,
            device.clone(),
        )?),
        None => {
            tracing::warn!("no training dataset provided - using random tokens (testing mode)");
            Box::new(SyntheticDataset::new(
                config.seed,
                config.steps_per_epoch.unwrap_or(16),
                config.batch_size,
                config.max_seq_length,
                config.vocab_size,
                false,
                device.clone(),
            ))
        }
    };

    trainer.run(train.as_mut(), &mut evals)?;
    Ok(())
}
