//! Train/eval orchestration: epochs, evaluation passes, checkpointing and
//! prediction export.
//!
//! The trainer drives the state machine
//! `restore-or-init -> train epoch <-> eval epoch -> checkpoint -> done`,
//! with a separate prediction-only path that restores a checkpoint, runs
//! one evaluation pass per dataset and exports raw predictions. Precision
//! accumulation happens only in training steps; every evaluation pass reads
//! the frozen matrix through its lazily-inverted covariance.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::calibrate::{mean_field_logits, posterior_stddev};
use crate::config::SngpConfig;
use crate::data::{BatchProvider, TextBatch, IDENTITY_LABELS};
use crate::encoder::load_pretrained_encoder;
use crate::error::{SngpError, SngpResult};
use crate::metrics::{mc_ensemble_nll, MetricsRegistry};
use crate::model::{bce_with_logits, SngpModel};
use crate::optimizer::{AdamW, LinearDecaySchedule};
use crate::replica::{reduce_gradients, reduce_precision, shard_batch};
use crate::summary::SummaryWriter;

/// Fallback steps-per-epoch estimate when neither the config nor the
/// provider can say how long an epoch is; only affects the LR schedule.
const DEFAULT_STEPS_PER_EPOCH: usize = 1000;

/// Scalar trainer state persisted alongside the tensors in a checkpoint.
#[derive(Debug, Serialize, Deserialize)]
struct TrainerState {
    /// Global step counter
    step: usize,
    /// Number of completed epochs
    completed_epochs: usize,
    /// Optimizer step counter (Adam bias correction)
    optimizer_steps: usize,
}

/// A named evaluation dataset. The dataset named `"ind"` is the in-domain
/// set and keeps unsuffixed metric names.
pub type EvalDataset = (String, Box<dyn BatchProvider>);

/// Orchestrates training, evaluation, checkpointing and prediction export
/// for one run directory.
pub struct SngpTrainer {
    config: SngpConfig,
    model: SngpModel,
    optimizer: AdamW,
    schedule: LinearDecaySchedule,
    metrics: MetricsRegistry,
    summary: SummaryWriter,
    device: Device,
    /// Global training step counter
    step: usize,
}

impl SngpTrainer {
    /// Build a trainer. Fails fast on configuration errors before touching
    /// the filesystem or allocating model state.
    pub fn new(config: SngpConfig, device: &Device) -> SngpResult<Self> {
        config.validate()?;
        let model = SngpModel::new(&config, device)?;
        let summary = SummaryWriter::new(&config.output_dir)?;
        // Placeholder schedule; rebuilt in run() once the epoch length is known.
        let schedule = LinearDecaySchedule::new(
            config.learning_rate,
            config.warmup_proportion,
            DEFAULT_STEPS_PER_EPOCH * config.train_epochs.max(1),
        );
        Ok(Self {
            metrics: MetricsRegistry::new(&config),
            optimizer: AdamW::new(),
            schedule,
            summary,
            model,
            device: device.clone(),
            config,
            step: 0,
        })
    }

    pub fn model(&self) -> &SngpModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut SngpModel {
        &mut self.model
    }

    pub fn metrics(&mut self) -> &mut MetricsRegistry {
        &mut self.metrics
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// One training step over a logical batch: shard, forward/backward per
    /// shard, reduce, apply one optimizer update, renormalize spectral
    /// weights, apply one precision update.
    pub fn train_step(&mut self, batch: &TextBatch) -> SngpResult<f32> {
        let num_replicas = self.config.num_replicas;
        let shards = shard_batch(batch, num_replicas)?;

        let mut gradient_maps = Vec::with_capacity(num_replicas);
        let mut precision_contributions = Vec::new();
        let mut shard_stats = Vec::with_capacity(num_replicas);

        for shard in &shards {
            let out = self.model.forward(shard, true)?;
            let loss = self
                .model
                .compute_loss(&out.output.logits, &shard.labels, self.config.loss_type)?;
            // Pre-scale so the summed update is replica-count invariant.
            let scaled = (&loss / num_replicas as f64)?;
            let grads = scaled.backward()?;

            let mut gradient_map = HashMap::new();
            {
                let data = self.model.var_map().data().lock().unwrap();
                for (name, var) in data.iter() {
                    if let Some(grad) = grads.get(var) {
                        gradient_map.insert(name.clone(), grad.clone());
                    }
                }
            }
            gradient_maps.push(gradient_map);

            if let Some(contribution) = out.precision_contribution {
                precision_contributions.push(contribution);
            }

            // Training-time metrics use uncalibrated probabilities (no
            // covariance exists during training).
            let calibrated = mean_field_logits(
                &out.output.logits.detach(),
                None,
                self.config.gp_mean_field_factor,
            )?;
            let probs = candle_nn::ops::sigmoid(&calibrated)?
                .squeeze(1)?
                .to_vec1::<f32>()?;
            let labels = shard.labels.to_vec1::<f32>()?;
            let loss_value = loss.to_scalar::<f32>()?;
            shard_stats.push((labels, probs, loss_value));
        }

        let reduced = reduce_gradients(gradient_maps)?;
        let lr = self.schedule.learning_rate(self.step);
        self.optimizer.step(self.model.var_map(), &reduced, lr)?;
        self.model.renormalize()?;

        if let Some(contribution) = reduce_precision(precision_contributions)? {
            self.model
                .apply_precision_update(&contribution, batch.batch_size())?;
        }

        let mut mean_loss = 0.0;
        for (labels, probs, loss) in &shard_stats {
            // Without an auxiliary regularizer the reported loss and the
            // negative log-likelihood coincide.
            self.metrics.train.update(labels, probs, *loss, *loss);
            mean_loss += *loss;
        }
        mean_loss /= shard_stats.len() as f32;

        self.step += 1;
        Ok(mean_loss)
    }

    /// One evaluation pass over a dataset. The precision matrix is frozen;
    /// its inverse is computed lazily on the first batch and reused.
    pub fn eval_pass(&mut self, dataset: &str, provider: &mut dyn BatchProvider) -> SngpResult<()> {
        provider.reset()?;
        tracing::info!("evaluating on dataset {dataset}");
        let mut batches = 0usize;

        while let Some(result) = provider.next_batch() {
            let batch = result?;
            let started = Instant::now();
            let batch_size = batch.batch_size();

            let mut calibrated_list = Vec::with_capacity(self.config.num_mc_samples);
            let mut stddev_list = Vec::with_capacity(self.config.num_mc_samples);
            let mut ce_list = Vec::with_capacity(self.config.num_mc_samples);

            for _ in 0..self.config.num_mc_samples {
                let out = self.model.forward(&batch, false)?;
                let calibrated = mean_field_logits(
                    &out.output.logits.detach(),
                    out.output.covariance.as_ref(),
                    self.config.gp_mean_field_factor,
                )?;
                let stddev = match &out.output.covariance {
                    Some(cov) => posterior_stddev(cov)?,
                    // Identity covariance: unit epistemic stddev.
                    None => Tensor::ones((batch_size,), DType::F32, &self.device)?,
                };
                let ce = bce_with_logits(&calibrated.squeeze(1)?, &batch.labels)?;
                calibrated_list.push(calibrated);
                stddev_list.push(stddev);
                ce_list.push(ce);
            }

            let ce = Tensor::stack(&ce_list, 0)?;
            let nll = mc_ensemble_nll(&ce)?.mean_all()?.to_scalar::<f32>()?;

            // Ensemble in probability space: mean of per-sample sigmoids.
            let logits = Tensor::stack(&calibrated_list, 0)?;
            let probs = candle_nn::ops::sigmoid(&logits)?
                .mean(0)?
                .squeeze(1)?
                .to_vec1::<f32>()?;
            let stddev = Tensor::stack(&stddev_list, 0)?.mean(0)?.to_vec1::<f32>()?;
            let labels = batch.labels.to_vec1::<f32>()?;
            let elapsed = started.elapsed().as_secs_f32();

            self.metrics
                .eval_mut(dataset)
                .update(&labels, &probs, nll, &stddev, elapsed);

            batches += 1;
            if batches % 20 == 0 {
                tracing::info!("eval step {batches} of dataset {dataset}");
            }
        }
        tracing::info!("done with testing on {dataset}");
        Ok(())
    }

    /// Full training run over the configured number of epochs.
    pub fn run(
        &mut self,
        train: &mut dyn BatchProvider,
        evals: &mut [EvalDataset],
    ) -> SngpResult<()> {
        fs::create_dir_all(&self.config.output_dir)?;
        fs::write(
            self.config.output_dir.join("config.json"),
            serde_json::to_string_pretty(&self.config)?,
        )?;

        let initial_epoch = match latest_checkpoint(&self.config.output_dir) {
            Some(dir) => {
                tracing::info!("restoring checkpoint {}", dir.display());
                self.restore(&dir)?
            }
            None => {
                // Fresh start: GP and spectral state stay at their seeded
                // initialization; only the encoder loads pretrained weights.
                if let Some(path) = self.config.pretrained_encoder.clone() {
                    load_pretrained_encoder(self.model.var_map(), &path, &self.device)?;
                }
                0
            }
        };

        let steps_per_epoch = self.config.steps_per_epoch.or_else(|| train.len_hint());
        let total_steps =
            steps_per_epoch.unwrap_or(DEFAULT_STEPS_PER_EPOCH) * self.config.train_epochs.max(1);
        self.schedule = LinearDecaySchedule::new(
            self.config.learning_rate,
            self.config.warmup_proportion,
            total_steps,
        );

        tracing::info!(
            "training for {} epochs ({} parameters, use_gp_layer={})",
            self.config.train_epochs,
            self.model.parameter_count(),
            self.config.use_gp_layer,
        );

        let run_started = Instant::now();
        for epoch in initial_epoch..self.config.train_epochs {
            tracing::info!("starting epoch {epoch}");
            if self.config.gp_reset_covariance_per_epoch {
                self.model.reset_precision()?;
            }

            train.reset()?;
            let mut epoch_steps = 0usize;
            while let Some(result) = train.next_batch() {
                if let Some(cap) = steps_per_epoch {
                    if epoch_steps >= cap {
                        break;
                    }
                }
                let batch = result?;
                let loss = self.train_step(&batch)?;
                epoch_steps += 1;

                if epoch_steps % 20 == 0 {
                    let elapsed = run_started.elapsed().as_secs_f64();
                    let steps_per_sec = self.step as f64 / elapsed.max(1e-9);
                    let eta_min = steps_per_epoch
                        .map(|spe| {
                            let max_steps = spe * self.config.train_epochs;
                            (max_steps.saturating_sub(self.step)) as f64
                                / steps_per_sec.max(1e-9)
                                / 60.0
                        })
                        .unwrap_or(f64::NAN);
                    tracing::info!(
                        "epoch {}/{} step {}: loss {:.4}, {:.1} steps/s, ETA {:.0} min",
                        epoch + 1,
                        self.config.train_epochs,
                        epoch_steps,
                        loss,
                        steps_per_sec,
                        eta_min,
                    );
                }
            }

            if epoch % self.config.evaluation_interval == 0 {
                for (name, provider) in evals.iter_mut() {
                    let name = name.clone();
                    self.eval_pass(&name, provider.as_mut())?;
                }

                tracing::info!(
                    "train loss: {:.4}, ece: {:.2}, accuracy: {:.2}",
                    self.metrics.train.loss.result(),
                    self.metrics.train.ece.result(),
                    self.metrics.train.accuracy.result(),
                );

                let mut scalars = self.metrics.train.finalize();
                for (name, _) in evals.iter() {
                    scalars.extend(
                        self.metrics
                            .eval_mut(name)
                            .finalize(name, name == "ind"),
                    );
                }
                self.summary.write_scalars(epoch + 1, &scalars)?;
            }

            self.metrics.reset_all();

            if self.config.checkpoint_interval > 0
                && (epoch + 1) % self.config.checkpoint_interval as usize == 0
            {
                let dir = self.save_checkpoint(epoch + 1)?;
                tracing::info!("saved checkpoint to {}", dir.display());
            }
        }

        // Final model export on exit.
        let final_path = self.config.output_dir.join("model.safetensors");
        self.model.save(&final_path)?;
        tracing::info!("saved model to {}", final_path.display());
        Ok(())
    }

    /// Prediction-only path: restore the requested checkpoint, run one
    /// evaluation pass per dataset and export raw predictions, then return.
    pub fn predict(&mut self, evals: &mut [EvalDataset]) -> SngpResult<()> {
        let checkpoint_root = self
            .config
            .eval_checkpoint_dir
            .clone()
            .ok_or_else(|| {
                SngpError::invalid_config("prediction mode requires eval_checkpoint_dir")
            })?;
        let checkpoint = latest_checkpoint(&checkpoint_root).ok_or_else(|| {
            SngpError::checkpoint(format!(
                "no checkpoint found under {}",
                checkpoint_root.display()
            ))
        })?;
        tracing::info!("restoring checkpoint {}", checkpoint.display());
        self.restore(&checkpoint)?;
        fs::create_dir_all(&self.config.output_dir)?;

        for (name, provider) in evals.iter_mut() {
            tracing::info!("final eval on dataset {name}");
            provider.reset()?;

            let mut texts: Vec<Vec<u32>> = Vec::new();
            let mut logits: Vec<f32> = Vec::new();
            let mut labels: Vec<f32> = Vec::new();
            let mut identity_rows: Vec<Vec<f32>> = Vec::new();

            while let Some(result) = provider.next_batch() {
                let batch = result?;
                let out = self.model.forward(&batch, false)?;
                let calibrated = mean_field_logits(
                    &out.output.logits.detach(),
                    out.output.covariance.as_ref(),
                    self.config.gp_mean_field_factor,
                )?;
                texts.extend(batch.input_ids.to_vec2::<u32>()?);
                logits.extend(calibrated.squeeze(1)?.to_vec1::<f32>()?);
                labels.extend(batch.labels.to_vec1::<f32>()?);
                if let Some(identity) = &batch.identity_labels {
                    identity_rows.extend(identity.to_vec2::<f32>()?);
                }
            }

            write_json(&self.config.output_dir, &format!("texts_{name}"), &texts)?;
            write_json(&self.config.output_dir, &format!("logits_{name}"), &logits)?;
            write_json(&self.config.output_dir, &format!("labels_{name}"), &labels)?;
            if !identity_rows.is_empty() {
                // Stack to [num_subgroups, num_examples] in the fixed
                // IDENTITY_LABELS column order.
                let stacked: Vec<Vec<f32>> = (0..IDENTITY_LABELS.len())
                    .map(|col| identity_rows.iter().map(|row| row[col]).collect())
                    .collect();
                write_json(
                    &self.config.output_dir,
                    &format!("additional_labels_{name}"),
                    &stacked,
                )?;
            }
            tracing::info!("done with testing on {name}");
        }
        Ok(())
    }

    /// Write all state needed to resume bit-for-bit into
    /// `checkpoint-<step>/` under the run directory.
    pub fn save_checkpoint(&self, completed_epochs: usize) -> SngpResult<PathBuf> {
        let dir = self
            .config
            .output_dir
            .join(format!("checkpoint-{}", self.step));
        fs::create_dir_all(&dir)?;

        self.model.save(&dir.join("model.safetensors"))?;
        candle_core::safetensors::save(&self.model.aux_state(), &dir.join("gp.safetensors"))?;
        self.optimizer.save(&dir.join("optimizer.safetensors"))?;

        let state = TrainerState {
            step: self.step,
            completed_epochs,
            optimizer_steps: self.optimizer.steps(),
        };
        fs::write(
            dir.join("state.json"),
            serde_json::to_string_pretty(&state)?,
        )?;
        Ok(dir)
    }

    /// Restore a checkpoint directory; returns the epoch to resume at.
    /// Unparseable state is fatal; no partial recovery is attempted.
    pub fn restore(&mut self, dir: &Path) -> SngpResult<usize> {
        self.model.load_weights(&dir.join("model.safetensors"))?;
        let aux = candle_core::safetensors::load(dir.join("gp.safetensors"), &self.device)?;
        self.model.load_aux_state(&aux)?;
        self.optimizer
            .load(&dir.join("optimizer.safetensors"), &self.device)?;

        let raw = fs::read_to_string(dir.join("state.json"))?;
        let state: TrainerState = serde_json::from_str(&raw)
            .map_err(|e| SngpError::checkpoint(format!("unparseable state.json: {e}")))?;
        self.step = state.step;
        self.optimizer.set_steps(state.optimizer_steps);
        Ok(state.completed_epochs)
    }
}

/// Find the numerically-latest `checkpoint-<step>` directory, if any.
/// Absence is the fresh-start path, never an error.
pub fn latest_checkpoint(root: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(root).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            let step: usize = path
                .file_name()?
                .to_str()?
                .strip_prefix("checkpoint-")?
                .parse()
                .ok()?;
            path.is_dir().then_some((step, path))
        })
        .max_by_key(|(step, _)| *step)
        .map(|(_, path)| path)
}

fn write_json<T: Serialize>(dir: &Path, name: &str, data: &T) -> SngpResult<()> {
    let file = fs::File::create(dir.join(format!("{name}.json")))?;
    serde_json::to_writer(std::io::BufWriter::new(file), data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SyntheticDataset;

    fn test_config(dir: &Path) -> SngpConfig {
        let mut config = SngpConfig::test();
        config.output_dir = dir.to_path_buf();
        config.steps_per_epoch = Some(3);
        config
    }

    fn synthetic(config: &SngpConfig, batches: usize, identity: bool) -> SyntheticDataset {
        SyntheticDataset::new(
            config.seed,
            batches,
            config.batch_size,
            config.max_seq_length,
            config.vocab_size,
            identity,
            Device::Cpu,
        )
    }

    #[test]
    fn test_train_step_decreases_nothing_but_runs() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut trainer = SngpTrainer::new(config.clone(), &Device::Cpu).unwrap();
        let mut data = synthetic(&config, 2, false);

        let batch = data.next_batch().unwrap().unwrap();
        let loss = trainer.train_step(&batch).unwrap();
        assert!(loss.is_finite());
        assert_eq!(trainer.step(), 1);
        assert!(trainer.metrics().train.loss.result() > 0.0);
    }

    #[test]
    fn test_latest_checkpoint_picks_highest_step() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_checkpoint(dir.path()).is_none());

        fs::create_dir_all(dir.path().join("checkpoint-2")).unwrap();
        fs::create_dir_all(dir.path().join("checkpoint-10")).unwrap();
        fs::create_dir_all(dir.path().join("not-a-checkpoint")).unwrap();

        let latest = latest_checkpoint(dir.path()).unwrap();
        assert!(latest.ends_with("checkpoint-10"));
    }

    #[test]
    fn test_eval_pass_populates_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut trainer = SngpTrainer::new(config.clone(), &Device::Cpu).unwrap();
        let mut data = synthetic(&config, 2, false);

        trainer.eval_pass("ind", &mut data).unwrap();
        let results = trainer.metrics().eval_mut("ind").finalize("ind", true);
        let map: HashMap<String, f32> = results.into_iter().collect();
        assert!(map["test/nll"].is_finite());
        assert!(map["test/stddev"] > 0.0);
        assert!((0.0..=1.0).contains(&map["test/acc"]));
        // Oracle referral of everything is always perfect.
        assert!((map["test_collab_acc/collab_acc_1"] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_eval_does_not_mutate_precision() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut trainer = SngpTrainer::new(config.clone(), &Device::Cpu).unwrap();
        let mut data = synthetic(&config, 2, false);

        let batch = data.next_batch().unwrap().unwrap();
        trainer.train_step(&batch).unwrap();
        let before = trainer.model().aux_state()["gp.precision"]
            .to_vec2::<f32>()
            .unwrap();

        data.reset().unwrap();
        trainer.eval_pass("ind", &mut data).unwrap();
        let after = trainer.model().aux_state()["gp.precision"]
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_prediction_mode_requires_existing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let empty = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.prediction_mode = true;
        config.eval_checkpoint_dir = Some(empty.path().to_path_buf());

        let mut trainer = SngpTrainer::new(config.clone(), &Device::Cpu).unwrap();
        let mut evals: Vec<EvalDataset> = vec![(
            "ind".to_string(),
            Box::new(synthetic(&config, 1, false)),
        )];
        assert!(trainer.predict(&mut evals).is_err());
    }
}
