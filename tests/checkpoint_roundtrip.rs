//! Resume-equivalence: training N steps, checkpointing, restoring and
//! training M more steps must reproduce the uninterrupted N+M trajectory,
//! including the precision matrix.

use candle_core::Device;

use sngp_model_rs::data::{BatchProvider, SyntheticDataset, TextBatch};
use sngp_model_rs::{SngpConfig, SngpTrainer};

fn test_config(dir: &std::path::Path) -> SngpConfig {
    let mut config = SngpConfig::test();
    config.output_dir = dir.to_path_buf();
    config
}

fn collect_batches(config: &SngpConfig, n: usize) -> Vec<TextBatch> {
    let mut data = SyntheticDataset::new(
        config.seed,
        n,
        config.batch_size,
        config.max_seq_length,
        config.vocab_size,
        false,
        Device::Cpu,
    );
    let mut batches = Vec::new();
    while let Some(batch) = data.next_batch() {
        batches.push(batch.unwrap());
    }
    batches
}

fn weights_of(trainer: &SngpTrainer) -> Vec<(String, Vec<f32>)> {
    let data = trainer.model().var_map().data().lock().unwrap();
    let mut out: Vec<(String, Vec<f32>)> = data
        .iter()
        .map(|(name, var)| {
            let flat = var
                .as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap();
            (name.clone(), flat)
        })
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

fn assert_close(a: &[(String, Vec<f32>)], b: &[(String, Vec<f32>)], tolerance: f32) {
    assert_eq!(a.len(), b.len());
    for ((name_a, values_a), (name_b, values_b)) in a.iter().zip(b) {
        assert_eq!(name_a, name_b);
        assert_eq!(values_a.len(), values_b.len(), "{name_a}");
        for (x, y) in values_a.iter().zip(values_b) {
            assert!(
                (x - y).abs() <= tolerance,
                "parameter {name_a} diverged: {x} vs {y}"
            );
        }
    }
}

#[test]
fn test_restore_reproduces_uninterrupted_training() {
    let device = Device::Cpu;
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let config_a = test_config(dir_a.path());
    let config_b = test_config(dir_b.path());

    let batches = collect_batches(&config_a, 5);

    // Uninterrupted: 5 steps straight through.
    let mut uninterrupted = SngpTrainer::new(config_a, &device).unwrap();
    for batch in &batches {
        uninterrupted.train_step(batch).unwrap();
    }

    // Interrupted: 3 steps, checkpoint, restore into a fresh trainer,
    // then the remaining 2 steps.
    let mut first = SngpTrainer::new(config_b.clone(), &device).unwrap();
    for batch in &batches[..3] {
        first.train_step(batch).unwrap();
    }
    first.save_checkpoint(0).unwrap();

    let mut resumed = SngpTrainer::new(config_b.clone(), &device).unwrap();
    let checkpoint = sngp_model_rs::trainer::latest_checkpoint(dir_b.path()).unwrap();
    resumed.restore(&checkpoint).unwrap();
    assert_eq!(resumed.step(), 3);
    for batch in &batches[3..] {
        resumed.train_step(batch).unwrap();
    }

    // Same parameters...
    assert_close(&weights_of(&uninterrupted), &weights_of(&resumed), 1e-6);

    // ...and the same precision-matrix trajectory.
    let precision_a = uninterrupted.model().aux_state()["gp.precision"]
        .to_vec2::<f32>()
        .unwrap();
    let precision_b = resumed.model().aux_state()["gp.precision"]
        .to_vec2::<f32>()
        .unwrap();
    for (row_a, row_b) in precision_a.iter().zip(&precision_b) {
        for (x, y) in row_a.iter().zip(row_b) {
            assert!((x - y).abs() <= 1e-7, "precision diverged: {x} vs {y}");
        }
    }

    // Power-iteration vectors round-trip too.
    let u_a = uninterrupted.model().aux_state()["encoder.pooler.dense.u"]
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    let u_b = resumed.model().aux_state()["encoder.pooler.dense.u"]
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    for (x, y) in u_a.iter().zip(&u_b) {
        assert!((x - y).abs() <= 1e-6);
    }
}

#[test]
fn test_missing_checkpoint_is_fresh_start() {
    let dir = tempfile::tempdir().unwrap();
    assert!(sngp_model_rs::trainer::latest_checkpoint(dir.path()).is_none());
}

#[test]
fn test_corrupt_state_is_fatal() {
    let device = Device::Cpu;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let mut trainer = SngpTrainer::new(config.clone(), &device).unwrap();
    let batches = collect_batches(&config, 1);
    trainer.train_step(&batches[0]).unwrap();
    let checkpoint = trainer.save_checkpoint(0).unwrap();

    // Corrupt the scalar state; restore must fail loudly, not recover.
    std::fs::write(checkpoint.join("state.json"), "{not json").unwrap();
    let mut fresh = SngpTrainer::new(config, &device).unwrap();
    assert!(fresh.restore(&checkpoint).is_err());
}
