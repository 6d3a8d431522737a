//! Replica-parallel execution model: batch sharding and reduction.
//!
//! The training computation is written as pure functions over a single
//! shard; this module owns the split/reduce seam. A logical batch is cut
//! into `num_replicas` disjoint shards, the per-shard gradient maps and
//! precision contributions are summed, and exactly one update is applied
//! per step regardless of replica count. Shards are executed sequentially
//! here; the reduction contract is what the rest of the crate depends on.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::data::TextBatch;
use crate::error::{SngpError, SngpResult};

/// Split a batch into `num_replicas` equal shards along the batch
/// dimension. The caller guarantees divisibility (validated config).
pub fn shard_batch(batch: &TextBatch, num_replicas: usize) -> SngpResult<Vec<TextBatch>> {
    let total = batch.batch_size();
    if num_replicas == 0 || total % num_replicas != 0 {
        return Err(SngpError::training(format!(
            "batch of {total} cannot be split into {num_replicas} shards"
        )));
    }
    let per = total / num_replicas;
    (0..num_replicas)
        .map(|r| batch.narrow(r * per, per))
        .collect()
}

/// Sum per-shard gradient maps into one reduced map.
pub fn reduce_gradients(
    shard_gradients: Vec<HashMap<String, Tensor>>,
) -> SngpResult<HashMap<String, Tensor>> {
    let mut reduced: HashMap<String, Tensor> = HashMap::new();
    for shard in shard_gradients {
        for (name, grad) in shard {
            match reduced.get(&name) {
                Some(acc) => {
                    let sum = (acc + &grad)?;
                    reduced.insert(name, sum);
                }
                None => {
                    reduced.insert(name, grad);
                }
            }
        }
    }
    Ok(reduced)
}

/// Sum per-shard precision-matrix contributions.
pub fn reduce_precision(contributions: Vec<Tensor>) -> SngpResult<Option<Tensor>> {
    let mut iter = contributions.into_iter();
    let Some(first) = iter.next() else {
        return Ok(None);
    };
    let mut sum = first;
    for c in iter {
        sum = (&sum + &c)?;
    }
    Ok(Some(sum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::batch_from_parts;
    use candle_core::Device;

    #[test]
    fn test_shard_batch_partitions() {
        let device = Device::Cpu;
        let batch = batch_from_parts(
            (0..8u32).collect(),
            vec![0.1, 0.2, 0.3, 0.4],
            4,
            2,
            &device,
        )
        .unwrap();
        let shards = shard_batch(&batch, 2).unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].batch_size(), 2);
        assert_eq!(shards[1].labels.to_vec1::<f32>().unwrap(), vec![0.3, 0.4]);
    }

    #[test]
    fn test_shard_batch_rejects_indivisible() {
        let device = Device::Cpu;
        let batch =
            batch_from_parts((0..6u32).collect(), vec![0.0, 0.0, 0.0], 3, 2, &device).unwrap();
        assert!(shard_batch(&batch, 2).is_err());
    }

    #[test]
    fn test_reduce_gradients_sums() {
        let device = Device::Cpu;
        let mut a = HashMap::new();
        a.insert(
            "w".to_string(),
            Tensor::from_vec(vec![1.0f32, 2.0], (2,), &device).unwrap(),
        );
        let mut b = HashMap::new();
        b.insert(
            "w".to_string(),
            Tensor::from_vec(vec![10.0f32, 20.0], (2,), &device).unwrap(),
        );

        let reduced = reduce_gradients(vec![a, b]).unwrap();
        assert_eq!(
            reduced["w"].to_vec1::<f32>().unwrap(),
            vec![11.0, 22.0]
        );
    }

    #[test]
    fn test_reduce_precision_sums() {
        let device = Device::Cpu;
        let a = Tensor::from_vec(vec![1.0f32, 0.0, 0.0, 1.0], (2, 2), &device).unwrap();
        let b = Tensor::from_vec(vec![0.5f32, 0.0, 0.0, 0.5], (2, 2), &device).unwrap();
        let sum = reduce_precision(vec![a, b]).unwrap().unwrap();
        let rows = sum.to_vec2::<f32>().unwrap();
        assert_eq!(rows[0][0], 1.5);
        assert_eq!(rows[1][1], 1.5);

        assert!(reduce_precision(vec![]).unwrap().is_none());
    }
}
