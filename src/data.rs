//! Batch types and dataset providers for toxicity classification.
//!
//! Tokenization is upstream of this crate: datasets supply pre-tokenized
//! `input_ids` (plus mask and segment ids) together with a continuous
//! toxicity label in `[0, 1]` and, for the identity-annotated dataset, one
//! column per identity subgroup. Providers stream fixed-shape batches and
//! signal exhaustion by returning `None`; exhaustion is never an error.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;

use crate::error::{SngpError, SngpResult};

/// Identity subgroup label columns, in the fixed order used for dataset
/// parsing and prediction export.
pub const IDENTITY_LABELS: [&str; 24] = [
    "male",
    "female",
    "transgender",
    "other_gender",
    "heterosexual",
    "homosexual_gay_or_lesbian",
    "bisexual",
    "other_sexual_orientation",
    "christian",
    "jewish",
    "muslim",
    "hindu",
    "buddhist",
    "atheist",
    "other_religion",
    "black",
    "white",
    "asian",
    "latino",
    "other_race_or_ethnicity",
    "physical_disability",
    "intellectual_or_learning_disability",
    "psychiatric_or_mental_illness",
    "other_disability",
];

/// A fixed-shape batch of tokenized comments.
#[derive(Debug, Clone)]
pub struct TextBatch {
    /// Token ids: `[batch, seq]`, u32
    pub input_ids: Tensor,
    /// Attention mask: `[batch, seq]`, f32, 1.0 for real tokens
    pub input_mask: Tensor,
    /// Segment (token type) ids: `[batch, seq]`, u32
    pub segment_ids: Tensor,
    /// Toxicity scores: `[batch]`, f32 in `[0, 1]`
    pub labels: Tensor,
    /// Identity subgroup labels: `[batch, 24]`, f32, column order
    /// [`IDENTITY_LABELS`]; present only for identity-annotated datasets
    pub identity_labels: Option<Tensor>,
}

impl TextBatch {
    /// Number of examples in the batch.
    pub fn batch_size(&self) -> usize {
        self.input_ids.dims()[0]
    }

    /// Slice out `[start, start + len)` examples along the batch dimension.
    pub fn narrow(&self, start: usize, len: usize) -> SngpResult<Self> {
        Ok(Self {
            input_ids: self.input_ids.narrow(0, start, len)?,
            input_mask: self.input_mask.narrow(0, start, len)?,
            segment_ids: self.segment_ids.narrow(0, start, len)?,
            labels: self.labels.narrow(0, start, len)?,
            identity_labels: match &self.identity_labels {
                Some(t) => Some(t.narrow(0, start, len)?),
                None => None,
            },
        })
    }
}

/// A lazy, restartable sequence of batches.
///
/// `next_batch` returning `None` is the end-of-data condition; the caller
/// treats it as "stop this pass". `reset` rewinds to the beginning for the
/// next epoch or evaluation pass.
pub trait BatchProvider {
    /// Produce the next batch, or `None` when the pass is exhausted.
    fn next_batch(&mut self) -> Option<SngpResult<TextBatch>>;

    /// Rewind to the start of the dataset.
    fn reset(&mut self) -> SngpResult<()>;

    /// Approximate number of batches per pass, when known.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// One pre-tokenized example as stored in JSONL.
#[derive(Debug, Deserialize)]
struct JsonlExample {
    input_ids: Vec<u32>,
    #[serde(default)]
    input_mask: Option<Vec<f32>>,
    #[serde(default)]
    segment_ids: Option<Vec<u32>>,
    label: f32,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// Streaming JSONL dataset of pre-tokenized toxicity examples.
///
/// Reads files line by line; sequences are truncated or zero-padded to the
/// configured length so every batch has a fixed shape. A trailing partial
/// batch is dropped.
pub struct JsonlToxicityDataset {
    files: Vec<PathBuf>,
    current_file_idx: usize,
    reader: Option<BufReader<File>>,
    max_seq_length: usize,
    batch_size: usize,
    with_identity_labels: bool,
    device: Device,
}

impl JsonlToxicityDataset {
    /// Open a JSONL file or a directory of JSONL files.
    pub fn new(
        path: impl AsRef<Path>,
        max_seq_length: usize,
        batch_size: usize,
        with_identity_labels: bool,
        device: Device,
    ) -> SngpResult<Self> {
        let path = path.as_ref();
        let files = if path.is_file() {
            vec![path.to_path_buf()]
        } else if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
                .collect();
            files.sort();
            if files.is_empty() {
                return Err(SngpError::data(format!(
                    "no .jsonl files under {}",
                    path.display()
                )));
            }
            files
        } else {
            return Err(SngpError::data(format!(
                "path does not exist: {}",
                path.display()
            )));
        };

        Ok(Self {
            files,
            current_file_idx: 0,
            reader: None,
            max_seq_length,
            batch_size,
            with_identity_labels,
            device,
        })
    }

    fn next_line(&mut self) -> Option<SngpResult<String>> {
        loop {
            if self.reader.is_none() {
                if self.current_file_idx >= self.files.len() {
                    return None;
                }
                let file = match File::open(&self.files[self.current_file_idx]) {
                    Ok(f) => f,
                    Err(e) => return Some(Err(e.into())),
                };
                self.reader = Some(BufReader::new(file));
            }
            let mut line = String::new();
            match self.reader.as_mut().unwrap().read_line(&mut line) {
                Ok(0) => {
                    self.reader = None;
                    self.current_file_idx += 1;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        return Some(Ok(trimmed.to_string()));
                    }
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    fn next_example(&mut self) -> Option<SngpResult<JsonlExample>> {
        let line = match self.next_line()? {
            Ok(l) => l,
            Err(e) => return Some(Err(e)),
        };
        Some(serde_json::from_str::<JsonlExample>(&line).map_err(SngpError::from))
    }
}

/// Pad or truncate a sequence to `len`.
fn fit<T: Copy + Default>(seq: &[T], len: usize) -> Vec<T> {
    let mut out = vec![T::default(); len];
    let n = seq.len().min(len);
    out[..n].copy_from_slice(&seq[..n]);
    out
}

impl BatchProvider for JsonlToxicityDataset {
    fn next_batch(&mut self) -> Option<SngpResult<TextBatch>> {
        let seq = self.max_seq_length;
        let mut ids = Vec::with_capacity(self.batch_size * seq);
        let mut mask = Vec::with_capacity(self.batch_size * seq);
        let mut segments = Vec::with_capacity(self.batch_size * seq);
        let mut labels = Vec::with_capacity(self.batch_size);
        let mut identities = Vec::with_capacity(self.batch_size * IDENTITY_LABELS.len());

        for _ in 0..self.batch_size {
            let ex = match self.next_example() {
                Some(Ok(ex)) => ex,
                Some(Err(e)) => return Some(Err(e)),
                // Partial batch at end of data: drop it, end the pass.
                None => return None,
            };
            ids.extend(fit(&ex.input_ids, seq));
            match &ex.input_mask {
                Some(m) => mask.extend(fit(m, seq)),
                None => {
                    let real = ex.input_ids.len().min(seq);
                    mask.extend((0..seq).map(|i| if i < real { 1.0f32 } else { 0.0 }));
                }
            }
            match &ex.segment_ids {
                Some(s) => segments.extend(fit(s, seq)),
                None => segments.extend(std::iter::repeat(0u32).take(seq)),
            }
            labels.push(ex.label);
            if self.with_identity_labels {
                for name in IDENTITY_LABELS {
                    let v = ex
                        .extra
                        .get(name)
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.0);
                    identities.push(v as f32);
                }
            }
        }

        let build = || -> SngpResult<TextBatch> {
            let b = self.batch_size;
            Ok(TextBatch {
                input_ids: Tensor::from_vec(ids, (b, seq), &self.device)?,
                input_mask: Tensor::from_vec(mask, (b, seq), &self.device)?,
                segment_ids: Tensor::from_vec(segments, (b, seq), &self.device)?,
                labels: Tensor::from_vec(labels, (b,), &self.device)?,
                identity_labels: if self.with_identity_labels {
                    Some(Tensor::from_vec(
                        identities,
                        (b, IDENTITY_LABELS.len()),
                        &self.device,
                    )?)
                } else {
                    None
                },
            })
        };
        Some(build())
    }

    fn reset(&mut self) -> SngpResult<()> {
        self.current_file_idx = 0;
        self.reader = None;
        Ok(())
    }
}

/// Deterministic random-token dataset for tests and smoke runs.
pub struct SyntheticDataset {
    seed: u64,
    rng: ChaCha8Rng,
    num_batches: usize,
    emitted: usize,
    batch_size: usize,
    max_seq_length: usize,
    vocab_size: usize,
    with_identity_labels: bool,
    device: Device,
}

impl SyntheticDataset {
    pub fn new(
        seed: u64,
        num_batches: usize,
        batch_size: usize,
        max_seq_length: usize,
        vocab_size: usize,
        with_identity_labels: bool,
        device: Device,
    ) -> Self {
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            num_batches,
            emitted: 0,
            batch_size,
            max_seq_length,
            vocab_size,
            with_identity_labels,
            device,
        }
    }
}

impl BatchProvider for SyntheticDataset {
    fn next_batch(&mut self) -> Option<SngpResult<TextBatch>> {
        if self.emitted >= self.num_batches {
            return None;
        }
        self.emitted += 1;

        let (b, seq) = (self.batch_size, self.max_seq_length);
        let ids: Vec<u32> = (0..b * seq)
            .map(|_| self.rng.random_range(0..self.vocab_size as u32))
            .collect();
        let mask = vec![1.0f32; b * seq];
        let segments = vec![0u32; b * seq];
        let labels: Vec<f32> = (0..b).map(|_| self.rng.random::<f32>()).collect();
        let identities: Vec<f32> = (0..b * IDENTITY_LABELS.len())
            .map(|_| if self.rng.random::<f32>() < 0.1 { 1.0 } else { 0.0 })
            .collect();

        let build = || -> SngpResult<TextBatch> {
            Ok(TextBatch {
                input_ids: Tensor::from_vec(ids, (b, seq), &self.device)?,
                input_mask: Tensor::from_vec(mask, (b, seq), &self.device)?,
                segment_ids: Tensor::from_vec(segments, (b, seq), &self.device)?,
                labels: Tensor::from_vec(labels, (b,), &self.device)?,
                identity_labels: if self.with_identity_labels {
                    Some(Tensor::from_vec(
                        identities,
                        (b, IDENTITY_LABELS.len()),
                        &self.device,
                    )?)
                } else {
                    None
                },
            })
        };
        Some(build())
    }

    fn reset(&mut self) -> SngpResult<()> {
        self.rng = ChaCha8Rng::seed_from_u64(self.seed);
        self.emitted = 0;
        Ok(())
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.num_batches)
    }
}

/// Build a fully-masked, single-segment batch from raw ids and labels.
pub fn batch_from_parts(
    ids: Vec<u32>,
    labels: Vec<f32>,
    batch_size: usize,
    seq: usize,
    device: &Device,
) -> SngpResult<TextBatch> {
    let mask = Tensor::ones((batch_size, seq), DType::F32, device)?;
    let segments = Tensor::zeros((batch_size, seq), DType::U32, device)?;
    Ok(TextBatch {
        input_ids: Tensor::from_vec(ids, (batch_size, seq), device)?,
        input_mask: mask,
        segment_ids: segments,
        labels: Tensor::from_vec(labels, (batch_size,), device)?,
        identity_labels: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_synthetic_dataset_deterministic_reset() {
        let device = Device::Cpu;
        let mut ds = SyntheticDataset::new(7, 3, 2, 4, 100, false, device);
        let first = ds.next_batch().unwrap().unwrap();
        let a = first.input_ids.to_vec2::<u32>().unwrap();

        ds.reset().unwrap();
        let again = ds.next_batch().unwrap().unwrap();
        let b = again.input_ids.to_vec2::<u32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_synthetic_dataset_exhausts() {
        let device = Device::Cpu;
        let mut ds = SyntheticDataset::new(7, 2, 2, 4, 100, false, device);
        assert!(ds.next_batch().is_some());
        assert!(ds.next_batch().is_some());
        assert!(ds.next_batch().is_none());
    }

    #[test]
    fn test_jsonl_dataset_batches_and_identity_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        let mut f = File::create(&path).unwrap();
        for i in 0..5 {
            writeln!(
                f,
                r#"{{"input_ids":[1,2,{i}],"label":0.9,"male":1.0,"female":0.0}}"#
            )
            .unwrap();
        }
        drop(f);

        let mut ds =
            JsonlToxicityDataset::new(&path, 4, 2, true, Device::Cpu).unwrap();
        let batch = ds.next_batch().unwrap().unwrap();
        assert_eq!(batch.batch_size(), 2);
        assert_eq!(batch.input_ids.dims(), &[2, 4]);

        // Padded position is masked out.
        let mask = batch.input_mask.to_vec2::<f32>().unwrap();
        assert_eq!(mask[0], vec![1.0, 1.0, 1.0, 0.0]);

        let ident = batch.identity_labels.as_ref().unwrap();
        assert_eq!(ident.dims(), &[2, IDENTITY_LABELS.len()]);
        let rows = ident.to_vec2::<f32>().unwrap();
        assert_eq!(rows[0][0], 1.0); // male
        assert_eq!(rows[0][1], 0.0); // female

        // 5 examples, batch 2: two full batches, remainder dropped.
        assert!(ds.next_batch().is_some());
        assert!(ds.next_batch().is_none());

        // Restartable.
        ds.reset().unwrap();
        assert!(ds.next_batch().is_some());
    }

    #[test]
    fn test_batch_narrow() {
        let device = Device::Cpu;
        let batch = batch_from_parts(vec![1, 2, 3, 4], vec![0.1, 0.9], 2, 2, &device).unwrap();
        let shard = batch.narrow(1, 1).unwrap();
        assert_eq!(shard.batch_size(), 1);
        assert_eq!(shard.labels.to_vec1::<f32>().unwrap(), vec![0.9]);
    }
}
