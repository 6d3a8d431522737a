//! Scalar summary sink: one JSONL line per metric per epoch.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::SngpResult;

/// Appends scalar metric series to `summaries.jsonl` in the run directory.
pub struct SummaryWriter {
    path: PathBuf,
}

impl SummaryWriter {
    pub fn new(run_dir: &Path) -> SngpResult<Self> {
        std::fs::create_dir_all(run_dir)?;
        Ok(Self {
            path: run_dir.join("summaries.jsonl"),
        })
    }

    /// Append one scalar per metric for the given epoch.
    pub fn write_scalars(&self, epoch: usize, scalars: &[(String, f32)]) -> SngpResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let timestamp = Utc::now().to_rfc3339();
        for (name, value) in scalars {
            let line = serde_json::json!({
                "epoch": epoch,
                "name": name,
                "value": value,
                "timestamp": timestamp,
            });
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    #[test]
    fn test_writes_one_line_per_scalar() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SummaryWriter::new(dir.path()).unwrap();
        writer
            .write_scalars(
                1,
                &[
                    ("test/auroc".to_string(), 0.9),
                    ("test/ece".to_string(), 0.05),
                ],
            )
            .unwrap();
        writer
            .write_scalars(2, &[("test/auroc".to_string(), 0.92)])
            .unwrap();

        let file = std::fs::File::open(writer.path()).unwrap();
        let lines: Vec<String> = std::io::BufReader::new(file)
            .lines()
            .map(|l| l.unwrap())
            .collect();
        assert_eq!(lines.len(), 3);

        let parsed: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(parsed["epoch"], 1);
        assert_eq!(parsed["name"], "test/auroc");
    }
}
