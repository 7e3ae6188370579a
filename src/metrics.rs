//! Training metric records
//!
//! Every record is logged through `tracing` and, when a metrics file is set,
//! appended to it as one JSON object per line.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::sae::VariantStats;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricRecord {
    /// Loss terms of one training step.
    Step {
        step: usize,
        loss: f32,
        mse: f32,
        l1: f32,
        l0: Option<f32>,
        l1_scale: f64,
        variants: Vec<VariantStats>,
    },
    /// Activation frequency health plus buffer timing.
    Frequency {
        step: usize,
        /// Fraction of features that never fired since the last reset
        dead: f64,
        below_1e_6: f64,
        below_1e_5: f64,
        refresh_count: usize,
        refresh_secs: f64,
        wall_secs: f64,
    },
    /// Dead features flagged for resampling.
    Flag {
        step: usize,
        flagged: usize,
        saved_version: Option<u32>,
        elapsed_secs: f64,
    },
    /// A resampling pass.
    Resample {
        step: usize,
        waiting: usize,
        reset: usize,
    },
}

impl MetricRecord {
    fn log(&self) {
        match self {
            MetricRecord::Step {
                step,
                loss,
                mse,
                l1,
                l0,
                l1_scale,
                ..
            } => match l0 {
                Some(l0) => info!(
                    "step {step}: loss={loss:.6} mse={mse:.6} l1={l1:.4} l0={l0:.2} l1_scale={l1_scale:.4}"
                ),
                None => info!("step {step}: loss={loss:.6} mse={mse:.6} l1={l1:.4}"),
            },
            MetricRecord::Frequency {
                step,
                dead,
                below_1e_6,
                below_1e_5,
                refresh_count,
                refresh_secs,
                wall_secs,
            } => info!(
                "step {step}: dead={:.2}% <1e-6={:.2}% <1e-5={:.2}% | {refresh_count} refreshes, {refresh_secs:.1}s refreshing, {wall_secs:.1}s total",
                dead * 100.0,
                below_1e_6 * 100.0,
                below_1e_5 * 100.0
            ),
            MetricRecord::Flag {
                step,
                flagged,
                saved_version,
                elapsed_secs,
            } => info!(
                "step {step}: flagged {flagged} feature(s) for resampling in {elapsed_secs:.2}s (checkpoint {saved_version:?})"
            ),
            MetricRecord::Resample {
                step,
                waiting,
                reset,
            } => info!("step {step}: reset {reset} of {waiting} waiting feature(s)"),
        }
    }
}

/// Sink for [`MetricRecord`]s.
pub struct MetricsWriter {
    file: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    written: usize,
}

impl MetricsWriter {
    /// Append to `path`, creating it if needed.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open metrics file {}", path.display()))?;
        Ok(Self {
            file: Some(BufWriter::new(file)),
            path: Some(path.to_path_buf()),
            written: 0,
        })
    }

    /// Log only; nothing is written to disk.
    pub fn log_only() -> Self {
        Self {
            file: None,
            path: None,
            written: 0,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Records handled so far.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn record(&mut self, record: &MetricRecord) -> Result<()> {
        record.log();
        if let Some(file) = self.file.as_mut() {
            serde_json::to_writer(&mut *file, record)?;
            file.write_all(b"\n")?;
            file.flush()?;
        }
        self.written += 1;
        Ok(())
    }
}

/// Read back a JSONL metrics file.
pub fn read_records(path: &Path) -> Result<Vec<MetricRecord>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open metrics file {}", path.display()))?;
    BufReader::new(file)
        .lines()
        .filter(|line| line.as_ref().map_or(true, |l| !l.trim().is_empty()))
        .enumerate()
        .map(|(i, line)| {
            let line = line?;
            serde_json::from_str(&line)
                .with_context(|| format!("Bad metrics record on line {}", i + 1))
        })
        .collect()
}
