use crate::detector::FrameAnalysis;
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const CSV_HEADER: &str = "Motion,SSIM,Brightness";

/// Per-frame numbers written to the metrics log.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MetricsRecord {
    pub motion_ratio: f64,
    pub ssim_score: f64,
    pub mean_brightness: f64,
}

impl From<&FrameAnalysis> for MetricsRecord {
    fn from(analysis: &FrameAnalysis) -> Self {
        Self {
            motion_ratio: analysis.motion_ratio,
            ssim_score: analysis.ssim_score,
            mean_brightness: analysis.mean_brightness,
        }
    }
}

impl MetricsRecord {
    /// Motion and SSIM to 4 decimal places, brightness to 2.
    pub fn to_csv_row(&self) -> String {
        format!("{:.4},{:.4},{:.2}", self.motion_ratio, self.ssim_score, self.mean_brightness)
    }
}

pub trait MetricsSink {
    fn record(&mut self, record: &MetricsRecord) -> Result<()>;
}

impl MetricsSink for Vec<MetricsRecord> {
    fn record(&mut self, record: &MetricsRecord) -> Result<()> {
        self.push(*record);
        Ok(())
    }
}

/// Append-only CSV file. The header is written only when the file is new or
/// empty, so repeated sessions keep extending the same log.
pub struct CsvMetricsLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl CsvMetricsLog {
    pub fn open(path: &Path) -> Result<Self> {
        let is_new = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open metrics log {:?}", path))?;
        let mut writer = BufWriter::new(file);

        if is_new {
            writeln!(writer, "{}", CSV_HEADER).context("Failed to write metrics header")?;
            writer.flush()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for CsvMetricsLog {
    fn record(&mut self, record: &MetricsRecord) -> Result<()> {
        writeln!(self.writer, "{}", record.to_csv_row())
            .with_context(|| format!("Failed to append to metrics log {:?}", self.path))?;
        self.writer.flush()?;
        Ok(())
    }
}
