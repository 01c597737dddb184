//! Append-only CSV logs: sensor snapshots and watering cycles.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::acquisition::SensorSnapshot;

/// A CSV file that gets its header on first write.
struct CsvFile {
    path: PathBuf,
}

impl CsvFile {
    async fn append(&self, header: &str, row: &str) -> Result<()> {
        let fresh = !tokio::fs::try_exists(&self.path).await.unwrap_or(false);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open records: {}", self.path.display()))?;

        let mut out = String::new();
        if fresh {
            out.push_str(header);
            out.push('\n');
        }
        out.push_str(row);
        out.push('\n');
        file.write_all(out.as_bytes())
            .await
            .with_context(|| format!("failed to append records: {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sensor records
// ---------------------------------------------------------------------------

pub struct RecordSink {
    file: CsvFile,
    soil_columns: usize,
}

impl RecordSink {
    pub fn new(path: impl Into<PathBuf>, soil_columns: usize) -> Self {
        Self {
            file: CsvFile { path: path.into() },
            soil_columns,
        }
    }

    fn header(&self) -> String {
        let mut cols = vec!["timestamp".to_string()];
        cols.extend((1..=self.soil_columns).map(|n| format!("soil_{n}")));
        cols.push("tds".into());
        cols.push("ph".into());
        cols.join(",")
    }

    fn row(&self, at: &str, snapshot: &SensorSnapshot) -> String {
        let mut cols = vec![at.to_string()];
        cols.extend((0..self.soil_columns).map(|i| {
            snapshot
                .soil
                .get(i)
                .map(|r| r.percent.to_string())
                .unwrap_or_default()
        }));
        cols.push(snapshot.tds.to_string());
        cols.push(snapshot.ph.to_string());
        cols.join(",")
    }

    /// Append one row stamped `at`, writing the header first if the file is
    /// new.
    pub async fn append(&self, at: &str, snapshot: &SensorSnapshot) -> Result<()> {
        self.file.append(&self.header(), &self.row(at, snapshot)).await
    }
}

// ---------------------------------------------------------------------------
// Pump records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEvent {
    /// Flow is the count since the previous cycle ended.
    Start,
    /// Flow is the count during the cycle.
    End,
}

impl CycleEvent {
    fn label(self) -> &'static str {
        match self {
            CycleEvent::Start => "start",
            CycleEvent::End => "end",
        }
    }
}

const PUMP_HEADER: &str = "timestamp,valve,event,flow";

/// One row per watering cycle boundary.
pub struct PumpLog {
    file: CsvFile,
}

impl PumpLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: CsvFile { path: path.into() },
        }
    }

    pub async fn append(&self, at: &str, valve: usize, event: CycleEvent, flow: u64) -> Result<()> {
        let row = format!("{at},{valve},{},{flow}", event.label());
        self.file.append(PUMP_HEADER, &row).await
    }
}
