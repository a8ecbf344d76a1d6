use super::context::Suspicion;
use super::dispatch::{PointOutcome, PointStatus};
use crate::core::types::value::Value;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Label used for the record written in place of the outputs of an invalid point.
pub const INVALID_POINT_LABEL: &str = "invalid_point";
/// Label of the records carrying suspicious-point flags.
pub const SUSPICIOUS_POINT_LABEL: &str = "suspicious_point";

/// One printed value, keyed by the point and the worker rank that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrintRecord {
    pub point_id: u64,
    pub rank: usize,
    pub capability_id: usize,
    pub label: String,
    pub value: Value,
}

impl PrintRecord {
    pub(crate) fn invalid(outcome: &PointOutcome) -> Self {
        let reason = match &outcome.status {
            PointStatus::Valid => String::new(),
            PointStatus::Invalid { functor, reason } => format!("{functor}: {reason}"),
            PointStatus::Failed { functor, error } => format!("{functor}: {error}"),
        };
        Self {
            point_id: outcome.point_id,
            rank: outcome.rank,
            capability_id: usize::MAX,
            label: INVALID_POINT_LABEL.to_string(),
            value: Value::Text(reason),
        }
    }

    pub(crate) fn suspicious(outcome: &PointOutcome, suspicion: &Suspicion) -> Self {
        Self {
            point_id: outcome.point_id,
            rank: outcome.rank,
            capability_id: usize::MAX,
            label: SUSPICIOUS_POINT_LABEL.to_string(),
            value: Value::Text(format!(
                "{} [{}]: {}",
                suspicion.functor, suspicion.code, suspicion.message
            )),
        }
    }

    pub fn is_invalid_marker(&self) -> bool {
        self.label == INVALID_POINT_LABEL
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error on result file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Record rejected: {0}")]
    Rejected(String),
}

/// Destination of printed results. Shared by every scan worker.
pub trait ResultSink: Send + Sync {
    fn print(&self, record: PrintRecord) -> Result<(), SinkError>;

    fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<PrintRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PrintRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Records of one point, in the order they were printed.
    pub fn for_point(&self, point_id: u64) -> Vec<PrintRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.point_id == point_id)
            .cloned()
            .collect()
    }
}

impl ResultSink for MemorySink {
    fn print(&self, record: PrintRecord) -> Result<(), SinkError> {
        self.records.lock().push(record);
        Ok(())
    }
}

/// Writes one JSON object per record to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        let file = File::create(path).map_err(|source| SinkError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> SinkError {
        SinkError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl ResultSink for JsonLinesSink {
    fn print(&self, record: PrintRecord) -> Result<(), SinkError> {
        let line = serde_json::to_string(&record)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{line}").map_err(|e| self.io_error(e))
    }

    fn flush(&self) -> Result<(), SinkError> {
        self.writer.lock().flush().map_err(|e| self.io_error(e))
    }
}
