//! # Sample Sink
//!
//! Buffers accepted heart rate samples and persists them to one JSON file per
//! recording session.
//!
//! ## File Layout
//! ```text
//! sub-<subject>_date-<YYYYMMDD>_time-<HHMMSS>.json
//! {
//!   "subject": "A1B",
//!   "date": "2024-03-01",
//!   "time": "14:05:09",
//!   "sampling_interval_sec": 10,
//!   "device_name": "Polar Sense B5E4",
//!   "device_address": "A0:9E:1A:B5:E4:01",
//!   "data": [ { "timestamp": 1709298309.51, "datetime": "2024-03-01T14:05:09.510000", "hr": 71 } ]
//! }
//! ```
//!
//! ## Flush Discipline
//! Every flush re-reads the file, extends `data` with the buffered samples and
//! rewrites the whole file. The buffer is cleared only after the write
//! succeeds, so a sample is never written twice and a failed write is retried
//! on the next flush. An unparsable existing file is logged and replaced.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PersistError;
use crate::sampling::Sample;

/// One logical recording run
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub subject_id: String,
    pub sampling_interval: Duration,
    pub device_name: Option<String>,
    pub device_address: Option<String>,
    pub start_time: DateTime<Local>,
    /// Accepted samples, append-only
    pub records: Vec<Sample>,
}

impl Session {
    pub fn new(
        subject_id: impl Into<String>,
        sampling_interval: Duration,
        device_name: Option<String>,
        device_address: Option<String>,
        start_time: DateTime<Local>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            sampling_interval,
            device_name,
            device_address,
            start_time,
            records: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    pub datetime: String,
    pub hr: u16,
}

impl From<&Sample> for RecordEntry {
    fn from(sample: &Sample) -> Self {
        Self {
            timestamp: sample.timestamp.timestamp_micros() as f64 / 1_000_000.0,
            datetime: sample
                .timestamp
                .naive_local()
                .format("%Y-%m-%dT%H:%M:%S%.6f")
                .to_string(),
            hr: sample.heart_rate,
        }
    }
}

/// Persisted session structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub subject: String,
    pub date: String,
    pub time: String,
    pub sampling_interval_sec: u64,
    pub device_name: Option<String>,
    pub device_address: Option<String>,
    #[serde(default)]
    pub data: Vec<RecordEntry>,
}

impl SessionRecord {
    /// Metadata-only record for a session
    pub fn header(session: &Session) -> Self {
        Self {
            subject: session.subject_id.clone(),
            date: session.start_time.format("%Y-%m-%d").to_string(),
            time: session.start_time.format("%H:%M:%S").to_string(),
            sampling_interval_sec: session.sampling_interval.as_secs(),
            device_name: session.device_name.clone(),
            device_address: session.device_address.clone(),
            data: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, PersistError> {
        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| PersistError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// Keep alphanumerics, `-` and `_`; an empty result becomes "unknown"
pub fn sanitize_subject_id(subject_id: &str) -> String {
    let safe: String = subject_id
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if safe.is_empty() {
        "unknown".to_string()
    } else {
        safe
    }
}

pub fn session_filename(subject_id: &str, start_time: &DateTime<Local>) -> String {
    format!(
        "sub-{}_date-{}_time-{}.json",
        sanitize_subject_id(subject_id),
        start_time.format("%Y%m%d"),
        start_time.format("%H%M%S")
    )
}

pub struct SampleSink {
    path: PathBuf,
    header: SessionRecord,
    buffer: Vec<Sample>,
}

impl SampleSink {
    /// Derive the session file path, creating the output directory if absent
    pub fn open(output_dir: &Path, session: &Session) -> Result<Self, PersistError> {
        fs::create_dir_all(output_dir)?;
        let path = output_dir.join(session_filename(&session.subject_id, &session.start_time));
        log::info!("Session file: {}", path.display());

        Ok(Self {
            path,
            header: SessionRecord::header(session),
            buffer: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Number of buffered samples not yet on disk
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn append(&mut self, batch: &[Sample]) {
        self.buffer.extend_from_slice(batch);
    }

    /// Write buffered samples, returning how many were persisted
    pub fn flush(&mut self) -> Result<usize, PersistError> {
        if self.buffer.is_empty() && self.path.exists() {
            return Ok(0);
        }

        let mut record = match self.load_existing() {
            Ok(Some(record)) => record,
            Ok(None) => self.header.clone(),
            Err(e @ PersistError::Corrupt { .. }) => {
                log::warn!("{}; prior data discarded", e);
                self.header.clone()
            }
            Err(e) => return Err(e),
        };
        record.data.extend(self.buffer.iter().map(RecordEntry::from));

        let json = serde_json::to_string_pretty(&record).map_err(PersistError::Serialize)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, json)?;
        fs::rename(&staging, &self.path)?;

        let written = self.buffer.len();
        self.buffer.clear();
        log::debug!("Flushed {} samples to {}", written, self.path.display());
        Ok(written)
    }

    /// Final flush
    pub fn close(&mut self) -> Result<usize, PersistError> {
        let written = self.flush()?;
        log::info!("Session file closed: {}", self.path.display());
        Ok(written)
    }

    /// Existing file contents; a missing or zero-length file means no prior data
    fn load_existing(&self) -> Result<Option<SessionRecord>, PersistError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistError::Io(e)),
        };
        if contents.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| PersistError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }
}
