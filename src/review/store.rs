use super::ReviewSegmentRecord;
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where segment snapshots are persisted. Failures are reported, never fatal
/// to the maintainer.
pub trait SegmentStore: Send {
    fn upsert(&mut self, record: &ReviewSegmentRecord) -> Result<(), StoreError>;

    /// Forget segments a previous run left open
    fn clear_ongoing(&mut self) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum StoreEntry {
    Upsert { record: ReviewSegmentRecord },
    ClearOngoing,
}

#[derive(Debug, Serialize, Deserialize)]
struct LogLine {
    written_at: DateTime<Utc>,
    entry: StoreEntry,
}

/// Appends one JSON object per operation to a log file
pub struct JsonLinesSegmentStore {
    path: PathBuf,
    file: Option<File>,
}

impl JsonLinesSegmentStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, entry: StoreEntry) -> Result<(), StoreError> {
        let line = serde_json::to_string(&LogLine {
            written_at: Utc::now(),
            entry,
        })?;
        let path = self.path.clone();
        let write_err = |source| StoreError::Write {
            path: path.display().to_string(),
            source,
        };

        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent).map_err(write_err)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(write_err)?;
            info!("Review segments are logged to {}", self.path.display());
            self.file = Some(file);
        }

        if let Some(file) = self.file.as_mut() {
            if let Err(e) = writeln!(file, "{}", line) {
                // reopen on the next write
                self.file = None;
                return Err(write_err(e));
            }
        }
        Ok(())
    }

    /// Replay a log into the latest record per segment id
    pub fn replay<P: AsRef<Path>>(path: P) -> Result<BTreeMap<String, ReviewSegmentRecord>, StoreError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| StoreError::Write {
            path: path.display().to_string(),
            source,
        })?;

        let mut records = BTreeMap::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| StoreError::Write {
                path: path.display().to_string(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogLine>(&line).map(|l| l.entry) {
                Ok(StoreEntry::Upsert { record }) => {
                    records.insert(record.id.clone(), record);
                }
                Ok(StoreEntry::ClearOngoing) => {
                    records.retain(|_, r: &mut ReviewSegmentRecord| r.end_time.is_some());
                }
                Err(e) => warn!("Skipping malformed review log line {}: {}", number + 1, e),
            }
        }
        Ok(records)
    }
}

impl SegmentStore for JsonLinesSegmentStore {
    fn upsert(&mut self, record: &ReviewSegmentRecord) -> Result<(), StoreError> {
        debug!("Persisting review segment {}", record.id);
        self.append(StoreEntry::Upsert {
            record: record.clone(),
        })
    }

    fn clear_ongoing(&mut self) -> Result<(), StoreError> {
        self.append(StoreEntry::ClearOngoing)
    }
}
