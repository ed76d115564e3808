//! Durable sample storage and JSONL I/O.
//!
//! The store is keyed by the full sample tuple so out-of-order completion
//! under concurrency never loses or duplicates work. Each record is written
//! as one complete line under a lock; a torn line cannot appear even with
//! concurrent writers.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::condition::Condition;
use crate::sampler::RawSample;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Durable key of one sample.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SampleKey {
    pub dataset: String,
    pub question_id: String,
    pub model_id: String,
    pub condition: Condition,
    pub sample_index: usize,
}

/// Skip-existing boundary consulted before any sampling call.
pub trait ResultStore: Send + Sync {
    fn exists(&self, key: &SampleKey) -> bool;
    fn append(&self, sample: &RawSample) -> Result<(), StoreError>;
}

// =============================================================================
// JSONL store
// =============================================================================

/// Append-only JSONL store with an in-memory key index loaded at open.
pub struct JsonlResultStore {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    index: Mutex<HashSet<SampleKey>>,
}

impl JsonlResultStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut index = HashSet::new();
        if path.exists() {
            for sample in read_jsonl::<RawSample>(&path)? {
                index.insert(sample.key());
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            index: Mutex::new(index),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.index.lock().expect("store index poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultStore for JsonlResultStore {
    fn exists(&self, key: &SampleKey) -> bool {
        self.index.lock().expect("store index poisoned").contains(key)
    }

    fn append(&self, sample: &RawSample) -> Result<(), StoreError> {
        let line = serde_json::to_string(sample)?;
        {
            let mut writer = self.writer.lock().expect("store writer poisoned");
            writeln!(writer, "{line}")?;
            writer.flush()?;
        }
        self.index
            .lock()
            .expect("store index poisoned")
            .insert(sample.key());
        Ok(())
    }
}

// =============================================================================
// Memory store
// =============================================================================

/// In-memory store for quick tests; keeps keys only.
#[derive(Default)]
pub struct MemoryResultStore {
    index: Mutex<HashSet<SampleKey>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultStore for MemoryResultStore {
    fn exists(&self, key: &SampleKey) -> bool {
        self.index.lock().expect("store index poisoned").contains(key)
    }

    fn append(&self, sample: &RawSample) -> Result<(), StoreError> {
        self.index
            .lock()
            .expect("store index poisoned")
            .insert(sample.key());
        Ok(())
    }
}

// =============================================================================
// JSONL helpers
// =============================================================================

/// Read a JSONL file, skipping malformed lines with a warning.
pub fn read_jsonl<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>, StoreError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    let mut rows = Vec::new();
    for (line_num, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(row) => rows.push(row),
            Err(e) => warn!(
                path = %path.display(),
                line = line_num + 1,
                error = %e,
                "skipping invalid jsonl line"
            ),
        }
    }
    Ok(rows)
}

/// Write rows to a JSONL file, one complete line per row.
pub fn write_jsonl<T: Serialize>(
    path: impl AsRef<Path>,
    rows: impl IntoIterator<Item = T>,
) -> Result<(), StoreError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut writer = BufWriter::new(File::create(path)?);
    for row in rows {
        let line = serde_json::to_string(&row)?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}
