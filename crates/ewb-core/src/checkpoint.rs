//! Durable per-unit result snapshots.
//!
//! Layout: `<dir>/<model>_<event_type>_results.json`, one file per
//! `(model, event_type)` unit. Writes go to a temp file in the same
//! directory and are renamed into place, so readers see the old file or the
//! new one, never a partial write.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::domain::{CheckpointError, EventType, ResultTable};

pub const SCHEMA_VERSION: u32 = 1;
const FILE_SUFFIX: &str = "_results.json";

/// Identity of one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CheckpointKey {
    pub model: String,
    pub event_type: EventType,
}

impl CheckpointKey {
    pub fn new(model: impl Into<String>, event_type: EventType) -> Self {
        Self {
            model: model.into(),
            event_type,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}_{}{FILE_SUFFIX}", self.model, self.event_type)
    }

    /// Inverse of [`file_name`](Self::file_name).
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(FILE_SUFFIX)?;
        EventType::ALL.into_iter().find_map(|event_type| {
            let model = stem.strip_suffix(event_type.as_str())?.strip_suffix('_')?;
            (!model.is_empty()).then(|| Self::new(model, event_type))
        })
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model, self.event_type)
    }
}

/// On-disk envelope around a result table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub schema_version: u32,
    pub model: String,
    pub event_type: EventType,
    pub saved_at: DateTime<Utc>,
    pub record_count: usize,
    /// SHA-256 hex of the serialized `records`.
    pub digest: String,
    pub records: ResultTable,
}

fn records_digest(records: &ResultTable) -> Result<String, CheckpointError> {
    let bytes = serde_json::to_vec(records)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Directory of checkpoint files.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, key: &CheckpointKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    pub fn exists(&self, key: &CheckpointKey) -> bool {
        self.path(key).is_file()
    }

    /// Atomically write `table` for `key`, replacing any previous file.
    pub fn save(&self, key: &CheckpointKey, table: &ResultTable) -> Result<PathBuf, CheckpointError> {
        fs::create_dir_all(&self.dir)?;
        let file = CheckpointFile {
            schema_version: SCHEMA_VERSION,
            model: key.model.clone(),
            event_type: key.event_type,
            saved_at: Utc::now(),
            record_count: table.len(),
            digest: records_digest(table)?,
            records: table.clone(),
        };
        let path = self.path(key);

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut tmp, &file)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;

        debug!(path = %path.display(), records = file.record_count, "checkpoint written");
        Ok(path)
    }

    /// Read and verify the checkpoint for `key`. `None` when absent.
    pub fn load_file(&self, key: &CheckpointKey) -> Result<Option<CheckpointFile>, CheckpointError> {
        let path = self.path(key);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let corrupt = |reason: String| CheckpointError::Corrupt {
            path: path.clone(),
            reason,
        };

        let file: CheckpointFile =
            serde_json::from_slice(&raw).map_err(|e| corrupt(e.to_string()))?;
        if file.schema_version != SCHEMA_VERSION {
            return Err(corrupt(format!(
                "unsupported schema version {}",
                file.schema_version
            )));
        }
        if file.model != key.model || file.event_type != key.event_type {
            return Err(corrupt(format!(
                "file holds {}/{}",
                file.model, file.event_type
            )));
        }
        if file.record_count != file.records.len() {
            return Err(corrupt(format!(
                "expected {} records, found {}",
                file.record_count,
                file.records.len()
            )));
        }
        let digest = records_digest(&file.records)?;
        if digest != file.digest {
            return Err(corrupt(format!("digest mismatch: computed {digest}")));
        }
        Ok(Some(file))
    }

    pub fn load(&self, key: &CheckpointKey) -> Result<Option<ResultTable>, CheckpointError> {
        Ok(self.load_file(key)?.map(|file| file.records))
    }

    /// Keys of every checkpoint in the directory, sorted.
    pub fn list(&self) -> Result<Vec<CheckpointKey>, CheckpointError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(key) = entry
                .file_name()
                .to_str()
                .and_then(CheckpointKey::from_file_name)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
