//! Completion store
//!
//! Durable set of "step name is done" facts. A step is executed on a fresh run
//! if and only if the store has no record for its name, and the record is
//! written only after the step's action succeeded.
//!
//! [`MarkerStore`] keeps one marker file per step (`<state_dir>/<name>.done`).
//! The file's existence is the fact; its JSON body is informational and a
//! marker with an unreadable body still counts as done. [`MemoryStore`] backs
//! tests and dry runs.

use crate::errors::{BootstrapError, Result, StoreError};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Marker file extension
const MARKER_EXTENSION: &str = "done";

static STEP_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9._-]*$").expect("Valid regex pattern"));

/// Check that `name` is usable as a completion key (and as a file name)
pub fn validate_step_name(name: &str) -> Result<()> {
    if STEP_NAME.is_match(name) {
        Ok(())
    } else {
        Err(BootstrapError::Store(StoreError::InvalidName {
            name: name.to_string(),
        }))
    }
}

/// One durable completion fact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Step name
    pub name: String,
    /// When the step succeeded, if recorded
    pub completed_at: Option<DateTime<Utc>>,
}

impl CompletionRecord {
    fn now(name: &str) -> Self {
        Self {
            name: name.to_string(),
            completed_at: Some(Utc::now()),
        }
    }
}

/// Pluggable key-set store consulted by the step executor
pub trait CompletionStore: Send + Sync + fmt::Debug {
    /// Whether a completion record exists for `name`
    fn is_done(&self, name: &str) -> Result<bool>;

    /// Record that `name` succeeded
    fn mark_done(&self, name: &str) -> Result<()>;

    /// Delete the record for `name`. Returns whether a record existed.
    fn clear(&self, name: &str) -> Result<bool>;

    /// All records, ordered by step name
    fn completed(&self) -> Result<Vec<CompletionRecord>>;
}

/// File-marker store: one `<name>.done` file per completed step
#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the markers
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Marker path for a step name
    pub fn marker_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, MARKER_EXTENSION))
    }

    fn io_error(path: &Path, source: std::io::Error) -> BootstrapError {
        BootstrapError::Store(StoreError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    fn read_record(&self, name: &str, path: &Path) -> CompletionRecord {
        match std::fs::read_to_string(path)
            .ok()
            .and_then(|body| serde_json::from_str::<CompletionRecord>(&body).ok())
        {
            Some(record) if record.name == name => record,
            _ => {
                debug!("Marker {} has no readable record body", path.display());
                CompletionRecord {
                    name: name.to_string(),
                    completed_at: None,
                }
            }
        }
    }
}

impl CompletionStore for MarkerStore {
    fn is_done(&self, name: &str) -> Result<bool> {
        validate_step_name(name)?;
        let path = self.marker_path(name);
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }

    fn mark_done(&self, name: &str) -> Result<()> {
        validate_step_name(name)?;
        std::fs::create_dir_all(&self.dir).map_err(|e| Self::io_error(&self.dir, e))?;

        let path = self.marker_path(name);
        let body = serde_json::to_string_pretty(&CompletionRecord::now(name)).map_err(|e| {
            Self::io_error(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        // temp file + rename so a crash never leaves a half-written marker
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, body).map_err(|e| Self::io_error(&temp_path, e))?;
        std::fs::rename(&temp_path, &path).map_err(|e| Self::io_error(&path, e))?;

        debug!("Wrote completion marker {}", path.display());
        Ok(())
    }

    fn clear(&self, name: &str) -> Result<bool> {
        validate_step_name(name)?;
        let path = self.marker_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed completion marker {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }

    fn completed(&self) -> Result<Vec<CompletionRecord>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_error(&self.dir, e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Self::io_error(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MARKER_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_step_name(name).is_err() {
                warn!("Ignoring marker with invalid name: {}", path.display());
                continue;
            }
            records.push(self.read_record(name, &path));
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}

/// In-memory store; nothing survives the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, CompletionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, CompletionRecord>> {
        // a poisoned map is still a consistent map
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl CompletionStore for MemoryStore {
    fn is_done(&self, name: &str) -> Result<bool> {
        validate_step_name(name)?;
        Ok(self.lock().contains_key(name))
    }

    fn mark_done(&self, name: &str) -> Result<()> {
        validate_step_name(name)?;
        self.lock()
            .insert(name.to_string(), CompletionRecord::now(name));
        Ok(())
    }

    fn clear(&self, name: &str) -> Result<bool> {
        validate_step_name(name)?;
        Ok(self.lock().remove(name).is_some())
    }

    fn completed(&self) -> Result<Vec<CompletionRecord>> {
        Ok(self.lock().values().cloned().collect())
    }
}
