use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::app_dir;
use crate::core::error::EngineError;
use crate::models::FinalizeRecord;

/// History collaborator. The engine emits one record per terminal job state;
/// persistence, querying and export are the collaborator's business and the
/// engine never reads history back for scheduling decisions.
pub trait HistorySink: Send + Sync {
    fn record(&self, record: &FinalizeRecord);
}

/// Sink that drops everything.
pub struct NullHistory;

impl HistorySink for NullHistory {
    fn record(&self, _record: &FinalizeRecord) {}
}

/// Append-only JSON-lines store with an explicit open/close lifecycle.
pub struct JsonHistory {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonHistory {
    pub fn default_path() -> PathBuf {
        app_dir().join("history.jsonl")
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes and drops the underlying file. Records arriving afterwards
    /// are discarded with a warning.
    pub fn close(&self) {
        let mut file = self.file.lock().unwrap();
        if let Some(mut f) = file.take() {
            let _ = f.flush();
        }
    }
}

impl HistorySink for JsonHistory {
    fn record(&self, record: &FinalizeRecord) {
        let mut file = self.file.lock().unwrap();
        let Some(f) = file.as_mut() else {
            tracing::warn!(id = %record.id, "history store closed, dropping record");
            return;
        };
        match serde_json::to_string(record) {
            Ok(line) => {
                if let Err(e) = writeln!(f, "{}", line) {
                    tracing::warn!("failed to write history record: {}", e);
                }
            }
            Err(e) => tracing::warn!("failed to serialize history record: {}", e),
        }
    }
}
