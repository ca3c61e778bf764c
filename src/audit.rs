//! Append-only audit logging keyed by client fingerprint.
//!
//! The engine writes exactly one record per evaluated request; the
//! reputation aggregator optionally records positive verdicts through the
//! same interface. Duplicate identical records for one key are suppressed
//! before append, and file destinations are locked per path so concurrent
//! requests cannot lose updates.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::{Result, RiskError};

/// Record sink boundary (§6 logger collaborator).
pub trait LogSink: Send + Sync {
    /// Append `record` to the ordered list kept for `key`.
    fn append(&self, key: &str, record: &Map<String, Value>);
}

/// One lock per log destination, shared across instances pointing at the
/// same path.
static FILE_LOCKS: Lazy<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    let mut locks = FILE_LOCKS.lock();
    locks.entry(path.to_path_buf()).or_default().clone()
}

/// In-memory sink, used in tests and as a default when no persistence is
/// configured.
#[derive(Default)]
pub struct MemoryLog {
    entries: Mutex<HashMap<String, Vec<Map<String, Value>>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records appended for `key`, oldest first.
    pub fn entries_for(&self, key: &str) -> Vec<Map<String, Value>> {
        self.entries.lock().get(key).cloned().unwrap_or_default()
    }

    /// Total number of records across all keys.
    pub fn total_entries(&self) -> usize {
        self.entries.lock().values().map(Vec::len).sum()
    }
}

impl LogSink for MemoryLog {
    fn append(&self, key: &str, record: &Map<String, Value>) {
        let mut entries = self.entries.lock();
        let list = entries.entry(key.to_string()).or_default();
        if list.iter().any(|existing| existing == record) {
            return;
        }
        list.push(record.clone());
    }
}

/// JSON file sink: one file holding a `fingerprint -> [records]` mapping.
///
/// Reads and writes happen under the per-path lock; an unreadable or corrupt
/// file degrades to an empty log rather than failing the request.
pub struct JsonFileLog {
    path: PathBuf,
}

impl JsonFileLog {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(RiskError::AuditError(format!(
                    "log directory does not exist: {}",
                    parent.display()
                )));
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> HashMap<String, Vec<Map<String, Value>>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                log::warn!("audit log {} is corrupt: {}", self.path.display(), e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }

    fn store(&self, data: &HashMap<String, Vec<Map<String, Value>>>) {
        match serde_json::to_string(data) {
            Ok(text) => {
                if let Err(e) = fs::write(&self.path, text) {
                    log::warn!("failed to write audit log {}: {}", self.path.display(), e);
                }
            }
            Err(e) => log::warn!("failed to serialize audit log: {}", e),
        }
    }
}

impl LogSink for JsonFileLog {
    fn append(&self, key: &str, record: &Map<String, Value>) {
        let lock = lock_for(&self.path);
        let _guard = lock.lock();

        let mut data = self.load();
        let list = data.entry(key.to_string()).or_default();
        if list.iter().any(|existing| existing == record) {
            return;
        }
        list.push(record.clone());
        self.store(&data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(action: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("action".to_string(), json!(action));
        map.insert("ip".to_string(), json!("203.0.113.1"));
        map
    }

    #[test]
    fn test_memory_log_appends_in_order() {
        let log = MemoryLog::new();
        log.append("fp1", &record("allow"));
        log.append("fp1", &record("block"));
        let entries = log.entries_for("fp1");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].get("action"), Some(&json!("allow")));
        assert_eq!(entries[1].get("action"), Some(&json!("block")));
    }

    #[test]
    fn test_memory_log_suppresses_duplicates() {
        let log = MemoryLog::new();
        log.append("fp1", &record("allow"));
        log.append("fp1", &record("allow"));
        assert_eq!(log.entries_for("fp1").len(), 1);
    }

    #[test]
    fn test_memory_log_keys_are_independent() {
        let log = MemoryLog::new();
        log.append("fp1", &record("allow"));
        log.append("fp2", &record("allow"));
        assert_eq!(log.total_entries(), 2);
    }

    #[test]
    fn test_json_file_log_roundtrip() {
        let dir = std::env::temp_dir().join("riskgate_audit_test");
        let _ = fs::create_dir_all(&dir);
        let path = dir.join("audit.json");
        let _ = fs::remove_file(&path);

        let log = JsonFileLog::new(&path).unwrap();
        log.append("fp1", &record("challenge"));
        log.append("fp1", &record("challenge")); // duplicate, suppressed
        log.append("fp1", &record("block"));

        let data = log.load();
        assert_eq!(data.get("fp1").map(Vec::len), Some(2));

        let _ = fs::remove_file(&path);
        let _ = fs::remove_dir(&dir);
    }

    #[test]
    fn test_json_file_log_rejects_missing_directory() {
        let result = JsonFileLog::new("/nonexistent/path/audit.json");
        assert!(result.is_err());
    }

    #[test]
    fn test_json_file_log_survives_corrupt_file() {
        let dir = std::env::temp_dir().join("riskgate_audit_corrupt");
        let _ = fs::create_dir_all(&dir);
        let path = dir.join("audit.json");
        fs::write(&path, "{not json").unwrap();

        let log = JsonFileLog::new(&path).unwrap();
        log.append("fp1", &record("allow"));
        assert_eq!(log.load().get("fp1").map(Vec::len), Some(1));

        let _ = fs::remove_file(&path);
        let _ = fs::remove_dir(&dir);
    }
}
