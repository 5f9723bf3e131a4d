//! `mp_store` - JSON document storage layer for ModelPilot
//!
//! This crate provides:
//! - Atomic named-document persistence (write a sibling temp file, then
//!   rename it over the old document)
//! - Append-only JSON logs with bounded retention
//! - Blob storage for model artifacts
//! - A per-key lock registry so managers can serialize mutations per
//!   model type

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Corrupt document {path}: {reason}")]
    CorruptDocument { path: String, reason: String },
}

/// Main storage handle, rooted at a data directory.
///
/// All documents live under the root as pretty-printed JSON so operators can
/// inspect and repair state with ordinary tools. Every write lands in a
/// sibling `*.tmp` file first and is renamed over the target, so readers
/// always see either the old document or the new one, never a torn write.
#[derive(Debug, Clone)]
pub struct DocStore {
    root: PathBuf,
    append_lock: Arc<StdMutex<()>>,
}

impl DocStore {
    /// Open or create a document store at the given root directory
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the root directory cannot be created.
    #[instrument]
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        info!(root = %root.display(), "Opening document store");
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            append_lock: Arc::new(StdMutex::new(())),
        })
    }

    /// Root directory of the store
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read a named document, returning `None` when it does not exist yet
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CorruptDocument`] if the file exists but does
    /// not parse, and [`StoreError::IoError`] for other read failures.
    pub fn read_doc<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StoreError> {
        let path = self.root.join(name);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str(&raw) {
            Ok(doc) => Ok(Some(doc)),
            Err(err) => Err(StoreError::CorruptDocument {
                path: path.display().to_string(),
                reason: err.to_string(),
            }),
        }
    }

    /// Atomically replace a named document
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if serialization, the temp write, or the
    /// rename fails.
    pub fn write_doc<T: Serialize>(&self, name: &str, doc: &T) -> Result<(), StoreError> {
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(doc)?;
        let tmp = self.root.join(format!("{name}.tmp"));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        debug!(doc = name, "Document written");
        Ok(())
    }

    /// Append an entry to a JSON-array log, keeping at most `retain` entries
    ///
    /// The log is a plain document holding an array; retention drops the
    /// oldest entries first. An append rewrites the whole array, so appends
    /// hold an internal lock from read-back to rewrite and concurrent
    /// writers cannot drop each other's entries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the log cannot be read back or rewritten.
    ///
    /// # Panics
    ///
    /// Panics if the append lock is poisoned.
    pub fn append_log<T>(&self, name: &str, entry: &T, retain: usize) -> Result<(), StoreError>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        let _guard = self.append_lock.lock().unwrap();
        let mut entries: Vec<T> = self.read_doc(name)?.unwrap_or_default();
        entries.push(entry.clone());
        if entries.len() > retain {
            let excess = entries.len() - retain;
            entries.drain(..excess);
        }
        self.write_doc(name, &entries)
    }

    /// Read the full contents of a JSON-array log (empty if absent)
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the log exists but cannot be parsed.
    pub fn read_log<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, StoreError> {
        Ok(self.read_doc(name)?.unwrap_or_default())
    }

    /// Store an opaque blob (model artifact, metadata file) at a relative path
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if directories cannot be created or the write
    /// fails.
    pub fn put_blob(&self, rel_path: &str, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let path = self.root.join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.root.join(format!("{rel_path}.tmp"));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        debug!(blob = rel_path, bytes = bytes.len(), "Blob written");
        Ok(path)
    }

    /// Read back a blob stored with [`DocStore::put_blob`]
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IoError`] if the blob is missing or unreadable.
    pub fn read_blob(&self, rel_path: &str) -> Result<Vec<u8>, StoreError> {
        Ok(std::fs::read(self.root.join(rel_path))?)
    }

    /// List document file names (not paths) in a subdirectory, sorted
    ///
    /// Missing directories list as empty. Temp files left over from an
    /// interrupted swap are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IoError`] if the directory cannot be read.
    pub fn list_docs(&self, dir: &str) -> Result<Vec<String>, StoreError> {
        let path = self.root.join(dir);
        let entries = match std::fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut names: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".json") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Per-key async locks for serializing mutations.
///
/// Each manager owns its own registry and keys it by model type, so
/// concurrent operations on different model types proceed in parallel while
/// operations on the same type queue up.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LockRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Fetch (or create) the lock for a key
    #[must_use]
    pub fn for_key(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Compute a hex-encoded SipHash fingerprint of content
#[must_use]
pub fn fingerprint(content: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Format a timestamp as the compact `YYYYmmdd_HHMMSS` slug used in
/// report, dataset, and version identifiers
#[must_use]
pub fn timestamp_slug(ts: &DateTime<Utc>) -> String {
    ts.format("%Y%m%d_%H%M%S").to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        id: String,
        value: i64,
    }

    fn temp_store() -> (TempDir, DocStore) {
        let dir = TempDir::new().unwrap();
        let store = DocStore::open(dir.path()).unwrap();
        (dir, store)
    }

    // ========================================================================
    // Document read/write
    // ========================================================================

    #[test]
    fn test_read_missing_doc_is_none() {
        let (_dir, store) = temp_store();
        let doc: Option<Doc> = store.read_doc("missing.json").unwrap();
        assert!(doc.is_none());
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let (_dir, store) = temp_store();
        let doc = Doc {
            id: "a".to_string(),
            value: 42,
        };
        store.write_doc("state.json", &doc).unwrap();
        let back: Doc = store.read_doc("state.json").unwrap().unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_write_replaces_previous_content() {
        let (_dir, store) = temp_store();
        let first = Doc {
            id: "a".to_string(),
            value: 1,
        };
        let second = Doc {
            id: "a".to_string(),
            value: 2,
        };
        store.write_doc("state.json", &first).unwrap();
        store.write_doc("state.json", &second).unwrap();
        let back: Doc = store.read_doc("state.json").unwrap().unwrap();
        assert_eq!(back.value, 2);
        // No temp file should survive a completed swap
        assert!(!store.root().join("state.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_doc_is_reported_with_path() {
        let (_dir, store) = temp_store();
        std::fs::write(store.root().join("bad.json"), "{not json").unwrap();
        let err = store.read_doc::<Doc>("bad.json").unwrap_err();
        match err {
            StoreError::CorruptDocument { path, .. } => assert!(path.ends_with("bad.json")),
            other => panic!("expected CorruptDocument, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_doc_creates_parent_dirs() {
        let (_dir, store) = temp_store();
        let doc = Doc {
            id: "nested".to_string(),
            value: 7,
        };
        store.write_doc("reports/2026/report.json", &doc).unwrap();
        let back: Doc = store.read_doc("reports/2026/report.json").unwrap().unwrap();
        assert_eq!(back.id, "nested");
    }

    // ========================================================================
    // Append-only logs
    // ========================================================================

    #[test]
    fn test_append_log_accumulates() {
        let (_dir, store) = temp_store();
        for value in 0..3 {
            let entry = Doc {
                id: format!("e{value}"),
                value,
            };
            store.append_log("history.json", &entry, 100).unwrap();
        }
        let entries: Vec<Doc> = store.read_log("history.json").unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].id, "e0");
        assert_eq!(entries[2].id, "e2");
    }

    #[test]
    fn test_append_log_retention_drops_oldest() {
        let (_dir, store) = temp_store();
        for value in 0..10 {
            let entry = Doc {
                id: format!("e{value}"),
                value,
            };
            store.append_log("history.json", &entry, 4).unwrap();
        }
        let entries: Vec<Doc> = store.read_log("history.json").unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].id, "e6");
        assert_eq!(entries[3].id, "e9");
    }

    #[test]
    fn test_read_missing_log_is_empty() {
        let (_dir, store) = temp_store();
        let entries: Vec<Doc> = store.read_log("nothing.json").unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_append_log_keeps_entries_from_concurrent_writers() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for writer in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for value in 0..25 {
                    let entry = Doc {
                        id: format!("w{writer}_e{value}"),
                        value,
                    };
                    store.append_log("history.json", &entry, 1000).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let entries: Vec<Doc> = store.read_log("history.json").unwrap();
        assert_eq!(entries.len(), 100);
    }

    // ========================================================================
    // Blobs and listing
    // ========================================================================

    #[test]
    fn test_blob_roundtrip() {
        let (_dir, store) = temp_store();
        let bytes = b"model-weights";
        let path = store
            .put_blob("models/demo/v1/model.bin", bytes)
            .unwrap();
        assert!(path.exists());
        let back = store.read_blob("models/demo/v1/model.bin").unwrap();
        assert_eq!(back, bytes);
    }

    #[test]
    fn test_list_docs_sorted_and_filtered() {
        let (_dir, store) = temp_store();
        let doc = Doc {
            id: "x".to_string(),
            value: 0,
        };
        store.write_doc("reports/b.json", &doc).unwrap();
        store.write_doc("reports/a.json", &doc).unwrap();
        std::fs::write(store.root().join("reports/ignore.txt"), "x").unwrap();
        let names = store.list_docs("reports").unwrap();
        assert_eq!(names, vec!["a.json".to_string(), "b.json".to_string()]);
    }

    #[test]
    fn test_list_docs_missing_dir_is_empty() {
        let (_dir, store) = temp_store();
        assert!(store.list_docs("nowhere").unwrap().is_empty());
    }

    // ========================================================================
    // Locks and helpers
    // ========================================================================

    #[tokio::test]
    async fn test_lock_registry_returns_same_lock_per_key() {
        let registry = LockRegistry::new();
        let a = registry.for_key("vendor_recommendation");
        let b = registry.for_key("vendor_recommendation");
        assert!(Arc::ptr_eq(&a, &b));

        let other = registry.for_key("time_estimator");
        assert!(!Arc::ptr_eq(&a, &other));

        // Holding one key must not block another
        let _guard = a.lock().await;
        let _other_guard = other.lock().await;
    }

    #[test]
    fn test_fingerprint_is_stable_and_16_hex() {
        let a = fingerprint(b"training-data-v1");
        let b = fingerprint(b"training-data-v1");
        let c = fingerprint(b"training-data-v2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_timestamp_slug_format() {
        let ts = chrono::DateTime::parse_from_rfc3339("2026-03-01T14:30:05Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(timestamp_slug(&ts), "20260301_143005");
    }
}
