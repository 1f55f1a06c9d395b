//! Durable record of which change revisions already received a verdict.
//!
//! The record is a JSON object mapping change-id to the revision ref that was
//! tested. It is rewritten in full after every mutation through a temporary
//! file in the same directory followed by an atomic rename, so a crash never
//! leaves a truncated record behind.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{Error, Result};

/// File name of the record inside the working directory.
pub const RECORD_FILE: &str = "record.json";

/// Change-id to last-tested revision ref, backed by a JSON file.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    tested: BTreeMap<String, String>,
}

impl StateStore {
    /// Loads the record at `path`.
    ///
    /// A missing or zero-length file yields an empty record. Any other
    /// content that is not a JSON object of strings is fatal.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tested = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|source| {
                Error::StateCorrupt {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::Io(e)),
        };

        tracing::info!(path = ?path, entries = tested.len(), "loaded state record");
        Ok(Self { path, tested })
    }

    /// Loads `record.json` from the working directory.
    pub fn load_from_dir(work_dir: &Path) -> Result<Self> {
        Self::load(work_dir.join(RECORD_FILE))
    }

    /// Returns true only if `change_id` was tested at exactly `revision_ref`.
    pub fn is_known(&self, change_id: &str, revision_ref: &str) -> bool {
        self.tested
            .get(change_id)
            .is_some_and(|stored| stored == revision_ref)
    }

    /// Returns the stored ref for a change, if any.
    pub fn get(&self, change_id: &str) -> Option<&str> {
        self.tested.get(change_id).map(String::as_str)
    }

    /// Records that `change_id` received a verdict at `revision_ref`.
    pub fn remember(&mut self, change_id: &str, revision_ref: &str) {
        self.tested
            .insert(change_id.to_string(), revision_ref.to_string());
    }

    /// Drops a change from the record. Returns true if it was present.
    pub fn forget(&mut self, change_id: &str) -> bool {
        self.tested.remove(change_id).is_some()
    }

    /// Number of remembered changes.
    pub fn len(&self) -> usize {
        self.tested.len()
    }

    /// Returns true if nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.tested.is_empty()
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the backing file atomically.
    pub fn persist(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let content = serde_json::to_vec_pretty(&self.tested)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&content)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!(path = ?self.path, entries = self.tested.len(), "persisted state record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::load_from_dir(dir.path()).unwrap();

        assert!(store.is_empty());
        assert_eq!(store.path(), dir.path().join(RECORD_FILE));
    }

    #[test]
    fn load_zero_length_file_is_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(RECORD_FILE), "").unwrap();

        let store = StateStore::load_from_dir(dir.path()).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn load_malformed_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(RECORD_FILE), "{not json").unwrap();

        let err = StateStore::load_from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, Error::StateCorrupt { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn load_wrong_shape_is_fatal() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(RECORD_FILE), r#"["I123"]"#).unwrap();

        let err = StateStore::load_from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, Error::StateCorrupt { .. }));
    }

    #[test]
    fn is_known_requires_exact_ref() {
        let dir = TempDir::new().unwrap();
        let mut store = StateStore::load_from_dir(dir.path()).unwrap();
        store.remember("I1a2b", "refs/changes/45/2345/3");

        assert!(store.is_known("I1a2b", "refs/changes/45/2345/3"));
        assert!(!store.is_known("I1a2b", "refs/changes/45/2345/4"));
        assert!(!store.is_known("Iffff", "refs/changes/45/2345/3"));
    }

    #[test]
    fn forget_removes_entry() {
        let dir = TempDir::new().unwrap();
        let mut store = StateStore::load_from_dir(dir.path()).unwrap();
        store.remember("I1", "refs/changes/01/1/1");

        assert!(store.forget("I1"));
        assert!(!store.forget("I1"));
        assert!(store.get("I1").is_none());
    }

    #[test]
    fn persist_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut store = StateStore::load_from_dir(dir.path()).unwrap();
        store.remember("I1", "refs/changes/01/1/1");
        store.remember("I2", "refs/changes/02/2/5");
        store.persist().unwrap();

        let reloaded = StateStore::load_from_dir(dir.path()).unwrap();
        assert_eq!(reloaded.tested, store.tested);
    }

    #[test]
    fn persist_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let mut store = StateStore::load_from_dir(dir.path()).unwrap();
        store.remember("I1", "refs/changes/01/1/1");
        store.persist().unwrap();
        store.forget("I1");
        store.persist().unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from(RECORD_FILE)]);

        let content = std::fs::read_to_string(dir.path().join(RECORD_FILE)).unwrap();
        assert_eq!(content.trim(), "{}");
    }

    #[test]
    fn persisted_file_is_plain_json_object() {
        let dir = TempDir::new().unwrap();
        let mut store = StateStore::load_from_dir(dir.path()).unwrap();
        store.remember("I1", "refs/changes/01/1/1");
        store.persist().unwrap();

        let content = std::fs::read_to_string(dir.path().join(RECORD_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["I1"], "refs/changes/01/1/1");
    }
}
