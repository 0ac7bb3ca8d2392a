//! Persistent auth record: an origin-scoped bootstrap hint.
//!
//! DESIGN
//! ======
//! The record holds a small serialized subset of `AuthState` so a fresh tab
//! can avoid flashing "signed out" before the session authority answers. It
//! is never authoritative: the first authority response always supersedes it.
//! Storage is last-write-wins across tabs and is not used for conflict
//! resolution.
//!
//! ERROR HANDLING
//! ==============
//! Storage I/O is best-effort. A value that is present but unparsable is
//! treated as tampering: it is reported, cleared, and treated as absent.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AuthError;
use crate::state::AuthState;

// =============================================================================
// STORAGE BACKENDS
// =============================================================================

/// Synchronous key/value slot shared by every tab of an origin.
pub trait RecordStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// In-process storage. Clones share the same slots, so tabs created from
/// one `MemoryStorage` see each other's writes.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    slots: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
    }

    fn remove(&self, key: &str) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// One JSON file per key inside `dir`.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file}.json"))
    }
}

impl RecordStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(key)).ok()
    }

    fn set(&self, key: &str, value: &str) {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!(error = %e, dir = %self.dir.display(), "record directory unavailable");
            return;
        }
        if let Err(e) = std::fs::write(self.path_for(key), value) {
            warn!(error = %e, key, "record write failed");
        }
    }

    fn remove(&self, key: &str) {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, key, "record clear failed"),
        }
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Serialized subset of `AuthState` kept in the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub is_ready: bool,
    pub is_authenticated: bool,
    pub user_id: Option<String>,
}

impl Snapshot {
    #[must_use]
    pub fn of(state: &AuthState) -> Self {
        Self {
            is_ready: state.is_ready,
            is_authenticated: state.is_authenticated,
            user_id: state.user_id().map(str::to_owned),
        }
    }
}

// =============================================================================
// RECORD
// =============================================================================

#[derive(Clone)]
pub struct PersistentAuthRecord {
    storage: Arc<dyn RecordStorage>,
    key: String,
}

impl PersistentAuthRecord {
    #[must_use]
    pub fn new(storage: Arc<dyn RecordStorage>, key: impl Into<String>) -> Self {
        Self { storage, key: key.into() }
    }

    /// Read and validate the stored snapshot.
    ///
    /// # Errors
    ///
    /// Returns `MalformedRecord` if a value is present but is not valid JSON,
    /// or claims an authenticated state without a user id.
    pub fn read(&self) -> Result<Option<Snapshot>, AuthError> {
        let Some(raw) = self.storage.get(&self.key) else {
            return Ok(None);
        };
        let snapshot: Snapshot =
            serde_json::from_str(&raw).map_err(|e| AuthError::MalformedRecord { reason: e.to_string() })?;
        let has_user = snapshot.user_id.as_deref().is_some_and(|id| !id.is_empty());
        if snapshot.is_authenticated != has_user {
            return Err(AuthError::MalformedRecord {
                reason: "authentication flag disagrees with user id".to_owned(),
            });
        }
        Ok(Some(snapshot))
    }

    pub fn write(&self, snapshot: &Snapshot) {
        match serde_json::to_string(snapshot) {
            Ok(raw) => self.storage.set(&self.key, &raw),
            Err(e) => warn!(error = %e, "record serialization failed"),
        }
    }

    pub fn clear(&self) {
        self.storage.remove(&self.key);
    }

    /// Read once at startup. Tampered values are cleared and treated as absent.
    #[must_use]
    pub fn bootstrap(&self) -> Option<Snapshot> {
        match self.read() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, key = %self.key, "discarding persistent auth record");
                self.clear();
                None
            }
        }
    }

    /// Mirror a committed state into storage.
    pub(crate) fn persist(&self, state: &AuthState) {
        if state.is_authenticated {
            self.write(&Snapshot::of(state));
        } else if state.is_ready {
            self.clear();
        }
    }
}

#[cfg(test)]
#[path = "record_test.rs"]
mod record_test;
