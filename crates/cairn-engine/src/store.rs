//! Durable request snapshots.
//!
//! Persistent operations commit a [`PersistedRequest`] through a
//! [`DurableStore`] before every externally visible step, so a crash never
//! loses the fact that a request is still pending. `FileStore` keeps one
//! JSON file per operation and writes through a temp file plus rename, the
//! same discipline the registry files use elsewhere; `MemStore` backs tests
//! and callers that opt out of durability.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::request::{OperationId, PersistedRequest};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Where request snapshots survive a process restart.
pub trait DurableStore: Send + Sync {
    fn load(&self, id: OperationId) -> Result<Option<PersistedRequest>, StoreError>;

    fn commit(&self, snapshot: &PersistedRequest) -> Result<(), StoreError>;

    fn remove(&self, id: OperationId) -> Result<(), StoreError>;

    /// Everything currently persisted, ordered by id. Drives the
    /// resume-on-start sweep.
    fn load_all(&self) -> Result<Vec<PersistedRequest>, StoreError>;
}

/// Shared handle to a durable store.
pub type DynDurableStore = Arc<dyn DurableStore>;

/// Hot-path commit: a failed write is logged and the in-memory machine
/// proceeds, it never wedges a transfer.
pub(crate) fn commit_best_effort(store: &dyn DurableStore, snapshot: &PersistedRequest) {
    if let Err(err) = store.commit(snapshot) {
        tracing::warn!(op = %snapshot.id, %err, "request snapshot commit failed");
    }
}

pub(crate) fn remove_best_effort(store: &dyn DurableStore, id: OperationId) {
    if let Err(err) = store.remove(id) {
        tracing::warn!(op = %id, %err, "request snapshot removal failed");
    }
}

// ── MemStore ──────────────────────────────────────────────────────────────────

/// In-memory store for tests and non-durable deployments.
#[derive(Default)]
pub struct MemStore {
    entries: DashMap<OperationId, PersistedRequest>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for MemStore {
    fn load(&self, id: OperationId) -> Result<Option<PersistedRequest>, StoreError> {
        Ok(self.entries.get(&id).map(|entry| entry.clone()))
    }

    fn commit(&self, snapshot: &PersistedRequest) -> Result<(), StoreError> {
        self.entries.insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    fn remove(&self, id: OperationId) -> Result<(), StoreError> {
        self.entries.remove(&id);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PersistedRequest>, StoreError> {
        let mut out: Vec<PersistedRequest> =
            self.entries.iter().map(|entry| entry.clone()).collect();
        out.sort_by_key(|snapshot| snapshot.id);
        Ok(out)
    }
}

// ── FileStore ─────────────────────────────────────────────────────────────────

/// One JSON file per operation under a root directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn path_for(&self, id: OperationId) -> PathBuf {
        self.root.join(format!("{}.json", id.0))
    }

    fn parse(path: &std::path::Path, text: &str) -> Option<PersistedRequest> {
        match serde_json::from_str(text) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    %err,
                    "ignoring corrupt request snapshot"
                );
                None
            }
        }
    }
}

impl DurableStore for FileStore {
    fn load(&self, id: OperationId) -> Result<Option<PersistedRequest>, StoreError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(Self::parse(&path, &text))
    }

    fn commit(&self, snapshot: &PersistedRequest) -> Result<(), StoreError> {
        let path = self.path_for(snapshot.id);
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, id: OperationId) -> Result<(), StoreError> {
        let path = self.path_for(id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PersistedRequest>, StoreError> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                let text = std::fs::read_to_string(&path)?;
                if let Some(snapshot) = Self::parse(&path, &text) {
                    out.push(snapshot);
                }
            }
        }
        out.sort_by_key(|snapshot| snapshot.id);
        Ok(out)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
