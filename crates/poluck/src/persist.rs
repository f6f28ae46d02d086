use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::LuckError;
use crate::types::{ContentHash, ObjectRef};

/// Local node state that survives restarts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub head: ObjectRef,
    pub mempool: Vec<ContentHash>,
}

pub trait StateStore: Send {
    fn load(&self) -> Result<Option<Snapshot>, LuckError>;

    fn save(&self, snapshot: &Snapshot) -> Result<(), LuckError>;
}

/// Snapshot kept as pretty JSON, replaced atomically on every save.
pub struct JsonFileState {
    path: PathBuf,
}

impl JsonFileState {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StateStore for JsonFileState {
    fn load(&self) -> Result<Option<Snapshot>, LuckError> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| LuckError::Serialization(e.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), LuckError> {
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| LuckError::Serialization(e.to_string()))?;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory state; clones share the same slot.
#[derive(Clone, Default)]
pub struct MemoryState {
    slot: Arc<Mutex<Option<Snapshot>>>,
}

impl MemoryState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryState {
    fn load(&self) -> Result<Option<Snapshot>, LuckError> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), LuckError> {
        *self.slot.lock() = Some(snapshot.clone());
        Ok(())
    }
}
