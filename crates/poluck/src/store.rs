use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::crypto;
use crate::error::LuckError;
use crate::types::{ContentHash, ObjectRef};

/// Content-addressed object storage. `put` is idempotent: the same bytes always
/// land at the same hash.
pub trait ObjectStore: Send + Sync {
    fn put(&self, bytes: &[u8]) -> Result<ContentHash, LuckError>;

    fn get(&self, hash: &ContentHash) -> Result<Vec<u8>, LuckError>;
}

/// Store a value under the hash of its canonical encoding.
pub fn put_object<T: Serialize>(store: &dyn ObjectStore, value: &T) -> Result<ContentHash, LuckError> {
    store.put(&crypto::encode(value)?)
}

/// Fetch and decode a value, checking it against its address.
pub fn get_object<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    hash: &ContentHash,
) -> Result<T, LuckError> {
    let bytes = store.get(hash)?;
    if crypto::hash_bytes(&bytes) != hash.0 {
        return Err(LuckError::Storage(format!(
            "object {hash} does not match its address"
        )));
    }
    crypto::decode(&bytes)
}

#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<ContentHash, Vec<u8>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl ObjectStore for MemoryStore {
    fn put(&self, bytes: &[u8]) -> Result<ContentHash, LuckError> {
        let hash = ContentHash(crypto::hash_bytes(bytes));
        self.objects
            .write()
            .entry(hash)
            .or_insert_with(|| bytes.to_vec());
        Ok(hash)
    }

    fn get(&self, hash: &ContentHash) -> Result<Vec<u8>, LuckError> {
        self.objects
            .read()
            .get(hash)
            .cloned()
            .ok_or(LuckError::NotFound(ObjectRef::Content(*hash)))
    }
}

/// One file per object, named by its hex hash.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, LuckError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(hash.to_hex())
    }
}

impl ObjectStore for FileStore {
    fn put(&self, bytes: &[u8]) -> Result<ContentHash, LuckError> {
        let hash = ContentHash(crypto::hash_bytes(bytes));
        let path = self.path(&hash);
        if !path.exists() {
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, bytes)?;
            fs::rename(&tmp, &path)?;
        }
        Ok(hash)
    }

    fn get(&self, hash: &ContentHash) -> Result<Vec<u8>, LuckError> {
        match fs::read(self.path(hash)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(LuckError::NotFound(ObjectRef::Content(*hash)))
            }
            Err(e) => Err(e.into()),
        }
    }
}
