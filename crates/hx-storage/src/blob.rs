//! Key/value backends for compressed content blobs.

use crate::durability::DurabilityControl;
use hx_core::{HxError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Result of inserting a key that must not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    AlreadyExists,
}

/// Blob backend trait. Keys are immutable once stored.
pub trait BlobBackend: Send + Sync {
    fn contains(&self, key: &str) -> Result<bool>;
    /// Store `data` under `key` unless the key already exists.
    fn put_new(&self, key: &str, data: &[u8]) -> Result<PutOutcome>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn len(&self) -> Result<usize>;
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// In-memory blob backend.
pub struct MemoryBlobBackend {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobBackend {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBlobBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobBackend for MemoryBlobBackend {
    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.data.read().contains_key(key))
    }

    fn put_new(&self, key: &str, data: &[u8]) -> Result<PutOutcome> {
        let mut map = self.data.write();
        if map.contains_key(key) {
            return Ok(PutOutcome::AlreadyExists);
        }
        map.insert(key.to_string(), data.to_vec());
        Ok(PutOutcome::Stored)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.data.read().len())
    }
}

fn storage_err(what: &str, path: &Path, e: io::Error) -> HxError {
    HxError::Storage(format!("{what} {}: {e}", path.display()))
}

/// Filesystem blob backend: one file per key under `<root>/blobs/<hh>/`.
///
/// A blob is written to a uniquely named file in `<root>/tmp`, then
/// published with a hard link, which fails if the key already exists. A
/// crash leaves at most a stray temp file, never a partial blob.
pub struct FsBlobBackend {
    root: PathBuf,
    durability: Arc<DurabilityControl>,
    lock: Mutex<()>,
}

impl FsBlobBackend {
    pub fn open(root: impl Into<PathBuf>, durability: Arc<DurabilityControl>) -> Result<Self> {
        let root = root.into();
        for dir in [root.join("blobs"), root.join("tmp")] {
            fs::create_dir_all(&dir).map_err(|e| storage_err("create", &dir, e))?;
        }
        Ok(Self {
            root,
            durability,
            lock: Mutex::new(()),
        })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        let shard = key.get(..2).unwrap_or("__");
        self.root.join("blobs").join(shard).join(key)
    }

    fn write_temp(&self, tmp: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = fs::File::create(tmp)?;
        file.write_all(data)?;
        if self.durability.should_sync() {
            file.sync_data()?;
        }
        Ok(())
    }

    fn publish(&self, tmp: &Path, dest: &Path, data: &[u8]) -> Result<PutOutcome> {
        self.write_temp(tmp, data).map_err(|e| storage_err("write", tmp, e))?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| storage_err("create", parent, e))?;
        }
        match fs::hard_link(tmp, dest) {
            Ok(()) => Ok(PutOutcome::Stored),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(PutOutcome::AlreadyExists),
            Err(e) => Err(storage_err("link", dest, e)),
        }
    }
}

impl BlobBackend for FsBlobBackend {
    fn contains(&self, key: &str) -> Result<bool> {
        let _held = self.lock.lock();
        Ok(self.blob_path(key).is_file())
    }

    fn put_new(&self, key: &str, data: &[u8]) -> Result<PutOutcome> {
        let _held = self.lock.lock();
        let tmp = self.root.join("tmp").join(uuid::Uuid::new_v4().to_string());
        let outcome = self.publish(&tmp, &self.blob_path(key), data);
        let _ = fs::remove_file(&tmp);
        outcome
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let _held = self.lock.lock();
        let path = self.blob_path(key);
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_err("read", &path, e)),
        }
    }

    fn len(&self) -> Result<usize> {
        let _held = self.lock.lock();
        let blobs = self.root.join("blobs");
        let mut count = 0;
        for shard in fs::read_dir(&blobs).map_err(|e| storage_err("list", &blobs, e))? {
            let shard = shard?.path();
            if shard.is_dir() {
                count += fs::read_dir(&shard).map_err(|e| storage_err("list", &shard, e))?.count();
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fs_backend(tmp: &TempDir) -> FsBlobBackend {
        FsBlobBackend::open(tmp.path(), DurabilityControl::new()).unwrap()
    }

    #[test]
    fn test_memory_put_new_is_first_write_wins() {
        let backend = MemoryBlobBackend::new();
        assert_eq!(backend.put_new("k", b"one").unwrap(), PutOutcome::Stored);
        assert_eq!(backend.put_new("k", b"two").unwrap(), PutOutcome::AlreadyExists);
        assert_eq!(backend.get("k").unwrap().unwrap(), b"one");
        assert_eq!(backend.len().unwrap(), 1);
        assert!(backend.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_fs_layout_and_dedup() {
        let tmp = TempDir::new().unwrap();
        let backend = fs_backend(&tmp);
        assert!(backend.is_empty().unwrap());
        assert_eq!(backend.put_new("abcdef", b"data").unwrap(), PutOutcome::Stored);
        assert!(tmp.path().join("blobs/ab/abcdef").is_file());
        assert_eq!(backend.put_new("abcdef", b"other").unwrap(), PutOutcome::AlreadyExists);
        assert_eq!(backend.get("abcdef").unwrap().unwrap(), b"data");
        assert!(backend.contains("abcdef").unwrap());
        assert!(!backend.contains("abcdee").unwrap());
        assert_eq!(backend.len().unwrap(), 1);
    }

    #[test]
    fn test_fs_temp_files_removed() {
        let tmp = TempDir::new().unwrap();
        let backend = fs_backend(&tmp);
        backend.put_new("aa01", b"x").unwrap();
        backend.put_new("aa01", b"x").unwrap();
        assert_eq!(fs::read_dir(tmp.path().join("tmp")).unwrap().count(), 0);
    }

    #[test]
    fn test_fs_failed_temp_write_stores_nothing() {
        let tmp = TempDir::new().unwrap();
        let backend = fs_backend(&tmp);
        fs::remove_dir(tmp.path().join("tmp")).unwrap();
        fs::write(tmp.path().join("tmp"), b"not a directory").unwrap();

        let err = backend.put_new("abcd", b"data").unwrap_err();
        assert!(err.is_storage());
        assert!(backend.get("abcd").unwrap().is_none());
        assert!(!backend.contains("abcd").unwrap());
        assert!(backend.is_empty().unwrap());
    }

    #[test]
    fn test_fs_reopen_sees_existing_blobs() {
        let tmp = TempDir::new().unwrap();
        fs_backend(&tmp).put_new("ff00", b"kept").unwrap();
        let reopened = fs_backend(&tmp);
        assert_eq!(reopened.get("ff00").unwrap().unwrap(), b"kept");
    }
}
