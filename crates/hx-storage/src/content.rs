//! Content-addressed, deduplicated blob store.

use crate::blob::{BlobBackend, PutOutcome};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use hx_core::{HxError, Result};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::debug;

/// Key of the empty blob, which is never physically stored.
pub const EMPTY_HASH: &str = "";

/// Hashes remembered before the dedup cache is reset.
pub const CACHE_CAPACITY: usize = 65_536;

/// Lowercase hex SHA-256 of `data`.
pub fn content_hash(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentStats {
    /// Blobs physically written.
    pub writes: u64,
    /// Inserts whose hash was already in the backend.
    pub dedup_hits: u64,
    /// Inserts answered from the dedup cache.
    pub cache_hits: u64,
}

pub struct ContentStore {
    backend: Arc<dyn BlobBackend>,
    level: Compression,
    seen: Mutex<HashSet<String>>,
    stats: Mutex<ContentStats>,
}

impl ContentStore {
    pub fn new(backend: Arc<dyn BlobBackend>, compression_level: u32) -> Self {
        Self {
            backend,
            level: Compression::new(compression_level.min(9)),
            seen: Mutex::new(HashSet::new()),
            stats: Mutex::new(ContentStats::default()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn BlobBackend> {
        &self.backend
    }

    /// Store `data` and return its hash. Idempotent.
    pub fn insert(&self, data: &[u8]) -> Result<String> {
        if data.is_empty() {
            return Ok(EMPTY_HASH.to_string());
        }
        let hash = content_hash(data);
        if self.seen.lock().contains(&hash) {
            self.stats.lock().cache_hits += 1;
            return Ok(hash);
        }
        if self.backend.contains(&hash)? {
            self.stats.lock().dedup_hits += 1;
        } else {
            let compressed = compress(data, self.level)?;
            match self.backend.put_new(&hash, &compressed)? {
                PutOutcome::Stored => {
                    debug!(hash = %hash, len = data.len(), stored = compressed.len(), "blob written");
                    self.stats.lock().writes += 1;
                }
                PutOutcome::AlreadyExists => self.stats.lock().dedup_hits += 1,
            }
        }
        self.remember(hash.clone());
        Ok(hash)
    }

    /// Exact bytes stored under `hash`.
    pub fn read(&self, hash: &str) -> Result<Vec<u8>> {
        if hash == EMPTY_HASH {
            return Ok(Vec::new());
        }
        let compressed = self
            .backend
            .get(hash)?
            .ok_or_else(|| HxError::NotFound { hash: hash.to_string() })?;
        let mut data = Vec::new();
        ZlibDecoder::new(&compressed[..])
            .read_to_end(&mut data)
            .map_err(|e| HxError::Storage(format!("blob {hash} is corrupt: {e}")))?;
        Ok(data)
    }

    pub fn stats(&self) -> ContentStats {
        *self.stats.lock()
    }

    fn remember(&self, hash: String) {
        let mut seen = self.seen.lock();
        if seen.len() >= CACHE_CAPACITY {
            seen.clear();
        }
        seen.insert(hash);
    }
}

fn compress(data: &[u8], level: Compression) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), level);
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobBackend;

    fn store() -> ContentStore {
        ContentStore::new(Arc::new(MemoryBlobBackend::new()), 6)
    }

    #[test]
    fn test_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_empty_content_is_reserved() {
        let store = store();
        assert_eq!(store.insert(b"").unwrap(), EMPTY_HASH);
        assert!(store.read(EMPTY_HASH).unwrap().is_empty());
        assert!(store.backend().is_empty().unwrap());
    }

    #[test]
    fn test_round_trip_binary() {
        let store = store();
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let hash = store.insert(&data).unwrap();
        assert_eq!(store.read(&hash).unwrap(), data);
    }

    #[test]
    fn test_distinct_content_distinct_hashes() {
        let store = store();
        let a = store.insert(b"GET / HTTP/1.1").unwrap();
        let b = store.insert(b"GET / HTTP/1.0").unwrap();
        assert_ne!(a, b);
        assert_eq!(store.backend().len().unwrap(), 2);
    }

    #[test]
    fn test_same_body_stored_once() {
        let store = store();
        for _ in 0..1000 {
            store.insert(b"<html>same</html>").unwrap();
        }
        assert_eq!(store.backend().len().unwrap(), 1);
        let stats = store.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.cache_hits, 999);
    }

    #[test]
    fn test_backend_hit_without_cache() {
        let backend: Arc<dyn BlobBackend> = Arc::new(MemoryBlobBackend::new());
        ContentStore::new(Arc::clone(&backend), 6).insert(b"shared").unwrap();
        let second = ContentStore::new(backend, 6);
        second.insert(b"shared").unwrap();
        assert_eq!(second.stats().writes, 0);
        assert_eq!(second.stats().dedup_hits, 1);
    }

    #[test]
    fn test_unknown_hash_not_found() {
        let err = store().read("deadbeef").unwrap_err();
        assert!(matches!(err, HxError::NotFound { .. }));
    }

    #[test]
    fn test_blobs_are_compressed() {
        let store = store();
        let data = vec![b'A'; 64 * 1024];
        let hash = store.insert(&data).unwrap();
        let raw = store.backend().get(&hash).unwrap().unwrap();
        assert!(raw.len() < data.len() / 10);
    }
}
