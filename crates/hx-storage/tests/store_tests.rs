//! Integration tests for the filesystem-backed store.

use hx_core::{Capture, Extras, HxError, Message, Origin, StorageBackend, StorageConfig};
use hx_storage::{Durability, Store, EMPTY_HASH};
use tempfile::TempDir;

fn capture(path: &str, body: &[u8]) -> Capture {
    let mut c = Capture::empty(Origin::Proxy);
    c.host = "shop.test".into();
    c.method = "POST".into();
    c.url = format!("https://shop.test{path}");
    c.status = Some(201);
    c.request = Message::new(format!("POST {path} HTTP/1.1\r\nHost: shop.test").into_bytes(), body.to_vec());
    c.response = Message::new(b"HTTP/1.1 201 Created".to_vec(), Vec::new());
    c.extras = Extras {
        notes: Some("created".into()),
        ..Default::default()
    };
    c
}

// ============================================================
// Round trip
// ============================================================

#[test]
fn test_capture_round_trip() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open_dir(tmp.path(), 6).unwrap();
    let original = capture("/orders", b"{\"qty\":\x00\xff}");
    store.writer(100).write_all(vec![Ok(original.clone())]).unwrap();

    let row = &store.table().rows().unwrap()[0];
    assert_eq!(row.response_body, EMPTY_HASH);
    assert_eq!(store.capture(row.id).unwrap().unwrap(), original);
    assert!(store.capture(999).unwrap().is_none());
}

#[test]
fn test_rows_survive_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let store = Store::open_dir(tmp.path(), 6).unwrap();
        store
            .writer(2)
            .write_all((0..5).map(|i| Ok(capture(&format!("/{i}"), b"x"))))
            .unwrap();
    }
    let store = Store::open_dir(tmp.path(), 6).unwrap();
    assert_eq!(store.table().len().unwrap(), 5);
    assert_eq!(store.capture(5).unwrap().unwrap().url, "https://shop.test/4");
    assert!(tmp.path().join("captures.jsonl").is_file());
}

// ============================================================
// Dedup
// ============================================================

#[test]
fn test_identical_content_one_blob_on_disk() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open_dir(tmp.path(), 6).unwrap();
    let body = vec![b'z'; 4096];
    let hashes: Vec<String> = (0..1000).map(|_| store.content().insert(&body).unwrap()).collect();
    assert!(hashes.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(store.content().backend().len().unwrap(), 1);
    assert_eq!(store.content().stats().writes, 1);
}

#[test]
fn test_reopened_store_dedups_against_disk() {
    let tmp = TempDir::new().unwrap();
    Store::open_dir(tmp.path(), 6).unwrap().content().insert(b"persisted").unwrap();
    let store = Store::open_dir(tmp.path(), 6).unwrap();
    store.content().insert(b"persisted").unwrap();
    assert_eq!(store.content().stats().writes, 0);
    assert_eq!(store.content().stats().dedup_hits, 1);
}

// ============================================================
// Failure handling
// ============================================================

#[test]
fn test_partial_batch_not_durable() {
    let tmp = TempDir::new().unwrap();
    {
        let store = Store::open_dir(tmp.path(), 6).unwrap();
        let items = (0..250).map(|i| {
            if i == 150 {
                Err(HxError::TruncatedInput { context: "test".into() })
            } else {
                Ok(capture(&format!("/{i}"), b"body"))
            }
        });
        let failure = store.writer(100).write_all(items).unwrap_err();
        assert_eq!(failure.committed, 100);
    }
    let store = Store::open_dir(tmp.path(), 6).unwrap();
    assert_eq!(store.table().len().unwrap(), 100);
}

#[test]
fn test_relaxed_durability_is_scoped() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open_dir(tmp.path(), 6).unwrap();
    {
        let _guard = store.relax_durability();
        assert_eq!(store.durability(), Durability::Relaxed);
        store.writer(10).write_all(vec![Ok(capture("/fast", b""))]).unwrap();
    }
    assert_eq!(store.durability(), Durability::Full);
}

// ============================================================
// Config
// ============================================================

#[test]
fn test_from_config_backends() {
    let tmp = TempDir::new().unwrap();
    let config = StorageConfig {
        backend: StorageBackend::Filesystem,
        root: tmp.path().join("store"),
        compression_level: 9,
    };
    let store = Store::from_config(&config).unwrap();
    assert_eq!(store.root(), Some(config.root.as_path()));
    assert!(config.root.join("blobs").is_dir());

    let memory = Store::from_config(&StorageConfig {
        backend: StorageBackend::Memory,
        ..config
    })
    .unwrap();
    assert!(memory.root().is_none());
}
