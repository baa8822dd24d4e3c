//! Capture store: content blobs plus the capture table.

use crate::blob::{BlobBackend, FsBlobBackend, MemoryBlobBackend};
use crate::content::ContentStore;
use crate::durability::{Durability, DurabilityControl, RelaxedGuard};
use crate::table::{CaptureTable, JsonlCaptureTable, MemoryCaptureTable};
use crate::writer::TransactionalWriter;
use hx_core::{Capture, Message, Result, StorageBackend, StorageConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub const TABLE_FILE: &str = "captures.jsonl";

pub struct Store {
    root: Option<PathBuf>,
    content: ContentStore,
    table: Arc<dyn CaptureTable>,
    durability: Arc<DurabilityControl>,
}

impl Store {
    pub fn in_memory() -> Self {
        let backend: Arc<dyn BlobBackend> = Arc::new(MemoryBlobBackend::new());
        Self {
            root: None,
            content: ContentStore::new(backend, StorageConfig::default().compression_level),
            table: Arc::new(MemoryCaptureTable::new()),
            durability: DurabilityControl::new(),
        }
    }

    /// Open (or create) a store rooted at `root`.
    pub fn open_dir(root: impl AsRef<Path>, compression_level: u32) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let durability = DurabilityControl::new();
        let backend: Arc<dyn BlobBackend> = Arc::new(FsBlobBackend::open(&root, Arc::clone(&durability))?);
        let table = JsonlCaptureTable::open(root.join(TABLE_FILE), Arc::clone(&durability))?;
        info!(root = %root.display(), rows = table.len()?, "store opened");
        Ok(Self {
            root: Some(root),
            content: ContentStore::new(backend, compression_level),
            table: Arc::new(table),
            durability,
        })
    }

    /// Store over caller-supplied content and table backends.
    pub fn with_parts(content: ContentStore, table: Arc<dyn CaptureTable>) -> Self {
        Self {
            root: None,
            content,
            table,
            durability: DurabilityControl::new(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match config.backend {
            StorageBackend::Memory => Ok(Self::in_memory()),
            StorageBackend::Filesystem => Self::open_dir(&config.root, config.compression_level),
        }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn table(&self) -> &Arc<dyn CaptureTable> {
        &self.table
    }

    pub fn writer(&self, batch_size: usize) -> TransactionalWriter<'_> {
        TransactionalWriter::new(self, batch_size)
    }

    pub fn durability(&self) -> Durability {
        self.durability.current()
    }

    /// Skip fsync until the returned guard (and every other one) is dropped.
    pub fn relax_durability(&self) -> RelaxedGuard {
        self.durability.relax()
    }

    /// Reassemble a stored capture with its message bytes.
    pub fn capture(&self, id: u64) -> Result<Option<Capture>> {
        let Some(row) = self.table.get(id)? else {
            return Ok(None);
        };
        Ok(Some(Capture {
            origin: row.origin,
            host: row.host,
            hostip: row.hostip,
            url: row.url,
            method: row.method,
            status: row.status,
            content_type: row.content_type,
            datetime: row.datetime,
            request: Message::new(self.content.read(&row.request_headers)?, self.content.read(&row.request_body)?),
            response: Message::new(
                self.content.read(&row.response_headers)?,
                self.content.read(&row.response_body)?,
            ),
            extras: row.extras,
        }))
    }
}
