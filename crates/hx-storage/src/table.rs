//! Capture rows and the tables that hold them.

use crate::durability::DurabilityControl;
use hx_core::{Capture, Extras, HxError, Origin, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// One stored capture. Message parts are referenced by content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRow {
    /// Assigned at commit; 0 until then.
    #[serde(default)]
    pub id: u64,
    pub origin: Origin,
    pub host: String,
    pub hostip: String,
    pub url: String,
    pub method: String,
    pub status: Option<u16>,
    pub content_type: String,
    pub datetime: String,
    pub request_headers: String,
    pub request_body: String,
    pub response_headers: String,
    pub response_body: String,
    #[serde(default)]
    pub extras: Extras,
}

/// Content hashes of a capture's four message parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHashes {
    pub request_headers: String,
    pub request_body: String,
    pub response_headers: String,
    pub response_body: String,
}

impl CaptureRow {
    /// Row for `capture`, minus its message bytes.
    pub fn new(capture: Capture, hashes: MessageHashes) -> Self {
        Self {
            id: 0,
            origin: capture.origin,
            host: capture.host,
            hostip: capture.hostip,
            url: capture.url,
            method: capture.method,
            status: capture.status,
            content_type: capture.content_type,
            datetime: capture.datetime,
            request_headers: hashes.request_headers,
            request_body: hashes.request_body,
            response_headers: hashes.response_headers,
            response_body: hashes.response_body,
            extras: capture.extras,
        }
    }
}

/// Append-only table of capture rows.
pub trait CaptureTable: Send + Sync {
    /// Append all rows or none, assigning consecutive ids. Returns the ids.
    fn append_batch(&self, rows: Vec<CaptureRow>) -> Result<Vec<u64>>;
    fn get(&self, id: u64) -> Result<Option<CaptureRow>>;
    fn rows(&self) -> Result<Vec<CaptureRow>>;
    fn len(&self) -> Result<usize>;
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn assign_ids(rows: &mut [CaptureRow], first: u64) -> Vec<u64> {
    rows.iter_mut()
        .zip(first..)
        .map(|(row, id)| {
            row.id = id;
            id
        })
        .collect()
}

/// In-memory capture table.
pub struct MemoryCaptureTable {
    rows: RwLock<Vec<CaptureRow>>,
}

impl MemoryCaptureTable {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryCaptureTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureTable for MemoryCaptureTable {
    fn append_batch(&self, mut rows: Vec<CaptureRow>) -> Result<Vec<u64>> {
        let mut table = self.rows.write();
        let first = table.last().map_or(1, |r| r.id + 1);
        let ids = assign_ids(&mut rows, first);
        table.extend(rows);
        Ok(ids)
    }

    fn get(&self, id: u64) -> Result<Option<CaptureRow>> {
        Ok(self.rows.read().iter().find(|r| r.id == id).cloned())
    }

    fn rows(&self) -> Result<Vec<CaptureRow>> {
        Ok(self.rows.read().clone())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.rows.read().len())
    }
}

struct JsonlState {
    file: File,
    len: u64,
    next_id: u64,
    count: usize,
}

/// Capture table stored as one JSON row per line.
///
/// A batch is written with a single append; if the write fails the file is
/// truncated back to its previous length.
pub struct JsonlCaptureTable {
    path: PathBuf,
    durability: Arc<DurabilityControl>,
    state: Mutex<JsonlState>,
}

/// Rows of a table file plus the length of its complete lines. A final
/// line without a newline is a torn write and is not counted.
fn read_rows(path: &Path) -> Result<(Vec<CaptureRow>, u64)> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut rows = Vec::new();
    let mut valid = 0u64;
    let mut line = Vec::new();
    let mut lineno = 0;
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        lineno += 1;
        if line.last() != Some(&b'\n') {
            warn!(path = %path.display(), line = lineno, "ignoring torn capture row");
            break;
        }
        valid += n as u64;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<CaptureRow>(&line) {
            Ok(row) => rows.push(row),
            Err(e) => warn!(path = %path.display(), line = lineno, error = %e, "skipping unreadable capture row"),
        }
    }
    Ok((rows, valid))
}

impl JsonlCaptureTable {
    pub fn open(path: impl Into<PathBuf>, durability: Arc<DurabilityControl>) -> Result<Self> {
        let path = path.into();
        let (existing, len) = read_rows(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| HxError::Storage(format!("open {}: {e}", path.display())))?;
        if file.metadata()?.len() > len {
            file.set_len(len)?;
        }
        let next_id = existing.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        debug!(path = %path.display(), rows = existing.len(), "capture table opened");
        Ok(Self {
            path,
            durability,
            state: Mutex::new(JsonlState {
                file,
                len,
                next_id,
                count: existing.len(),
            }),
        })
    }

    fn truncate_to(&self, len: u64) -> io::Result<()> {
        OpenOptions::new().write(true).open(&self.path)?.set_len(len)
    }

    fn write_batch(&self, state: &mut JsonlState, buf: &[u8]) -> io::Result<()> {
        state.file.write_all(buf)?;
        state.file.flush()?;
        if self.durability.should_sync() {
            state.file.sync_data()?;
        }
        Ok(())
    }
}

impl CaptureTable for JsonlCaptureTable {
    fn append_batch(&self, mut rows: Vec<CaptureRow>) -> Result<Vec<u64>> {
        let mut state = self.state.lock();
        let ids = assign_ids(&mut rows, state.next_id);
        let mut buf = Vec::new();
        for row in &rows {
            serde_json::to_writer(&mut buf, row)?;
            buf.push(b'\n');
        }
        if let Err(e) = self.write_batch(&mut state, &buf) {
            self.truncate_to(state.len).map_err(|t| {
                HxError::Storage(format!("truncate {} after failed append: {t}", self.path.display()))
            })?;
            return Err(HxError::Storage(format!("append to {}: {e}", self.path.display())));
        }
        state.len += buf.len() as u64;
        state.next_id += rows.len() as u64;
        state.count += rows.len();
        Ok(ids)
    }

    fn get(&self, id: u64) -> Result<Option<CaptureRow>> {
        Ok(self.rows()?.into_iter().find(|r| r.id == id))
    }

    fn rows(&self) -> Result<Vec<CaptureRow>> {
        let _held = self.state.lock();
        Ok(read_rows(&self.path)?.0)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.state.lock().count)
    }
}
