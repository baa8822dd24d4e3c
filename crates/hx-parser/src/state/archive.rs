//! Locating and streaming the state entry inside its zip container.

use flate2::read::DeflateDecoder;
use hx_core::{HxError, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use zip::{CompressionMethod, ZipArchive};

pub const ENTRY_NAME: &str = "burp";

struct EntryLocation {
    data_start: u64,
    compressed_size: u64,
    method: CompressionMethod,
}

fn locate(path: &Path) -> Result<EntryLocation> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| HxError::Archive(format!("{}: {e}", path.display())))?;
    let entry = archive
        .by_name(ENTRY_NAME)
        .map_err(|e| HxError::Archive(format!("{}: entry {ENTRY_NAME}: {e}", path.display())))?;
    Ok(EntryLocation {
        data_start: entry.data_start(),
        compressed_size: entry.compressed_size(),
        method: entry.compression(),
    })
}

/// Open the state entry as a byte stream.
///
/// The archive directory is read once to find the entry; the entry data is
/// then read straight from a fresh handle so it is never held in memory.
pub fn open_entry(path: &Path) -> Result<Box<dyn Read + Send>> {
    let location = locate(path)?;
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(location.data_start))?;
    let data = file.take(location.compressed_size);
    match location.method {
        CompressionMethod::Stored => Ok(Box::new(data)),
        CompressionMethod::Deflated => Ok(Box::new(DeflateDecoder::new(data))),
        other => Err(HxError::Archive(format!("unsupported compression {other:?}"))),
    }
}
