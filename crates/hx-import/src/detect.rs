//! Picking the parser for a capture file.

use anyhow::{anyhow, Context};
use hx_core::Result;
use hx_parser::{builtin_formats, CaptureFormat};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// Bytes read from the start of a file for content sniffing.
pub const SNIFF_LEN: u64 = 4096;

/// Known capture formats, tried in registration order.
pub struct FormatRegistry {
    formats: Vec<Box<dyn CaptureFormat>>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self {
            formats: builtin_formats(),
        }
    }

    pub fn empty() -> Self {
        Self { formats: Vec::new() }
    }

    pub fn register(&mut self, format: Box<dyn CaptureFormat>) {
        self.formats.push(format);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.formats.iter().map(|f| f.name()).collect()
    }

    /// Choose a format by content first, then by extension.
    pub fn detect(&self, path: &Path) -> Result<&dyn CaptureFormat> {
        let head = read_head(path).with_context(|| format!("read {}", path.display()))?;
        if let Some(format) = self.formats.iter().find(|f| f.sniff(&head)) {
            debug!(path = %path.display(), format = format.name(), "format sniffed");
            return Ok(format.as_ref());
        }
        let name = path.to_string_lossy();
        if let Some(format) = self.formats.iter().find(|f| f.can_parse(&name)) {
            debug!(path = %path.display(), format = format.name(), "format chosen by extension");
            return Ok(format.as_ref());
        }
        Err(anyhow!("unrecognized capture format: {}", path.display()).into())
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn read_head(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(SNIFF_LEN as usize);
    File::open(path)?.take(SNIFF_LEN).read_to_end(&mut head)?;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn detect_name(name: &str, content: &[u8]) -> Result<&'static str> {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(name);
        std::fs::write(&path, content).unwrap();
        FormatRegistry::new().detect(&path).map(|f| f.name())
    }

    #[test]
    fn test_content_wins_over_extension() {
        let log = format!("{}\r\n1:00:00 PM  http://a.test\r\n", "=".repeat(54));
        assert_eq!(detect_name("capture.xml", log.as_bytes()).unwrap(), "log");
        assert_eq!(detect_name("report.txt", b"<?xml version=\"1.0\"?><issues/>").unwrap(), "issue report");
    }

    #[test]
    fn test_extension_fallback() {
        assert_eq!(detect_name("empty.burp", b"").unwrap(), "state");
        assert_eq!(detect_name("blank.log", b"\n\n").unwrap(), "log");
    }

    #[test]
    fn test_unrecognized() {
        let err = detect_name("notes.md", b"# hello").unwrap_err();
        assert!(err.to_string().contains("unrecognized capture format"));
    }

    #[test]
    fn test_registry_names() {
        let names = FormatRegistry::new().names();
        assert_eq!(names, vec!["state", "item export", "issue report", "scan report", "log"]);
        assert!(FormatRegistry::empty().names().is_empty());
    }
}
