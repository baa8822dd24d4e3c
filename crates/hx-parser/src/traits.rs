use crate::raw::RawCapture;
use hx_core::Result;
use std::path::Path;

/// Boxed record stream returned by [`CaptureFormat::open`].
pub type CaptureStream = Box<dyn Iterator<Item = Result<RawCapture>> + Send>;

/// Trait for capture file formats.
pub trait CaptureFormat: Send + Sync {
    /// Short name used in logs and reports.
    fn name(&self) -> &'static str;

    /// Open a file as a lazy record stream.
    fn open(&self, path: &Path) -> Result<CaptureStream>;

    /// Supported file extensions.
    fn supported_extensions(&self) -> Vec<String>;

    /// Check the first bytes of a file.
    fn sniff(&self, head: &[u8]) -> bool;

    /// Check if a file can be parsed, by extension.
    fn can_parse(&self, path: &str) -> bool {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let ext_with_dot = format!(".{}", ext);
        self.supported_extensions().contains(&ext_with_dot)
    }
}
