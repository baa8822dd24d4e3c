//! Capture file parsing for hx
//!
//! Every format yields a lazy stream of [`RawCapture`] values; the
//! [`adapter`] turns those into the canonical [`hx_core::Capture`].

pub mod adapter;
pub mod datetime;
pub mod http;
pub mod log;
pub mod raw;
pub mod state;
pub mod traits;
pub mod xml;

pub use adapter::{adapt, NormalizeExt, Normalized};
pub use log::{LogFormat, LogParser};
pub use raw::RawCapture;
pub use state::{StateFormat, StateParser};
pub use traits::{CaptureFormat, CaptureStream};
pub use xml::{IssueReport, ItemExport, ScanReport, XmlFormat, XmlParser};

pub type ItemExportFormat = XmlFormat<ItemExport>;
pub type IssueReportFormat = XmlFormat<IssueReport>;
pub type ScanReportFormat = XmlFormat<ScanReport>;

/// All built-in formats, in detection order.
pub fn builtin_formats() -> Vec<Box<dyn CaptureFormat>> {
    vec![
        Box::new(StateFormat),
        Box::new(ItemExportFormat::new()),
        Box::new(IssueReportFormat::new()),
        Box::new(ScanReportFormat::new()),
        Box::new(LogFormat),
    ]
}
