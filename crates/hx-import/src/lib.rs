//! File import jobs for hx.

pub mod detect;
pub mod importer;

pub use detect::{FormatRegistry, SNIFF_LEN};
pub use importer::{ImportFailure, ImportReport, Importer, RunReport};
