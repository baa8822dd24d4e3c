pub mod capture;
pub mod config;
pub mod error;

pub use capture::{Capture, Extras, Message, Origin};
pub use config::{ErrorPolicy, HxConfig, ImportConfig, StorageBackend, StorageConfig};
pub use error::{HxError, Result};
