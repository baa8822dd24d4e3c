//! hx storage layer.

pub mod blob;
pub mod content;
pub mod durability;
pub mod store;
pub mod table;
pub mod transaction;
pub mod writer;

pub use blob::{BlobBackend, FsBlobBackend, MemoryBlobBackend, PutOutcome};
pub use content::{content_hash, ContentStats, ContentStore, EMPTY_HASH};
pub use durability::{Durability, DurabilityControl, RelaxedGuard};
pub use store::Store;
pub use table::{CaptureRow, CaptureTable, JsonlCaptureTable, MemoryCaptureTable, MessageHashes};
pub use transaction::{Transaction, TransactionStatus};
pub use writer::{TransactionalWriter, WriteFailure, WriteSummary};
