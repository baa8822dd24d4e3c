//! Batched, all-or-nothing-per-batch writing of captures.

use crate::store::Store;
use crate::table::{CaptureRow, MessageHashes};
use crate::transaction::Transaction;
use hx_core::{Capture, HxError, Result};
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub committed: usize,
    pub batches: usize,
}

/// A write that stopped early. Batches committed before the error stay
/// durable; the open batch was rolled back.
#[derive(Debug)]
pub struct WriteFailure {
    pub committed: usize,
    pub error: HxError,
}

impl fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} committed records)", self.error, self.committed)
    }
}

impl std::error::Error for WriteFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Stores captures through a private [`Transaction`], committing every
/// `batch_size` records.
pub struct TransactionalWriter<'a> {
    store: &'a Store,
    batch_size: usize,
    txn: Transaction,
    summary: WriteSummary,
}

impl<'a> TransactionalWriter<'a> {
    pub fn new(store: &'a Store, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            txn: Transaction::begin(),
            summary: WriteSummary::default(),
        }
    }

    pub fn committed(&self) -> usize {
        self.summary.committed
    }

    /// Store the message blobs of `capture` and queue its row.
    pub fn append(&mut self, capture: Capture) -> Result<()> {
        let content = self.store.content();
        let hashes = MessageHashes {
            request_headers: content.insert(&capture.request.headers)?,
            request_body: content.insert(&capture.request.body)?,
            response_headers: content.insert(&capture.response.headers)?,
            response_body: content.insert(&capture.response.body)?,
        };
        self.txn.push(CaptureRow::new(capture, hashes));
        if self.txn.len() >= self.batch_size {
            self.commit()?;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.txn.is_empty() {
            return Ok(());
        }
        let ids = self.txn.commit(self.store.table().as_ref())?;
        self.summary.committed += ids.len();
        self.summary.batches += 1;
        debug!(
            txn = %self.txn.id(),
            rows = ids.len(),
            total = self.summary.committed,
            "capture batch committed"
        );
        Ok(())
    }

    /// Commit whatever is still pending.
    pub fn finish(mut self) -> Result<WriteSummary> {
        self.commit()?;
        Ok(self.summary)
    }

    /// Drop the open batch.
    pub fn rollback(&mut self) {
        self.txn.rollback();
    }

    /// Write every capture of `captures`, stopping at the first error.
    pub fn write_all<I>(mut self, captures: I) -> std::result::Result<WriteSummary, WriteFailure>
    where
        I: IntoIterator<Item = Result<Capture>>,
    {
        for item in captures {
            if let Err(error) = item.and_then(|capture| self.append(capture)) {
                self.rollback();
                warn!(committed = self.committed(), error = %error, "write stopped");
                return Err(WriteFailure {
                    committed: self.committed(),
                    error,
                });
            }
        }
        let committed = self.committed();
        self.finish().map_err(|error| WriteFailure { committed, error })
    }
}
