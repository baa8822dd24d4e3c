//! Per-job batch of rows awaiting commit.

use crate::table::{CaptureRow, CaptureTable};
use hx_core::Result;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Open,
    Committed,
    RolledBack,
}

/// Rows buffered by one import job. Nothing is visible in the table until
/// [`Transaction::commit`] succeeds.
#[derive(Debug)]
pub struct Transaction {
    id: String,
    pending: Vec<CaptureRow>,
    status: TransactionStatus,
}

impl Transaction {
    pub fn begin() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pending: Vec::new(),
            status: TransactionStatus::Open,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn push(&mut self, row: CaptureRow) {
        self.pending.push(row);
        self.status = TransactionStatus::Open;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Append the pending rows as one batch. On failure the rows are
    /// dropped and the transaction is rolled back.
    pub fn commit(&mut self, table: &dyn CaptureTable) -> Result<Vec<u64>> {
        let rows = std::mem::take(&mut self.pending);
        let count = rows.len();
        match table.append_batch(rows) {
            Ok(ids) => {
                self.status = TransactionStatus::Committed;
                debug!(txn = %self.id, rows = count, "batch committed");
                Ok(ids)
            }
            Err(e) => {
                self.status = TransactionStatus::RolledBack;
                warn!(txn = %self.id, rows = count, error = %e, "commit failed, batch rolled back");
                Err(e)
            }
        }
    }

    /// Drop the pending rows. Returns how many were discarded.
    pub fn rollback(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.status = TransactionStatus::RolledBack;
        if dropped > 0 {
            warn!(txn = %self.id, rows = dropped, "batch rolled back");
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{MemoryCaptureTable, MessageHashes};
    use hx_core::{Capture, Origin};

    fn row() -> CaptureRow {
        CaptureRow::new(Capture::empty(Origin::Repeater), MessageHashes::default())
    }

    #[test]
    fn test_rows_invisible_until_commit() {
        let table = MemoryCaptureTable::new();
        let mut txn = Transaction::begin();
        txn.push(row());
        txn.push(row());
        assert!(table.is_empty().unwrap());
        assert_eq!(txn.commit(&table).unwrap(), vec![1, 2]);
        assert_eq!(txn.status(), TransactionStatus::Committed);
        assert!(txn.is_empty());
        assert_eq!(table.len().unwrap(), 2);
    }

    #[test]
    fn test_rollback_discards_pending() {
        let table = MemoryCaptureTable::new();
        let mut txn = Transaction::begin();
        txn.push(row());
        assert_eq!(txn.rollback(), 1);
        assert_eq!(txn.status(), TransactionStatus::RolledBack);
        txn.commit(&table).unwrap();
        assert!(table.is_empty().unwrap());
    }

    #[test]
    fn test_transaction_ids_unique() {
        assert_ne!(Transaction::begin().id(), Transaction::begin().id());
    }
}
