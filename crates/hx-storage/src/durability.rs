//! Process-wide fsync policy shared by the storage backends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// fsync every blob and every committed batch.
    Full,
    /// Skip fsync; data reaches disk when the OS flushes it.
    Relaxed,
}

/// Reference-counted durability switch.
///
/// Any number of [`RelaxedGuard`]s may be alive at once; the level returns
/// to [`Durability::Full`] when the last one is dropped.
#[derive(Debug, Default)]
pub struct DurabilityControl {
    relaxed: AtomicUsize,
}

impl DurabilityControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn current(&self) -> Durability {
        if self.relaxed.load(Ordering::Acquire) == 0 {
            Durability::Full
        } else {
            Durability::Relaxed
        }
    }

    pub fn should_sync(&self) -> bool {
        self.current() == Durability::Full
    }

    pub fn relax(self: &Arc<Self>) -> RelaxedGuard {
        if self.relaxed.fetch_add(1, Ordering::AcqRel) == 0 {
            debug!("durability relaxed");
        }
        RelaxedGuard {
            control: Arc::clone(self),
        }
    }
}

/// Keeps durability relaxed while alive.
#[must_use = "durability is restored as soon as the guard is dropped"]
#[derive(Debug)]
pub struct RelaxedGuard {
    control: Arc<DurabilityControl>,
}

impl Drop for RelaxedGuard {
    fn drop(&mut self) {
        if self.control.relaxed.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug!("durability restored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_full() {
        let control = DurabilityControl::new();
        assert_eq!(control.current(), Durability::Full);
        assert!(control.should_sync());
    }

    #[test]
    fn test_nested_guards_restore_on_last_drop() {
        let control = DurabilityControl::new();
        let outer = control.relax();
        let inner = control.relax();
        assert_eq!(control.current(), Durability::Relaxed);
        drop(outer);
        assert_eq!(control.current(), Durability::Relaxed);
        drop(inner);
        assert_eq!(control.current(), Durability::Full);
    }

    #[test]
    fn test_restored_after_panic() {
        let control = DurabilityControl::new();
        let cloned = Arc::clone(&control);
        let result = std::panic::catch_unwind(move || {
            let _guard = cloned.relax();
            panic!("import blew up");
        });
        assert!(result.is_err());
        assert_eq!(control.current(), Durability::Full);
    }
}
