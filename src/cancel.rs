use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation flag for one measurement run.
///
/// Clones share the flag, so a handler thread (e.g. Ctrl+C) can cancel a run
/// executing elsewhere. The sweep polls it once per inner iteration.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing shutdown flag
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag before the next run
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
