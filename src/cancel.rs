use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation for downloads and migrations.
///
/// Clones share one flag. Workers check it between chunks or between file
/// copies and stop at the next boundary, so the filesystem is always left in
/// a defined non-committing state.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    /// Shared cancellation flag
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    ///
    /// Non-blocking. The worker observes it at its next chunk or file boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The underlying flag, for registration with signal handlers.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

/// Marks a single-job slot busy for as long as the guard lives.
///
/// Unlike a `MutexGuard` this can be moved into a worker thread, so a job can
/// be claimed synchronously by the caller and released by the worker.
#[derive(Debug)]
pub struct JobGuard {
    /// Slot released on drop
    busy: Arc<AtomicBool>,
}

impl JobGuard {
    /// Claim the slot, or `None` if another job holds it.
    pub fn try_claim(busy: &Arc<AtomicBool>) -> Option<Self> {
        busy.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self {
                busy: Arc::clone(busy),
            })
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}
