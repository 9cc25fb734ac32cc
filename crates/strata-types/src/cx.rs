//! Cooperative cancellation context.
//!
//! Every operation that performs file I/O or may block on a lock accepts a
//! `&Cx` and calls [`Cx::checkpoint`] before each I/O call and before each
//! lock retry. Cancellation is observed at the next checkpoint; it never
//! interrupts an in-flight syscall.
//!
//! Clones share cancellation state, so a handle kept by the caller can
//! cancel an operation running on another thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use strata_error::{Result, StrataError};

/// Cancellation context threaded through all blocking operations.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cx {
    /// Create a context that never cancels on its own.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context that additionally trips once `timeout` has elapsed.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Request cancellation. Idempotent; visible to all clones.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested (deadline included).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Check for cancellation at a yield point.
    ///
    /// Returns `Err(Cancelled)` once [`Self::cancel`] has been called or the
    /// deadline has passed, and `Ok(())` otherwise.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(StrataError::Cancelled);
        }
        Ok(())
    }
}
