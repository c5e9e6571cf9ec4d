//! Cooperative cancellation.
//!
//! A [`CancelToken`] is threaded through every operation that may block on
//! I/O. Implementations check the token at entry and before each disk access;
//! a tripped token surfaces as `Cancelled` (or `DeadlineExceeded` when a
//! deadline ran out) and any partial state is rolled back before the error
//! propagates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Result, TurError};

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Option<Arc<Inner>>,
}

struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that never cancels. Cheap to clone and pass around.
    pub fn none() -> Self {
        CancelToken { inner: None }
    }

    pub fn new() -> Self {
        CancelToken {
            inner: Some(Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: None,
            })),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        CancelToken {
            inner: Some(Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Some(deadline),
            })),
        }
    }

    /// Trip the token. All holders observe cancellation at their next check.
    pub fn cancel(&self) {
        if let Some(inner) = &self.inner {
            inner.cancelled.store(true, Ordering::Release);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.cancelled.load(Ordering::Acquire),
            None => false,
        }
    }

    /// Fail fast if cancelled or past the deadline.
    pub fn check(&self) -> Result<()> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        if inner.cancelled.load(Ordering::Acquire) {
            return Err(TurError::Cancelled);
        }
        if let Some(deadline) = inner.deadline {
            if Instant::now() >= deadline {
                return Err(TurError::DeadlineExceeded);
            }
        }
        Ok(())
    }
}
