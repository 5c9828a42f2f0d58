//! Cooperative cancellation and deadlines for pipeline runs.

use nanoquant_core::{NanoquantError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cancellation token shared between a caller and a running pipeline.
///
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The run stops at its next checkpoint.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Checkpoint guard for one run: cancellation plus an optional deadline.
#[derive(Debug, Clone)]
pub struct RunControl {
    token: CancellationToken,
    started: Instant,
    deadline: Option<Duration>,
}

impl RunControl {
    #[must_use]
    pub fn new(token: CancellationToken, deadline: Option<Duration>) -> Self {
        Self {
            token,
            started: Instant::now(),
            deadline,
        }
    }

    /// A control that never stops the run.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(CancellationToken::new(), None)
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Fail if the run was cancelled or its deadline has passed.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(NanoquantError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            let elapsed = self.elapsed();
            if elapsed >= deadline {
                return Err(NanoquantError::DeadlineExceeded(elapsed));
            }
        }
        Ok(())
    }
}
