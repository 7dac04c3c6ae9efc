//! Cancellation and deadline propagation for blocking operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A cancellable execution context with an optional deadline.
///
/// Derived contexts share the cancellation flag with their parent; a child's
/// deadline can only tighten the parent's. Cancellation is idempotent.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl ExecContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a context whose deadline is at most `timeout` from now.
    /// A zero timeout leaves the deadline unchanged.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            return self.clone();
        }
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) => Some(existing.min(candidate)),
            None => Some(candidate),
        };
        Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn deadline_exceeded(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    /// True once the context has been cancelled or its deadline has passed.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.is_cancelled() || self.deadline_exceeded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_shared_and_idempotent() {
        let ctx = ExecContext::new();
        let child = ctx.with_timeout(Duration::from_secs(60));
        assert!(!child.should_stop());
        ctx.cancel();
        ctx.cancel();
        assert!(child.is_cancelled());
        assert!(child.should_stop());
    }

    #[test]
    fn deadline_only_tightens() {
        let ctx = ExecContext::new().with_timeout(Duration::from_millis(1));
        let child = ctx.with_timeout(Duration::from_secs(3600));
        std::thread::sleep(Duration::from_millis(5));
        assert!(child.deadline_exceeded());
    }

    #[test]
    fn zero_timeout_means_no_deadline() {
        let ctx = ExecContext::new().with_timeout(Duration::ZERO);
        assert!(!ctx.deadline_exceeded());
    }
}
