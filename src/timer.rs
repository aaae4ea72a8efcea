//! Cancellable, re-armable deadline

use std::future::pending;
use tokio::time::{sleep_until, Duration, Instant};

/// A slot holding at most one outstanding deadline.
///
/// Arming a slot that is already armed replaces the previous deadline, so a
/// slot can never fire twice for the same reason. `wait` never resolves while
/// the slot is empty.
#[derive(Debug, Default)]
pub(crate) struct TimerSlot {
    deadline: Option<Instant>,
}

impl TimerSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn arm_at(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    pub(crate) fn arm_in(&mut self, delay: Duration) {
        self.arm_at(Instant::now() + delay);
    }

    pub(crate) fn cancel(&mut self) {
        self.deadline = None;
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    #[cfg(test)]
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves when the deadline passes. Callers disarm the slot after it fires.
    pub(crate) async fn wait(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => pending().await,
        }
    }
}
