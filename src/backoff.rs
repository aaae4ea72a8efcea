//! Reconnect scheduling
//!
//! The delay grows linearly by one step for every ten consecutive failed
//! attempts and is clamped into `[min, max]`. With the defaults that is 5 s
//! for the first ten attempts, 6 s for the next ten, and so on up to 60 s.

use crate::config::RealtimeConfig;
use crate::timer::TimerSlot;
use tokio::time::{Duration, Instant};

/// Owns the backoff state and the single outstanding reconnect timer.
#[derive(Debug)]
pub(crate) struct ReconnectController {
    min_delay: Duration,
    step: Duration,
    max_delay: Duration,
    attempt_count: u32,
    timer: TimerSlot,
}

impl ReconnectController {
    pub(crate) fn new(min_delay: Duration, step: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            step,
            max_delay,
            attempt_count: 0,
            timer: TimerSlot::new(),
        }
    }

    pub(crate) fn from_config(config: &RealtimeConfig) -> Self {
        Self::new(
            config.reconnect_min_delay,
            config.reconnect_step,
            config.reconnect_max_delay,
        )
    }

    pub(crate) fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Delay for the given number of previous failures
    pub(crate) fn delay_for(&self, attempt_count: u32) -> Duration {
        let grown = self
            .min_delay
            .saturating_add(self.step.saturating_mul(attempt_count / 10));
        grown.clamp(self.min_delay, self.max_delay.max(self.min_delay))
    }

    /// Arm the reconnect timer, replacing any pending one, and count the attempt
    pub(crate) fn schedule(&mut self, now: Instant) -> Duration {
        let delay = self.delay_for(self.attempt_count);
        self.timer.arm_at(now + delay);
        self.attempt_count = self.attempt_count.saturating_add(1);
        delay
    }

    /// A handshake succeeded
    pub(crate) fn reset(&mut self) {
        self.attempt_count = 0;
    }

    pub(crate) fn cancel(&mut self) {
        self.timer.cancel();
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self) -> bool {
        self.timer.is_armed()
    }

    /// Resolves when the pending reconnect is due; never resolves when idle
    pub(crate) async fn wait(&self) {
        self.timer.wait().await
    }
}
