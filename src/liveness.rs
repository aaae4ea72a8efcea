//! Heartbeat liveness monitor
//!
//! While the connection is ready the monitor alternates between two phases:
//! waiting for the next ping to be due, and waiting for the pong to the ping
//! that was just sent. Only one of the two timers is ever armed, which is what
//! keeps a second ping from going out while a reply is still outstanding.

use crate::timer::TimerSlot;
use tokio::time::{Duration, Instant};

/// What the monitor wants the connection to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LivenessEvent {
    /// Time to send a ping
    PingDue,
    /// The outstanding ping was never answered
    PongTimedOut,
}

#[derive(Debug)]
pub(crate) struct LivenessMonitor {
    interval: Duration,
    timeout: Duration,
    next_ping: TimerSlot,
    pong_deadline: TimerSlot,
    last_keep_alive: Option<Instant>,
}

impl LivenessMonitor {
    pub(crate) fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            next_ping: TimerSlot::new(),
            pong_deadline: TimerSlot::new(),
            last_keep_alive: None,
        }
    }

    /// Begin heartbeating; called on entering the ready state
    pub(crate) fn start(&mut self, now: Instant) {
        self.pong_deadline.cancel();
        self.next_ping.arm_at(now + self.interval);
    }

    /// Cancel all timers; called on leaving the ready state
    pub(crate) fn stop(&mut self) {
        self.next_ping.cancel();
        self.pong_deadline.cancel();
        self.last_keep_alive = None;
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.next_ping.is_armed() || self.pong_deadline.is_armed()
    }

    #[cfg(test)]
    pub(crate) fn awaiting_pong(&self) -> bool {
        self.pong_deadline.is_armed()
    }

    pub(crate) fn ping_sent(&mut self, now: Instant) {
        self.next_ping.cancel();
        self.pong_deadline.arm_at(now + self.timeout);
    }

    /// A pong arrived. Returns false for a pong nobody asked for.
    pub(crate) fn pong_received(&mut self, now: Instant) -> bool {
        if !self.pong_deadline.is_armed() {
            return false;
        }
        self.pong_deadline.cancel();
        self.next_ping.arm_at(now + self.interval);
        true
    }

    pub(crate) fn keep_alive_received(&mut self, now: Instant) {
        self.last_keep_alive = Some(now);
    }

    pub(crate) fn last_keep_alive(&self) -> Option<Instant> {
        self.last_keep_alive
    }

    /// Resolves with the next due event. Never resolves while stopped.
    /// The caller must react (`ping_sent` or `stop`) before waiting again.
    pub(crate) async fn wait(&self) -> LivenessEvent {
        tokio::select! {
            _ = self.next_ping.wait() => LivenessEvent::PingDue,
            _ = self.pong_deadline.wait() => LivenessEvent::PongTimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> LivenessMonitor {
        LivenessMonitor::new(Duration::from_secs(20), Duration::from_secs(2))
    }

    #[test]
    fn test_new_monitor_is_idle() {
        let m = monitor();
        assert!(!m.is_running());
        assert!(!m.awaiting_pong());
    }

    #[test]
    fn test_ping_then_pong_rearms_interval() {
        let mut m = monitor();
        let now = Instant::now();

        m.start(now);
        assert_eq!(m.next_ping.deadline(), Some(now + Duration::from_secs(20)));

        m.ping_sent(now);
        assert!(m.awaiting_pong());
        assert!(!m.next_ping.is_armed());
        assert_eq!(m.pong_deadline.deadline(), Some(now + Duration::from_secs(2)));

        let later = now + Duration::from_millis(300);
        assert!(m.pong_received(later));
        assert!(!m.awaiting_pong());
        assert_eq!(
            m.next_ping.deadline(),
            Some(later + Duration::from_secs(20))
        );
    }

    #[test]
    fn test_unsolicited_pong_is_ignored() {
        let mut m = monitor();
        let now = Instant::now();
        m.start(now);

        assert!(!m.pong_received(now));
        assert_eq!(m.next_ping.deadline(), Some(now + Duration::from_secs(20)));
    }

    #[test]
    fn test_stop_cancels_everything() {
        let mut m = monitor();
        let now = Instant::now();
        m.start(now);
        m.ping_sent(now);
        m.keep_alive_received(now);

        m.stop();
        assert!(!m.is_running());
        assert!(m.last_keep_alive().is_none());
    }

    #[test]
    fn test_keep_alive_does_not_answer_ping() {
        let mut m = monitor();
        let now = Instant::now();
        m.start(now);
        m.ping_sent(now);

        m.keep_alive_received(now);
        assert!(m.awaiting_pong());
        assert_eq!(m.last_keep_alive(), Some(now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_reports_ping_due_then_timeout() {
        let mut m = monitor();
        m.start(Instant::now());

        assert_eq!(m.wait().await, LivenessEvent::PingDue);
        m.ping_sent(Instant::now());

        let sent = Instant::now();
        assert_eq!(m.wait().await, LivenessEvent::PongTimedOut);
        assert!(sent.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_monitor_never_fires() {
        let mut m = monitor();
        m.start(Instant::now());
        m.stop();

        let result = tokio::time::timeout(Duration::from_secs(3600), m.wait()).await;
        assert!(result.is_err());
    }
}
