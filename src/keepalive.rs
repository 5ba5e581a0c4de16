use log::debug;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// What a liveness deadline asks the connection manager to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LivenessAction {
    /// Nothing was heard for a while; send a ping.
    Ping,
    /// A ping went unanswered; force a disconnect.
    Expired,
}

/// The keepalive and ping-expiry deadlines.
///
/// Any inbound traffic calls [`reset`](Self::reset), which cancels a running
/// ping expiry and schedules the next keepalive somewhere in
/// `[interval - window, interval + window]`.
#[derive(Debug)]
pub(crate) struct LivenessTimers {
    keepalive_interval: Duration,
    keepalive_window: Duration,
    ping_expiry: Duration,
    next_keepalive: Option<Instant>,
    expiry: Option<Instant>,
}

impl LivenessTimers {
    pub(crate) fn new(
        keepalive_interval: Duration,
        keepalive_window: Duration,
        ping_expiry: Duration,
    ) -> Self {
        Self {
            keepalive_interval,
            keepalive_window,
            ping_expiry,
            next_keepalive: None,
            expiry: None,
        }
    }

    pub(crate) fn reset(&mut self, now: Instant) {
        self.expiry = None;
        let window_ms = self.keepalive_window.as_millis() as u64;
        let spread = if window_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=window_ms * 2)
        };
        let delay = self.keepalive_interval - self.keepalive_window + Duration::from_millis(spread);
        self.next_keepalive = Some(now + delay);
    }

    pub(crate) fn cancel(&mut self) {
        self.next_keepalive = None;
        self.expiry = None;
    }

    /// Arms the expiry deadline after a ping went out.
    pub(crate) fn ping_sent(&mut self, now: Instant) {
        self.expiry = Some(now + self.ping_expiry);
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        match (self.next_keepalive, self.expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Returns the action that is due, clearing its deadline.
    pub(crate) fn poll(&mut self, now: Instant) -> Option<LivenessAction> {
        if self.expiry.is_some_and(|at| at <= now) {
            self.expiry = None;
            return Some(LivenessAction::Expired);
        }
        if self.next_keepalive.is_some_and(|at| at <= now) {
            self.next_keepalive = None;
            debug!(target: "Relay/Keepalive", "Keepalive interval elapsed without traffic");
            return Some(LivenessAction::Ping);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timers() -> LivenessTimers {
        LivenessTimers::new(
            Duration::from_secs(20 * 60),
            Duration::from_secs(5 * 60),
            Duration::from_secs(40),
        )
    }

    #[test]
    fn test_keepalive_lands_inside_window() {
        let start = Instant::now();
        let mut timers = timers();
        for _ in 0..20 {
            timers.reset(start);
            let at = timers.next_deadline().unwrap();
            assert!(at >= start + Duration::from_secs(15 * 60));
            assert!(at <= start + Duration::from_secs(25 * 60));
        }
    }

    #[test]
    fn test_ping_then_expiry() {
        let start = Instant::now();
        let mut timers = timers();
        timers.reset(start);

        let due = timers.next_deadline().unwrap();
        assert_eq!(timers.poll(due - Duration::from_millis(1)), None);
        assert_eq!(timers.poll(due), Some(LivenessAction::Ping));

        timers.ping_sent(due);
        assert_eq!(timers.next_deadline(), Some(due + Duration::from_secs(40)));
        assert_eq!(
            timers.poll(due + Duration::from_secs(40)),
            Some(LivenessAction::Expired)
        );
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_traffic_cancels_expiry() {
        let start = Instant::now();
        let mut timers = timers();
        timers.ping_sent(start);
        timers.reset(start + Duration::from_secs(1));

        assert_eq!(timers.poll(start + Duration::from_secs(41)), None);
        assert!(timers.next_deadline().unwrap() > start + Duration::from_secs(60));
    }

    #[test]
    fn test_cancel_clears_everything() {
        let start = Instant::now();
        let mut timers = timers();
        timers.reset(start);
        timers.ping_sent(start);
        timers.cancel();
        assert_eq!(timers.next_deadline(), None);
    }
}
