//! When and whether to retry after the session drops.
//!
//! Two mechanisms exist and at most one is active:
//! - the immediate ladder, only after a handshake succeeded once, walks a fixed
//!   list of short delays;
//! - the passive probe fires periodically and triggers silent attempts.
//!
//! This type only does the bookkeeping. The owner turns the returned delays into
//! timers and cancels them whenever the state leaves the matching variant.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionState {
    Idle,
    ImmediateLadder { index: usize },
    PassiveScheduled,
}

#[derive(Debug, Clone)]
pub struct ReconnectionPolicy {
    delays: Vec<Duration>,
    jitter: Duration,
    passive_interval: Duration,
    state: ReconnectionState,
}

impl ReconnectionPolicy {
    pub fn new(delays: Vec<Duration>, jitter: Duration, passive_interval: Duration) -> Self {
        Self {
            delays,
            jitter,
            passive_interval,
            state: ReconnectionState::Idle,
        }
    }

    pub fn state(&self) -> ReconnectionState {
        self.state
    }

    /// Starts the ladder at its first step, or moves to the next one.
    ///
    /// Returns the delay before the next attempt, or `None` once the ladder is
    /// exhausted. Entering the ladder cancels a scheduled passive probe.
    pub fn advance_immediate(&mut self) -> Option<Duration> {
        let index = match self.state {
            ReconnectionState::ImmediateLadder { index } => index + 1,
            _ => 0,
        };
        let base = *self.delays.get(index)?;

        self.state = ReconnectionState::ImmediateLadder { index };
        Some(base + self.sample_jitter())
    }

    /// Schedules the passive probe and returns the delay before its first run.
    ///
    /// The first probe comes after half an interval, later ones after
    /// [`passive_interval`](Self::passive_interval).
    pub fn start_passive(&mut self) -> Duration {
        self.state = ReconnectionState::PassiveScheduled;
        self.passive_interval / 2
    }

    pub fn passive_interval(&self) -> Duration {
        self.passive_interval
    }

    pub fn is_passive(&self) -> bool {
        self.state == ReconnectionState::PassiveScheduled
    }

    /// Cancels both mechanisms; called after a successful handshake.
    pub fn reset(&mut self) {
        self.state = ReconnectionState::Idle;
    }

    fn sample_jitter(&self) -> Duration {
        let max = self.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: Duration) -> ReconnectionPolicy {
        ReconnectionPolicy::new(
            vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(10),
            ],
            jitter,
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_ladder_walks_delays_then_exhausts() {
        let mut policy = policy(Duration::ZERO);
        assert_eq!(policy.advance_immediate(), Some(Duration::from_secs(1)));
        assert_eq!(policy.advance_immediate(), Some(Duration::from_secs(5)));
        assert_eq!(policy.advance_immediate(), Some(Duration::from_secs(10)));
        assert_eq!(policy.advance_immediate(), None);
        assert_eq!(
            policy.state(),
            ReconnectionState::ImmediateLadder { index: 2 }
        );
    }

    #[test]
    fn test_reset_restarts_ladder_at_first_step() {
        let mut policy = policy(Duration::ZERO);
        policy.advance_immediate();
        policy.advance_immediate();
        policy.reset();
        assert_eq!(policy.state(), ReconnectionState::Idle);
        assert_eq!(policy.advance_immediate(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_jitter_stays_below_one_second() {
        let mut policy = policy(Duration::from_secs(1));
        for _ in 0..50 {
            policy.reset();
            let delay = policy.advance_immediate().unwrap();
            assert!(delay >= Duration::from_secs(1));
            assert!(delay < Duration::from_secs(2));
        }
    }

    #[test]
    fn test_mechanisms_are_mutually_exclusive() {
        let mut policy = policy(Duration::ZERO);
        assert_eq!(policy.start_passive(), Duration::from_secs(15));
        assert!(policy.is_passive());

        policy.advance_immediate();
        assert!(!policy.is_passive());
        assert_eq!(
            policy.state(),
            ReconnectionState::ImmediateLadder { index: 0 }
        );

        policy.start_passive();
        assert_eq!(policy.state(), ReconnectionState::PassiveScheduled);
    }
}
