//! Reconnect backoff: a fixed, increasing delay sequence with a terminal cap.
//!
//! After a connection failure the connection manager asks [`Backoff::on_failure`]
//! what to do. While fewer than `max_attempts` consecutive failures have been
//! retried it answers [`BackoffDecision::Retry`] with the delay for that
//! attempt; once the cap is reached it answers [`BackoffDecision::Abort`].
//! Indexes past the end of the sequence repeat its last value.

use std::time::Duration;

use rand::Rng;

/// Delay used when the configured sequence is empty.
const FALLBACK_DELAY: Duration = Duration::from_secs(1);

/// Configuration for reconnect scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Ordered delays for attempts 0, 1, 2, ... Default: 1 s, 2 s, 5 s, 10 s.
    pub delays: Vec<Duration>,
    /// Consecutive failures tolerated before giving up. Default: 5.
    pub max_attempts: u32,
    /// Jitter factor (0.0–1.0) applied as ±jitter to each delay. Default: 0.0.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(10),
            ],
            max_attempts: 5,
            jitter: 0.0,
        }
    }
}

/// What to do after a connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Reconnect after `delay`. `attempt` is 1-based.
    Retry {
        /// Which retry this is.
        attempt: u32,
        /// How long to wait before it.
        delay: Duration,
    },
    /// The cap is exhausted; stop reconnecting.
    Abort {
        /// Retries made before giving up.
        attempts: u32,
    },
}

/// Tracks consecutive failed attempts.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Create a scheduler with no failures recorded.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Decide the next step and advance the attempt counter on retry.
    pub fn on_failure(&mut self) -> BackoffDecision {
        if self.attempt >= self.config.max_attempts {
            return BackoffDecision::Abort {
                attempts: self.attempt,
            };
        }

        let delay = self.jittered(self.base_delay(self.attempt));
        self.attempt += 1;
        BackoffDecision::Retry {
            attempt: self.attempt,
            delay,
        }
    }

    /// Un-jittered delay for a 0-based attempt index.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let delays = &self.config.delays;
        let index = (attempt as usize).min(delays.len().saturating_sub(1));
        delays.get(index).copied().unwrap_or(FALLBACK_DELAY)
    }

    fn jittered(&self, base: Duration) -> Duration {
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor)
    }

    /// Forget past failures (called on every successful open).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive retries scheduled since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_sequence_follows_configured_delays() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let delays: Vec<_> = (0..5)
            .map(|_| match backoff.on_failure() {
                BackoffDecision::Retry { delay, .. } => delay,
                BackoffDecision::Abort { .. } => panic!("aborted early"),
            })
            .collect();
        assert_eq!(delays, vec![secs(1), secs(2), secs(5), secs(10), secs(10)]);
    }

    #[test]
    fn test_abort_after_cap() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        for expected in 1..=5 {
            assert!(matches!(
                backoff.on_failure(),
                BackoffDecision::Retry { attempt, .. } if attempt == expected
            ));
        }
        assert_eq!(backoff.on_failure(), BackoffDecision::Abort { attempts: 5 });
        // Stays aborted until reset.
        assert_eq!(backoff.on_failure(), BackoffDecision::Abort { attempts: 5 });
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        backoff.on_failure();
        backoff.on_failure();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(
            backoff.on_failure(),
            BackoffDecision::Retry {
                attempt: 1,
                delay: secs(1)
            }
        );
    }

    #[test]
    fn test_last_delay_repeats() {
        let backoff = Backoff::new(BackoffConfig::default());
        assert_eq!(backoff.base_delay(3), secs(10));
        assert_eq!(backoff.base_delay(50), secs(10));
    }

    #[test]
    fn test_empty_sequence_falls_back() {
        let backoff = Backoff::new(BackoffConfig {
            delays: vec![],
            ..Default::default()
        });
        assert_eq!(backoff.base_delay(0), FALLBACK_DELAY);
    }

    #[test]
    fn test_zero_cap_aborts_immediately() {
        let mut backoff = Backoff::new(BackoffConfig {
            max_attempts: 0,
            ..Default::default()
        });
        assert_eq!(backoff.on_failure(), BackoffDecision::Abort { attempts: 0 });
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(BackoffConfig {
            jitter: 0.25,
            max_attempts: 100,
            ..Default::default()
        });
        for _ in 0..20 {
            backoff.reset();
            let BackoffDecision::Retry { delay, .. } = backoff.on_failure() else {
                panic!("expected retry");
            };
            assert!(delay >= Duration::from_millis(749) && delay <= Duration::from_millis(1251));
        }
    }
}
