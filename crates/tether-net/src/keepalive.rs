//! Keep-alive monitor: inbound-silence tracking and heartbeat probes.
//!
//! The monitor is a pure state machine driven by the connection manager's
//! event loop. It is polled at [`KeepAlive::next_poll`]; every inbound frame
//! resets the silence clock. One probe is allowed per silence window, and the
//! poll after a probe is pulled in so it lands no later than the abort
//! deadline.

use std::time::Duration;

use tokio::time::Instant;

/// Keep-alive thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// Regular poll interval. Default: 1 s.
    pub poll_interval: Duration,
    /// Silence after which a heartbeat probe is sent. Default: 15 s.
    pub warn_after: Duration,
    /// Silence after which the connection is declared dead. Default: 20 s.
    pub abort_after: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            warn_after: Duration::from_secs(15),
            abort_after: Duration::from_secs(20),
        }
    }
}

/// Outcome of a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    /// Traffic is recent enough; nothing to do.
    Idle,
    /// Send one heartbeat probe.
    Probe,
    /// Silence exceeded the abort threshold; force-close the socket.
    Expired {
        /// How long the link has been silent.
        silence: Duration,
    },
}

/// Tracks inbound traffic recency for one open socket.
#[derive(Debug)]
pub struct KeepAlive {
    config: KeepAliveConfig,
    last_inbound: Instant,
    probe_sent_at: Option<Instant>,
    next_poll: Option<Instant>,
    last_rtt: Option<Duration>,
}

impl KeepAlive {
    /// Create a stopped monitor.
    pub fn new(config: KeepAliveConfig) -> Self {
        Self {
            config,
            last_inbound: Instant::now(),
            probe_sent_at: None,
            next_poll: None,
            last_rtt: None,
        }
    }

    /// Start monitoring a freshly opened socket.
    pub fn start(&mut self, now: Instant) {
        self.last_inbound = now;
        self.probe_sent_at = None;
        self.next_poll = Some(now + self.config.poll_interval);
    }

    /// Stop monitoring. [`next_poll`](Self::next_poll) returns `None` until restarted.
    pub fn stop(&mut self) {
        self.next_poll = None;
        self.probe_sent_at = None;
    }

    /// Whether the monitor is running.
    pub fn is_running(&self) -> bool {
        self.next_poll.is_some()
    }

    /// When the event loop should call [`poll`](Self::poll) next.
    pub fn next_poll(&self) -> Option<Instant> {
        self.next_poll
    }

    /// Any inbound byte resets the silence clock.
    pub fn record_inbound(&mut self, now: Instant) {
        self.last_inbound = now;
    }

    /// A heartbeat response arrived. Returns the probe round-trip time if a
    /// probe was outstanding.
    pub fn record_pong(&mut self, now: Instant) -> Option<Duration> {
        self.last_inbound = now;
        let rtt = self.probe_sent_at.take().map(|sent| now - sent);
        if rtt.is_some() {
            self.last_rtt = rtt;
        }
        rtt
    }

    /// Most recent probe round-trip time.
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Evaluate silence at `now` and schedule the next poll.
    pub fn poll(&mut self, now: Instant) -> KeepAliveAction {
        if self.next_poll.is_none() {
            return KeepAliveAction::Idle;
        }

        let silence = now.saturating_duration_since(self.last_inbound);
        if silence >= self.config.abort_after {
            self.stop();
            return KeepAliveAction::Expired { silence };
        }

        let until_abort = self.config.abort_after - silence;
        let probe_outstanding = self
            .probe_sent_at
            .is_some_and(|sent| sent >= self.last_inbound);

        if silence >= self.config.warn_after && !probe_outstanding {
            self.probe_sent_at = Some(now);
            self.next_poll = Some(now + self.config.poll_interval.min(until_abort));
            return KeepAliveAction::Probe;
        }

        self.next_poll = Some(now + self.config.poll_interval.min(until_abort));
        KeepAliveAction::Idle
    }
}
