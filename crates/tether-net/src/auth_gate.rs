//! Authorization gate: holds outbound application traffic until the
//! post-connect handshake succeeds.
//!
//! Lifecycle per socket: `Locked` on open → `Authorized` on the auth-accepted
//! control frame. While locked, envelopes are queued strictly FIFO. Authorizing
//! drains the queue in enqueue order. A queued envelope can be withdrawn by its
//! correlation id (cancel or timeout before flush).

use std::collections::VecDeque;

use crate::codec::OutboundEnvelope;

/// Authorization state of the current socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Handshake not yet completed; application traffic is queued.
    Locked,
    /// Handshake succeeded; application traffic flows directly.
    Authorized,
}

/// What [`AuthGate::admit`] did with an envelope.
#[derive(Debug, PartialEq)]
pub enum Admission {
    /// Authorized: transmit it now.
    Send(OutboundEnvelope),
    /// Locked: queued at the given position (0-based).
    Queued(usize),
}

/// FIFO buffer for envelopes sent while unauthorized.
#[derive(Debug)]
pub struct AuthGate {
    state: GateState,
    queue: VecDeque<OutboundEnvelope>,
}

impl Default for AuthGate {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthGate {
    /// Create a locked, empty gate.
    pub fn new() -> Self {
        Self {
            state: GateState::Locked,
            queue: VecDeque::new(),
        }
    }

    /// Current authorization state.
    pub fn state(&self) -> GateState {
        self.state
    }

    /// Whether application traffic may be sent directly.
    pub fn is_authorized(&self) -> bool {
        self.state == GateState::Authorized
    }

    /// Revoke authorization. Queued envelopes are kept.
    pub fn lock(&mut self) {
        self.state = GateState::Locked;
    }

    /// Pass an envelope through the gate or queue it.
    pub fn admit(&mut self, envelope: OutboundEnvelope) -> Admission {
        match self.state {
            GateState::Authorized => Admission::Send(envelope),
            GateState::Locked => {
                self.queue.push_back(envelope);
                Admission::Queued(self.queue.len() - 1)
            }
        }
    }

    /// Mark the gate authorized and hand back everything queued, oldest first.
    pub fn authorize(&mut self) -> Vec<OutboundEnvelope> {
        self.state = GateState::Authorized;
        self.queue.drain(..).collect()
    }

    /// Put envelopes that could not be flushed back at the head of the queue,
    /// ahead of anything queued since, preserving their relative order.
    pub fn requeue_front(&mut self, envelopes: impl IntoIterator<Item = OutboundEnvelope>) {
        let mut restored: VecDeque<_> = envelopes.into_iter().collect();
        restored.append(&mut self.queue);
        self.queue = restored;
        self.state = GateState::Locked;
    }

    /// Remove a not-yet-flushed envelope by correlation id.
    pub fn withdraw(&mut self, correlation_id: u64) -> Option<OutboundEnvelope> {
        let pos = self
            .queue
            .iter()
            .position(|env| env.correlation_id == Some(correlation_id))?;
        self.queue.remove(pos)
    }

    /// Drop every queued envelope and lock the gate, returning the ids removed.
    pub fn clear(&mut self) -> Vec<u64> {
        self.state = GateState::Locked;
        self.queue
            .drain(..)
            .filter_map(|env| env.correlation_id)
            .collect()
    }

    /// Number of queued envelopes.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Payload;

    fn env(id: u64) -> OutboundEnvelope {
        OutboundEnvelope::request(id, format!("ev{id}"), Payload::empty())
    }

    fn ids(envs: &[OutboundEnvelope]) -> Vec<u64> {
        envs.iter().filter_map(|e| e.correlation_id).collect()
    }

    #[test]
    fn test_new_gate_is_locked() {
        let gate = AuthGate::new();
        assert_eq!(gate.state(), GateState::Locked);
        assert_eq!(gate.queued(), 0);
    }

    #[test]
    fn test_locked_gate_queues_in_order() {
        let mut gate = AuthGate::new();
        assert_eq!(gate.admit(env(1)), Admission::Queued(0));
        assert_eq!(gate.admit(env(2)), Admission::Queued(1));
        assert_eq!(gate.admit(env(3)), Admission::Queued(2));

        let flushed = gate.authorize();
        assert_eq!(ids(&flushed), vec![1, 2, 3]);
        assert!(gate.is_authorized());
        assert_eq!(gate.queued(), 0);
    }

    #[test]
    fn test_authorized_gate_passes_through() {
        let mut gate = AuthGate::new();
        gate.authorize();
        assert_eq!(gate.admit(env(9)), Admission::Send(env(9)));
    }

    #[test]
    fn test_lock_keeps_queue() {
        let mut gate = AuthGate::new();
        gate.admit(env(1));
        gate.lock();
        assert_eq!(gate.queued(), 1);
    }

    #[test]
    fn test_withdraw_removes_only_target() {
        let mut gate = AuthGate::new();
        gate.admit(env(1));
        gate.admit(env(2));
        gate.admit(env(3));

        assert_eq!(gate.withdraw(2), Some(env(2)));
        assert_eq!(gate.withdraw(2), None);
        assert_eq!(ids(&gate.authorize()), vec![1, 3]);
    }

    #[test]
    fn test_requeue_front_preserves_order() {
        let mut gate = AuthGate::new();
        gate.admit(env(1));
        gate.admit(env(2));
        let mut flushed = gate.authorize();
        let unsent = flushed.split_off(1);

        gate.lock();
        gate.admit(env(3));
        gate.requeue_front(unsent);
        assert_eq!(ids(&gate.authorize()), vec![2, 3]);
    }

    #[test]
    fn test_clear_returns_ids_and_locks() {
        let mut gate = AuthGate::new();
        gate.admit(env(4));
        gate.admit(env(5));
        assert_eq!(gate.clear(), vec![4, 5]);
        assert_eq!(gate.queued(), 0);
        assert!(!gate.is_authorized());
    }
}
