//! Request registry: correlation ids, pending callers, and per-request timeouts.
//!
//! Every request is resolved exactly once. Resolution paths (matching
//! response, timeout, cancellation, teardown) all go through
//! [`RequestRegistry::resolve`], which removes the entry first; whichever path
//! runs second finds nothing and is a no-op.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::codec::Payload;
use crate::error::RequestError;

/// Outcome delivered to a request's caller.
pub type RequestResult = Result<Payload, RequestError>;

/// Monotonic correlation id source shared by every handle of one engine.
///
/// Ids start at 1 and never wrap in practice, so an id is never reissued
/// while its previous holder could still be pending.
#[derive(Debug)]
pub struct CorrelationIds {
    next: AtomicU64,
}

impl CorrelationIds {
    /// Create a generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unused id.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Bookkeeping for one outstanding request.
#[derive(Debug)]
pub struct PendingRequest {
    /// Correlation id.
    pub id: u64,
    /// Event name, for diagnostics.
    pub event: String,
    /// When the request was registered.
    pub created_at: Instant,
    /// When its timeout fires, if it has one.
    pub deadline: Option<Instant>,
    /// Whether the envelope has been written to a socket.
    pub transmitted: bool,
    reply: oneshot::Sender<RequestResult>,
}

/// Tracks pending requests and their deadlines.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    pending: HashMap<u64, PendingRequest>,
    deadlines: BTreeSet<(Instant, u64)>,
}

impl RequestRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new pending request.
    pub fn register(
        &mut self,
        id: u64,
        event: impl Into<String>,
        deadline: Option<Instant>,
        reply: oneshot::Sender<RequestResult>,
    ) {
        if let Some(at) = deadline {
            self.deadlines.insert((at, id));
        }
        let request = PendingRequest {
            id,
            event: event.into(),
            created_at: Instant::now(),
            deadline,
            transmitted: false,
            reply,
        };
        if let Some(stale) = self.pending.insert(id, request) {
            tracing::warn!(correlation_id = id, "Correlation id reused, superseding stale request");
            if let Some(at) = stale.deadline {
                self.deadlines.remove(&(at, id));
            }
            let _ = stale.reply.send(Err(RequestError::Cancelled));
        }
    }

    /// Note that the request's envelope reached the socket.
    pub fn mark_transmitted(&mut self, id: u64) {
        if let Some(request) = self.pending.get_mut(&id) {
            request.transmitted = true;
        }
    }

    /// Whether `id` is still pending.
    pub fn contains(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    /// Look up a pending request.
    pub fn get(&self, id: u64) -> Option<&PendingRequest> {
        self.pending.get(&id)
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|(at, _)| *at)
    }

    /// Resolve and remove a request. Returns the removed entry's metadata, or
    /// `None` if it was already resolved.
    pub fn resolve(&mut self, id: u64, outcome: RequestResult) -> Option<ResolvedRequest> {
        let request = self.pending.remove(&id)?;
        if let Some(at) = request.deadline {
            self.deadlines.remove(&(at, id));
        }
        let delivered = request.reply.send(outcome).is_ok();
        Some(ResolvedRequest {
            id,
            event: request.event,
            elapsed: request.created_at.elapsed(),
            delivered,
        })
    }

    /// Resolve every request whose deadline is at or before `now` with
    /// [`RequestError::Timeout`]. Returns the expired ids, earliest first.
    pub fn expire(&mut self, now: Instant) -> Vec<u64> {
        let mut expired = Vec::new();
        while let Some(&(at, id)) = self.deadlines.first() {
            if at > now {
                break;
            }
            self.deadlines.remove(&(at, id));
            if self.resolve(id, Err(RequestError::Timeout)).is_some() {
                expired.push(id);
            }
        }
        expired
    }

    /// Resolve every request already written to a socket with `error`.
    /// Requests still queued are left alone.
    pub fn fail_transmitted(&mut self, error: &RequestError) -> Vec<u64> {
        let ids: Vec<u64> = self
            .pending
            .values()
            .filter(|r| r.transmitted)
            .map(|r| r.id)
            .collect();
        self.fail(ids, error)
    }

    /// Resolve every pending request with `error`.
    pub fn fail_all(&mut self, error: &RequestError) -> Vec<u64> {
        let ids: Vec<u64> = self.pending.keys().copied().collect();
        self.fail(ids, error)
    }

    fn fail(&mut self, mut ids: Vec<u64>, error: &RequestError) -> Vec<u64> {
        ids.sort_unstable();
        for &id in &ids {
            self.resolve(id, Err(error.clone()));
        }
        ids
    }
}

/// Metadata of a request that was just resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRequest {
    /// Correlation id.
    pub id: u64,
    /// Event name.
    pub event: String,
    /// Time from registration to resolution.
    pub elapsed: std::time::Duration,
    /// Whether the caller was still listening.
    pub delivered: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn register(
        registry: &mut RequestRegistry,
        id: u64,
        deadline: Option<Instant>,
    ) -> oneshot::Receiver<RequestResult> {
        let (tx, rx) = oneshot::channel();
        registry.register(id, "echo", deadline, tx);
        rx
    }

    #[test]
    fn test_ids_are_monotonic_from_one() {
        let ids = CorrelationIds::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }

    #[test]
    fn test_response_resolves_caller() {
        let mut registry = RequestRegistry::new();
        let mut rx = register(&mut registry, 1, None);

        let resolved = registry.resolve(1, Ok(Payload::from_bytes(vec![7])));
        assert!(resolved.is_some_and(|r| r.delivered));
        assert_eq!(rx.try_recv().unwrap(), Ok(Payload::from_bytes(vec![7])));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_second_resolution_is_noop() {
        let mut registry = RequestRegistry::new();
        let mut rx = register(&mut registry, 1, None);

        assert!(registry.resolve(1, Err(RequestError::Cancelled)).is_some());
        assert!(registry.resolve(1, Ok(Payload::empty())).is_none());
        assert_eq!(rx.try_recv().unwrap(), Err(RequestError::Cancelled));
    }

    #[test]
    fn test_timeout_expires_only_due_requests() {
        let mut registry = RequestRegistry::new();
        let t0 = Instant::now();
        let mut early = register(&mut registry, 1, Some(t0 + Duration::from_millis(50)));
        let _late = register(&mut registry, 2, Some(t0 + Duration::from_millis(500)));
        let _none = register(&mut registry, 3, None);

        assert_eq!(registry.next_deadline(), Some(t0 + Duration::from_millis(50)));
        assert_eq!(registry.expire(t0 + Duration::from_millis(50)), vec![1]);
        assert_eq!(early.try_recv().unwrap(), Err(RequestError::Timeout));
        assert!(!registry.contains(1));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.next_deadline(), Some(t0 + Duration::from_millis(500)));
    }

    #[test]
    fn test_response_clears_deadline() {
        let mut registry = RequestRegistry::new();
        let t0 = Instant::now();
        let _rx = register(&mut registry, 1, Some(t0 + Duration::from_millis(50)));

        registry.resolve(1, Ok(Payload::empty()));
        assert_eq!(registry.next_deadline(), None);
        assert!(registry.expire(t0 + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_fail_transmitted_keeps_queued() {
        let mut registry = RequestRegistry::new();
        let mut sent = register(&mut registry, 1, None);
        let _queued = register(&mut registry, 2, None);
        registry.mark_transmitted(1);

        assert_eq!(registry.fail_transmitted(&RequestError::ConnectionLost), vec![1]);
        assert_eq!(sent.try_recv().unwrap(), Err(RequestError::ConnectionLost));
        assert!(registry.contains(2));
    }

    #[test]
    fn test_fail_all_resolves_everything() {
        let mut registry = RequestRegistry::new();
        let mut a = register(&mut registry, 1, Some(Instant::now()));
        let mut b = register(&mut registry, 2, None);

        assert_eq!(registry.fail_all(&RequestError::NotConnected), vec![1, 2]);
        assert_eq!(a.try_recv().unwrap(), Err(RequestError::NotConnected));
        assert_eq!(b.try_recv().unwrap(), Err(RequestError::NotConnected));
        assert!(registry.is_empty());
        assert_eq!(registry.next_deadline(), None);
    }

    #[test]
    fn test_dropped_caller_is_not_delivered() {
        let mut registry = RequestRegistry::new();
        drop(register(&mut registry, 1, None));
        let resolved = registry.resolve(1, Ok(Payload::empty())).unwrap();
        assert!(!resolved.delivered);
    }
}
