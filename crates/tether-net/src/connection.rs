//! Connection manager: the single event loop that owns the socket.
//!
//! One engine task processes host commands, socket events, and timer
//! firings strictly one at a time, so no engine state is ever shared or
//! locked. Every physical socket gets a new generation number; events from
//! a socket that is no longer current are ignored.
//!
//! Status lifecycle:
//!
//! ```text
//! Closed ──connect──► Connecting ──opened──► Open
//!   ▲                     │                   │
//!   └──── backoff ◄─── Closed ◄──── lost ─────┘
//!                         │
//!                   cap reached ──► Aborted
//! any ──disconnect──► UserClosed     any ──terminate──► Terminated
//! Open ──duplicate──► Duplicated
//! ```

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::auth_gate::{Admission, AuthGate};
use crate::backoff::{Backoff, BackoffDecision};
use crate::client::{ClientConfig, Command};
use crate::codec::{
    CANCEL_EVENT, ControlSignal, DUPLICATE_SESSION_CLOSE_CODE, Decoded, NORMAL_CLOSE_CODE,
    OutboundEnvelope, Payload, decode, encode_envelope,
};
use crate::dispatcher::{Dispatcher, Route};
use crate::error::RequestError;
use crate::keepalive::{KeepAlive, KeepAliveAction};
use crate::notification::{Notification, Notifier};
use crate::registry::{RequestRegistry, RequestResult};
use crate::transport::{Connector, SocketEvent, SocketEvents, SocketLink};

/// Connection lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// A socket is being opened.
    Connecting,
    /// The socket is open. Authorization may still be pending.
    Open,
    /// The socket was lost; a reconnect may be scheduled.
    Closed,
    /// Reconnection gave up.
    Aborted,
    /// The host disconnected explicitly.
    UserClosed,
    /// The remote superseded this session with another connection.
    Duplicated,
    /// The engine was shut down permanently.
    Terminated,
}

impl ConnectionStatus {
    /// Whether no automatic reconnection will follow this status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Aborted | Self::UserClosed | Self::Duplicated | Self::Terminated
        )
    }
}

/// Observable connection status backed by a [`watch`] channel.
///
/// Multiple subscribers can observe status transitions without polling.
#[derive(Debug)]
pub struct StatusWatch {
    tx: watch::Sender<ConnectionStatus>,
}

impl Default for StatusWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusWatch {
    /// Create a new watch initialized to [`ConnectionStatus::Closed`].
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionStatus::Closed);
        Self { tx }
    }

    /// Set the status. Returns `true` if it changed; subscribers are only
    /// woken on change.
    pub fn set(&self, status: ConnectionStatus) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        })
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }

    /// Return the current status without blocking.
    pub fn current(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The socket of the current connection attempt.
struct ActiveLink {
    generation: u64,
    link: SocketLink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// State owned by the engine task.
pub(crate) struct Engine<C> {
    config: ClientConfig,
    connector: C,
    status: StatusWatch,
    notifier: Notifier,
    dispatcher: Dispatcher,
    registry: RequestRegistry,
    gate: AuthGate,
    keepalive: KeepAlive,
    backoff: Backoff,
    link: Option<ActiveLink>,
    generation: u64,
    reconnect_at: Option<Instant>,
    late_responses: u64,
    socket_tx: mpsc::UnboundedSender<(u64, SocketEvent)>,
}

impl<C: Connector> Engine<C> {
    pub(crate) fn new(
        config: ClientConfig,
        connector: C,
        status: StatusWatch,
        notifier: Notifier,
        socket_tx: mpsc::UnboundedSender<(u64, SocketEvent)>,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(notifier.clone()),
            keepalive: KeepAlive::new(config.keepalive.clone()),
            backoff: Backoff::new(config.backoff.clone()),
            config,
            connector,
            status,
            notifier,
            registry: RequestRegistry::new(),
            gate: AuthGate::new(),
            link: None,
            generation: 0,
            reconnect_at: None,
            late_responses: 0,
            socket_tx,
        }
    }

    /// Run until terminated or every command sender is gone.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut socket_rx: mpsc::UnboundedReceiver<(u64, SocketEvent)>,
    ) {
        tracing::debug!(url = %self.config.url, "Engine started");
        loop {
            let reconnect_at = self.reconnect_at;
            let next_poll = self.keepalive.next_poll();
            let next_deadline = self.registry.next_deadline();

            let flow = tokio::select! {
                biased;

                Some((generation, event)) = socket_rx.recv() => {
                    self.on_socket_event(generation, event);
                    Flow::Continue
                }
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        tracing::debug!("All client handles dropped");
                        self.terminate();
                        Flow::Stop
                    }
                },
                _ = sleep_until_opt(reconnect_at) => {
                    self.on_reconnect_due();
                    Flow::Continue
                }
                _ = sleep_until_opt(next_poll) => {
                    self.on_keepalive_tick();
                    Flow::Continue
                }
                _ = sleep_until_opt(next_deadline) => {
                    self.on_deadline();
                    Flow::Continue
                }
            };

            if flow == Flow::Stop {
                break;
            }
        }
        tracing::debug!("Engine stopped");
    }

    // -- Commands -----------------------------------------------------------

    fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::Terminate => {
                self.terminate();
                return Flow::Stop;
            }
            Command::Send {
                id,
                event,
                payload,
                timeout,
                reply,
            } => self.send(id, event, payload, timeout, reply),
            Command::Cancel { id } => self.cancel(id),
        }
        Flow::Continue
    }

    fn connect(&mut self) {
        match self.status.current() {
            ConnectionStatus::Connecting | ConnectionStatus::Open => {
                tracing::debug!("Connect ignored, connection already active");
                return;
            }
            _ => {}
        }
        if self.reconnect_at.take().is_some() {
            tracing::debug!(
                attempt = self.backoff.attempt(),
                "Connecting early, reconnect timer cleared"
            );
        } else {
            self.backoff.reset();
        }
        self.open_socket();
    }

    fn disconnect(&mut self) {
        self.drop_link(Some(NORMAL_CLOSE_CODE));
        self.finish(ConnectionStatus::UserClosed);
    }

    fn terminate(&mut self) {
        self.drop_link(Some(NORMAL_CLOSE_CODE));
        self.finish(ConnectionStatus::Terminated);
    }

    fn send(
        &mut self,
        id: u64,
        event: String,
        payload: Payload,
        timeout: Option<Duration>,
        reply: oneshot::Sender<RequestResult>,
    ) {
        if !self.accepts_requests() {
            tracing::debug!(correlation_id = id, %event, "Send rejected, not connected");
            let _ = reply.send(Err(RequestError::NotConnected));
            self.publish_result(id, Err(RequestError::NotConnected));
            return;
        }

        let deadline = timeout
            .or(self.config.default_timeout)
            .map(|t| Instant::now() + t);
        self.registry.register(id, event.as_str(), deadline, reply);

        match self.gate.admit(OutboundEnvelope::request(id, event, payload)) {
            Admission::Send(envelope) => {
                if let Err(envelope) = self.transmit(envelope) {
                    self.gate.requeue_front([envelope]);
                }
            }
            Admission::Queued(position) => {
                tracing::trace!(correlation_id = id, position, "Queued until authorized");
            }
        }
    }

    fn cancel(&mut self, id: u64) {
        let withdrawn = self.gate.withdraw(id).is_some();
        let transmitted = self.registry.get(id).is_some_and(|r| r.transmitted);
        if !self.settle(id, Err(RequestError::Cancelled)) {
            tracing::trace!(correlation_id = id, "Cancel for a request already resolved");
            return;
        }
        tracing::debug!(correlation_id = id, withdrawn, "Request cancelled");

        if transmitted && self.config.notify_remote_cancel && self.gate.is_authorized() {
            let notice = OutboundEnvelope::request(id, CANCEL_EVENT, Payload::empty());
            let _ = self.transmit(notice);
        }
    }

    /// Requests are accepted while a session is live or about to be retried.
    fn accepts_requests(&self) -> bool {
        match self.status.current() {
            ConnectionStatus::Connecting | ConnectionStatus::Open => true,
            ConnectionStatus::Closed => self.reconnect_at.is_some(),
            _ => false,
        }
    }

    // -- Socket events ------------------------------------------------------

    fn on_socket_event(&mut self, generation: u64, event: SocketEvent) {
        if self.link.as_ref().map(|l| l.generation) != Some(generation) {
            tracing::trace!(generation, ?event, "Ignoring event from stale socket");
            return;
        }
        match event {
            SocketEvent::Opened => self.on_opened(),
            SocketEvent::Frame(bytes) => self.on_frame(&bytes),
            SocketEvent::Closed { code, reason } => {
                tracing::debug!(generation, ?code, ?reason, "Socket closed");
                if code == Some(DUPLICATE_SESSION_CLOSE_CODE) {
                    self.on_duplicate();
                } else {
                    self.on_connection_lost();
                }
            }
        }
    }

    fn on_opened(&mut self) {
        if self.status.current() != ConnectionStatus::Connecting {
            return;
        }
        self.gate.lock();
        self.keepalive.start(Instant::now());
        self.announce(ConnectionStatus::Open);

        match self.config.auth.clone() {
            Some(credential) => {
                tracing::debug!(event = %credential.event, "Sending authentication");
                let envelope = OutboundEnvelope::control(credential.event, credential.data);
                let _ = self.transmit(envelope);
            }
            None => self.on_authorized(),
        }
    }

    fn on_frame(&mut self, bytes: &[u8]) {
        let now = Instant::now();
        self.keepalive.record_inbound(now);

        match decode(bytes) {
            Ok(Decoded::Control(signal)) => self.on_control(signal, now),
            Ok(Decoded::Frame(frame)) => match self.dispatcher.dispatch(frame, &mut self.registry) {
                Route::UnknownCorrelation(id) => {
                    self.late_responses += 1;
                    tracing::debug!(
                        correlation_id = id,
                        total = self.late_responses,
                        "Discarding response nobody is waiting for"
                    );
                }
                Route::Unroutable => {
                    tracing::warn!("Dropping frame with neither correlation id nor event");
                }
                Route::Response(_) | Route::Event => {}
            },
            Err(e) => {
                tracing::warn!(len = bytes.len(), "Dropping undecodable frame: {e}");
                self.notifier.publish(Notification::DecodeFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    fn on_control(&mut self, signal: ControlSignal, now: Instant) {
        match signal {
            ControlSignal::Ping => {
                tracing::trace!("Answering server ping");
                self.write(ControlSignal::Pong.to_bytes());
            }
            ControlSignal::Pong => {
                if let Some(rtt) = self.keepalive.record_pong(now) {
                    tracing::debug!(?rtt, "Heartbeat round trip");
                }
            }
            ControlSignal::AuthAccepted => {
                if !self.gate.is_authorized() {
                    self.on_authorized();
                }
            }
            ControlSignal::AuthDenied => {
                tracing::warn!("Authorization denied, dropping connection");
                self.drop_link(Some(NORMAL_CLOSE_CODE));
                self.on_connection_lost();
            }
            ControlSignal::DuplicateSession => self.on_duplicate(),
            ControlSignal::Close(DUPLICATE_SESSION_CLOSE_CODE) => self.on_duplicate(),
            ControlSignal::Close(code) => {
                tracing::debug!(code, "Remote closed the connection");
                self.on_connection_lost();
            }
        }
    }

    /// The session is usable. Only now does the failure streak end, so a
    /// remote that keeps denying the credential still exhausts the backoff cap.
    fn on_authorized(&mut self) {
        self.backoff.reset();
        let queued = self.gate.authorize();
        tracing::info!(flushed = queued.len(), "Authorized");

        let mut remaining = queued.into_iter();
        while let Some(envelope) = remaining.next() {
            if let Err(envelope) = self.transmit(envelope) {
                self.gate
                    .requeue_front(std::iter::once(envelope).chain(remaining));
                return;
            }
        }
    }

    fn on_duplicate(&mut self) {
        tracing::warn!("Session superseded by another connection");
        self.drop_link(None);
        self.finish(ConnectionStatus::Duplicated);
    }

    /// The current socket failed. Requests written to it are lost; queued
    /// ones wait for the next session.
    fn on_connection_lost(&mut self) {
        self.drop_link(None);
        self.keepalive.stop();
        self.gate.lock();
        for id in self.registry.fail_transmitted(&RequestError::ConnectionLost) {
            self.publish_result(id, Err(RequestError::ConnectionLost));
        }
        self.announce(ConnectionStatus::Closed);

        if !self.config.auto_reconnect {
            self.finish(ConnectionStatus::Aborted);
            return;
        }
        match self.backoff.on_failure() {
            BackoffDecision::Retry { attempt, delay } => {
                tracing::info!(attempt, ?delay, "Reconnect scheduled");
                self.reconnect_at = Some(Instant::now() + delay);
            }
            BackoffDecision::Abort { attempts } => {
                tracing::warn!(attempts, "Giving up after repeated connection failures");
                self.finish(ConnectionStatus::Aborted);
            }
        }
    }

    // -- Timers -------------------------------------------------------------

    fn on_reconnect_due(&mut self) {
        self.reconnect_at = None;
        tracing::debug!(attempt = self.backoff.attempt(), "Reconnecting");
        self.open_socket();
    }

    fn on_keepalive_tick(&mut self) {
        match self.keepalive.poll(Instant::now()) {
            KeepAliveAction::Idle => {}
            KeepAliveAction::Probe => {
                tracing::debug!("Link quiet, sending heartbeat probe");
                self.write(ControlSignal::Ping.to_bytes());
            }
            KeepAliveAction::Expired { silence } => {
                tracing::warn!(?silence, "No traffic from remote, forcing reconnect");
                self.drop_link(Some(NORMAL_CLOSE_CODE));
                self.on_connection_lost();
            }
        }
    }

    fn on_deadline(&mut self) {
        for id in self.registry.expire(Instant::now()) {
            self.gate.withdraw(id);
            tracing::debug!(correlation_id = id, "Request timed out");
            self.publish_result(id, Err(RequestError::Timeout));
        }
    }

    // -- Helpers ------------------------------------------------------------

    fn open_socket(&mut self) {
        self.drop_link(None);
        self.generation += 1;
        let events = SocketEvents::new(self.generation, self.socket_tx.clone());
        let link = self.connector.open(&self.config.url, events);
        self.link = Some(ActiveLink {
            generation: self.generation,
            link,
        });
        self.gate.lock();
        self.announce(ConnectionStatus::Connecting);
    }

    fn drop_link(&mut self, close_code: Option<u16>) {
        if let Some(active) = self.link.take() {
            if let Some(code) = close_code {
                active.link.close(code);
            }
            tracing::trace!(generation = active.generation, "Socket released");
        }
    }

    /// Enter a terminal status: timers off, queue emptied, every pending
    /// request resolved.
    fn finish(&mut self, status: ConnectionStatus) {
        self.reconnect_at = None;
        self.keepalive.stop();
        self.gate.clear();
        self.announce(status);

        let error = match status {
            ConnectionStatus::Duplicated => RequestError::DuplicateSession,
            _ => RequestError::NotConnected,
        };
        for id in self.registry.fail_all(&error) {
            self.publish_result(id, Err(error.clone()));
        }
    }

    fn announce(&mut self, status: ConnectionStatus) {
        if self.status.set(status) {
            tracing::info!(?status, "Connection status changed");
            self.notifier.publish(Notification::StatusChanged(status));
        }
    }

    /// Encode and write an envelope. Hands the envelope back if no socket
    /// accepted it.
    fn transmit(&mut self, envelope: OutboundEnvelope) -> Result<(), OutboundEnvelope> {
        let bytes = match encode_envelope(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(correlation_id = ?envelope.correlation_id, "Failed to encode envelope: {e}");
                if let Some(id) = envelope.correlation_id {
                    self.settle(id, Err(RequestError::Encode(e.to_string())));
                }
                return Ok(());
            }
        };

        if let Some(max) = self.connector.max_frame_size()
            && bytes.len() > max as usize
        {
            let size = bytes.len();
            tracing::warn!(correlation_id = ?envelope.correlation_id, size, max, "Envelope exceeds frame limit");
            if let Some(id) = envelope.correlation_id {
                self.settle(
                    id,
                    Err(RequestError::FrameTooLarge {
                        size,
                        max: max as usize,
                    }),
                );
            }
            return Ok(());
        }

        let Some(active) = &self.link else {
            return Err(envelope);
        };
        if active.link.send(bytes).is_err() {
            tracing::warn!(generation = active.generation, "Socket refused frame");
            return Err(envelope);
        }

        if let Some(id) = envelope.correlation_id {
            self.registry.mark_transmitted(id);
        }
        tracing::trace!(correlation_id = ?envelope.correlation_id, event = %envelope.event, "Frame sent");
        Ok(())
    }

    fn write(&self, bytes: Vec<u8>) {
        if let Some(active) = &self.link {
            let _ = active.link.send(bytes);
        }
    }

    /// Resolve one request and publish its outcome. Returns `false` if it
    /// was already resolved.
    fn settle(&mut self, id: u64, result: RequestResult) -> bool {
        let Some(resolved) = self.registry.resolve(id, result.clone()) else {
            return false;
        };
        if !resolved.delivered {
            tracing::trace!(correlation_id = id, event = %resolved.event, "Caller gone before resolution");
        }
        self.publish_result(id, result);
        true
    }

    fn publish_result(&self, correlation_id: u64, result: RequestResult) {
        self.notifier.publish(Notification::ResponseReceived {
            correlation_id,
            result,
        });
    }
}

/// Sleep until `deadline`, or forever when there is none.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_watch_starts_closed() {
        let watch = StatusWatch::new();
        assert_eq!(watch.current(), ConnectionStatus::Closed);
    }

    #[test]
    fn test_status_watch_reports_change_only() {
        let watch = StatusWatch::new();
        let rx = watch.subscribe();
        assert!(!watch.set(ConnectionStatus::Closed));
        assert!(!rx.has_changed().unwrap());

        assert!(watch.set(ConnectionStatus::Connecting));
        assert!(rx.has_changed().unwrap());
        assert_eq!(watch.current(), ConnectionStatus::Connecting);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ConnectionStatus::Aborted.is_terminal());
        assert!(ConnectionStatus::UserClosed.is_terminal());
        assert!(ConnectionStatus::Duplicated.is_terminal());
        assert!(ConnectionStatus::Terminated.is_terminal());
        assert!(!ConnectionStatus::Closed.is_terminal());
        assert!(!ConnectionStatus::Open.is_terminal());
    }
}
