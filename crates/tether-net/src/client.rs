//! Host-facing handle to a running engine.
//!
//! [`Client::spawn`] starts the engine task and returns a cheap, cloneable
//! handle. Every method sends one command into the engine's queue; nothing
//! here touches engine state directly.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::backoff::BackoffConfig;
use crate::codec::Payload;
use crate::connection::{ConnectionStatus, Engine, StatusWatch};
use crate::error::RequestError;
use crate::framing::FrameConfig;
use crate::keepalive::KeepAliveConfig;
use crate::notification::{Notification, Notifier};
use crate::registry::{CorrelationIds, RequestResult};
use crate::transport::{Connector, SocketConfig, TcpConnector};

/// Credential sent as the first envelope on every new socket.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthCredential {
    /// Event name of the authentication envelope.
    pub event: String,
    /// Credential payload.
    pub data: Payload,
}

/// Runtime configuration of one engine.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Remote endpoint handed to the [`Connector`].
    pub url: String,
    /// Issue a connect right after spawning.
    pub auto_connect: bool,
    /// Reconnect after a lost connection. When off, a loss ends in `Aborted`.
    pub auto_reconnect: bool,
    /// Handshake credential. `None` authorizes as soon as the socket opens.
    pub auth: Option<AuthCredential>,
    /// Reconnect delays and cap.
    pub backoff: BackoffConfig,
    /// Heartbeat thresholds.
    pub keepalive: KeepAliveConfig,
    /// Timeout for sends that don't specify one.
    pub default_timeout: Option<Duration>,
    /// Send a cancel notice for cancelled requests the remote has seen.
    pub notify_remote_cancel: bool,
    /// Notifications buffered per lagging subscriber.
    pub notification_capacity: usize,
}

impl ClientConfig {
    /// Defaults for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auto_connect: true,
            auto_reconnect: true,
            auth: None,
            backoff: BackoffConfig::default(),
            keepalive: KeepAliveConfig::default(),
            default_timeout: None,
            notify_remote_cancel: true,
            notification_capacity: 256,
        }
    }

    /// Convert the on-disk settings.
    pub fn from_settings(settings: &tether_config::Config) -> Self {
        let conn = &settings.connection;
        let hb = &settings.keepalive;
        Self {
            url: conn.url.clone(),
            auto_connect: conn.auto_connect,
            auto_reconnect: conn.auto_reconnect,
            auth: conn.auth_token.as_ref().map(|token| AuthCredential {
                event: conn.auth_event.clone(),
                data: Payload::from_bytes(token.as_bytes()),
            }),
            backoff: BackoffConfig {
                delays: settings
                    .reconnect
                    .delays_ms
                    .iter()
                    .map(|&ms| Duration::from_millis(ms))
                    .collect(),
                max_attempts: settings.reconnect.max_attempts,
                jitter: settings.reconnect.jitter,
            },
            keepalive: KeepAliveConfig {
                poll_interval: Duration::from_millis(hb.poll_interval_ms),
                warn_after: Duration::from_millis(hb.warn_after_ms),
                abort_after: Duration::from_millis(hb.abort_after_ms),
            },
            default_timeout: settings
                .requests
                .default_timeout_ms
                .map(Duration::from_millis),
            notify_remote_cancel: settings.requests.notify_remote_cancel,
            notification_capacity: settings.requests.notification_capacity,
        }
    }
}

impl TcpConnector {
    /// Build a connector from the on-disk transport settings.
    pub fn from_settings(settings: &tether_config::Config) -> Self {
        let transport = &settings.transport;
        let defaults = SocketConfig::default();
        Self::new(
            FrameConfig {
                max_frame_size: transport.max_frame_size,
            },
            SocketConfig {
                tcp_nodelay: transport.tcp_nodelay,
                tcp_keepalive: transport.tcp_keepalive_secs.map(Duration::from_secs),
                connect_timeout: Duration::from_millis(transport.connect_timeout_ms),
                ..defaults
            },
        )
    }
}

/// Host → engine commands.
#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Disconnect,
    Terminate,
    Send {
        id: u64,
        event: String,
        payload: Payload,
        timeout: Option<Duration>,
        reply: oneshot::Sender<RequestResult>,
    },
    Cancel {
        id: u64,
    },
}

/// Handle to a running engine.
///
/// Cloning is cheap. The engine stops on [`terminate`](Self::terminate) or
/// once every handle (including outstanding [`PendingResponse`]s) is dropped.
#[derive(Debug, Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    ids: Arc<CorrelationIds>,
    status: watch::Receiver<ConnectionStatus>,
    notifier: Notifier,
}

impl Client {
    /// Start an engine on the current tokio runtime.
    ///
    /// Issues a connect immediately when `config.auto_connect` is set.
    pub fn spawn(config: ClientConfig, connector: impl Connector) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let status = StatusWatch::new();
        let status_rx = status.subscribe();
        let notifier = Notifier::new(config.notification_capacity);
        let auto_connect = config.auto_connect;

        let engine = Engine::new(config, connector, status, notifier.clone(), socket_tx);
        tokio::spawn(engine.run(command_rx, socket_rx));

        let client = Self {
            commands,
            ids: Arc::new(CorrelationIds::new()),
            status: status_rx,
            notifier,
        };
        if auto_connect {
            client.connect();
        }
        client
    }

    /// Open a connection. No-op while connecting or open; skips the wait
    /// when a reconnect is scheduled.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Close the connection and stop reconnecting. Pending requests fail
    /// with [`RequestError::NotConnected`].
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Shut the engine down for good.
    pub fn terminate(&self) {
        self.command(Command::Terminate);
    }

    /// Send a request using the configured default timeout.
    pub fn send(&self, event: impl Into<String>, payload: Payload) -> PendingResponse {
        self.dispatch(event.into(), payload, None)
    }

    /// Send a request that fails with [`RequestError::Timeout`] if no
    /// response arrives within `timeout`.
    pub fn send_with_timeout(
        &self,
        event: impl Into<String>,
        payload: Payload,
        timeout: Duration,
    ) -> PendingResponse {
        self.dispatch(event.into(), payload, Some(timeout))
    }

    /// Cancel a request by correlation id.
    pub fn cancel(&self, id: u64) {
        self.command(Command::Cancel { id });
    }

    /// Subscribe to engine notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Receiver that wakes on every status change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Wait until the engine task has stopped.
    pub async fn stopped(&self) {
        self.commands.closed().await;
    }

    fn dispatch(&self, event: String, payload: Payload, timeout: Option<Duration>) -> PendingResponse {
        let id = self.ids.next_id();
        let (reply, rx) = oneshot::channel();
        // If the engine is gone the reply sender is dropped with the command
        // and the caller sees EngineStopped.
        self.command(Command::Send {
            id,
            event,
            payload,
            timeout,
            reply,
        });
        PendingResponse {
            id,
            rx,
            commands: self.commands.clone(),
        }
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Command dropped, engine stopped");
        }
    }
}

/// Future resolving to a request's outcome.
///
/// Resolves exactly once: with the response payload, or with the
/// [`RequestError`] explaining why there is none.
#[derive(Debug)]
pub struct PendingResponse {
    id: u64,
    rx: oneshot::Receiver<RequestResult>,
    commands: mpsc::UnboundedSender<Command>,
}

impl PendingResponse {
    /// Correlation id of the request.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancel the request. The future then resolves with
    /// [`RequestError::Cancelled`] unless it was already resolved.
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel { id: self.id });
    }
}

impl Future for PendingResponse {
    type Output = RequestResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RequestError::EngineStopped)))
    }
}
