//! Physical socket seam and the TCP implementation.
//!
//! The connection manager never touches I/O directly. For each connection
//! attempt it asks a [`Connector`] to open a fresh socket; the socket reports
//! back through [`SocketEvents`] (stamped with the attempt's generation) and
//! accepts outbound frames through the returned [`SocketLink`].

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::codec::ControlSignal;
use crate::framing::{FrameConfig, FrameError, read_frame, write_frame};

// ---------------------------------------------------------------------------
// Seam
// ---------------------------------------------------------------------------

/// Something a socket reports to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// The socket is open and ready for traffic.
    Opened,
    /// One complete inbound frame.
    Frame(Vec<u8>),
    /// The socket closed or failed. `code` is set when the peer supplied one.
    Closed {
        /// Close code, if any.
        code: Option<u16>,
        /// Diagnostic reason, if any.
        reason: Option<String>,
    },
}

/// Event sender handed to a socket, stamped with its generation.
#[derive(Debug, Clone)]
pub struct SocketEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, SocketEvent)>,
}

impl SocketEvents {
    /// Create a sender for the socket of the given generation.
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, SocketEvent)>) -> Self {
        Self { generation, tx }
    }

    /// Generation of the socket this sender belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an event. Returns `false` once the engine has gone away.
    pub fn emit(&self, event: SocketEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }

    /// Report that the socket opened.
    pub fn opened(&self) -> bool {
        self.emit(SocketEvent::Opened)
    }

    /// Report an inbound frame.
    pub fn frame(&self, frame: Vec<u8>) -> bool {
        self.emit(SocketEvent::Frame(frame))
    }

    /// Report that the socket closed.
    pub fn closed(&self, code: Option<u16>, reason: Option<String>) -> bool {
        self.emit(SocketEvent::Closed { code, reason })
    }
}

/// Instruction from the engine to a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Write one frame.
    Frame(Vec<u8>),
    /// Close cleanly, telling the peer `code`.
    Close {
        /// Close code sent to the peer.
        code: u16,
    },
}

/// The socket has stopped accepting frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("socket link closed")]
pub struct LinkClosed;

/// Engine-side write handle of one socket. Dropping it tears the socket down.
#[derive(Debug)]
pub struct SocketLink {
    tx: mpsc::UnboundedSender<LinkCommand>,
}

impl SocketLink {
    /// Create a link and the receiver the socket task drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LinkCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue one frame for writing.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), LinkClosed> {
        self.tx.send(LinkCommand::Frame(frame)).map_err(|_| LinkClosed)
    }

    /// Ask the socket to close cleanly.
    pub fn close(&self, code: u16) {
        let _ = self.tx.send(LinkCommand::Close { code });
    }
}

/// Opens physical sockets.
pub trait Connector: Send + Sync + 'static {
    /// Start opening a socket to `url`. Must not block: the outcome is reported
    /// through `events` (`Opened`, or `Closed` on failure).
    fn open(&self, url: &str, events: SocketEvents) -> SocketLink;

    /// Largest frame the sockets will write, if they enforce one. The engine
    /// rejects bigger envelopes before handing them over.
    fn max_frame_size(&self) -> Option<u32> {
        None
    }
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// TCP socket options applied to every connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Default: true.
    pub tcp_nodelay: bool,
    /// OS-level keepalive idle time; `None` disables it. Default: 60 s.
    pub tcp_keepalive: Option<Duration>,
    /// Interval between OS keepalive probes. Default: 10 s.
    pub tcp_keepalive_interval: Duration,
    /// Give up on a connect that takes longer than this. Default: 10 s.
    pub connect_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_keepalive: Some(Duration::from_secs(60)),
            tcp_keepalive_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Apply [`SocketConfig`] to a connected stream.
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if let Some(idle) = config.tcp_keepalive {
        let keepalive = TcpKeepalive::new()
            .with_time(idle)
            .with_interval(config.tcp_keepalive_interval);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Strip an optional `tcp://` scheme and trailing slash from a URL.
pub fn socket_address(url: &str) -> &str {
    url.strip_prefix("tcp://")
        .unwrap_or(url)
        .trim_end_matches('/')
}

/// [`Connector`] over `tokio::net::TcpStream` with length-prefixed framing.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    /// Framing limits.
    pub frame: FrameConfig,
    /// Socket options.
    pub socket: SocketConfig,
}

impl TcpConnector {
    /// Create a connector with the given settings.
    pub fn new(frame: FrameConfig, socket: SocketConfig) -> Self {
        Self { frame, socket }
    }
}

impl Connector for TcpConnector {
    fn open(&self, url: &str, events: SocketEvents) -> SocketLink {
        let (link, commands) = SocketLink::channel();
        let addr = socket_address(url).to_owned();
        tokio::spawn(run_tcp_socket(addr, self.clone(), events, commands));
        link
    }

    fn max_frame_size(&self) -> Option<u32> {
        Some(self.frame.max_frame_size)
    }
}

async fn run_tcp_socket(
    addr: String,
    config: TcpConnector,
    events: SocketEvents,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) {
    let generation = events.generation();
    let stream =
        match tokio::time::timeout(config.socket.connect_timeout, TcpStream::connect(&addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!(generation, %addr, "Connect failed: {e}");
                events.closed(None, Some(e.to_string()));
                return;
            }
            Err(_) => {
                tracing::debug!(generation, %addr, "Connect timed out");
                events.closed(
                    None,
                    Some(format!(
                        "connect timed out after {:?}",
                        config.socket.connect_timeout
                    )),
                );
                return;
            }
        };

    if let Err(e) = configure_stream(&stream, &config.socket) {
        tracing::warn!(generation, "Failed to apply socket options: {e}");
    }

    let (mut reader, mut writer) = stream.into_split();
    if !events.opened() {
        return;
    }

    // read_frame is not cancel-safe, so reads live in their own task.
    let reader_events = events.clone();
    let read_config = config.frame.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader, &read_config).await {
                Ok(frame) => {
                    if !reader_events.frame(frame) {
                        break;
                    }
                }
                Err(FrameError::ConnectionClosed) => {
                    reader_events.closed(None, None);
                    break;
                }
                Err(e) => {
                    reader_events.closed(None, Some(e.to_string()));
                    break;
                }
            }
        }
    });

    while let Some(command) = commands.recv().await {
        match command {
            LinkCommand::Frame(frame) => match write_frame(&mut writer, &frame, &config.frame).await
            {
                Ok(()) => {}
                Err(FrameError::FrameTooLarge { size, max }) => {
                    tracing::warn!(generation, size, max, "Dropping oversized outbound frame");
                }
                Err(e) => {
                    events.closed(None, Some(e.to_string()));
                    break;
                }
            },
            LinkCommand::Close { code } => {
                let notice = ControlSignal::Close(code).to_bytes();
                let _ = write_frame(&mut writer, &notice, &config.frame).await;
                let _ = writer.shutdown().await;
                break;
            }
        }
    }

    reader_task.abort();
    tracing::trace!(generation, "Socket task finished");
}
