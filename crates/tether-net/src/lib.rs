//! Resilient single-connection transport client.
//!
//! One engine task owns one logical connection to a remote endpoint. It
//! multiplexes correlated request/response exchanges and server-pushed events
//! over that connection and hides reconnection, authentication, and
//! keep-alive from callers, who only see a [`Client`] handle, per-request
//! results, and [`Notification`]s.

pub mod auth_gate;
pub mod backoff;
pub mod client;
pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod framing;
pub mod keepalive;
pub mod notification;
pub mod registry;
pub mod transport;

pub use auth_gate::{Admission, AuthGate, GateState};
pub use backoff::{Backoff, BackoffConfig, BackoffDecision};
pub use client::{AuthCredential, Client, ClientConfig, PendingResponse};
pub use codec::{
    CodecError, ControlSignal, Decoded, InboundFrame, OutboundEnvelope, Payload, decode,
    encode_envelope, encode_frame,
};
pub use connection::{ConnectionStatus, StatusWatch};
pub use dispatcher::{Dispatcher, Route};
pub use error::RequestError;
pub use framing::{FrameConfig, FrameError, read_frame, write_frame};
pub use keepalive::{KeepAlive, KeepAliveAction, KeepAliveConfig};
pub use notification::{Notification, Notifier, ServerEvent};
pub use registry::{CorrelationIds, RequestRegistry, RequestResult};
pub use transport::{
    Connector, LinkCommand, LinkClosed, SocketConfig, SocketEvent, SocketEvents, SocketLink,
    TcpConnector,
};
