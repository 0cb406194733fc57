//! Wire codec: control tags, application frames, and the obfuscation transform.
//!
//! Every frame starts with a single tag byte. Control frames are sent as fixed,
//! recognizable bytes and are inspected before any deserialization:
//!
//! ```text
//! 0x01            heartbeat ping
//! 0x02            heartbeat pong
//! 0x03            duplicate-session notice
//! 0x04            authorization accepted
//! 0x05            authorization denied
//! 0x06 hi lo      close notice carrying a u16 close code (big-endian)
//! ```
//!
//! Application frames carry the ordered record `[correlation_id, event, payload]`
//! encoded with [`postcard`], prefixed with [`APPLICATION_TAG`], and then XORed
//! byte-wise with [`OBFUSCATION_KEY`] (tag included).
//!
//! The XOR transform is **obfuscation only**. It keeps payloads from being
//! readable at a glance in a packet capture and provides no confidentiality or
//! integrity whatsoever. Transport security belongs to the socket layer.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Single-byte key applied to every byte of an application frame.
pub const OBFUSCATION_KEY: u8 = 0x5A;

/// Leading tag of an application frame before obfuscation. On the wire it
/// appears as `APPLICATION_TAG ^ OBFUSCATION_KEY` (`0xFF`).
pub const APPLICATION_TAG: u8 = 0xA5;

/// Close code signalling that a newer connection superseded this session.
pub const DUPLICATE_SESSION_CLOSE_CODE: u16 = 4001;

/// Close code sent on a clean, user-initiated disconnect.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Event name marking a response as a remote error.
pub const ERROR_EVENT: &str = "error";

/// Event name of the remote cancel notice.
pub const CANCEL_EVENT: &str = "$cancel";

/// Control tag bytes.
pub mod tag {
    /// Heartbeat probe.
    pub const PING: u8 = 0x01;
    /// Heartbeat response.
    pub const PONG: u8 = 0x02;
    /// The remote superseded this session with a newer connection.
    pub const DUPLICATE_SESSION: u8 = 0x03;
    /// Post-connect authorization succeeded.
    pub const AUTH_ACCEPTED: u8 = 0x04;
    /// Post-connect authorization was refused.
    pub const AUTH_DENIED: u8 = 0x05;
    /// Close notice followed by a two-byte close code.
    pub const CLOSE: u8 = 0x06;
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Opaque application payload. The engine never looks inside it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Vec<u8>);

impl Payload {
    /// Empty payload.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Wrap raw bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Serialize a structured value into a payload.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, CodecError> {
        Ok(Self(postcard::to_allocvec(value)?))
    }

    /// Deserialize the payload as a structured value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        Ok(postcard::from_bytes(&self.0)?)
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume into the raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Number of payload bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Envelopes and frames
// ---------------------------------------------------------------------------

/// An outbound application message, consumed once by [`encode_envelope`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEnvelope {
    /// `None` only for fire-and-forget control traffic such as the auth handshake.
    pub correlation_id: Option<u64>,
    /// Event name.
    pub event: String,
    /// Message body.
    pub payload: Payload,
}

impl OutboundEnvelope {
    /// Envelope paired with a pending request.
    pub fn request(correlation_id: u64, event: impl Into<String>, payload: Payload) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            event: event.into(),
            payload,
        }
    }

    /// Envelope without a correlation id.
    pub fn control(event: impl Into<String>, payload: Payload) -> Self {
        Self {
            correlation_id: None,
            event: event.into(),
            payload,
        }
    }
}

/// A decoded application frame from the remote side.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    /// Correlation id of the request this answers, if any.
    pub correlation_id: Option<u64>,
    /// Event name, absent on bare responses.
    pub event: Option<String>,
    /// Message body.
    pub payload: Payload,
}

/// A recognized control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Heartbeat probe.
    Ping,
    /// Heartbeat response.
    Pong,
    /// Session superseded by another connection of the same identity.
    DuplicateSession,
    /// Authorization accepted.
    AuthAccepted,
    /// Authorization refused.
    AuthDenied,
    /// The remote is closing the connection with the given code.
    Close(u16),
}

impl ControlSignal {
    /// Wire bytes of this control frame.
    pub fn to_bytes(self) -> Vec<u8> {
        match self {
            ControlSignal::Ping => vec![tag::PING],
            ControlSignal::Pong => vec![tag::PONG],
            ControlSignal::DuplicateSession => vec![tag::DUPLICATE_SESSION],
            ControlSignal::AuthAccepted => vec![tag::AUTH_ACCEPTED],
            ControlSignal::AuthDenied => vec![tag::AUTH_DENIED],
            ControlSignal::Close(code) => {
                let [hi, lo] = code.to_be_bytes();
                vec![tag::CLOSE, hi, lo]
            }
        }
    }
}

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A control frame, handled by the connection manager.
    Control(ControlSignal),
    /// An application frame, handed to the dispatcher.
    Frame(InboundFrame),
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame had no bytes at all.
    #[error("empty frame")]
    EmptyFrame,

    /// A control tag was followed by the wrong number of bytes.
    #[error("malformed control frame 0x{tag:02x} ({len} bytes)")]
    MalformedControl {
        /// The control tag.
        tag: u8,
        /// Total frame length.
        len: usize,
    },

    /// The leading byte is neither a control tag nor an application frame.
    #[error("unknown frame tag 0x{0:02x}")]
    UnknownTag(u8),

    /// Postcard (de)serialization failed.
    #[error("serialization error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Apply the XOR transform in place. Applying it twice restores the input.
pub fn obfuscate(bytes: &mut [u8]) {
    for b in bytes.iter_mut() {
        *b ^= OBFUSCATION_KEY;
    }
}

/// Encode an outbound envelope into an obfuscated application frame.
pub fn encode_envelope(envelope: &OutboundEnvelope) -> Result<Vec<u8>, CodecError> {
    let record = (
        envelope.correlation_id,
        Some(envelope.event.as_str()),
        &envelope.payload,
    );
    let body = postcard::to_allocvec(&record)?;

    let mut out = Vec::with_capacity(1 + body.len());
    out.push(APPLICATION_TAG);
    out.extend_from_slice(&body);
    obfuscate(&mut out);
    Ok(out)
}

/// Encode an inbound-shaped frame. Used by the remote side of the protocol
/// and by tests that script a server.
pub fn encode_frame(frame: &InboundFrame) -> Result<Vec<u8>, CodecError> {
    let record = (frame.correlation_id, frame.event.as_deref(), &frame.payload);
    let body = postcard::to_allocvec(&record)?;

    let mut out = Vec::with_capacity(1 + body.len());
    out.push(APPLICATION_TAG);
    out.extend_from_slice(&body);
    obfuscate(&mut out);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode one frame. Control tags are checked first; only application frames
/// are deobfuscated and deserialized.
pub fn decode(bytes: &[u8]) -> Result<Decoded, CodecError> {
    let Some(&first) = bytes.first() else {
        return Err(CodecError::EmptyFrame);
    };

    if let Some(signal) = decode_control(first, bytes)? {
        return Ok(Decoded::Control(signal));
    }

    let mut plain = bytes.to_vec();
    obfuscate(&mut plain);
    if plain[0] != APPLICATION_TAG {
        return Err(CodecError::UnknownTag(first));
    }

    let (correlation_id, event, payload): (Option<u64>, Option<String>, Payload) =
        postcard::from_bytes(&plain[1..])?;

    Ok(Decoded::Frame(InboundFrame {
        correlation_id,
        event,
        payload,
    }))
}

fn decode_control(first: u8, bytes: &[u8]) -> Result<Option<ControlSignal>, CodecError> {
    let single = |signal| {
        if bytes.len() == 1 {
            Ok(Some(signal))
        } else {
            Err(CodecError::MalformedControl {
                tag: first,
                len: bytes.len(),
            })
        }
    };

    match first {
        tag::PING => single(ControlSignal::Ping),
        tag::PONG => single(ControlSignal::Pong),
        tag::DUPLICATE_SESSION => single(ControlSignal::DuplicateSession),
        tag::AUTH_ACCEPTED => single(ControlSignal::AuthAccepted),
        tag::AUTH_DENIED => single(ControlSignal::AuthDenied),
        tag::CLOSE => match bytes {
            [_, hi, lo] => Ok(Some(ControlSignal::Close(u16::from_be_bytes([*hi, *lo])))),
            _ => Err(CodecError::MalformedControl {
                tag: first,
                len: bytes.len(),
            }),
        },
        _ => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
