//! Length-prefixed framing for the TCP transport.
//!
//! A byte stream has no message boundaries, so each codec frame travels as:
//!
//! ```text
//! +-------------------+----------------------------+
//! | length (4 bytes)  |   frame                    |
//! | u32 little-endian |   (control tag or          |
//! |                   |    obfuscated application) |
//! +-------------------+----------------------------+
//! ```
//!
//! The length excludes the 4 prefix bytes. Zero-length frames are rejected on
//! read since every codec frame carries at least its tag byte.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Limits applied by the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed frame size in bytes. Default: 1 MiB.
    pub max_frame_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 1_048_576,
        }
    }
}

/// Errors that can occur while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame exceeds the configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// The announced or actual frame size.
        size: u32,
        /// The configured maximum.
        max: u32,
    },

    /// A zero-length frame was announced.
    #[error("zero-length frame")]
    EmptyFrame,

    /// The peer closed the stream, cleanly or mid-frame.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn eof_as_closed(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Read one frame from the stream.
///
/// Not cancel-safe: a partially read frame is lost if the future is dropped,
/// so callers run this in a dedicated reader task rather than inside `select!`.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(eof_as_closed)?;

    let len = u32::from_le_bytes(len_buf);
    if len == 0 {
        return Err(FrameError::EmptyFrame);
    }
    if len > config.max_frame_size {
        return Err(FrameError::FrameTooLarge {
            size: len,
            max: config.max_frame_size,
        });
    }

    let mut frame = vec![0u8; len as usize];
    reader.read_exact(&mut frame).await.map_err(eof_as_closed)?;
    Ok(frame)
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = u32::try_from(frame.len()).unwrap_or(u32::MAX);
    if len > config.max_frame_size {
        return Err(FrameError::FrameTooLarge {
            size: len,
            max: config.max_frame_size,
        });
    }
    if len == 0 {
        return Err(FrameError::EmptyFrame);
    }

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ControlSignal, OutboundEnvelope, Payload, encode_envelope};
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_control_and_application_frames_keep_boundaries() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig::default();

        let ping = ControlSignal::Ping.to_bytes();
        let app = encode_envelope(&OutboundEnvelope::request(
            1,
            "echo",
            Payload::from_bytes(vec![1, 2, 3]),
        ))
        .unwrap();

        write_frame(&mut client, &ping, &config).await.unwrap();
        write_frame(&mut client, &app, &config).await.unwrap();

        assert_eq!(read_frame(&mut server, &config).await.unwrap(), ping);
        assert_eq!(read_frame(&mut server, &config).await.unwrap(), app);
    }

    #[tokio::test]
    async fn test_frame_split_across_small_buffer() {
        let (mut client, mut server) = duplex(8);
        let config = FrameConfig::default();
        let frame = vec![0xABu8; 300];

        let write_config = config.clone();
        let expected = frame.clone();
        let writer = tokio::spawn(async move {
            write_frame(&mut client, &frame, &write_config).await.unwrap();
        });

        let received = read_frame(&mut server, &config).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_oversized_announcement_rejected() {
        let (mut client, mut server) = duplex(64);
        let config = FrameConfig { max_frame_size: 16 };

        client.write_all(&1024u32.to_le_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let result = read_frame(&mut server, &config).await;
        assert!(matches!(
            result,
            Err(FrameError::FrameTooLarge { size: 1024, max: 16 })
        ));
    }

    #[tokio::test]
    async fn test_oversized_write_rejected() {
        let (mut client, _server) = duplex(64);
        let config = FrameConfig { max_frame_size: 16 };
        let result = write_frame(&mut client, &[0u8; 32], &config).await;
        assert!(matches!(result, Err(FrameError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_zero_length_frame_rejected() {
        let (mut client, mut server) = duplex(64);
        let config = FrameConfig::default();

        assert!(matches!(
            write_frame(&mut client, &[], &config).await,
            Err(FrameError::EmptyFrame)
        ));

        client.write_all(&0u32.to_le_bytes()).await.unwrap();
        client.flush().await.unwrap();
        assert!(matches!(
            read_frame(&mut server, &config).await,
            Err(FrameError::EmptyFrame)
        ));
    }

    #[tokio::test]
    async fn test_peer_close_reported() {
        let (client, mut server) = duplex(64);
        drop(client);
        let result = read_frame(&mut server, &FrameConfig::default()).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_mid_frame_reported() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);

        let result = read_frame(&mut server, &FrameConfig::default()).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }
}
