//! Wire frames for the TCP relay transport
//!
//! Frames are MessagePack-encoded and length-prefixed:
//! 4-byte little-endian length + payload.

use relay_core::{PeerIdentity, RelayError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on a single frame (64MB)
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Frames exchanged between two relay endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame from the dialer
    Hello { identity: PeerIdentity },
    /// Listener accepted the connection
    Welcome { identity: PeerIdentity },
    /// Application payload, carried as msgpack bin
    Data {
        reliable: bool,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// Orderly close
    Goodbye,
}

/// Encode a frame with its length prefix
pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
    let body =
        rmp_serde::to_vec_named(frame).map_err(|e| RelayError::Serialization(e.to_string()))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(RelayError::Protocol(format!(
            "Frame too large: {} bytes",
            body.len()
        )));
    }

    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode a frame body (without length prefix)
pub fn decode(body: &[u8]) -> Result<Frame> {
    rmp_serde::from_slice(body).map_err(|e| RelayError::Serialization(e.to_string()))
}

/// Read one length-prefixed frame
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(RelayError::Protocol(format!(
            "Frame too large: {} bytes",
            len
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode(&body)
}
