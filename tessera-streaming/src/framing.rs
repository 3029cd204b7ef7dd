//! Wire framing for stream session control messages.
//!
//! Every control message is a fixed binary header followed by a
//! variable-length JSON payload:
//!
//! ```text
//! +-------+-------+-------------------+-----------------------------+
//! | magic | ver   | payload_len (u32) | payload (payload_len bytes) |
//! | 0x54  | 0x01  | big-endian        | UTF-8 JSON                  |
//! +-------+-------+-------------------+-----------------------------+
//!   1 byte  1 byte      4 bytes          variable
//!                  ← fixed 6 bytes →
//! ```
//!
//! A [`StreamMessage::File`] frame is followed immediately by exactly
//! `size_bytes` raw bytes with no further framing.

use std::net::SocketAddr;

// ---

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

// ---

use tessera_domain::{Result, StreamError, StreamSummary};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic byte: 'T' for Tessera.  Lets the receiver detect misaligned reads.
pub const MAGIC: u8 = 0x54;

/// Wire format version.  Bump when the fixed header layout changes.
pub const VERSION: u8 = 0x01;

/// Fixed header size in bytes: magic(1) + ver(1) + payload_len(4).
pub const FIXED_HEADER_LEN: usize = 6;

/// Upper bound on a single control payload.  Unit data never goes through
/// the JSON path, so anything larger is a corrupt or hostile length.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Raw unit bytes are written and read in pieces of this size; one
/// progress report is published per piece.
pub const CHUNK_SIZE: usize = 16 * 1024; // 16 KiB

// ---------------------------------------------------------------------------
// StreamMessage
// ---------------------------------------------------------------------------

/// Control messages exchanged over a session connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamMessage {
    // ---
    /// First frame on every connection, written by the initiator.
    ///
    /// `from` is the initiator's logical address; the responder files the
    /// session under it rather than under the ephemeral socket address.
    /// `peer_sessions` is how many sessions the initiator opens to this
    /// responder in the plan, `0` when unknown.
    Init {
        plan_id: Uuid,
        session_index: u32,
        from: SocketAddr,
        description: String,
        peer_sessions: u32,
    },

    /// What the writer is going to send in this session.
    Prepare { summaries: Vec<StreamSummary> },

    /// Header of one transfer unit; `size_bytes` raw bytes follow.
    File { name: String, size_bytes: u64 },

    /// Receiver has the whole unit named `name`.
    Received { name: String },

    /// Writer has finished all of its work in this session.
    Complete,

    /// Writer has failed the session.
    SessionFailed { reason: String },
}

// ---------------------------------------------------------------------------
// write_message
// ---------------------------------------------------------------------------

/// Serialize `msg` and write the fixed preamble + JSON payload to `stream`.
///
/// Errors if serialization fails or the write to `stream` fails.
pub async fn write_message<W>(stream: &mut W, msg: &StreamMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(msg)
        .map_err(|e| StreamError::Protocol(format!("framing serialize error: {e}")))?;

    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(StreamError::Protocol(format!(
            "framing payload of {} bytes exceeds {MAX_PAYLOAD_LEN}",
            payload.len()
        )));
    }
    let payload_len = payload.len() as u32;

    // Fixed header: magic + version + payload_len (big-endian u32)
    let mut fixed = [0u8; FIXED_HEADER_LEN];
    fixed[0] = MAGIC;
    fixed[1] = VERSION;
    fixed[2..6].copy_from_slice(&payload_len.to_be_bytes());

    stream
        .write_all(&fixed)
        .await
        .map_err(|e| StreamError::Transport(format!("framing write fixed header: {e}")))?;

    stream
        .write_all(&payload)
        .await
        .map_err(|e| StreamError::Transport(format!("framing write payload: {e}")))?;

    stream
        .flush()
        .await
        .map_err(|e| StreamError::Transport(format!("framing flush: {e}")))?;

    Ok(())
}

// ---------------------------------------------------------------------------
// read_message
// ---------------------------------------------------------------------------

/// Read and deserialize one [`StreamMessage`] from `stream`.
///
/// Returns `None` on clean EOF (zero-length read of the first header
/// byte), which signals that the peer closed its write half between
/// messages.  EOF anywhere else is an error.
pub async fn read_message<R>(stream: &mut R) -> Result<Option<StreamMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut fixed = [0u8; FIXED_HEADER_LEN];

    // Peek at the first byte to distinguish clean EOF from a real header.
    match stream.read(&mut fixed[..1]).await {
        Ok(0) => return Ok(None), // clean EOF
        Ok(_) => {}
        Err(e) => return Err(StreamError::Transport(format!("framing read header[0]: {e}"))),
    }

    stream
        .read_exact(&mut fixed[1..])
        .await
        .map_err(|e| StreamError::Transport(format!("framing read header[1..]: {e}")))?;

    if fixed[0] != MAGIC {
        return Err(StreamError::Protocol(format!(
            "framing bad magic: expected 0x{MAGIC:02X}, got 0x{:02X}",
            fixed[0]
        )));
    }

    if fixed[1] != VERSION {
        return Err(StreamError::Protocol(format!(
            "framing unsupported version: expected {VERSION}, got {}",
            fixed[1]
        )));
    }

    let payload_len = u32::from_be_bytes([fixed[2], fixed[3], fixed[4], fixed[5]]) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(StreamError::Protocol(format!(
            "framing payload length {payload_len} exceeds {MAX_PAYLOAD_LEN}"
        )));
    }

    let mut payload = vec![0u8; payload_len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| StreamError::Transport(format!("framing read payload: {e}")))?;

    let msg: StreamMessage = serde_json::from_slice(&payload)
        .map_err(|e| StreamError::Protocol(format!("framing deserialize error: {e}")))?;

    Ok(Some(msg))
}

// ---

/// Like [`read_message`] but treats EOF as the peer hanging up.
pub async fn expect_message<R>(stream: &mut R) -> Result<StreamMessage>
where
    R: AsyncRead + Unpin,
{
    read_message(stream).await?.ok_or(StreamError::SessionClosed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
