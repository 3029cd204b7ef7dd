use std::net::SocketAddr;

use thiserror::Error;

// ---

#[derive(Debug, Error)]
pub enum StreamError {
    // ---
    /// Bookkeeping addressed a peer that was never registered with the
    /// coordinator.
    #[error("unknown peer requested: {0}")]
    UnknownPeer(SocketAddr),

    /// Progress arrived for a session whose summary was never registered.
    #[error("no session info registered for {peer} session #{session_index}")]
    MissingSessionInfo {
        peer: SocketAddr,
        session_index: u32,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("session closed")]
    SessionClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---

pub type Result<T> = std::result::Result<T, StreamError>;
