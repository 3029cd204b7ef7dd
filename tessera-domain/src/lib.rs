//! Core traits and types for Tessera inter-node streaming.
//!
//! This crate defines the vocabulary of the streaming subsystem. The
//! coordinator, the transports and the agent all depend on
//! `tessera-domain` and speak its types. No session logic lives here.
//!
//! # Structure
//!
//! - `error`        [`StreamError`] and the [`Result<T>`] alias
//! - `state`        [`StreamState`] session state machine
//! - `progress`     [`ProgressInfo`], [`Direction`]
//! - `session_info` [`SessionInfo`], [`StreamSummary`]
//! - `transport`    [`StreamConnection`], [`StreamConnectionFactory`] traits

mod error;
mod progress;
mod session_info;
mod state;
mod transport;

// --- error
pub use error::{Result, StreamError};

// --- state
pub use state::StreamState;

// --- progress
pub use progress::{Direction, ProgressInfo};

// --- session info
pub use session_info::{SessionInfo, StreamSummary};

// --- transport
pub use transport::{
    // ---
    StreamConnection,
    StreamConnectionFactory,
    StreamConnectionFactoryPtr,
    StreamConnectionPtr,
};
