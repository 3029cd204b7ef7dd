//! Session → coordinator event channel.
//!
//! Every [`super::StreamSession`] holds a clone of [`StreamEventTx`] and
//! publishes lifecycle and progress events on it from its own tasks.  The
//! receiving end is drained by [`super::StreamMonitor`], which folds the
//! events into the coordinator under its lock and forwards them to the
//! application's [`StreamEventHandler`].

use std::net::SocketAddr;

// ---

use async_trait::async_trait;
use tokio::sync::mpsc;

// ---

use tessera_domain::{ProgressInfo, SessionInfo};

// ---------------------------------------------------------------------------
// StreamEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum StreamEvent {
    // ---
    /// Both sides have exchanged summaries; the session is now streaming.
    SessionPrepared(SessionInfo),

    /// A chunk of a unit was written or read.
    Progress(ProgressInfo),

    /// A whole unit arrived from the peer.
    UnitReceived {
        peer: SocketAddr,
        session_index: u32,
        name: String,
        data: Vec<u8>,
    },

    /// The session reached a terminal state.
    SessionComplete {
        peer: SocketAddr,
        session_index: u32,
        success: bool,
        reason: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// StreamEventTx
// ---------------------------------------------------------------------------

/// Cheap-clone sender handle.  Cloned into every session of a coordinator.
#[derive(Clone, Debug)]
pub struct StreamEventTx {
    // ---
    tx: mpsc::UnboundedSender<StreamEvent>,
}

// ---

impl StreamEventTx {
    // ---
    /// Create a connected sender / receiver pair.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    // ---

    /// Publish an event. Returns `false` if nobody is listening any more.
    pub fn send(&self, event: StreamEvent) -> bool {
        if self.tx.send(event).is_err() {
            tracing::debug!("stream event channel closed, dropping event");
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// StreamEventHandler
// ---------------------------------------------------------------------------

/// Application callback interface.
///
/// All methods have default no-op implementations; implementors only
/// override what they need.
#[async_trait]
pub trait StreamEventHandler: Send + Sync {
    // ---
    async fn on_session_prepared(&self, info: &SessionInfo) {
        let _ = info;
    }

    // ---

    async fn on_progress(&self, progress: &ProgressInfo) {
        let _ = progress;
    }

    // ---

    /// Called once per unit received from a peer. The handler owns `data`.
    async fn on_unit_received(&self, peer: SocketAddr, session_index: u32, name: String, data: Vec<u8>) {
        let _ = (peer, session_index, name, data);
    }

    // ---

    async fn on_session_complete(
        &self,
        peer: SocketAddr,
        session_index: u32,
        success: bool,
        reason: Option<&str>,
    ) {
        let _ = (peer, session_index, success, reason);
    }
}

// ---

/// Handler that ignores everything.
pub struct NoopHandler;

impl StreamEventHandler for NoopHandler {}
