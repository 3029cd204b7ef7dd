use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::error::Result;

// ---------------------------------------------------------------------------
// StreamConnection
// ---------------------------------------------------------------------------

/// A connected, bidirectional byte pipe to one peer.
///
/// Anything that is [`AsyncRead`] + [`AsyncWrite`] qualifies, so the session
/// layer never knows whether it is talking to a TCP socket or an in-process
/// duplex pipe. Bytes written are delivered in order; a broken transport
/// surfaces as an I/O error on the next read or write.
pub trait StreamConnection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> StreamConnection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

// ---

/// Convenience type alias for a heap-allocated [`StreamConnection`].
pub type StreamConnectionPtr = Box<dyn StreamConnection>;

/// Shared handle to a [`StreamConnectionFactory`].
pub type StreamConnectionFactoryPtr = Arc<dyn StreamConnectionFactory>;

// ---------------------------------------------------------------------------
// StreamConnectionFactory
// ---------------------------------------------------------------------------

/// Factory trait for establishing stream connections.
///
/// Implementations: `tessera_tcp::TcpConnector`,
/// `tessera_link_sim::LinkSimConnector`.
#[async_trait]
pub trait StreamConnectionFactory: Send + Sync {
    // ---
    /// Dial `connecting` on behalf of the logical endpoint `peer`.
    ///
    /// `peer` and `connecting` differ when the peer is reached through a
    /// proxy or a private address. Timeouts are the implementation's
    /// concern.
    async fn connect(&self, peer: SocketAddr, connecting: SocketAddr) -> Result<StreamConnectionPtr>;
}
