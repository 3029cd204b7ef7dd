//! [`TcpConnector`] and [`TcpStreamListener`].

use std::net::SocketAddr;

// ---

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ---

use tessera_domain::{
    // ---
    Result,
    StreamConnectionFactory,
    StreamConnectionPtr,
    StreamError,
};

// ---

use crate::config::TcpConfig;

// ---------------------------------------------------------------------------
// TcpConnector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: TcpConfig,
}

// ---

impl TcpConnector {
    // ---
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

// ---

#[async_trait]
impl StreamConnectionFactory for TcpConnector {
    // ---
    async fn connect(&self, peer: SocketAddr, connecting: SocketAddr) -> Result<StreamConnectionPtr> {
        // ---
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(connecting))
            .await
            .map_err(|_| {
                StreamError::Transport(format!(
                    "connect to {connecting} timed out after {:?}",
                    self.config.connect_timeout
                ))
            })?
            .map_err(|e| StreamError::Transport(format!("connect to {connecting}: {e}")))?;

        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }

        tracing::debug!(%peer, %connecting, "tcp connection established");
        Ok(Box::new(stream))
    }
}

// ---------------------------------------------------------------------------
// TcpStreamListener
// ---------------------------------------------------------------------------

/// Bound listener whose accept loop runs on its own task.  Dropping the
/// handle stops accepting.
pub struct TcpStreamListener {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

// ---

impl TcpStreamListener {
    // ---
    /// Bind `addr` and start accepting.  Each accepted connection is sent
    /// with its remote address on the returned channel.
    pub async fn bind(
        addr: SocketAddr,
        config: TcpConfig,
    ) -> Result<(Self, mpsc::Receiver<(StreamConnectionPtr, SocketAddr)>)> {
        // ---
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StreamError::Transport(format!("bind {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(16);

        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(%local_addr, "accept failed: {e}");
                        continue;
                    }
                };
                if config.nodelay {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::warn!(%remote, "set_nodelay failed: {e}");
                    }
                }
                let conn: StreamConnectionPtr = Box::new(stream);
                if tx.send((conn, remote)).await.is_err() {
                    tracing::debug!(%local_addr, "listener receiver dropped, stopping accept loop");
                    return;
                }
            }
        });

        tracing::info!(%local_addr, "tcp listener bound");
        Ok((Self { local_addr, accept_task }, rx))
    }

    // ---

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

// ---

impl Drop for TcpStreamListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
