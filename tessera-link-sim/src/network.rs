use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

// ---

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

// ---

use tessera_domain::{Result, StreamConnectionFactory, StreamConnectionPtr, StreamError};

// ---

use super::config::LinkSimConfig;
use super::stream::LinkSimStream;

// ---------------------------------------------------------------------------
// LinkSimNetwork
// ---------------------------------------------------------------------------

/// One accepted connection, as seen by the listening node.
#[derive(Debug)]
pub struct LinkSimIncoming {
    pub stream: LinkSimStream,

    /// Logical address of the dialing node.
    pub from: SocketAddr,
}

// ---

/// Registry of listening addresses.  Cheap to clone; clones share it.
#[derive(Clone, Default)]
pub struct LinkSimNetwork {
    listeners: Arc<Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<LinkSimIncoming>>>>,
}

// ---

impl LinkSimNetwork {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    // ---

    /// Accept connections addressed to `addr`.  Fails if something is
    /// already listening there.
    pub fn listen(&self, addr: SocketAddr) -> Result<mpsc::UnboundedReceiver<LinkSimIncoming>> {
        // ---
        let mut listeners = self.listeners.lock();
        if listeners.get(&addr).is_some_and(|tx| !tx.is_closed()) {
            return Err(StreamError::Transport(format!("{addr} already in use")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(addr, tx);
        tracing::debug!(%addr, "link sim listening");
        Ok(rx)
    }

    // ---

    /// Connection factory for a node whose logical address is `local`.
    pub fn connector(&self, local: SocketAddr, config: LinkSimConfig) -> LinkSimConnector {
        // ---
        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        LinkSimConnector {
            network: self.clone(),
            local,
            config,
            rng: Mutex::new(rng),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    // ---

    fn deliver(&self, to: SocketAddr, incoming: LinkSimIncoming) -> Result<()> {
        // ---
        let listeners = self.listeners.lock();
        let tx = listeners
            .get(&to)
            .ok_or_else(|| StreamError::Transport(format!("connection refused: nothing listening on {to}")))?;
        tx.send(incoming)
            .map_err(|_| StreamError::Transport(format!("connection refused: listener on {to} closed")))
    }
}

// ---------------------------------------------------------------------------
// LinkSimConnector
// ---------------------------------------------------------------------------

/// [`StreamConnectionFactory`] dialing over a [`LinkSimNetwork`] with the
/// impairments of its [`LinkSimConfig`].
pub struct LinkSimConnector {
    // ---
    network: LinkSimNetwork,
    local: SocketAddr,
    config: LinkSimConfig,
    rng: Mutex<SmallRng>,

    /// Dial attempts per `connecting` address, refused ones included.
    attempts: Mutex<HashMap<SocketAddr, u32>>,
}

// ---

impl LinkSimConnector {
    // ---
    pub fn attempts(&self, addr: SocketAddr) -> u32 {
        self.attempts.lock().get(&addr).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts.lock().values().sum()
    }

    // ---

    fn refuse(&self, connecting: SocketAddr) -> bool {
        // ---
        if self.config.unreachable.contains(&connecting) {
            return true;
        }
        let p = self.config.refuse_percent.clamp(0.0, 1.0);
        p > 0.0 && self.rng.lock().gen_bool(p)
    }
}

// ---

#[async_trait]
impl StreamConnectionFactory for LinkSimConnector {
    // ---
    async fn connect(&self, peer: SocketAddr, connecting: SocketAddr) -> Result<StreamConnectionPtr> {
        // ---
        *self.attempts.lock().entry(connecting).or_default() += 1;

        if !self.config.connect_delay.is_zero() {
            tokio::time::sleep(self.config.connect_delay).await;
        }

        if self.refuse(connecting) {
            tracing::debug!(%peer, %connecting, "link sim refused dial");
            return Err(StreamError::Transport(format!("connection to {connecting} refused")));
        }

        let (near, far) = LinkSimStream::pair(self.config.bw_cap_bps);
        self.network.deliver(
            connecting,
            LinkSimIncoming {
                stream: far,
                from: self.local,
            },
        )?;
        Ok(Box::new(near))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 7000))
    }

    // ---

    #[tokio::test]
    async fn dial_reaches_the_listener() {
        // ---
        let net = LinkSimNetwork::new();
        let mut incoming = net.listen(addr(2)).unwrap();
        let connector = net.connector(addr(1), LinkSimConfig::perfect());

        let mut conn = connector.connect(addr(2), addr(2)).await.unwrap();
        conn.write_all(b"ping").await.unwrap();

        let mut accepted = incoming.recv().await.unwrap();
        assert_eq!(accepted.from, addr(1));
        let mut buf = [0u8; 4];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(connector.attempts(addr(2)), 1);
    }

    // ---

    #[tokio::test]
    async fn nothing_listening_is_refused() {
        // ---
        let net = LinkSimNetwork::new();
        let connector = net.connector(addr(1), LinkSimConfig::perfect());
        assert!(connector.connect(addr(3), addr(3)).await.is_err());
    }

    // ---

    #[tokio::test]
    async fn unreachable_addresses_always_fail() {
        // ---
        let net = LinkSimNetwork::new();
        let _incoming = net.listen(addr(2)).unwrap();
        let connector = net.connector(addr(1), LinkSimConfig::perfect().with_unreachable(addr(2)));

        for _ in 0..3 {
            assert!(connector.connect(addr(2), addr(2)).await.is_err());
        }
        assert_eq!(connector.total_attempts(), 3);
    }

    // ---

    #[tokio::test]
    async fn seeded_refusals_are_reproducible() {
        // ---
        let net = LinkSimNetwork::new();
        let _incoming = net.listen(addr(2)).unwrap();

        let mut runs = Vec::new();
        for _ in 0..2 {
            let config = LinkSimConfig {
                connect_delay: Duration::ZERO,
                ..LinkSimConfig::flaky(0.5)
            };
            let connector = net.connector(addr(1), config);
            let mut outcomes = Vec::new();
            for _ in 0..32 {
                outcomes.push(connector.connect(addr(2), addr(2)).await.is_ok());
            }
            runs.push(outcomes);
        }
        assert_eq!(runs[0], runs[1]);
        assert!(runs[0].iter().any(|ok| *ok));
        assert!(runs[0].iter().any(|ok| !*ok));
    }

    // ---

    #[test]
    fn listening_twice_on_one_address_fails() {
        // ---
        let net = LinkSimNetwork::new();
        let _first = net.listen(addr(2)).unwrap();
        assert!(net.listen(addr(2)).is_err());
    }
}
