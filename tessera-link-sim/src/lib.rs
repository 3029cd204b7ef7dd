//! In-process simulated network for Tessera unit and integration testing.
//!
//! [`LinkSimNetwork`] stands in for a set of nodes reachable over TCP.
//! Nodes register with [`LinkSimNetwork::listen`]; senders dial through a
//! [`LinkSimConnector`], which implements
//! [`tessera_domain::StreamConnectionFactory`] over tokio channels.
//! [`LinkSimConfig`] controls injected impairments:
//!
//! - Connect refusal probability
//! - Addresses that are never reachable
//! - Connect latency
//! - Bandwidth cap (token bucket)
//! - Deterministic RNG seed for reproducible runs
//!
//! # Quick start
//!
//! ```rust
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! use tessera_link_sim::{LinkSimConfig, LinkSimNetwork};
//!
//! # fn main() -> tessera_domain::Result<()> {
//! let local_addr = SocketAddr::from(([10, 0, 0, 1], 7000));
//! let receiver_addr = SocketAddr::from(([10, 0, 0, 2], 7000));
//!
//! let net = LinkSimNetwork::new();
//! let incoming = net.listen(receiver_addr)?;
//! let factory = Arc::new(net.connector(local_addr, LinkSimConfig::flaky(0.2)));
//! # drop((incoming, factory));
//! # Ok(())
//! # }
//! ```

mod config;
mod network;
mod stream;

// --- public API
pub use config::LinkSimConfig;
pub use network::{LinkSimConnector, LinkSimIncoming, LinkSimNetwork};
pub use stream::LinkSimStream;
