//! TCP transport for Tessera streaming sessions.
//!
//! - [`TcpConnector`] implements [`tessera_domain::StreamConnectionFactory`] over
//!   `tokio::net::TcpStream`
//! - [`TcpStreamListener`] runs an accept loop feeding inbound connections to a
//!   channel

mod config;
mod transport;

pub use config::TcpConfig;
pub use transport::{TcpConnector, TcpStreamListener};
