//! [`TcpConfig`]: dial and socket options for the TCP transport.

use std::time::Duration;

// ---------------------------------------------------------------------------
// TcpConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TcpConfig {
    // ---
    /// Dials still pending after this long fail.
    pub connect_timeout: Duration,

    /// Disable Nagle on every connection.  Control frames are small and
    /// latency-sensitive.
    pub nodelay: bool,
}

// ---

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            nodelay: true,
        }
    }
}
