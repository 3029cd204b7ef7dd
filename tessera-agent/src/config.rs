//! CLI configuration for `tessera-agent`.
//!
//! Run modes:
//!   tessera-agent receive [--bind 0.0.0.0:7000] [--out-dir /tmp/tessera-received]
//!   tessera-agent send --local 10.0.0.1:7000 --peer 10.0.0.2:7000 --peer 10.0.0.3:7000 users-1.db users-2.db

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "tessera-agent", about = "Tessera streaming daemon")]
pub struct Config {
    // ---
    #[command(subcommand)]
    pub mode: Mode,

    /// Connection-establishment workers.  Defaults to the number of
    /// available CPUs.
    #[arg(long, global = true)]
    pub pool_size: Option<usize>,

    /// Dials still pending after this many seconds fail.
    #[arg(long, global = true, default_value_t = 10)]
    pub connect_timeout_secs: u64,
}

// ---

#[derive(Debug, Subcommand)]
pub enum Mode {
    // ---
    /// Accept stream sessions from peers and write received units to disk.
    Receive {
        /// TCP address to listen on.
        #[arg(long, default_value = "0.0.0.0:7000")]
        bind: SocketAddr,

        /// Received units land in `<out-dir>/<sender>/<name>`.
        #[arg(long, default_value = "/tmp/tessera-received")]
        out_dir: PathBuf,
    },

    /// Stream files to one or more peers.
    Send {
        // ---
        /// This node's address as peers should know it.
        #[arg(long)]
        local: SocketAddr,

        /// Receiving peer.  Repeat for several peers; every peer gets every
        /// file.
        #[arg(long = "peer", required = true)]
        peers: Vec<SocketAddr>,

        /// Parallel connections per peer; files are spread over them
        /// round-robin.
        #[arg(long, default_value_t = 2)]
        connections_per_host: u32,

        /// Label carried to the receivers and into the logs.
        #[arg(long, default_value = "bulk")]
        description: String,

        /// Write the final per-session report here as JSON.
        #[arg(long)]
        report: Option<PathBuf>,

        /// Files to send.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}
