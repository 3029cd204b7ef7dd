//! Tessera agent daemon.
//!
//! Streams files between nodes over TCP using the Tessera streaming
//! coordinator.
//!
//! Usage:
//!   tessera-agent receive --bind 0.0.0.0:7000 --out-dir /var/lib/tessera/in
//!   tessera-agent send --local 10.0.0.1:7000 --peer 10.0.0.2:7000 users-1.db users-2.db

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// ---

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

// ---

use tessera_streaming::{
    // ---
    ConnectPool,
    CoordinatorConfig,
    StreamCoordinator,
    StreamEventTx,
    StreamMonitor,
    StreamReceiver,
};
use tessera_tcp::{TcpConfig, TcpConnector, TcpStreamListener};

// ---

mod config;
mod handlers;

// ---

use config::{Config, Mode};
use handlers::{sha256_hex, FileSink, SendReporter};

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    let cfg = Config::parse();

    let no_color = std::env::var("EMACS").is_ok()
        || std::env::var("NO_COLOR").is_ok()
        || std::env::var("CARGO_TERM_COLOR").as_deref() == Ok("never")
        || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_ansi(!no_color)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "tessera-agent starting");

    let pool = ConnectPool::init_global(cfg.pool_size);
    info!(pool = pool.name(), size = pool.size(), "connect pool ready");

    let tcp = TcpConfig {
        connect_timeout: Duration::from_secs(cfg.connect_timeout_secs),
        ..Default::default()
    };

    let result = match cfg.mode {
        Mode::Receive { bind, out_dir } => run_receive(bind, out_dir, tcp).await,
        Mode::Send {
            local,
            peers,
            connections_per_host,
            description,
            report,
            files,
        } => {
            let plan = SendPlan {
                local,
                peers,
                connections_per_host,
                description,
                report,
                files,
            };
            run_send(plan, tcp).await
        }
    };

    ConnectPool::shutdown_global().await;
    info!("shutting down");
    result
}

// ---------------------------------------------------------------------------
// receive
// ---------------------------------------------------------------------------

async fn run_receive(bind: std::net::SocketAddr, out_dir: PathBuf, tcp: TcpConfig) -> anyhow::Result<()> {
    // ---
    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;
    info!(out_dir = %out_dir.display(), "output directory ready");

    let (listener, mut incoming) = TcpStreamListener::bind(bind, tcp.clone()).await?;
    info!(addr = %listener.local_addr(), "receive mode, waiting for senders");

    let (receiver, mut outcomes) = StreamReceiver::new(
        Arc::new(TcpConnector::new(tcp)),
        ConnectPool::global(),
        Arc::new(FileSink::new(out_dir)),
    );

    loop {
        tokio::select! {
            Some((conn, remote)) = incoming.recv() => {
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    if let Err(e) = receiver.accept(conn).await {
                        warn!(%remote, "rejected inbound connection: {e}");
                    }
                });
            }

            Some(outcome) = outcomes.recv() => {
                info!(
                    plan_id = %outcome.plan_id,
                    sessions = outcome.sessions.len(),
                    bytes = outcome.total_size_received(),
                    failed = outcome.has_failures(),
                    "plan done"
                );
            }

            r = tokio::signal::ctrl_c() => {
                r?;
                info!(active_plans = receiver.active_plans().len(), "interrupted");
                return Ok(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// send
// ---------------------------------------------------------------------------

struct SendPlan {
    local: std::net::SocketAddr,
    peers: Vec<std::net::SocketAddr>,
    connections_per_host: u32,
    description: String,
    report: Option<PathBuf>,
    files: Vec<PathBuf>,
}

// ---

async fn run_send(plan: SendPlan, tcp: TcpConfig) -> anyhow::Result<()> {
    // ---
    let config = CoordinatorConfig::sending(plan.connections_per_host, plan.local).with_description(&plan.description);
    let (events, rx) = StreamEventTx::channel();
    let coordinator = Arc::new(StreamCoordinator::new(
        config,
        Arc::new(TcpConnector::new(tcp)),
        ConnectPool::global(),
        events,
    ));

    info!(
        plan_id = %coordinator.plan_id(),
        description = %plan.description,
        peers = plan.peers.len(),
        files = plan.files.len(),
        "send mode"
    );

    // Every peer gets every file, spread over its connections.
    let mut names = HashSet::new();
    for path in &plan.files {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", path.display()))?;
        if !names.insert(name.clone()) {
            anyhow::bail!("more than one file named {name}");
        }

        info!(unit = %name, bytes = data.len(), sha256 = %sha256_hex(&data), "queued");

        for peer in &plan.peers {
            let session = coordinator.get_or_create_next_session(*peer, *peer);
            session.add_transfer(name.clone(), data.clone())?;
        }
    }

    let submitted = coordinator.connect_all_stream_sessions();
    info!(sessions = submitted, "connecting");

    let mut monitor = StreamMonitor::new(Arc::clone(&coordinator), rx, Arc::new(SendReporter));
    let outcome = monitor.run_until_drained().await;

    if let Some(path) = &plan.report {
        let json = serde_json::to_vec_pretty(&outcome)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("writing report {}", path.display()))?;
        info!(path = %path.display(), "report written");
    }

    if outcome.has_failures() {
        for f in &outcome.failures {
            warn!(peer = %f.peer, session_index = ?f.session_index, "failed: {}", f.reason);
        }
        anyhow::bail!("{} of {} sessions failed", outcome.failures.len(), submitted);
    }

    info!(bytes = outcome.total_size_sent(), "all sessions complete");
    Ok(())
}
