//! Application-side [`StreamEventHandler`]s for the two run modes.
//!
//! - [`FileSink`] (receive mode) writes every received unit to disk and
//!   logs its SHA-256 so operators can compare against the sender.
//! - [`SendReporter`] (send mode) logs each unit as the peer finishes
//!   receiving it.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

// ---

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

// ---

use tessera_domain::{Direction, ProgressInfo, SessionInfo};
use tessera_streaming::StreamEventHandler;

// ---

pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ---------------------------------------------------------------------------
// FileSink
// ---------------------------------------------------------------------------

pub struct FileSink {
    out_dir: PathBuf,
}

// ---

impl FileSink {
    // ---
    pub fn new(out_dir: PathBuf) -> Self {
        Self { out_dir }
    }

    // ---

    /// Destination for unit `name` from `peer`.  Only the final path
    /// component of `name` is used so a sender cannot escape `out_dir`.
    fn target(&self, peer: SocketAddr, name: &str) -> Option<PathBuf> {
        // ---
        let file_name = Path::new(name).file_name()?;
        let sender_dir = peer.to_string().replace(':', "_");
        Some(self.out_dir.join(sender_dir).join(file_name))
    }
}

// ---

#[async_trait]
impl StreamEventHandler for FileSink {
    // ---
    async fn on_session_prepared(&self, info: &SessionInfo) {
        info!(
            peer = %info.peer,
            session_index = info.session_index,
            files = info.total_files_to_receive(),
            bytes = info.total_size_to_receive(),
            "incoming session prepared"
        );
    }

    // ---

    async fn on_unit_received(&self, peer: SocketAddr, session_index: u32, name: String, data: Vec<u8>) {
        // ---
        let Some(path) = self.target(peer, &name) else {
            warn!(%peer, session_index, unit = %name, "unusable unit name, discarding");
            return;
        };

        if let Some(dir) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                warn!(%peer, dir = %dir.display(), "cannot create directory: {e}");
                return;
            }
        }

        let digest = sha256_hex(&data);
        match tokio::fs::write(&path, &data).await {
            Ok(()) => info!(
                %peer,
                session_index,
                path = %path.display(),
                bytes = data.len(),
                sha256 = %digest,
                "unit stored"
            ),
            Err(e) => warn!(%peer, session_index, path = %path.display(), "write failed: {e}"),
        }
    }

    // ---

    async fn on_session_complete(&self, peer: SocketAddr, session_index: u32, success: bool, reason: Option<&str>) {
        if !success {
            warn!(%peer, session_index, reason = reason.unwrap_or("unknown"), "incoming session failed");
        }
    }
}

// ---------------------------------------------------------------------------
// SendReporter
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct SendReporter;

// ---

#[async_trait]
impl StreamEventHandler for SendReporter {
    // ---
    async fn on_progress(&self, progress: &ProgressInfo) {
        if progress.direction == Direction::Out && progress.is_completed() {
            info!(
                peer = %progress.peer,
                session_index = progress.session_index,
                unit = %progress.file_name,
                bytes = progress.total_bytes,
                "unit sent"
            );
        }
    }

    // ---

    async fn on_session_complete(&self, peer: SocketAddr, session_index: u32, success: bool, reason: Option<&str>) {
        if success {
            info!(%peer, session_index, "session complete");
        } else {
            warn!(%peer, session_index, reason = reason.unwrap_or("unknown"), "session failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
