use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::progress::{Direction, ProgressInfo};
use super::state::StreamState;

// ---------------------------------------------------------------------------
// StreamSummary
// ---------------------------------------------------------------------------

/// What one side of a session announces it is going to send.
///
/// Exchanged in the prepare phase so each side knows how many units to
/// expect before it may declare its own work finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSummary {
    // ---
    pub files: u32,
    pub total_size: u64,
}

// ---

impl StreamSummary {
    // ---
    pub fn new(files: u32, total_size: u64) -> Self {
        Self { files, total_size }
    }
}

// ---------------------------------------------------------------------------
// SessionInfo
// ---------------------------------------------------------------------------

/// Aggregated, addressable summary of one session's transfer progress.
///
/// Registered wholesale once the session has exchanged summaries with its
/// peer, then patched incrementally by [`SessionInfo::update_progress`].
/// Only the latest [`ProgressInfo`] per unit and direction is retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    // ---
    pub peer: SocketAddr,

    pub session_index: u32,

    /// Address actually dialed; may differ from `peer`.
    pub connecting: SocketAddr,

    /// What the peer announced it will send us.
    pub receiving_summaries: Vec<StreamSummary>,

    /// What we announced we will send the peer.
    pub sending_summaries: Vec<StreamSummary>,

    pub state: StreamState,

    receiving_files: HashMap<String, ProgressInfo>,
    sending_files: HashMap<String, ProgressInfo>,
}

// ---

impl SessionInfo {
    // ---
    pub fn new(
        peer: SocketAddr,
        session_index: u32,
        connecting: SocketAddr,
        receiving_summaries: Vec<StreamSummary>,
        sending_summaries: Vec<StreamSummary>,
        state: StreamState,
    ) -> Self {
        // ---
        Self {
            peer,
            session_index,
            connecting,
            receiving_summaries,
            sending_summaries,
            state,
            receiving_files: HashMap::new(),
            sending_files: HashMap::new(),
        }
    }

    // ---

    /// Record the latest progress for one unit, replacing any earlier
    /// report for the same unit and direction.
    pub fn update_progress(&mut self, info: ProgressInfo) {
        // ---
        let files = match info.direction {
            Direction::In => &mut self.receiving_files,
            Direction::Out => &mut self.sending_files,
        };
        files.insert(info.file_name.clone(), info);
    }

    // ---

    pub fn receiving_files(&self) -> impl Iterator<Item = &ProgressInfo> {
        self.receiving_files.values()
    }

    pub fn sending_files(&self) -> impl Iterator<Item = &ProgressInfo> {
        self.sending_files.values()
    }

    pub fn is_failed(&self) -> bool {
        self.state == StreamState::Failed
    }

    // --- announced totals ---------------------------------------------------

    pub fn total_files_to_receive(&self) -> u64 {
        total_files(&self.receiving_summaries)
    }

    pub fn total_files_to_send(&self) -> u64 {
        total_files(&self.sending_summaries)
    }

    pub fn total_size_to_receive(&self) -> u64 {
        total_size(&self.receiving_summaries)
    }

    pub fn total_size_to_send(&self) -> u64 {
        total_size(&self.sending_summaries)
    }

    // --- observed progress --------------------------------------------------

    pub fn total_files_received(&self) -> u64 {
        completed_files(&self.receiving_files)
    }

    pub fn total_files_sent(&self) -> u64 {
        completed_files(&self.sending_files)
    }

    pub fn total_size_received(&self) -> u64 {
        transferred_bytes(&self.receiving_files)
    }

    pub fn total_size_sent(&self) -> u64 {
        transferred_bytes(&self.sending_files)
    }
}

// ---

fn total_files(summaries: &[StreamSummary]) -> u64 {
    summaries.iter().map(|s| u64::from(s.files)).sum()
}

fn total_size(summaries: &[StreamSummary]) -> u64 {
    summaries.iter().map(|s| s.total_size).sum()
}

fn completed_files(files: &HashMap<String, ProgressInfo>) -> u64 {
    files.values().filter(|p| p.is_completed()).count() as u64
}

fn transferred_bytes(files: &HashMap<String, ProgressInfo>) -> u64 {
    files.values().map(|p| p.current_bytes).sum()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
