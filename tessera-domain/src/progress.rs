use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Which way a transfer unit is flowing relative to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
}

// ---------------------------------------------------------------------------
// ProgressInfo
// ---------------------------------------------------------------------------

/// Progress snapshot for one transfer unit within one session.
///
/// Produced by an active session every time a chunk is written or read;
/// folded into the matching [`super::SessionInfo`] by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressInfo {
    // ---
    pub peer: SocketAddr,

    pub session_index: u32,

    /// Name of the unit being transferred.
    pub file_name: String,

    pub direction: Direction,

    /// Bytes transferred so far.
    pub current_bytes: u64,

    /// Size of the whole unit in bytes.
    pub total_bytes: u64,
}

// ---

impl ProgressInfo {
    // ---
    pub fn new(
        peer: SocketAddr,
        session_index: u32,
        file_name: impl Into<String>,
        direction: Direction,
        current_bytes: u64,
        total_bytes: u64,
    ) -> Self {
        // ---
        Self {
            peer,
            session_index,
            file_name: file_name.into(),
            direction,
            current_bytes,
            total_bytes,
        }
    }

    // ---

    /// `true` once every byte of the unit has been transferred.
    pub fn is_completed(&self) -> bool {
        self.current_bytes >= self.total_bytes
    }
}

// ---

impl fmt::Display for ProgressInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.direction {
            Direction::In => "<-",
            Direction::Out => "->",
        };
        write!(
            f,
            "{} {}/{} bytes ({}%) {} {} idx:{}",
            self.file_name,
            self.current_bytes,
            self.total_bytes,
            percent(self.current_bytes, self.total_bytes),
            arrow,
            self.peer,
            self.session_index,
        )
    }
}

// ---

fn percent(current: u64, total: u64) -> u64 {
    if total == 0 {
        return 100;
    }
    current.saturating_mul(100) / total
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn peer() -> SocketAddr {
        "10.0.0.1:7000".parse().unwrap()
    }

    #[test]
    fn completed_once_all_bytes_transferred() {
        // ---
        let partial = ProgressInfo::new(peer(), 0, "a.db", Direction::Out, 10, 20);
        let done = ProgressInfo::new(peer(), 0, "a.db", Direction::Out, 20, 20);

        assert!(!partial.is_completed());
        assert!(done.is_completed());
    }

    // ---

    #[test]
    fn empty_unit_counts_as_complete() {
        // ---
        let empty = ProgressInfo::new(peer(), 3, "empty", Direction::In, 0, 0);
        assert!(empty.is_completed());
        assert!(empty.to_string().contains("(100%)"));
    }
}
