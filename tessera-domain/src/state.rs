use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// StreamState
// ---------------------------------------------------------------------------

/// Lifecycle of one stream session.
///
/// ```text
/// Init ──▶ Preparing ──▶ Streaming ──▶ WaitComplete ──▶ Complete
///   │          │             │              │
///   └──────────┴─────────────┴──────────────┴────────▶ Failed
/// ```
///
/// `Complete` and `Failed` are terminal. A session is *active* while it is
/// in any other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    // ---
    /// Created, not yet connected.
    Init,

    /// Connected; exchanging summaries of what each side will send.
    Preparing,

    /// Sending and receiving transfer units.
    Streaming,

    /// All local work done; waiting for the peer's completion message.
    WaitComplete,

    /// Terminal success.
    Complete,

    /// Terminal failure.
    Failed,
}

// ---

impl StreamState {
    // ---
    /// Position along the success path. `Failed` sorts after everything.
    fn rank(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Preparing => 1,
            Self::Streaming => 2,
            Self::WaitComplete => 3,
            Self::Complete => 4,
            Self::Failed => 5,
        }
    }

    // ---

    /// `true` for `Complete` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// `true` while the session still has work outstanding.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    // ---

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Terminal states never move. `Failed` is reachable from every
    /// non-terminal state; otherwise transitions only go forward.
    pub fn can_transition_to(self, next: StreamState) -> bool {
        // ---
        if self.is_terminal() {
            return false;
        }
        if next == Self::Failed {
            return true;
        }
        next.rank() > self.rank()
    }
}

// ---

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Preparing => "PREPARING",
            Self::Streaming => "STREAMING",
            Self::WaitComplete => "WAIT_COMPLETE",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn only_terminal_states_are_inactive() {
        // ---
        assert!(StreamState::Init.is_active());
        assert!(StreamState::Preparing.is_active());
        assert!(StreamState::Streaming.is_active());
        assert!(StreamState::WaitComplete.is_active());
        assert!(!StreamState::Complete.is_active());
        assert!(!StreamState::Failed.is_active());
    }

    // ---

    #[test]
    fn failed_reachable_from_every_non_terminal_state() {
        // ---
        for s in [
            StreamState::Init,
            StreamState::Preparing,
            StreamState::Streaming,
            StreamState::WaitComplete,
        ] {
            assert!(s.can_transition_to(StreamState::Failed), "{s} -> FAILED");
        }
    }

    // ---

    #[test]
    fn terminal_states_never_move() {
        // ---
        assert!(!StreamState::Complete.can_transition_to(StreamState::Failed));
        assert!(!StreamState::Failed.can_transition_to(StreamState::Complete));
        assert!(!StreamState::Failed.can_transition_to(StreamState::Init));
    }

    // ---

    #[test]
    fn transitions_only_move_forward() {
        // ---
        assert!(StreamState::Init.can_transition_to(StreamState::Preparing));
        assert!(StreamState::Preparing.can_transition_to(StreamState::Streaming));
        assert!(StreamState::Streaming.can_transition_to(StreamState::WaitComplete));
        assert!(StreamState::WaitComplete.can_transition_to(StreamState::Complete));

        assert!(!StreamState::Streaming.can_transition_to(StreamState::Preparing));
        assert!(!StreamState::Preparing.can_transition_to(StreamState::Preparing));
    }
}
