//! [`CoordinatorConfig`]: static parameters of a stream coordinator.

use std::net::{Ipv4Addr, SocketAddr};

use uuid::Uuid;

// ---------------------------------------------------------------------------
// CoordinatorConfig
// ---------------------------------------------------------------------------

/// Static parameters of one [`super::StreamCoordinator`].
///
/// Defaults to a receiving-role coordinator for a fresh random plan.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    // ---
    /// Identifies the data movement operation this coordinator serves.
    pub plan_id: Uuid,

    /// Free-form label (`"bootstrap"`, `"repair"`, ...) carried in the
    /// session handshake and in logs.
    pub description: String,

    /// Physical connections multiplexed per peer.  `0` puts the
    /// coordinator in the receiving role, where sessions are created by
    /// id on behalf of the remote sender.
    pub connections_per_host: u32,

    /// This node's logical address, announced to peers when initiating.
    pub local: SocketAddr,
}

// ---

impl Default for CoordinatorConfig {
    fn default() -> Self {
        // ---
        Self {
            plan_id: Uuid::new_v4(),
            description: String::from("stream"),
            connections_per_host: 0,
            local: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        }
    }
}

// ---

impl CoordinatorConfig {
    // ---
    /// Sending role with `connections_per_host` connections to each peer.
    pub fn sending(connections_per_host: u32, local: SocketAddr) -> Self {
        // ---
        Self {
            connections_per_host,
            local,
            ..Default::default()
        }
    }

    // ---

    /// Receiving role for a plan chosen by the remote sender.
    pub fn receiving(plan_id: Uuid, description: impl Into<String>) -> Self {
        // ---
        Self {
            plan_id,
            description: description.into(),
            ..Default::default()
        }
    }

    // ---

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}
