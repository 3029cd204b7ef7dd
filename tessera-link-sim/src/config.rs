use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

// ---------------------------------------------------------------------------
// LinkSimConfig
// ---------------------------------------------------------------------------

/// Configuration for the in-process link simulator.
///
/// All fields default to a perfect network: every dial succeeds at once
/// and nothing is capped.
#[derive(Debug, Clone)]
pub struct LinkSimConfig {
    // ---
    /// Probability `[0.0, 1.0]` that any given dial is refused.
    pub refuse_percent: f64,

    /// Dials to these addresses always fail.
    pub unreachable: HashSet<SocketAddr>,

    /// Added latency before every dial resolves.
    pub connect_delay: Duration,

    /// Caps each direction of each connection using a token bucket.
    /// `None` = unlimited.
    pub bw_cap_bps: Option<u64>,

    /// RNG seed for reproducible refusal sequences. `None` = random.
    pub seed: Option<u64>,
}

// ---

impl Default for LinkSimConfig {
    fn default() -> Self {
        // ---
        Self {
            refuse_percent: 0.0,
            unreachable: HashSet::new(),
            connect_delay: Duration::ZERO,
            bw_cap_bps: None,
            seed: None,
        }
    }
}

// ---

impl LinkSimConfig {
    // ---
    /// Perfect network: no impairments. Useful as a baseline.
    pub fn perfect() -> Self {
        Self::default()
    }

    // ---

    /// Network refusing a fraction `refuse_percent` of dials, seeded so a
    /// test sees the same refusals on every run.
    pub fn flaky(refuse_percent: f64) -> Self {
        // ---
        Self {
            refuse_percent,
            connect_delay: Duration::from_millis(5),
            seed: Some(0x7E55_E4A0),
            ..Default::default()
        }
    }

    // ---

    /// Mark `addr` as never reachable.
    pub fn with_unreachable(mut self, addr: SocketAddr) -> Self {
        self.unreachable.insert(addr);
        self
    }
}
