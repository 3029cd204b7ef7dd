//! [`StreamCoordinator`]: the per-plan registry of peers and sessions.
//!
//! One coordinator serves one data movement plan.  It multiplexes up to
//! `connections_per_host` sessions per peer (sending role) or files
//! sessions under the ids the remote sender chose (receiving role), and
//! folds the progress those sessions report into per-session summaries.
//!
//! Everything the coordinator owns sits behind one `parking_lot::Mutex`.
//! Operations take it briefly and never across an `.await`; connecting and
//! transferring happen outside it, on the connect executor and on the
//! sessions' own tasks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

// ---

use parking_lot::Mutex;
use uuid::Uuid;

// ---

use tessera_domain::{ProgressInfo, Result, SessionInfo, StreamConnectionFactoryPtr, StreamError};

// ---

use super::host_data::HostStreamingData;
use super::session::{SessionContext, StreamSession};
use super::{ConnectExecutorPtr, CoordinatorConfig, StreamEventTx};

// ---------------------------------------------------------------------------
// StreamCoordinator
// ---------------------------------------------------------------------------

pub struct StreamCoordinator {
    // ---
    config: CoordinatorConfig,
    executor: ConnectExecutorPtr,
    ctx: Arc<SessionContext>,
    inner: Mutex<Inner>,
}

struct Inner {
    peers: HashMap<SocketAddr, HostStreamingData>,

    /// Captured by each session at creation.
    factory: StreamConnectionFactoryPtr,

    /// Receiving role: sessions each remote sender said it would open.
    expected: HashMap<SocketAddr, u32>,
}

// ---

impl StreamCoordinator {
    // ---
    /// Sessions created by this coordinator publish on `events`; hand the
    /// matching receiver to a [`super::StreamMonitor`].
    pub fn new(
        config: CoordinatorConfig,
        factory: StreamConnectionFactoryPtr,
        executor: ConnectExecutorPtr,
        events: StreamEventTx,
    ) -> Self {
        // ---
        let ctx = Arc::new(SessionContext {
            plan_id: config.plan_id,
            description: config.description.clone(),
            local: config.local,
            events,
        });

        tracing::debug!(
            plan_id = %config.plan_id,
            description = %config.description,
            connections_per_host = config.connections_per_host,
            "stream coordinator created"
        );

        Self {
            config,
            executor,
            ctx,
            inner: Mutex::new(Inner {
                peers: HashMap::new(),
                factory,
                expected: HashMap::new(),
            }),
        }
    }

    // --- accessors ----------------------------------------------------------

    pub fn plan_id(&self) -> Uuid {
        self.config.plan_id
    }

    pub fn description(&self) -> &str {
        &self.config.description
    }

    pub fn connections_per_host(&self) -> u32 {
        self.config.connections_per_host
    }

    pub fn local(&self) -> SocketAddr {
        self.config.local
    }

    /// `true` when sessions are created by id for a remote sender.
    pub fn is_receiving(&self) -> bool {
        self.config.connections_per_host == 0
    }

    /// Replace the factory used by sessions created from now on.  Existing
    /// sessions keep the one they were created with.
    pub fn set_connection_factory(&self, factory: StreamConnectionFactoryPtr) {
        self.inner.lock().factory = factory;
    }

    // --- session creation -----------------------------------------------

    /// Next session for `peer` in round-robin order, creating one while
    /// the peer has fewer than `connections_per_host`.
    pub fn get_or_create_next_session(&self, peer: SocketAddr, connecting: SocketAddr) -> Arc<StreamSession> {
        // ---
        let mut inner = self.inner.lock();
        let Inner { peers, factory, .. } = &mut *inner;
        self.host_entry(peers, peer)
            .get_or_create_next_session(peer, connecting, factory)
    }

    // ---

    /// The session registered under `id` for `peer`, created if absent.
    pub fn get_or_create_session_by_id(
        &self,
        peer: SocketAddr,
        id: u32,
        connecting: SocketAddr,
    ) -> Arc<StreamSession> {
        // ---
        let mut inner = self.inner.lock();
        let Inner { peers, factory, .. } = &mut *inner;
        self.host_entry(peers, peer)
            .get_or_create_session_by_id(peer, id, connecting, factory)
    }

    // ---

    fn host_entry<'a>(
        &self,
        peers: &'a mut HashMap<SocketAddr, HostStreamingData>,
        peer: SocketAddr,
    ) -> &'a mut HostStreamingData {
        // ---
        peers
            .entry(peer)
            .or_insert_with(|| HostStreamingData::new(self.config.connections_per_host, Arc::clone(&self.ctx)))
    }

    // --- connection -----------------------------------------------------

    /// Submit one connect task per session to the executor and return how
    /// many were submitted.  Does not wait for any of them.
    ///
    /// A task the executor drops without running fails its session.
    pub fn connect_all_stream_sessions(&self) -> usize {
        // ---
        // Snapshot under the lock; submit outside it.
        let sessions = self.all_stream_sessions();
        let submitted = sessions.len();

        let mut per_peer: HashMap<SocketAddr, u32> = HashMap::new();
        for session in &sessions {
            *per_peer.entry(session.peer()).or_default() += 1;
        }

        for session in sessions {
            session.announce_peer_sessions(per_peer.get(&session.peer()).copied().unwrap_or(0));
            let guard = StartGuard(Some(Arc::clone(&session)));
            self.executor.execute(Box::pin(async move {
                session.start().await;
                guard.disarm();
                if session.is_active() {
                    tracing::info!(
                        plan_id = %session.plan_id(),
                        session_index = session.session_index(),
                        peer = %session.peer(),
                        connecting = %session.connecting(),
                        "beginning stream session"
                    );
                }
            }));
        }

        tracing::debug!(plan_id = %self.config.plan_id, submitted, "connect tasks submitted");
        submitted
    }

    // --- snapshots ------------------------------------------------------

    pub fn has_active_sessions(&self) -> bool {
        self.inner.lock().peers.values().any(|h| h.has_active_sessions())
    }

    /// Every session, grouped by peer in address order, each peer's in
    /// creation order.
    pub fn all_stream_sessions(&self) -> Vec<Arc<StreamSession>> {
        // ---
        let inner = self.inner.lock();
        sorted_hosts(&inner.peers)
            .flat_map(|(_, h)| h.all_stream_sessions())
            .collect()
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        // ---
        let inner = self.inner.lock();
        sorted_hosts(&inner.peers).map(|(p, _)| p).collect()
    }

    pub fn all_session_info(&self) -> Vec<SessionInfo> {
        // ---
        let inner = self.inner.lock();
        sorted_hosts(&inner.peers)
            .flat_map(|(_, h)| h.all_session_info())
            .collect()
    }

    // --- bookkeeping ----------------------------------------------------

    /// Fold one progress report into its session's summary.
    pub fn update_progress(&self, info: ProgressInfo) -> Result<()> {
        // ---
        let mut inner = self.inner.lock();
        let host = inner
            .peers
            .get_mut(&info.peer)
            .ok_or(StreamError::UnknownPeer(info.peer))?;
        host.update_progress(info)
    }

    // ---

    pub fn add_session_info(&self, info: SessionInfo) {
        // ---
        let mut inner = self.inner.lock();
        let Inner { peers, .. } = &mut *inner;
        self.host_entry(peers, info.peer).add_session_info(info);
    }

    // --- announced sessions (receiving role) ----------------------------

    /// `peer` said it opens `count` sessions in this plan.  Zero means it
    /// did not say.
    pub(crate) fn expect_sessions(&self, peer: SocketAddr, count: u32) {
        // ---
        let mut inner = self.inner.lock();
        let want = inner.expected.entry(peer).or_default();
        *want = (*want).max(count);
    }

    /// Peers that announced more sessions than have arrived, with the
    /// number still missing, in address order.
    pub(crate) fn missing_sessions(&self) -> Vec<(SocketAddr, u32)> {
        // ---
        let inner = self.inner.lock();
        let mut missing: Vec<(SocketAddr, u32)> = inner
            .expected
            .iter()
            .filter_map(|(peer, &want)| {
                let have = inner.peers.get(peer).map_or(0, |h| h.session_count());
                (have < want).then_some((*peer, want - have))
            })
            .collect();
        missing.sort_unstable();
        missing
    }

    /// Stop waiting for announced sessions that have not arrived.
    pub(crate) fn forget_missing_sessions(&self) {
        // ---
        let mut inner = self.inner.lock();
        let Inner { peers, expected, .. } = &mut *inner;
        for (peer, want) in expected.iter_mut() {
            *want = peers.get(peer).map_or(0, |h| h.session_count());
        }
    }
}

// ---

/// Fails its session if the connect task is dropped before `start`
/// returns, e.g. by an executor that has shut down.
struct StartGuard(Option<Arc<StreamSession>>);

impl StartGuard {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        if let Some(session) = self.0.take() {
            session.abort("connect task dropped before it ran");
        }
    }
}

// ---

impl std::fmt::Debug for StreamCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCoordinator")
            .field("plan_id", &self.config.plan_id)
            .field("description", &self.config.description)
            .field("connections_per_host", &self.config.connections_per_host)
            .finish_non_exhaustive()
    }
}

// ---

fn sorted_hosts(
    peers: &HashMap<SocketAddr, HostStreamingData>,
) -> impl Iterator<Item = (SocketAddr, &HostStreamingData)> {
    // ---
    let mut hosts: Vec<(SocketAddr, &HostStreamingData)> = peers.iter().map(|(p, h)| (*p, h)).collect();
    hosts.sort_by_key(|(p, _)| *p);
    hosts.into_iter()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
