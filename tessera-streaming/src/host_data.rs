//! Per-peer session registry.
//!
//! [`HostStreamingData`] owns every session a coordinator has with one
//! peer, plus the summaries those sessions published.  It has no lock of
//! its own; the coordinator's lock guards it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

// ---

use tessera_domain::{ProgressInfo, Result, SessionInfo, StreamConnectionFactoryPtr, StreamError};

// ---

use super::session::{SessionContext, StreamSession};

// ---------------------------------------------------------------------------
// HostStreamingData
// ---------------------------------------------------------------------------

pub(crate) struct HostStreamingData {
    // ---
    /// `0` means receiving role; sessions are then created by id.
    connections_per_host: u32,

    ctx: Arc<SessionContext>,

    sessions: HashMap<u32, Arc<StreamSession>>,

    /// Same sessions in creation order; the round-robin walks this.
    order: Vec<Arc<StreamSession>>,

    session_infos: HashMap<u32, SessionInfo>,

    /// Position in `order` handed out last; `None` until the first reuse.
    last_returned: Option<usize>,
}

// ---

impl HostStreamingData {
    // ---
    pub(crate) fn new(connections_per_host: u32, ctx: Arc<SessionContext>) -> Self {
        // ---
        Self {
            connections_per_host,
            ctx,
            sessions: HashMap::new(),
            order: Vec::new(),
            session_infos: HashMap::new(),
            last_returned: None,
        }
    }

    // ---

    /// Below the cap, create a new session.  At the cap, hand out the
    /// existing sessions in creation order, cycling.
    pub(crate) fn get_or_create_next_session(
        &mut self,
        peer: SocketAddr,
        connecting: SocketAddr,
        factory: &StreamConnectionFactoryPtr,
    ) -> Arc<StreamSession> {
        // ---
        let cap = self.connections_per_host.max(1) as usize;
        if self.order.len() < cap {
            let index = self.next_unused_index();
            return self.create(peer, index, connecting, factory);
        }

        let pos = match self.last_returned {
            None => 0,
            Some(p) => (p + 1) % self.order.len(),
        };
        self.last_returned = Some(pos);
        Arc::clone(&self.order[pos])
    }

    // ---

    pub(crate) fn get_or_create_session_by_id(
        &mut self,
        peer: SocketAddr,
        id: u32,
        connecting: SocketAddr,
        factory: &StreamConnectionFactoryPtr,
    ) -> Arc<StreamSession> {
        // ---
        if let Some(session) = self.sessions.get(&id) {
            return Arc::clone(session);
        }
        self.create(peer, id, connecting, factory)
    }

    // ---

    pub(crate) fn has_active_sessions(&self) -> bool {
        self.order.iter().any(|s| s.is_active())
    }

    // ---

    pub(crate) fn update_progress(&mut self, info: ProgressInfo) -> Result<()> {
        // ---
        let entry = self
            .session_infos
            .get_mut(&info.session_index)
            .ok_or(StreamError::MissingSessionInfo {
                peer: info.peer,
                session_index: info.session_index,
            })?;
        entry.update_progress(info);
        Ok(())
    }

    // ---

    pub(crate) fn add_session_info(&mut self, info: SessionInfo) {
        self.session_infos.insert(info.session_index, info);
    }

    // ---

    /// Copies of every registered summary, ordered by session index, with
    /// `state` taken from the live session where there is one.
    pub(crate) fn all_session_info(&self) -> Vec<SessionInfo> {
        // ---
        let mut infos: Vec<SessionInfo> = self
            .session_infos
            .values()
            .map(|info| {
                let mut info = info.clone();
                if let Some(session) = self.sessions.get(&info.session_index) {
                    info.state = session.state();
                }
                info
            })
            .collect();
        infos.sort_by_key(|i| i.session_index);
        infos
    }

    // ---

    pub(crate) fn all_stream_sessions(&self) -> Vec<Arc<StreamSession>> {
        self.order.clone()
    }

    pub(crate) fn session_count(&self) -> u32 {
        self.order.len() as u32
    }

    // ---

    fn next_unused_index(&self) -> u32 {
        // ---
        let mut index = self.order.len() as u32;
        while self.sessions.contains_key(&index) {
            index += 1;
        }
        index
    }

    // ---

    fn create(
        &mut self,
        peer: SocketAddr,
        index: u32,
        connecting: SocketAddr,
        factory: &StreamConnectionFactoryPtr,
    ) -> Arc<StreamSession> {
        // ---
        let session = Arc::new(StreamSession::new(
            peer,
            connecting,
            index,
            Arc::clone(factory),
            Arc::clone(&self.ctx),
        ));

        tracing::debug!(
            plan_id = %self.ctx.plan_id,
            %peer,
            %connecting,
            session_index = index,
            "created stream session"
        );

        self.sessions.insert(index, Arc::clone(&session));
        self.order.push(Arc::clone(&session));
        session
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use async_trait::async_trait;
    use uuid::Uuid;

    use tessera_domain::{Direction, StreamConnectionFactory, StreamConnectionPtr, StreamState, StreamSummary};

    use super::*;
    use crate::StreamEventTx;

    // ---

    struct NeverFactory;

    #[async_trait]
    impl StreamConnectionFactory for NeverFactory {
        async fn connect(&self, _peer: SocketAddr, connecting: SocketAddr) -> Result<StreamConnectionPtr> {
            Err(StreamError::Transport(format!("{connecting} unreachable")))
        }
    }

    // ---

    fn peer() -> SocketAddr {
        "10.0.0.9:7000".parse().unwrap()
    }

    fn host(connections_per_host: u32) -> (HostStreamingData, StreamConnectionFactoryPtr) {
        let (events, _rx) = StreamEventTx::channel();
        let ctx = Arc::new(SessionContext {
            plan_id: Uuid::new_v4(),
            description: "test".into(),
            local: "10.0.0.1:7000".parse().unwrap(),
            events,
        });
        (HostStreamingData::new(connections_per_host, ctx), Arc::new(NeverFactory))
    }

    fn info(index: u32) -> SessionInfo {
        SessionInfo::new(
            peer(),
            index,
            peer(),
            vec![StreamSummary::new(1, 100)],
            vec![],
            StreamState::Streaming,
        )
    }

    // ---

    #[test]
    fn creates_up_to_cap_then_cycles_from_the_first() {
        // ---
        let (mut host, factory) = host(2);

        let indices: Vec<u32> = (0..6)
            .map(|_| host.get_or_create_next_session(peer(), peer(), &factory).session_index())
            .collect();

        assert_eq!(indices, vec![0, 1, 0, 1, 0, 1]);
        assert_eq!(host.all_stream_sessions().len(), 2);
    }

    // ---

    #[test]
    fn reuse_returns_the_same_session_objects() {
        // ---
        let (mut host, factory) = host(3);
        let created: Vec<_> = (0..3)
            .map(|_| host.get_or_create_next_session(peer(), peer(), &factory))
            .collect();

        for round in 0..2 {
            for expected in &created {
                let got = host.get_or_create_next_session(peer(), peer(), &factory);
                assert!(Arc::ptr_eq(expected, &got), "round {round}");
            }
        }
    }

    // ---

    #[test]
    fn zero_connections_behaves_as_one() {
        // ---
        let (mut host, factory) = host(0);
        let a = host.get_or_create_next_session(peer(), peer(), &factory);
        let b = host.get_or_create_next_session(peer(), peer(), &factory);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(host.all_stream_sessions().len(), 1);
    }

    // ---

    #[test]
    fn by_id_returns_one_session_per_id() {
        // ---
        let (mut host, factory) = host(0);

        let first = host.get_or_create_session_by_id(peer(), 5, peer(), &factory);
        let again = host.get_or_create_session_by_id(peer(), 5, peer(), &factory);
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.session_index(), 5);

        let sessions = host.all_stream_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_index(), 5);
        assert_eq!(host.session_count(), 1);
    }

    // ---

    #[test]
    fn next_session_skips_indices_taken_by_id() {
        // ---
        let (mut host, factory) = host(3);
        host.get_or_create_session_by_id(peer(), 1, peer(), &factory);

        let a = host.get_or_create_next_session(peer(), peer(), &factory);
        let b = host.get_or_create_next_session(peer(), peer(), &factory);
        assert_eq!(a.session_index(), 2);
        assert_eq!(b.session_index(), 3);
    }

    // ---

    #[test]
    fn activity_tracks_terminal_states() {
        // ---
        let (mut host, factory) = host(2);
        assert!(!host.has_active_sessions());

        let a = host.get_or_create_next_session(peer(), peer(), &factory);
        let b = host.get_or_create_next_session(peer(), peer(), &factory);
        assert!(host.has_active_sessions());

        a.abort("done");
        assert!(host.has_active_sessions());
        b.abort("done");
        assert!(!host.has_active_sessions());
    }

    // ---

    #[test]
    fn progress_without_info_is_rejected() {
        // ---
        let (mut host, _factory) = host(1);
        let progress = ProgressInfo::new(peer(), 0, "a.db", Direction::In, 10, 100);

        let err = host.update_progress(progress.clone()).unwrap_err();
        assert!(matches!(
            err,
            StreamError::MissingSessionInfo { session_index: 0, .. }
        ));
        assert!(host.all_session_info().is_empty(), "must not create a default entry");

        host.add_session_info(info(0));
        host.update_progress(progress).unwrap();
        let infos = host.all_session_info();
        assert_eq!(infos[0].total_size_received(), 10);
    }

    // ---

    #[test]
    fn session_info_state_comes_from_live_session() {
        // ---
        let (mut host, factory) = host(1);
        let session = host.get_or_create_next_session(peer(), peer(), &factory);
        host.add_session_info(info(0));
        host.add_session_info(info(7));

        let infos = host.all_session_info();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].state, StreamState::Init);
        assert_eq!(infos[1].state, StreamState::Streaming, "no live session under 7");

        session.abort("gone");
        assert_eq!(host.all_session_info()[0].state, StreamState::Failed);
    }

    // ---

    #[test]
    fn session_snapshot_is_isolated_from_later_creation() {
        // ---
        let (mut host, factory) = host(4);
        host.get_or_create_next_session(peer(), peer(), &factory);
        let snapshot = host.all_stream_sessions();

        host.get_or_create_next_session(peer(), peer(), &factory);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(host.all_stream_sessions().len(), 2);
    }
}
