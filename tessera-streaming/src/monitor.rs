//! [`StreamMonitor`]: folds session events back into the coordinator.
//!
//! Sessions never touch the coordinator directly.  They publish on their
//! [`StreamEventTx`](super::StreamEventTx); the monitor drains the other end,
//! applies each event to the coordinator's bookkeeping, and forwards it to
//! the application's [`StreamEventHandler`].

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

// ---

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

// ---

use tessera_domain::SessionInfo;

// ---

use super::{StreamCoordinator, StreamEvent, StreamEventHandler};

// ---------------------------------------------------------------------------
// StreamOutcome
// ---------------------------------------------------------------------------

/// A session that ended in failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionFailure {
    pub peer: SocketAddr,

    /// `None` for sessions a peer announced that never connected.
    pub session_index: Option<u32>,

    pub reason: String,
}

/// Final picture of a plan once its sessions have all stopped.
#[derive(Debug, Clone, Serialize)]
pub struct StreamOutcome {
    // ---
    pub plan_id: Uuid,

    /// Summaries of every session that got as far as exchanging them.
    pub sessions: Vec<SessionInfo>,

    /// Every failure seen, including sessions that never connected.
    pub failures: Vec<SessionFailure>,
}

impl StreamOutcome {
    // ---
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty() || self.sessions.iter().any(|s| s.is_failed())
    }

    pub fn total_size_sent(&self) -> u64 {
        self.sessions.iter().map(|s| s.total_size_sent()).sum()
    }

    pub fn total_size_received(&self) -> u64 {
        self.sessions.iter().map(|s| s.total_size_received()).sum()
    }
}

// ---------------------------------------------------------------------------
// StreamMonitor
// ---------------------------------------------------------------------------

pub struct StreamMonitor {
    // ---
    coordinator: Arc<StreamCoordinator>,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    handler: Arc<dyn StreamEventHandler>,
    failures: Vec<SessionFailure>,

    /// Sessions whose final event has been applied.
    finished: HashSet<(SocketAddr, u32)>,

    /// How long to wait for announced sessions once every known one has
    /// finished.  `None` waits indefinitely.
    late_session_grace: Option<Duration>,
}

// ---

impl StreamMonitor {
    // ---
    pub fn new(
        coordinator: Arc<StreamCoordinator>,
        rx: mpsc::UnboundedReceiver<StreamEvent>,
        handler: Arc<dyn StreamEventHandler>,
    ) -> Self {
        Self {
            coordinator,
            rx,
            handler,
            failures: Vec::new(),
            finished: HashSet::new(),
            late_session_grace: None,
        }
    }

    pub fn with_late_session_grace(mut self, grace: Duration) -> Self {
        self.late_session_grace = Some(grace);
        self
    }

    pub fn coordinator(&self) -> &Arc<StreamCoordinator> {
        &self.coordinator
    }

    // ---

    /// Apply events until every session the coordinator knows of has
    /// reported its completion and no announced session is still to
    /// arrive, or the channel closes.  Returns at once when that already
    /// holds, e.g. for a coordinator without sessions.  A session that
    /// completes publishes nothing after its completion event, so nothing
    /// it reported earlier is left unapplied.
    ///
    /// Announced sessions that have not connected within the late-session
    /// grace are recorded as failures and no longer waited for.
    ///
    /// May be called again to keep monitoring if new sessions start later;
    /// failures accumulate across calls.
    pub async fn run_until_drained(&mut self) -> StreamOutcome {
        // ---
        while !self.all_finished() {
            let next = match self.late_session_grace {
                Some(grace) if self.known_sessions_finished() => {
                    match tokio::time::timeout(grace, self.rx.recv()).await {
                        Ok(next) => next,
                        Err(_) => {
                            self.give_up_on_missing_sessions();
                            break;
                        }
                    }
                }
                _ => self.rx.recv().await,
            };

            match next {
                Some(event) => self.apply(event).await,
                None => break,
            }
        }

        let outcome = StreamOutcome {
            plan_id: self.coordinator.plan_id(),
            sessions: self.coordinator.all_session_info(),
            failures: self.failures.clone(),
        };

        tracing::info!(
            plan_id = %outcome.plan_id,
            sessions = outcome.sessions.len(),
            failures = outcome.failures.len(),
            bytes_sent = outcome.total_size_sent(),
            bytes_received = outcome.total_size_received(),
            "stream plan drained"
        );
        outcome
    }

    // ---

    /// Every known session has finished and none announced is missing.
    pub(crate) fn all_finished(&self) -> bool {
        self.known_sessions_finished() && self.coordinator.missing_sessions().is_empty()
    }

    fn known_sessions_finished(&self) -> bool {
        // ---
        let sessions = self.coordinator.all_stream_sessions();
        sessions
            .iter()
            .all(|s| self.finished.contains(&(s.peer(), s.session_index())))
    }

    // ---

    fn give_up_on_missing_sessions(&mut self) {
        // ---
        for (peer, missing) in self.coordinator.missing_sessions() {
            tracing::warn!(
                plan_id = %self.coordinator.plan_id(),
                %peer,
                missing,
                "announced sessions never connected"
            );
            self.failures.push(SessionFailure {
                peer,
                session_index: None,
                reason: format!("{missing} announced session(s) never connected"),
            });
        }
        self.coordinator.forget_missing_sessions();
    }

    // ---

    async fn apply(&mut self, event: StreamEvent) {
        // ---
        match event {
            StreamEvent::SessionPrepared(info) => {
                self.coordinator.add_session_info(info.clone());
                self.handler.on_session_prepared(&info).await;
            }

            StreamEvent::Progress(progress) => {
                if let Err(e) = self.coordinator.update_progress(progress.clone()) {
                    tracing::error!(
                        plan_id = %self.coordinator.plan_id(),
                        peer = %progress.peer,
                        session_index = progress.session_index,
                        "progress dropped: {e}"
                    );
                }
                self.handler.on_progress(&progress).await;
            }

            StreamEvent::UnitReceived {
                peer,
                session_index,
                name,
                data,
            } => {
                self.handler.on_unit_received(peer, session_index, name, data).await;
            }

            StreamEvent::SessionComplete {
                peer,
                session_index,
                success,
                reason,
            } => {
                self.finished.insert((peer, session_index));
                if !success {
                    self.failures.push(SessionFailure {
                        peer,
                        session_index: Some(session_index),
                        reason: reason.clone().unwrap_or_default(),
                    });
                }
                self.handler
                    .on_session_complete(peer, session_index, success, reason.as_deref())
                    .await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use async_trait::async_trait;

    use tessera_domain::{
        // ---
        Result,
        StreamConnectionFactory,
        StreamConnectionPtr,
        StreamError,
        StreamState,
        StreamSummary,
    };

    use super::*;
    use crate::{ConnectPool, CoordinatorConfig, NoopHandler, QueuedExecutor, StreamEventTx};

    // ---

    struct RefusingFactory;

    #[async_trait]
    impl StreamConnectionFactory for RefusingFactory {
        async fn connect(&self, _peer: SocketAddr, connecting: SocketAddr) -> Result<StreamConnectionPtr> {
            Err(StreamError::Transport(format!("{connecting} refused")))
        }
    }

    // ---

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 7000))
    }

    /// Coordinator, a handle for publishing events by hand, and the
    /// monitor draining them.
    fn monitored(connections_per_host: u32) -> (Arc<StreamCoordinator>, StreamEventTx, StreamMonitor) {
        // ---
        let (events, rx) = StreamEventTx::channel();
        let coordinator = Arc::new(StreamCoordinator::new(
            CoordinatorConfig::sending(connections_per_host, addr(1)),
            Arc::new(RefusingFactory),
            QueuedExecutor::new(),
            events.clone(),
        ));
        let monitor = StreamMonitor::new(Arc::clone(&coordinator), rx, Arc::new(NoopHandler));
        (coordinator, events, monitor)
    }

    fn failed(peer: SocketAddr, session_index: u32, reason: &str) -> StreamEvent {
        StreamEvent::SessionComplete {
            peer,
            session_index,
            success: false,
            reason: Some(reason.into()),
        }
    }

    async fn drain(monitor: &mut StreamMonitor) -> StreamOutcome {
        tokio::time::timeout(Duration::from_secs(2), monitor.run_until_drained())
            .await
            .expect("monitor did not drain")
    }

    // ---

    #[tokio::test]
    async fn coordinator_without_sessions_drains_at_once() {
        // ---
        let (coordinator, _events, mut monitor) = monitored(1);
        assert!(!coordinator.has_active_sessions());

        let outcome = drain(&mut monitor).await;
        assert_eq!(outcome.plan_id, coordinator.plan_id());
        assert!(outcome.sessions.is_empty());
        assert!(!outcome.has_failures());
    }

    // ---

    #[tokio::test]
    async fn waits_until_every_session_has_completed() {
        // ---
        let (coordinator, events, mut monitor) = monitored(2);
        coordinator.get_or_create_next_session(addr(2), addr(2));
        coordinator.get_or_create_next_session(addr(2), addr(2));

        events.send(failed(addr(2), 0, "refused"));
        let early = tokio::time::timeout(Duration::from_millis(100), monitor.run_until_drained()).await;
        assert!(early.is_err(), "one session is still outstanding");

        events.send(failed(addr(2), 1, "refused"));
        let outcome = drain(&mut monitor).await;
        assert_eq!(outcome.failures.len(), 2);
        assert_eq!(outcome.failures[0].session_index, Some(0));
        assert_eq!(outcome.failures[1].session_index, Some(1));
    }

    // ---

    #[tokio::test]
    async fn later_drains_accumulate_failures_and_summaries() {
        // ---
        let (coordinator, events, mut monitor) = monitored(1);

        coordinator.get_or_create_next_session(addr(2), addr(2));
        events.send(failed(addr(2), 0, "first"));
        let first = drain(&mut monitor).await;
        assert_eq!(first.failures.len(), 1);
        assert!(first.sessions.is_empty(), "never prepared");

        // A session started after the first drain.
        coordinator.get_or_create_next_session(addr(3), addr(3));
        events.send(StreamEvent::SessionPrepared(SessionInfo::new(
            addr(3),
            0,
            addr(3),
            vec![],
            vec![StreamSummary::new(1, 10)],
            StreamState::Streaming,
        )));
        events.send(failed(addr(3), 0, "second"));

        let second = drain(&mut monitor).await;
        let reasons: Vec<&str> = second.failures.iter().map(|f| f.reason.as_str()).collect();
        assert_eq!(reasons, vec!["first", "second"]);
        assert_eq!(second.sessions.len(), 1);
        assert_eq!(second.sessions[0].peer, addr(3));
        assert!(second.has_failures());
    }

    // ---

    /// Connect tasks dropped by a pool that has shut down still leave
    /// every session terminal, so the drain finishes.
    #[tokio::test]
    async fn drains_when_the_connect_pool_is_gone() {
        // ---
        let pool = ConnectPool::new("test-pool", 1);
        pool.shutdown().await;

        let (events, rx) = StreamEventTx::channel();
        let coordinator = Arc::new(StreamCoordinator::new(
            CoordinatorConfig::sending(1, addr(1)),
            Arc::new(RefusingFactory),
            pool,
            events,
        ));
        coordinator.get_or_create_next_session(addr(2), addr(2));
        coordinator.connect_all_stream_sessions();

        let mut monitor = StreamMonitor::new(Arc::clone(&coordinator), rx, Arc::new(NoopHandler));
        let outcome = drain(&mut monitor).await;
        assert_eq!(outcome.failures.len(), 1);
        assert!(!coordinator.has_active_sessions());
    }

    // ---

    #[tokio::test]
    async fn announced_sessions_that_never_arrive_become_failures() {
        // ---
        let (events, rx) = StreamEventTx::channel();
        let coordinator = Arc::new(StreamCoordinator::new(
            CoordinatorConfig::receiving(uuid::Uuid::new_v4(), "rebuild"),
            Arc::new(RefusingFactory),
            QueuedExecutor::new(),
            events.clone(),
        ));
        coordinator.expect_sessions(addr(2), 2);
        coordinator.get_or_create_session_by_id(addr(2), 0, addr(2));

        let mut monitor = StreamMonitor::new(Arc::clone(&coordinator), rx, Arc::new(NoopHandler))
            .with_late_session_grace(Duration::from_millis(50));
        events.send(StreamEvent::SessionComplete {
            peer: addr(2),
            session_index: 0,
            success: true,
            reason: None,
        });

        let outcome = drain(&mut monitor).await;
        assert_eq!(
            outcome.failures,
            vec![SessionFailure {
                peer: addr(2),
                session_index: None,
                reason: "1 announced session(s) never connected".into(),
            }]
        );
        assert!(monitor.all_finished());
    }
}
