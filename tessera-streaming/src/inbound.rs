//! [`StreamReceiver`]: accepts inbound session connections.
//!
//! A remote sender opens one connection per session and writes an `Init`
//! frame naming its plan, the session index and how many sessions it
//! opens to us.  The receiver keeps one receiving-role
//! [`StreamCoordinator`] per plan, created on the plan's first connection
//! together with a [`StreamMonitor`] task.  Once every announced session
//! has connected and finished, the plan is dropped and its outcome
//! published.  Announced sessions still missing after the late-session
//! grace are recorded as failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ---

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

// ---

use tessera_domain::{Result, StreamConnectionFactoryPtr, StreamConnectionPtr};

// ---

use super::session::read_init;
use super::{
    // ---
    ConnectExecutorPtr,
    CoordinatorConfig,
    StreamCoordinator,
    StreamEventHandler,
    StreamEventTx,
    StreamMonitor,
    StreamOutcome,
    StreamSession,
};

/// How long a plan waits for announced sessions after every connected
/// one has finished.
pub const LATE_SESSION_GRACE: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// StreamReceiver
// ---------------------------------------------------------------------------

pub struct StreamReceiver {
    // ---
    /// Receiving coordinators never dial; sessions still carry a factory.
    factory: StreamConnectionFactoryPtr,
    executor: ConnectExecutorPtr,
    handler: Arc<dyn StreamEventHandler>,
    late_session_grace: Duration,
    plans: Mutex<HashMap<Uuid, Arc<StreamCoordinator>>>,
    outcome_tx: mpsc::UnboundedSender<StreamOutcome>,
}

// ---

impl StreamReceiver {
    // ---
    /// Returns the receiver and the channel on which each finished plan's
    /// outcome is published.
    pub fn new(
        factory: StreamConnectionFactoryPtr,
        executor: ConnectExecutorPtr,
        handler: Arc<dyn StreamEventHandler>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StreamOutcome>) {
        Self::with_late_session_grace(factory, executor, handler, LATE_SESSION_GRACE)
    }

    /// As [`StreamReceiver::new`] with a custom wait for announced
    /// sessions.
    pub fn with_late_session_grace(
        factory: StreamConnectionFactoryPtr,
        executor: ConnectExecutorPtr,
        handler: Arc<dyn StreamEventHandler>,
        late_session_grace: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StreamOutcome>) {
        // ---
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let receiver = Arc::new(Self {
            factory,
            executor,
            handler,
            late_session_grace,
            plans: Mutex::new(HashMap::new()),
            outcome_tx,
        });
        (receiver, outcome_rx)
    }

    // ---

    /// Plans with at least one session still being monitored.
    pub fn active_plans(&self) -> Vec<Uuid> {
        self.plans.lock().keys().copied().collect()
    }

    // ---

    /// Read the `Init` frame from `conn` and attach it to the session it
    /// names, creating the plan's coordinator on first contact.
    pub async fn accept(self: &Arc<Self>, mut conn: StreamConnectionPtr) -> Result<Arc<StreamSession>> {
        // ---
        let init = read_init(&mut conn).await?;

        // Create the session while holding the plan map so the monitor
        // cannot retire the plan between lookup and registration.
        let (session, new_monitor) = {
            let mut plans = self.plans.lock();
            let (coordinator, monitor) = match plans.get(&init.plan_id) {
                Some(c) => (Arc::clone(c), None),
                None => {
                    let (c, monitor) = self.open_plan(init.plan_id, &init.description);
                    plans.insert(init.plan_id, Arc::clone(&c));
                    (c, Some(monitor))
                }
            };
            coordinator.expect_sessions(init.from, init.peer_sessions);
            let session = coordinator.get_or_create_session_by_id(init.from, init.session_index, init.from);
            (session, monitor)
        };

        // Started only now so its first check already sees the session.
        if let Some(monitor) = new_monitor {
            tokio::spawn(Arc::clone(self).watch_plan(monitor));
        }

        tracing::info!(
            plan_id = %init.plan_id,
            peer = %init.from,
            session_index = init.session_index,
            peer_sessions = init.peer_sessions,
            description = %init.description,
            "accepted stream session"
        );

        session.accept(conn)?;
        Ok(session)
    }

    // ---

    /// New receiving coordinator plus the monitor to run for it.  Called
    /// with the plan map locked.
    fn open_plan(&self, plan_id: Uuid, description: &str) -> (Arc<StreamCoordinator>, StreamMonitor) {
        // ---
        let (events, rx) = StreamEventTx::channel();
        let coordinator = Arc::new(StreamCoordinator::new(
            CoordinatorConfig::receiving(plan_id, description),
            Arc::clone(&self.factory),
            Arc::clone(&self.executor),
            events,
        ));

        tracing::info!(%plan_id, %description, "receiving stream plan");

        let monitor = StreamMonitor::new(Arc::clone(&coordinator), rx, Arc::clone(&self.handler))
            .with_late_session_grace(self.late_session_grace);
        (coordinator, monitor)
    }

    // ---

    async fn watch_plan(self: Arc<Self>, mut monitor: StreamMonitor) {
        // ---
        let plan_id = monitor.coordinator().plan_id();
        loop {
            let outcome = monitor.run_until_drained().await;

            // A session may have joined after the drain was decided.
            let retired = {
                let mut plans = self.plans.lock();
                if !monitor.all_finished() {
                    false
                } else {
                    plans.remove(&plan_id);
                    true
                }
            };

            if retired {
                if outcome.has_failures() {
                    tracing::warn!(%plan_id, failures = outcome.failures.len(), "stream plan finished with failures");
                } else {
                    tracing::info!(%plan_id, "stream plan finished");
                }
                let _ = self.outcome_tx.send(outcome);
                return;
            }
        }
    }
}

// ---

impl std::fmt::Debug for StreamReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReceiver")
            .field("plans", &self.plans.lock().len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
