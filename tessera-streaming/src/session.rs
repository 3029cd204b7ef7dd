//! [`StreamSession`]: one logical transfer channel to one peer.
//!
//! # Lifecycle
//!
//! A session is created in [`StreamState::Init`] by the owning
//! coordinator.  It becomes connected in one of two ways:
//!
//! - **Initiator**: [`StreamSession::start`] dials the peer through the
//!   session's connection factory.  Runs on the coordinator's connect
//!   executor, never on the caller's task.
//! - **Responder**: [`StreamSession::accept`] attaches an inbound
//!   connection whose `Init` frame the receiver has already consumed.
//!
//! Either way the session moves to `Preparing` and spawns its own two
//! tasks, independent of the connect executor:
//!
//! - **outbound**: sole owner of the write half.  Writes `Init` (initiator
//!   only) and `Prepare`, waits for the peer's `Prepare`, then sends every
//!   queued unit.  Between units it serves control requests from the
//!   inbound task (acks, completion, abort).
//! - **inbound**: sole owner of the read half.  Reads the peer's
//!   `Prepare`, receives units, counts acks, and watches for the peer's
//!   `Complete` / `SessionFailed`.
//!
//! The inbound task never writes directly: a unit being written can hold
//! the socket for a long time, and if both peers' readers waited on their
//! own writers while both writers waited on full socket buffers, neither
//! side would make progress.
//!
//! # Completion
//!
//! A side is done once every unit it sent has been acknowledged and every
//! unit the peer announced has arrived.  It then moves to `WaitComplete`
//! and writes `Complete`.  Having both sent and seen `Complete` moves it
//! to `Complete`.  Any error moves it to `Failed`; the failure is recorded
//! and published, never returned to whoever started the session.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

// ---

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use uuid::Uuid;

// ---

use tessera_domain::{
    // ---
    Direction,
    ProgressInfo,
    Result,
    SessionInfo,
    StreamConnectionFactoryPtr,
    StreamConnectionPtr,
    StreamError,
    StreamState,
    StreamSummary,
};

// ---

use super::{expect_message, read_message, write_message, StreamEvent, StreamEventTx, StreamMessage, CHUNK_SIZE};

/// Largest up-front allocation for an incoming unit; bigger units grow.
const MAX_PREALLOC: u64 = 4 * 1024 * 1024;

// ---------------------------------------------------------------------------
// SessionContext
// ---------------------------------------------------------------------------

/// Per-coordinator values every session shares.
#[derive(Debug, Clone)]
pub(crate) struct SessionContext {
    // ---
    pub(crate) plan_id: Uuid,
    pub(crate) description: String,
    pub(crate) local: SocketAddr,
    pub(crate) events: StreamEventTx,
}

// ---------------------------------------------------------------------------
// OutgoingUnit
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct OutgoingUnit {
    name: String,
    data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// StreamSession
// ---------------------------------------------------------------------------

pub struct StreamSession {
    // ---
    /// Logical endpoint reported in every event.
    peer: SocketAddr,

    /// Address actually dialed.
    connecting: SocketAddr,

    /// Unique within the peer's session set; never changes.
    session_index: u32,

    ctx: Arc<SessionContext>,

    /// Captured at creation; later factory swaps do not reach this session.
    factory: StreamConnectionFactoryPtr,

    state_tx: watch::Sender<StreamState>,

    /// Set by the first `start` or `accept`; a session connects once.
    started: AtomicBool,

    /// Sessions this node opens to `peer` in the plan, sent in `Init`.
    peer_sessions: AtomicU32,

    /// Units queued while in `Init`; moved to the outbound task on connect.
    outgoing: Mutex<Vec<OutgoingUnit>>,

    tasks: Mutex<Vec<AbortHandle>>,
}

// ---

impl StreamSession {
    // ---
    pub(crate) fn new(
        peer: SocketAddr,
        connecting: SocketAddr,
        session_index: u32,
        factory: StreamConnectionFactoryPtr,
        ctx: Arc<SessionContext>,
    ) -> Self {
        // ---
        let (state_tx, _) = watch::channel(StreamState::Init);
        Self {
            peer,
            connecting,
            session_index,
            ctx,
            factory,
            state_tx,
            started: AtomicBool::new(false),
            peer_sessions: AtomicU32::new(0),
            outgoing: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    // --- accessors ----------------------------------------------------------

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connecting(&self) -> SocketAddr {
        self.connecting
    }

    pub fn session_index(&self) -> u32 {
        self.session_index
    }

    pub fn plan_id(&self) -> Uuid {
        self.ctx.plan_id
    }

    pub fn state(&self) -> StreamState {
        *self.state_tx.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Subscribe to state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<StreamState> {
        self.state_tx.subscribe()
    }

    /// Wait until the session reaches `Complete` or `Failed`.
    pub async fn wait_terminal(&self) -> StreamState {
        // ---
        let mut rx = self.subscribe_state();
        let result = rx.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        // The sender lives as long as `self`, so the wait cannot fail.
        result.unwrap_or(StreamState::Failed)
    }

    // ---

    /// Queue a unit to send once connected.  Only legal before the
    /// session has been started; names must be unique within a session.
    pub fn add_transfer(&self, name: impl Into<String>, data: Vec<u8>) -> Result<()> {
        // ---
        let name = name.into();
        let mut outgoing = self.outgoing.lock();
        if self.started.load(Ordering::SeqCst) || self.state() != StreamState::Init {
            return Err(StreamError::Protocol(format!(
                "cannot add {name} to session #{} with {}: already {}",
                self.session_index,
                self.peer,
                self.state()
            )));
        }
        if outgoing.iter().any(|u| u.name == name) {
            return Err(StreamError::Protocol(format!(
                "session #{} with {} already has a unit named {name}",
                self.session_index, self.peer
            )));
        }
        outgoing.push(OutgoingUnit { name, data });
        Ok(())
    }

    /// Record how many sessions the owning coordinator opens to this
    /// session's peer.  Announced to the peer in `Init`.
    pub(crate) fn announce_peer_sessions(&self, count: u32) {
        self.peer_sessions.store(count, Ordering::SeqCst);
    }

    /// What this session will announce in its `Prepare`.
    pub fn outgoing_summary(&self) -> StreamSummary {
        summarize(&self.outgoing.lock())
    }

    // --- connection -----------------------------------------------------

    /// Dial the peer and begin the session.
    ///
    /// Fire-and-forget: a connect failure moves the session to `Failed` and
    /// publishes a `SessionComplete` event; nothing is returned.  Only the
    /// first call does anything.
    pub async fn start(self: &Arc<Self>) {
        // ---
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!(
                plan_id = %self.ctx.plan_id,
                peer = %self.peer,
                session_index = self.session_index,
                "start called twice, ignoring"
            );
            return;
        }

        match self.factory.connect(self.peer, self.connecting).await {
            Ok(conn) => {
                if self.transition(StreamState::Preparing) {
                    self.spawn_transfer(conn, true);
                }
            }
            Err(e) => {
                self.fail(&format!("connect to {} failed: {e}", self.connecting));
            }
        }
    }

    // ---

    /// Attach an inbound connection and begin the session as responder.
    ///
    /// The caller has already read the `Init` frame from `conn`.
    pub fn accept(self: &Arc<Self>, conn: StreamConnectionPtr) -> Result<()> {
        // ---
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(StreamError::Protocol(format!(
                "session #{} with {} is already connected",
                self.session_index, self.peer
            )));
        }
        if self.transition(StreamState::Preparing) {
            self.spawn_transfer(conn, false);
        }
        Ok(())
    }

    // --- state ----------------------------------------------------------

    /// Move to `next` if the state machine allows it.  Returns whether the
    /// state changed.
    fn transition(&self, next: StreamState) -> bool {
        // ---
        let mut from = next;
        let moved = self.state_tx.send_if_modified(|s| {
            if s.can_transition_to(next) {
                from = *s;
                *s = next;
                true
            } else {
                false
            }
        });

        if moved {
            tracing::debug!(
                plan_id = %self.ctx.plan_id,
                peer = %self.peer,
                session_index = self.session_index,
                %from,
                to = %next,
                "session state change"
            );
        }
        moved
    }

    // ---

    /// Record a failure.  Publishes `SessionComplete` once; later failures
    /// of an already terminal session are ignored.
    fn fail(&self, reason: &str) {
        // ---
        if !self.transition(StreamState::Failed) {
            return;
        }
        tracing::warn!(
            plan_id = %self.ctx.plan_id,
            peer = %self.peer,
            session_index = self.session_index,
            "stream session failed: {reason}"
        );
        self.ctx.events.send(StreamEvent::SessionComplete {
            peer: self.peer,
            session_index: self.session_index,
            success: false,
            reason: Some(reason.to_owned()),
        });
    }

    // ---

    fn complete(&self) {
        // ---
        if !self.transition(StreamState::Complete) {
            return;
        }
        tracing::info!(
            plan_id = %self.ctx.plan_id,
            peer = %self.peer,
            session_index = self.session_index,
            "stream session complete"
        );
        self.ctx.events.send(StreamEvent::SessionComplete {
            peer: self.peer,
            session_index: self.session_index,
            success: true,
            reason: None,
        });
    }

    // ---

    fn progress(&self, name: &str, direction: Direction, current: u64, total: u64) {
        self.ctx.events.send(StreamEvent::Progress(ProgressInfo::new(
            self.peer,
            self.session_index,
            name,
            direction,
            current,
            total,
        )));
    }

    // --- transfer tasks -------------------------------------------------

    fn spawn_transfer(self: &Arc<Self>, conn: StreamConnectionPtr, initiator: bool) {
        // ---
        let units = std::mem::take(&mut *self.outgoing.lock());
        let (reader, writer) = tokio::io::split(conn);
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();

        let transfer = Arc::new(Transfer {
            session: Arc::clone(self),
            initiator,
            summary: summarize(&units),
            counters: Mutex::new(Counters {
                to_send: units.len() as u32,
                ..Default::default()
            }),
            ctl_tx,
        });

        let inbound = {
            let t = Arc::clone(&transfer);
            tokio::spawn(async move {
                if let Err(e) = t.recv_loop(reader).await {
                    let reason = e.to_string();
                    t.session.fail(&reason);
                    t.control(Control::Abort(reason));
                }
            })
        };
        let inbound_abort = inbound.abort_handle();

        let outbound = {
            let t = Arc::clone(&transfer);
            tokio::spawn(async move {
                if let Err(e) = t.send_loop(writer, units, ctl_rx).await {
                    t.session.fail(&e.to_string());
                    inbound_abort.abort();
                }
            })
        };

        let mut tasks = self.tasks.lock();
        tasks.push(inbound.abort_handle());
        tasks.push(outbound.abort_handle());
    }

    // ---

    /// Abort the session's transfer tasks, failing it if still active.
    pub fn abort(&self, reason: &str) {
        // ---
        self.fail(reason);
        for t in self.tasks.lock().drain(..) {
            t.abort();
        }
    }
}

// ---

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("peer", &self.peer)
            .field("connecting", &self.connecting)
            .field("session_index", &self.session_index)
            .field("state", &self.state())
            .finish()
    }
}

// ---

fn summarize(units: &[OutgoingUnit]) -> StreamSummary {
    StreamSummary::new(
        units.len() as u32,
        units.iter().map(|u| u.data.len() as u64).sum(),
    )
}

// ---------------------------------------------------------------------------
// Transfer: state shared by one connected session's two tasks
// ---------------------------------------------------------------------------

/// Requests from the inbound task to the outbound (writer) task.
#[derive(Debug)]
enum Control {
    /// Acknowledge a received unit.
    Ack(String),

    /// Counters changed; see whether we are done.
    Recheck,

    /// Both sides complete; close the write half.
    Stop,

    /// Tell the peer why we failed, then close.
    Abort(String),
}

// ---

#[derive(Debug, Default)]
struct Counters {
    // ---
    to_send: u32,
    acked: u32,

    /// Units the peer announced; `None` until its `Prepare` arrives.
    expected_in: Option<u32>,
    received: u32,

    /// Names of units already received; a name may arrive only once.
    seen: HashSet<String>,

    /// Outbound task has claimed the right to write `Complete`.
    claimed_complete: bool,
    sent_complete: bool,
    peer_complete: bool,
}

impl Counters {
    fn work_done(&self) -> bool {
        self.acked == self.to_send && self.expected_in == Some(self.received)
    }
}

// ---

struct Transfer {
    // ---
    session: Arc<StreamSession>,
    initiator: bool,
    summary: StreamSummary,
    counters: Mutex<Counters>,
    ctl_tx: mpsc::UnboundedSender<Control>,
}

type Reader = ReadHalf<StreamConnectionPtr>;
type Writer = WriteHalf<StreamConnectionPtr>;

// ---

impl Transfer {
    // ---
    fn control(&self, ctl: Control) {
        // The outbound task may already have exited; nothing to do then.
        let _ = self.ctl_tx.send(ctl);
    }

    // --- outbound -------------------------------------------------------

    async fn send_loop(
        &self,
        mut writer: Writer,
        units: Vec<OutgoingUnit>,
        mut ctl_rx: mpsc::UnboundedReceiver<Control>,
    ) -> Result<()> {
        // ---
        let s = &self.session;

        if self.initiator {
            let init = StreamMessage::Init {
                plan_id: s.ctx.plan_id,
                session_index: s.session_index,
                from: s.ctx.local,
                description: s.ctx.description.clone(),
                peer_sessions: s.peer_sessions.load(Ordering::SeqCst),
            };
            write_message(&mut writer, &init).await?;
        }
        let prepare = StreamMessage::Prepare {
            summaries: vec![self.summary],
        };
        write_message(&mut writer, &prepare).await?;

        // Outgoing progress must not precede the session's prepared event.
        let mut state_rx = s.subscribe_state();
        state_rx
            .wait_for(|st| *st != StreamState::Preparing)
            .await
            .map_err(|_| StreamError::SessionClosed)?;

        let mut units = units.into_iter();
        loop {
            // Control requests are served between units, never inside one.
            while let Ok(ctl) = ctl_rx.try_recv() {
                if self.apply(&mut writer, ctl).await? {
                    return Ok(());
                }
            }

            if s.is_active() {
                if let Some(unit) = units.next() {
                    self.send_unit(&mut writer, unit).await?;
                    continue;
                }
                if self.maybe_send_complete(&mut writer).await? {
                    return Ok(());
                }
            }

            match ctl_rx.recv().await {
                Some(ctl) => {
                    if self.apply(&mut writer, ctl).await? {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }
    }

    // ---

    /// Handle one control request.  Returns `true` when the writer is done.
    async fn apply(&self, writer: &mut Writer, ctl: Control) -> Result<bool> {
        // ---
        match ctl {
            Control::Ack(name) => {
                write_message(writer, &StreamMessage::Received { name }).await?;
                Ok(false)
            }
            Control::Recheck => Ok(false),
            Control::Stop => {
                let _ = writer.shutdown().await;
                Ok(true)
            }
            Control::Abort(reason) => {
                // Best effort; the transport may be what failed.
                let _ = write_message(writer, &StreamMessage::SessionFailed { reason }).await;
                let _ = writer.shutdown().await;
                Ok(true)
            }
        }
    }

    // ---

    async fn send_unit(&self, writer: &mut Writer, unit: OutgoingUnit) -> Result<()> {
        // ---
        let s = &self.session;
        let total = unit.data.len() as u64;

        tracing::debug!(
            plan_id = %s.ctx.plan_id,
            peer = %s.peer,
            session_index = s.session_index,
            unit = %unit.name,
            bytes = total,
            "sending unit"
        );

        write_message(
            writer,
            &StreamMessage::File {
                name: unit.name.clone(),
                size_bytes: total,
            },
        )
        .await?;

        if total == 0 {
            s.progress(&unit.name, Direction::Out, 0, 0);
        }

        let mut sent = 0u64;
        for chunk in unit.data.chunks(CHUNK_SIZE) {
            writer
                .write_all(chunk)
                .await
                .map_err(|e| StreamError::Transport(format!("write unit {}: {e}", unit.name)))?;
            sent += chunk.len() as u64;
            s.progress(&unit.name, Direction::Out, sent, total);
        }

        writer
            .flush()
            .await
            .map_err(|e| StreamError::Transport(format!("flush unit {}: {e}", unit.name)))?;
        Ok(())
    }

    // ---

    /// Write `Complete` once all work is done.  Returns `true` when the
    /// peer's `Complete` had already arrived, i.e. the session is finished.
    async fn maybe_send_complete(&self, writer: &mut Writer) -> Result<bool> {
        // ---
        {
            let mut c = self.counters.lock();
            if c.claimed_complete || !c.work_done() {
                return Ok(false);
            }
            c.claimed_complete = true;
        }

        self.session.transition(StreamState::WaitComplete);
        write_message(writer, &StreamMessage::Complete).await?;

        let finished = {
            let mut c = self.counters.lock();
            c.sent_complete = true;
            c.peer_complete
        };

        if finished {
            self.session.complete();
            let _ = writer.shutdown().await;
        }
        Ok(finished)
    }

    // --- inbound --------------------------------------------------------

    async fn recv_loop(&self, mut reader: Reader) -> Result<()> {
        // ---
        let s = &self.session;

        loop {
            let msg = match read_message(&mut reader).await? {
                Some(msg) => msg,
                None if s.state() == StreamState::Complete => return Ok(()),
                None => return Err(StreamError::SessionClosed),
            };

            match msg {
                StreamMessage::Prepare { summaries } => self.on_prepare(summaries)?,

                StreamMessage::File { name, size_bytes } => {
                    self.on_file(&mut reader, name, size_bytes).await?;
                }

                StreamMessage::Received { name } => {
                    {
                        let mut c = self.counters.lock();
                        if c.acked >= c.to_send {
                            return Err(StreamError::Protocol(format!(
                                "ack for {name} but all {} units already acknowledged",
                                c.to_send
                            )));
                        }
                        c.acked += 1;
                    }
                    self.control(Control::Recheck);
                }

                StreamMessage::Complete => {
                    let finished = {
                        let mut c = self.counters.lock();
                        c.peer_complete = true;
                        c.sent_complete
                    };
                    if finished {
                        s.complete();
                        self.control(Control::Stop);
                        return Ok(());
                    }
                }

                StreamMessage::SessionFailed { reason } => {
                    s.fail(&format!("peer failed session: {reason}"));
                    self.control(Control::Stop);
                    return Ok(());
                }

                StreamMessage::Init { .. } => {
                    return Err(StreamError::Protocol("unexpected Init on established session".into()));
                }
            }
        }
    }

    // ---

    fn on_prepare(&self, summaries: Vec<StreamSummary>) -> Result<()> {
        // ---
        let s = &self.session;
        if s.state() != StreamState::Preparing {
            return Err(StreamError::Protocol(format!("Prepare received in state {}", s.state())));
        }

        let expected: u32 = summaries.iter().map(|x| x.files).sum();
        self.counters.lock().expected_in = Some(expected);

        let info = SessionInfo::new(
            s.peer,
            s.session_index,
            s.connecting,
            summaries,
            vec![self.summary],
            StreamState::Streaming,
        );

        tracing::info!(
            plan_id = %s.ctx.plan_id,
            peer = %s.peer,
            session_index = s.session_index,
            files_in = expected,
            files_out = self.summary.files,
            "stream session prepared"
        );

        // Published before the transition so the coordinator has the
        // summary before any outgoing progress can be reported.
        s.ctx.events.send(StreamEvent::SessionPrepared(info));
        s.transition(StreamState::Streaming);
        self.control(Control::Recheck);
        Ok(())
    }

    // ---

    async fn on_file(&self, reader: &mut Reader, name: String, size_bytes: u64) -> Result<()> {
        // ---
        let s = &self.session;
        {
            let c = self.counters.lock();
            match c.expected_in {
                None => {
                    return Err(StreamError::Protocol(format!("unit {name} arrived before Prepare")));
                }
                Some(expected) if c.received >= expected => {
                    return Err(StreamError::Protocol(format!(
                        "unit {name} exceeds the {expected} units announced"
                    )));
                }
                Some(_) if c.seen.contains(&name) => {
                    return Err(StreamError::Protocol(format!("unit {name} received twice")));
                }
                Some(_) => {}
            }
        }

        let mut data = Vec::with_capacity(size_bytes.min(MAX_PREALLOC) as usize);
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut got = 0u64;

        if size_bytes == 0 {
            s.progress(&name, Direction::In, 0, 0);
        }
        while got < size_bytes {
            let want = (size_bytes - got).min(CHUNK_SIZE as u64) as usize;
            reader
                .read_exact(&mut buf[..want])
                .await
                .map_err(|e| StreamError::Transport(format!("read unit {name}: {e}")))?;
            data.extend_from_slice(&buf[..want]);
            got += want as u64;
            s.progress(&name, Direction::In, got, size_bytes);
        }

        tracing::debug!(
            plan_id = %s.ctx.plan_id,
            peer = %s.peer,
            session_index = s.session_index,
            unit = %name,
            bytes = size_bytes,
            "received unit"
        );

        s.ctx.events.send(StreamEvent::UnitReceived {
            peer: s.peer,
            session_index: s.session_index,
            name: name.clone(),
            data,
        });

        {
            let mut c = self.counters.lock();
            c.received += 1;
            c.seen.insert(name.clone());
        }
        self.control(Control::Ack(name));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers for the receiving side
// ---------------------------------------------------------------------------

/// Fields of the `Init` frame that opens every inbound connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitHeader {
    pub plan_id: Uuid,
    pub session_index: u32,
    pub from: SocketAddr,
    pub description: String,

    /// Sessions the initiator opens to us in this plan; `0` if unknown.
    pub peer_sessions: u32,
}

/// Read the `Init` frame from a fresh inbound connection.
pub async fn read_init(conn: &mut StreamConnectionPtr) -> Result<InitHeader> {
    // ---
    match expect_message(conn).await? {
        StreamMessage::Init {
            plan_id,
            session_index,
            from,
            description,
            peer_sessions,
        } => Ok(InitHeader {
            plan_id,
            session_index,
            from,
            description,
            peer_sessions,
        }),
        other => Err(StreamError::Protocol(format!(
            "expected Init as first frame, got {other:?}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
