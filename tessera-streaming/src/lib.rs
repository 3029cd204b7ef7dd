//! Session multiplexing and connection coordination for Tessera streaming.
//!
//! # Structure
//!
//! - `coordinator`  [`StreamCoordinator`], the per-plan peer and session registry
//! - `session`      [`StreamSession`], one connection with its state machine and transfer tasks
//! - `executor`     [`ConnectExecutor`], [`ConnectPool`], [`QueuedExecutor`]
//! - `events`       [`StreamEvent`] channel and the [`StreamEventHandler`] callback trait
//! - `monitor`      [`StreamMonitor`], which applies events to the coordinator
//! - `inbound`      [`StreamReceiver`], which attaches inbound connections to plans
//! - `framing`      wire format of session control messages
//!
//! # Typical sender
//!
//! ```ignore
//! let (events, rx) = StreamEventTx::channel();
//! let coordinator = Arc::new(StreamCoordinator::new(config, factory, ConnectPool::global(), events));
//! let session = coordinator.get_or_create_next_session(peer, peer);
//! session.add_transfer("users-1.db", bytes)?;
//! coordinator.connect_all_stream_sessions();
//! let outcome = StreamMonitor::new(coordinator, rx, handler).run_until_drained().await;
//! ```

mod config;
mod coordinator;
mod events;
mod executor;
mod framing;
mod host_data;
mod inbound;
mod monitor;
mod session;

// --- config
pub use config::CoordinatorConfig;

// --- coordinator
pub use coordinator::StreamCoordinator;

// --- session
pub use session::{read_init, InitHeader, StreamSession};

// --- executor
pub use executor::{
    // ---
    ConnectExecutor,
    ConnectExecutorPtr,
    ConnectPool,
    ConnectTask,
    QueuedExecutor,
    CONNECT_POOL_NAME,
};

// --- events
pub use events::{NoopHandler, StreamEvent, StreamEventHandler, StreamEventTx};

// --- monitor
pub use monitor::{SessionFailure, StreamMonitor, StreamOutcome};

// --- inbound
pub use inbound::StreamReceiver;

// --- framing
pub use framing::{
    // ---
    expect_message,
    read_message,
    write_message,
    StreamMessage,
    CHUNK_SIZE,
    FIXED_HEADER_LEN,
    MAGIC,
    MAX_PAYLOAD_LEN,
    VERSION,
};
