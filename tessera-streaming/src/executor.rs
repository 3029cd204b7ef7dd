//! Bounded execution for session connection establishment.
//!
//! Connecting and handshaking block on the network, so the coordinator
//! never does it on the caller's task or under its lock.  Instead it hands
//! one [`ConnectTask`] per session to a [`ConnectExecutor`].
//!
//! - [`ConnectPool`] is the production executor, a fixed number of worker tasks
//!   draining one shared queue, so at most `size` handshakes are in flight
//!   process-wide no matter how many peers or coordinators exist.  Transfer
//!   work never runs here; a session spawns its own tasks once connected.
//! - [`QueuedExecutor`] holds tasks until [`QueuedExecutor::run_pending`]
//!   drives them one at a time, for deterministic tests.

use std::collections::VecDeque;
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

// ---

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

// ---------------------------------------------------------------------------
// ConnectExecutor
// ---------------------------------------------------------------------------

/// A detached unit of connection work. Its only outcome is side effects on
/// the session it drives.
pub type ConnectTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Task execution capability injected into the coordinator.
pub trait ConnectExecutor: Send + Sync {
    // ---
    /// Submit `task` for execution. Must not block the caller.  A task that
    /// will never run is dropped, not leaked.
    fn execute(&self, task: ConnectTask);
}

/// Shared handle to a [`ConnectExecutor`].
pub type ConnectExecutorPtr = Arc<dyn ConnectExecutor>;

// ---------------------------------------------------------------------------
// ConnectPool
// ---------------------------------------------------------------------------

/// Worker name prefix used in tracing spans.
pub const CONNECT_POOL_NAME: &str = "stream-connection-establisher";

static GLOBAL: OnceLock<Arc<ConnectPool>> = OnceLock::new();

type TaskRx = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ConnectTask>>>;

/// Fixed-size pool of connection-establishment workers.
///
/// Each worker loops taking the next task from the shared queue and
/// running it to completion, so the number of concurrently running tasks
/// never exceeds `size`.  A panicking task is contained and logged; the
/// worker carries on.
pub struct ConnectPool {
    // ---
    name: String,
    size: usize,

    /// `None` once [`ConnectPool::shutdown`] has been called.
    tx: Mutex<Option<mpsc::UnboundedSender<ConnectTask>>>,

    workers: Mutex<Vec<JoinHandle<()>>>,
}

// ---

impl ConnectPool {
    // ---
    /// Spawn a pool of `size` workers (at least one) on the current tokio
    /// runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(name: &str, size: usize) -> Arc<Self> {
        // ---
        let size = size.max(1);
        let (tx, rx) = mpsc::unbounded_channel::<ConnectTask>();
        let rx: TaskRx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..size)
            .map(|n| {
                let span = tracing::info_span!("connect_worker", worker = %format!("{name}-{n}"));
                tokio::spawn(worker_loop(Arc::clone(&rx)).instrument(span))
            })
            .collect();

        tracing::debug!(pool = name, size, "connect pool started");

        Arc::new(Self {
            name: name.to_owned(),
            size,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    // ---

    /// Pool sized to the host's available parallelism.
    pub fn with_available_parallelism(name: &str) -> Arc<Self> {
        Self::new(name, available_parallelism())
    }

    // ---

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_shut_down(&self) -> bool {
        self.tx.lock().is_none()
    }

    // ---

    /// Stop accepting tasks, let the workers drain what is already queued,
    /// and wait for them to exit.
    pub async fn shutdown(&self) {
        // ---
        let Some(tx) = self.tx.lock().take() else {
            return;
        };
        drop(tx);

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for w in workers {
            if let Err(e) = w.await {
                tracing::warn!(pool = %self.name, "connect worker ended abnormally: {e}");
            }
        }
        tracing::debug!(pool = %self.name, "connect pool shut down");
    }

    // --- process-wide instance ----------------------------------------------

    /// Initialise the process-wide pool once.  Later calls return the
    /// existing pool and ignore `size`.  `None` sizes the pool to the
    /// host's available parallelism.
    ///
    /// # Panics
    ///
    /// The first call panics if made outside a tokio runtime.
    pub fn init_global(size: Option<usize>) -> Arc<ConnectPool> {
        // ---
        let pool = GLOBAL.get_or_init(|| {
            let size = size.unwrap_or_else(available_parallelism);
            ConnectPool::new(CONNECT_POOL_NAME, size)
        });
        Arc::clone(pool)
    }

    /// The process-wide pool, initialised on first use.
    pub fn global() -> Arc<ConnectPool> {
        Self::init_global(None)
    }

    /// Shut down the process-wide pool if it was ever started.
    pub async fn shutdown_global() {
        if let Some(pool) = GLOBAL.get() {
            pool.shutdown().await;
        }
    }
}

// ---

impl ConnectExecutor for ConnectPool {
    // ---
    fn execute(&self, task: ConnectTask) {
        // ---
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            tracing::warn!(pool = %self.name, "connect pool shut down, dropping task");
            return;
        };
        if tx.send(task).is_err() {
            tracing::warn!(pool = %self.name, "connect workers gone, dropping task");
        }
    }
}

// ---

async fn worker_loop(rx: TaskRx) {
    // ---
    loop {
        // Hold the queue lock only while waiting for the next task.
        let task = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };

        let Some(task) = task else {
            tracing::debug!("connect queue closed, worker exiting");
            return;
        };

        // Run on its own task so a panic cannot take the worker down; the
        // worker still waits for it, which keeps the pool bounded.
        if let Err(e) = tokio::spawn(task).await {
            tracing::error!("connect task panicked: {e}");
        }
    }
}

// ---

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

// ---------------------------------------------------------------------------
// QueuedExecutor
// ---------------------------------------------------------------------------

/// Executor that only queues.  Nothing runs until the owner calls
/// [`QueuedExecutor::run_pending`], which drives tasks sequentially in
/// submission order.
#[derive(Default)]
pub struct QueuedExecutor {
    // ---
    queue: Mutex<VecDeque<ConnectTask>>,
}

// ---

impl QueuedExecutor {
    // ---
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of tasks submitted but not yet run.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run every queued task, including any submitted while running.
    /// Returns how many tasks ran.
    pub async fn run_pending(&self) -> usize {
        // ---
        let mut ran = 0;
        loop {
            let next = self.queue.lock().pop_front();
            match next {
                Some(task) => {
                    task.await;
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

// ---

impl ConnectExecutor for QueuedExecutor {
    fn execute(&self, task: ConnectTask) {
        self.queue.lock().push_back(task);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
