//! Sender coordinator → simulated network → receiver, end to end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

// ---

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

// ---

use tessera_domain::{Direction, ProgressInfo, StreamState};
use tessera_link_sim::{LinkSimConfig, LinkSimIncoming, LinkSimNetwork};
use tessera_streaming::{
    // ---
    ConnectPool,
    CoordinatorConfig,
    NoopHandler,
    StreamCoordinator,
    StreamEventHandler,
    StreamEventTx,
    StreamMonitor,
    StreamOutcome,
    StreamReceiver,
};

// ---

fn addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], 7000))
}

/// Collects every unit delivered on the receiving side.
#[derive(Default)]
struct Collector {
    units: Mutex<Vec<(SocketAddr, u32, String, Vec<u8>)>>,
    last_progress: Mutex<Vec<ProgressInfo>>,
}

#[async_trait]
impl StreamEventHandler for Collector {
    async fn on_progress(&self, progress: &ProgressInfo) {
        self.last_progress.lock().push(progress.clone());
    }

    async fn on_unit_received(&self, peer: SocketAddr, session_index: u32, name: String, data: Vec<u8>) {
        self.units.lock().push((peer, session_index, name, data));
    }
}

/// Start a receiving node listening on `at`; returns its outcome channel.
fn spawn_receiver(
    net: &LinkSimNetwork,
    at: SocketAddr,
    pool: Arc<ConnectPool>,
    handler: Arc<dyn StreamEventHandler>,
) -> mpsc::UnboundedReceiver<StreamOutcome> {
    // ---
    let mut incoming = net.listen(at).unwrap();
    let factory = Arc::new(net.connector(at, LinkSimConfig::perfect()));
    let (receiver, outcomes) = StreamReceiver::new(factory, pool, handler);

    tokio::spawn(async move {
        while let Some(LinkSimIncoming { stream, from }) = incoming.recv().await {
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move {
                if let Err(e) = receiver.accept(Box::new(stream)).await {
                    panic!("accept from {from} failed: {e}");
                }
            });
        }
    });
    outcomes
}

fn payload(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

async fn within<F: std::future::Future>(f: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(20), f)
        .await
        .expect("timed out")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Two peers, two connections each, five files.  Every peer receives every
/// file exactly once, both sides report success, and the sender's
/// bookkeeping shows all bytes sent.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn files_reach_every_peer_over_round_robin_sessions() {
    // ---
    let net = LinkSimNetwork::new();
    let pool = ConnectPool::new("e2e-pool", 2);

    let sink_a = Arc::new(Collector::default());
    let sink_b = Arc::new(Collector::default());
    let mut out_a = spawn_receiver(&net, addr(2), pool.clone(), sink_a.clone());
    let mut out_b = spawn_receiver(&net, addr(3), pool.clone(), sink_b.clone());

    let (events, rx) = StreamEventTx::channel();
    let sender = Arc::new(StreamCoordinator::new(
        CoordinatorConfig::sending(2, addr(1)).with_description("rebuild"),
        Arc::new(net.connector(addr(1), LinkSimConfig::perfect())),
        pool.clone(),
        events,
    ));

    let files: Vec<(String, Vec<u8>)> = (0..5u8)
        .map(|i| (format!("users-{i}.db"), payload(i, 20_000 + i as usize * 7_000)))
        .collect();
    let total: u64 = files.iter().map(|(_, d)| d.len() as u64).sum();

    for (name, data) in &files {
        for peer in [addr(2), addr(3)] {
            sender
                .get_or_create_next_session(peer, peer)
                .add_transfer(name.clone(), data.clone())
                .unwrap();
        }
    }
    assert_eq!(sender.all_stream_sessions().len(), 4);
    assert_eq!(sender.connect_all_stream_sessions(), 4);

    let mut monitor = StreamMonitor::new(sender.clone(), rx, Arc::new(NoopHandler));
    let outcome = within(monitor.run_until_drained()).await;

    assert!(!outcome.has_failures(), "failures: {:?}", outcome.failures);
    assert_eq!(outcome.plan_id, sender.plan_id());
    assert_eq!(outcome.sessions.len(), 4);
    assert!(outcome.sessions.iter().all(|s| s.state == StreamState::Complete));
    assert_eq!(outcome.total_size_sent(), total * 2);
    assert!(!sender.has_active_sessions());

    for (out, sink) in [(&mut out_a, &sink_a), (&mut out_b, &sink_b)] {
        // Each receiver reports the whole plan exactly once.
        let o = within(out.recv()).await.unwrap();
        assert_eq!(o.plan_id, sender.plan_id());
        assert!(!o.has_failures(), "failures: {:?}", o.failures);
        assert_eq!(o.sessions.len(), 2);
        assert_eq!(o.total_size_received(), total);
        assert!(out.try_recv().is_err());

        let mut units = sink.units.lock().clone();
        units.sort_by(|a, b| a.2.cmp(&b.2));
        assert_eq!(units.len(), files.len());
        for ((from, _, name, data), (want_name, want_data)) in units.iter().zip(&files) {
            assert_eq!(*from, addr(1));
            assert_eq!(name, want_name);
            assert_eq!(data, want_data);
        }

        // Files were spread over both sessions.
        let mut sessions: Vec<u32> = units.iter().map(|u| u.1).collect();
        sessions.sort_unstable();
        sessions.dedup();
        assert_eq!(sessions, vec![0, 1]);

        let progress = sink.last_progress.lock();
        assert!(progress.iter().all(|p| p.direction == Direction::In));
        assert!(progress.iter().any(|p| p.is_completed()));
    }

    pool.shutdown().await;
}

// ---

/// One reachable peer and one that refuses every dial.  The reachable
/// transfer completes, the other session fails, and the monitor still
/// drains instead of waiting forever.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_peer_fails_without_blocking_the_rest() {
    // ---
    let net = LinkSimNetwork::new();
    let pool = ConnectPool::new("e2e-pool", 2);

    let sink = Arc::new(Collector::default());
    let mut outcomes = spawn_receiver(&net, addr(2), pool.clone(), sink.clone());

    let (events, rx) = StreamEventTx::channel();
    let connector = Arc::new(net.connector(addr(1), LinkSimConfig::perfect().with_unreachable(addr(9))));
    let sender = Arc::new(StreamCoordinator::new(
        CoordinatorConfig::sending(1, addr(1)),
        connector.clone(),
        pool.clone(),
        events,
    ));

    for peer in [addr(2), addr(9)] {
        sender
            .get_or_create_next_session(peer, peer)
            .add_transfer("a.db", payload(1, 1_000))
            .unwrap();
    }
    sender.connect_all_stream_sessions();

    let mut monitor = StreamMonitor::new(sender.clone(), rx, Arc::new(NoopHandler));
    let outcome = within(monitor.run_until_drained()).await;

    assert!(outcome.has_failures());
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].peer, addr(9));
    assert_eq!(connector.attempts(addr(9)), 1);

    let states: Vec<(SocketAddr, StreamState)> = sender
        .all_stream_sessions()
        .iter()
        .map(|s| (s.peer(), s.state()))
        .collect();
    assert_eq!(
        states,
        vec![(addr(2), StreamState::Complete), (addr(9), StreamState::Failed)]
    );

    let received = within(outcomes.recv()).await.unwrap();
    assert!(!received.has_failures());
    assert_eq!(sink.units.lock().len(), 1);

    pool.shutdown().await;
}

// ---

/// A session with nothing to send still completes: both sides exchange
/// empty summaries and finish.
#[tokio::test]
async fn empty_session_completes() {
    // ---
    let net = LinkSimNetwork::new();
    let pool = ConnectPool::new("e2e-pool", 1);
    let mut outcomes = spawn_receiver(&net, addr(2), pool.clone(), Arc::new(NoopHandler));

    let (events, rx) = StreamEventTx::channel();
    let sender = Arc::new(StreamCoordinator::new(
        CoordinatorConfig::sending(1, addr(1)),
        Arc::new(net.connector(addr(1), LinkSimConfig::perfect())),
        pool.clone(),
        events,
    ));
    let session = sender.get_or_create_next_session(addr(2), addr(2));
    sender.connect_all_stream_sessions();

    let mut monitor = StreamMonitor::new(sender.clone(), rx, Arc::new(NoopHandler));
    let outcome = within(monitor.run_until_drained()).await;

    assert!(!outcome.has_failures());
    assert_eq!(session.state(), StreamState::Complete);
    assert_eq!(outcome.sessions[0].total_files_to_send(), 0);

    let received = within(outcomes.recv()).await.unwrap();
    assert_eq!(received.sessions.len(), 1);
    assert_eq!(received.sessions[0].state, StreamState::Complete);

    pool.shutdown().await;
}
