use super::*;
use crate::{CalcMetrics, Config, Coordinator};
use policy_agent_core::{EndpointId, IntentUpdate};
use tokio::{
    sync::mpsc,
    time::{self, Duration},
};

struct Harness {
    feed: mpsc::Sender<FeedEvent>,
    resyncs: mpsc::Sender<()>,
    updates: mpsc::Receiver<IntentUpdate>,
    shutdown: drain::Signal,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

fn spawn() -> Harness {
    let (feed_tx, feed_rx) = mpsc::channel(16);
    let (resync_tx, resync_rx) = mpsc::channel(1);
    let (updates_tx, updates_rx) = mpsc::channel(16);
    let (signal, watch) = drain::channel();
    let coordinator = Coordinator::new(
        CalcGraph::new(NODE),
        Config::default(),
        CalcMetrics::register(&mut Default::default()),
    );
    let task = tokio::spawn(coordinator.run(feed_rx, resync_rx, updates_tx, watch));
    Harness {
        feed: feed_tx,
        resyncs: resync_tx,
        updates: updates_rx,
        shutdown: signal,
        task,
    }
}

impl Harness {
    async fn send(&self, ev: FeedEvent) {
        self.feed.send(ev).await.expect("coordinator must be running");
    }

    async fn sync_all(&self) {
        for kind in Kind::ALL {
            self.send(FeedEvent::Synced(kind)).await;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn nothing_is_emitted_until_every_kind_is_listed() {
    let mut h = spawn();
    h.send(workload("ns", "a", &[], "10.0.0.1")).await;
    for kind in &Kind::ALL[..5] {
        h.send(FeedEvent::Synced(*kind)).await;
    }
    time::sleep(Duration::from_secs(5)).await;
    assert!(h.updates.try_recv().is_err());

    h.send(FeedEvent::Synced(Kind::ALL[5])).await;
    match h.updates.recv().await.expect("snapshot") {
        IntentUpdate::Snapshot(intent) => {
            assert!(intent
                .endpoints
                .contains_key(&EndpointId::workload("ns", "a")));
        }
        update => panic!("unexpected update: {update:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn bursts_are_debounced() {
    let mut h = spawn();
    h.sync_all().await;
    assert!(matches!(
        h.updates.recv().await,
        Some(IntentUpdate::Snapshot(_))
    ));

    let start = time::Instant::now();
    for i in 0..5 {
        h.send(workload("ns", &format!("ep{i}"), &[], &format!("10.0.0.{i}")))
            .await;
        time::sleep(Duration::from_millis(20)).await;
    }
    let update = h.updates.recv().await.expect("delta");
    let elapsed = start.elapsed();
    match update {
        IntentUpdate::Delta(delta) => assert_eq!(delta.endpoints.len(), 5),
        update => panic!("unexpected update: {update:?}"),
    }
    // The batch is emitted one quiescence window after the last event.
    assert!(elapsed >= Duration::from_millis(180), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(300), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn a_busy_feed_is_bounded_by_the_max_delay() {
    let mut h = spawn();
    h.sync_all().await;
    h.updates.recv().await.expect("snapshot");

    let feed = h.feed.clone();
    tokio::spawn(async move {
        for i in 0..40u8 {
            let ev = workload("ns", &format!("ep{i}"), &[], &format!("10.0.1.{i}"));
            if feed.send(ev).await.is_err() {
                return;
            }
            time::sleep(Duration::from_millis(50)).await;
        }
    });

    let start = time::Instant::now();
    let update = h.updates.recv().await.expect("delta");
    assert!(matches!(update, IntentUpdate::Delta(_)));
    assert!(start.elapsed() <= Duration::from_millis(1050));
}

#[tokio::test(start_paused = true)]
async fn resync_requests_are_answered_with_snapshots() {
    let mut h = spawn();
    h.sync_all().await;
    h.updates.recv().await.expect("snapshot");

    h.resyncs.send(()).await.unwrap();
    match h.updates.recv().await.expect("snapshot") {
        IntentUpdate::Snapshot(intent) => assert!(intent.endpoints.is_empty()),
        update => panic!("unexpected update: {update:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_emits_the_pending_batch() {
    let mut h = spawn();
    h.sync_all().await;
    h.updates.recv().await.expect("snapshot");

    h.send(workload("ns", "a", &[], "10.0.0.1")).await;
    // Let the coordinator process the event before signaling.
    tokio::task::yield_now().await;
    time::sleep(Duration::from_millis(10)).await;

    let Harness {
        shutdown,
        task,
        mut updates,
        ..
    } = h;
    let drained = tokio::spawn(shutdown.drain());
    match updates.recv().await.expect("delta") {
        IntentUpdate::Delta(delta) => assert_eq!(delta.endpoints.len(), 1),
        update => panic!("unexpected update: {update:?}"),
    }
    task.await.unwrap().unwrap();
    drained.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn invalid_events_do_not_stop_the_pipeline() {
    let mut h = spawn();
    h.sync_all().await;
    h.updates.recv().await.expect("snapshot");

    h.send(policy("ns", "bad", ingress("role ==", 1.0, vec![])))
        .await;
    h.send(workload("ns", "a", &[], "10.0.0.1")).await;
    match h.updates.recv().await.expect("delta") {
        IntentUpdate::Delta(delta) => assert_eq!(delta.endpoints.len(), 1),
        update => panic!("unexpected update: {update:?}"),
    }
}
