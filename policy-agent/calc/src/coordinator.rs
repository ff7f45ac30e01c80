use crate::{graph::CalcGraph, metrics::CalcMetrics};
use anyhow::{anyhow, Result};
use policy_agent_core::IntentUpdate;
use policy_agent_k8s_api::FeedEvent;
use tokio::{
    sync::mpsc,
    time::{self, Duration, Instant},
};
use tracing::{debug, info, warn};

/// Batching parameters.
#[derive(Clone, Debug)]
pub struct Config {
    /// How long the feed must be idle before a batch is emitted.
    pub quiescence: Duration,

    /// Bounds how long a batch may be held back by a feed that is never idle.
    pub max_batch_delay: Duration,
}

/// Drives the calculation graph from the datastore feed.
///
/// Each event is fully propagated through the graph as it is received. Intent changes are
/// debounced and emitted as a single delta once the feed has been idle for the quiescence window
/// (or the batch reaches its maximum delay). Nothing is emitted until every kind has been listed;
/// the first emission is then a full snapshot.
#[derive(Debug)]
pub struct Coordinator {
    graph: CalcGraph,
    config: Config,
    metrics: CalcMetrics,
    snapshot_requested: bool,
}

#[derive(Copy, Clone, Debug)]
struct Batch {
    started: Instant,
    last: Instant,
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            quiescence: Duration::from_millis(100),
            max_batch_delay: Duration::from_secs(1),
        }
    }
}

// === impl Coordinator ===

impl Coordinator {
    pub fn new(graph: CalcGraph, config: Config, metrics: CalcMetrics) -> Self {
        Self {
            graph,
            config,
            metrics,
            snapshot_requested: false,
        }
    }

    /// Runs until the feed closes or shutdown is signaled. Either way, the pending batch is emitted
    /// before returning.
    ///
    /// Each message on `resyncs` causes a full snapshot to be emitted. Fails if the intent
    /// receiver is dropped.
    pub async fn run(
        mut self,
        mut feed: mpsc::Receiver<FeedEvent>,
        mut resyncs: mpsc::Receiver<()>,
        updates: mpsc::Sender<IntentUpdate>,
        drain: drain::Watch,
    ) -> Result<()> {
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        let mut batch: Option<Batch> = None;
        loop {
            let deadline = batch.map(|b| {
                (b.last + self.config.quiescence).min(b.started + self.config.max_batch_delay)
            });

            tokio::select! {
                biased;

                handle = &mut shutdown => {
                    info!("Shutting down; emitting pending changes");
                    self.emit(&updates).await?;
                    drop(handle);
                    return Ok(());
                }

                ev = feed.recv() => match ev {
                    Some(ev) => {
                        self.process(ev);
                        let now = Instant::now();
                        batch.get_or_insert(Batch { started: now, last: now }).last = now;
                    }
                    None => {
                        info!("Feed closed");
                        self.emit(&updates).await?;
                        return Ok(());
                    }
                },

                Some(()) = resyncs.recv() => {
                    debug!("Snapshot requested");
                    self.snapshot_requested = true;
                    self.emit(&updates).await?;
                    batch = None;
                }

                () = sleep_until(deadline) => {
                    self.emit(&updates).await?;
                    batch = None;
                }
            }
        }
    }

    fn process(&mut self, event: FeedEvent) {
        self.metrics.feed_event(&event);
        let kind = match &event {
            FeedEvent::Resource(ev) => Some(ev.kind),
            FeedEvent::Restarted(_) | FeedEvent::Synced(_) => None,
        };
        if let Err(error) = self.graph.apply(event) {
            let error = format!("{error:#}");
            warn!(%error, "Ignoring invalid update");
            if let Some(kind) = kind {
                self.metrics.malformed(kind);
            }
        }
    }

    /// Sends the changes accumulated since the last emission, waiting for the receiver to have
    /// capacity.
    async fn emit(&mut self, updates: &mpsc::Sender<IntentUpdate>) -> Result<()> {
        if !self.graph.is_synced() {
            debug!("Waiting for every resource kind to be listed");
            return Ok(());
        }

        let requested = std::mem::take(&mut self.snapshot_requested);
        let update = if self.graph.take_snapshot_due() || requested {
            let intent = self.graph.snapshot();
            info!(version = intent.version, endpoints = intent.endpoints.len(), "Emitting snapshot");
            self.metrics.snapshot();
            IntentUpdate::Snapshot(intent)
        } else {
            match self.graph.flush() {
                Some(delta) => {
                    debug!(version = delta.version, "Emitting delta");
                    self.metrics.delta();
                    IntentUpdate::Delta(delta)
                }
                None => return Ok(()),
            }
        };
        self.metrics.observe(&self.graph.stats());

        updates
            .send(update)
            .await
            .map_err(|_| anyhow!("intent receiver dropped"))
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
