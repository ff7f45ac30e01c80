use crate::{
    backend::{ApplyError, BackendError, Dataplane},
    backoff::Backoff,
    metrics::ReconcilerMetrics,
    model::Observed,
    plan::{Model, Op},
    render::{Desired, RenderConfig},
};
use anyhow::{Context, Result};
use policy_agent_core::{ClassHealth, HealthReport, Intent, IntentUpdate, ResourceClass};
use std::collections::{BTreeMap, BTreeSet};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch, Mutex,
    },
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct Config {
    /// How often the live system is read back in full.
    pub resync_interval: Duration,

    /// Applies and reads that take longer than this are treated as failed.
    pub apply_timeout: Duration,

    /// Consecutive failures after which the affected classes are degraded.
    pub retry_budget: u32,
    pub backoff: Backoff,

    /// The retry interval once degraded.
    pub degraded_retry_interval: Duration,

    pub render: RenderConfig,
}

/// Keeps the live system in sync with the intent.
///
/// The reconciler is the only writer to the dataplane. It renders every intent update into the
/// live resources the intent calls for, and applies the difference between those and its model
/// of the live system in one ordered batch.
pub struct Reconciler<D> {
    dataplane: Mutex<D>,
    config: Config,
    metrics: ReconcilerMetrics,
    health: watch::Sender<HealthReport>,

    intent: Option<Intent>,
    desired: Desired,
    model: Model,

    /// Set until the live system has been read successfully.
    needs_resync: bool,
    observed: bool,
    failures: u32,
    retry_at: Option<Instant>,
    degraded: BTreeMap<ResourceClass, String>,
    applied_version: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(90),
            apply_timeout: Duration::from_secs(30),
            retry_budget: 5,
            backoff: Backoff::default(),
            degraded_retry_interval: Duration::from_secs(30),
            render: RenderConfig::default(),
        }
    }
}

// === impl Reconciler ===

impl<D: Dataplane> Reconciler<D> {
    pub fn new(
        dataplane: D,
        config: Config,
        metrics: ReconcilerMetrics,
        health: watch::Sender<HealthReport>,
    ) -> Self {
        Self {
            dataplane: Mutex::new(dataplane),
            config,
            metrics,
            health,
            intent: None,
            desired: Desired::default(),
            model: Model::default(),
            needs_resync: true,
            observed: false,
            failures: 0,
            retry_at: None,
            degraded: BTreeMap::new(),
            applied_version: None,
        }
    }

    /// Applies intent updates until the update stream ends.
    ///
    /// The reconciler does not observe shutdown itself: the calculation graph emits its final
    /// batch on shutdown and then closes `updates`, so every batch it sends is applied before
    /// this returns. Snapshots are requested on `resyncs` when an update arrives out of
    /// sequence. Returns an error only when the dataplane becomes unavailable.
    pub async fn run(
        mut self,
        mut updates: mpsc::Receiver<IntentUpdate>,
        resyncs: mpsc::Sender<()>,
    ) -> Result<()> {
        let interval = self.config.resync_interval;
        let mut resync = time::interval_at(Instant::now() + interval, interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                biased;

                update = updates.recv() => {
                    let Some(update) = update else {
                        if self.retry_at.is_some() {
                            warn!("Intent updates ended with changes still pending");
                        }
                        info!("Intent updates ended");
                        return Ok(());
                    };
                    self.ingest(update, &resyncs);
                    while let Ok(update) = updates.try_recv() {
                        self.ingest(update, &resyncs);
                    }
                    // While backing off, updates are applied with the next retry.
                    if self.retry_at.is_none() {
                        self.reconcile().await?;
                    }
                }

                _ = time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.reconcile().await?;
                }

                _ = resync.tick() => {
                    debug!("Resyncing");
                    self.needs_resync = true;
                    if self.retry_at.is_none() {
                        self.reconcile().await?;
                    }
                }
            }
        }
    }

    fn ingest(&mut self, update: IntentUpdate, resyncs: &mpsc::Sender<()>) {
        match update {
            IntentUpdate::Snapshot(intent) => {
                debug!(version = intent.version, "Received intent snapshot");
                self.desired = Desired::render(&intent, &self.config.render);
                self.model.mark_all_dirty(&self.desired);
                self.intent = Some(intent);
            }
            IntentUpdate::Delta(delta) => {
                let expected = self.intent.as_ref().map(|i| i.version + 1);
                let intent = match self.intent.as_mut() {
                    Some(intent) if Some(delta.version) == expected => intent,
                    _ => {
                        warn!(version = delta.version, ?expected, "Intent update out of sequence");
                        self.metrics.ignored();
                        match resyncs.try_send(()) {
                            // A snapshot is already pending.
                            Ok(()) | Err(TrySendError::Full(())) => {}
                            Err(TrySendError::Closed(())) => {
                                warn!("The calculation graph is gone; no snapshot will follow");
                            }
                        }
                        return;
                    }
                };
                debug!(version = delta.version, "Received intent update");
                intent.apply(&delta);
                let touched = self.desired.update(intent, &delta);
                self.model.mark_dirty(touched);
            }
        }
    }

    /// Reads back the live system if needed, then applies every pending change.
    async fn reconcile(&mut self) -> Result<()> {
        if self.intent.is_none() {
            return Ok(());
        }

        if self.needs_resync {
            match self.read().await {
                Ok(observed) => self.observe(observed),
                Err(error) if error.is_fatal() => {
                    return Err(error).context("failed to read the dataplane");
                }
                Err(error) => {
                    warn!(%error, "Failed to read the dataplane");
                    self.failed(error.to_string(), ResourceClass::ALL);
                    self.publish();
                    return Ok(());
                }
            }
        }

        let ops = self.model.plan(&self.desired);
        if ops.is_empty() {
            self.succeeded();
            self.publish();
            return Ok(());
        }

        let start = Instant::now();
        let result = self.apply(&ops).await;
        let elapsed = start.elapsed();
        match result {
            Ok(()) => {
                for op in &ops {
                    self.model.committed(op);
                }
                self.metrics.applied(&ops, elapsed);
                debug!(ops = ops.len(), ?elapsed, "Applied batch");
                self.succeeded();
            }
            Err(ApplyError { failed, source }) => {
                let failed = failed.min(ops.len());
                let (done, rest) = ops.split_at(failed);
                for op in done {
                    self.model.committed(op);
                }
                for op in rest {
                    self.model.failed(op);
                }
                self.metrics.applied(done, elapsed);
                self.metrics.failed();
                if source.is_fatal() {
                    return Err(source).context("failed to apply to the dataplane");
                }
                warn!(
                    error = %source,
                    applied = done.len(),
                    pending = rest.len(),
                    resource = %rest.first().map(Op::key).map(|k| k.to_string()).unwrap_or_default(),
                    "Failed to apply batch",
                );
                let classes = rest
                    .iter()
                    .map(|op| op.key().class())
                    .collect::<BTreeSet<_>>();
                self.failed(source.to_string(), classes);
            }
        }
        self.publish();
        Ok(())
    }

    async fn apply(&self, ops: &[Op]) -> Result<(), ApplyError> {
        let dataplane = self.dataplane.lock().await;
        time::timeout(self.config.apply_timeout, dataplane.apply_batch(ops))
            .await
            .unwrap_or_else(|_| {
                Err(ApplyError {
                    failed: 0,
                    source: BackendError::Timeout(self.config.apply_timeout),
                })
            })
    }

    async fn read(&self) -> Result<Observed, BackendError> {
        let dataplane = self.dataplane.lock().await;
        time::timeout(self.config.apply_timeout, dataplane.read_state())
            .await
            .unwrap_or(Err(BackendError::Timeout(self.config.apply_timeout)))
    }

    /// Replaces the model with the observed live state, so the next plan corrects any drift.
    fn observe(&mut self, observed: Observed) {
        self.metrics.resync();
        let drifted = self.model.observe(observed);
        if self.observed {
            for key in &drifted {
                warn!(%key, "Dataplane drifted");
                self.metrics.drift(key.class());
            }
        } else {
            info!(resources = drifted.len(), "Read the dataplane");
        }
        self.observed = true;
        self.needs_resync = false;
        self.model.mark_all_dirty(&self.desired);
    }

    fn succeeded(&mut self) {
        if !self.degraded.is_empty() {
            info!("Dataplane recovered");
        }
        self.failures = 0;
        self.retry_at = None;
        self.degraded.clear();
    }

    fn failed(&mut self, error: String, classes: impl IntoIterator<Item = ResourceClass>) {
        self.failures += 1;
        let delay = if self.failures >= self.config.retry_budget {
            if self.degraded.is_empty() {
                warn!(failures = self.failures, "Retry budget exhausted");
            }
            for class in classes {
                self.degraded.insert(class, error.clone());
            }
            self.needs_resync = true;
            self.config.degraded_retry_interval
        } else {
            self.config
                .backoff
                .delay(self.failures, &mut rand::thread_rng())
        };
        debug!(?delay, failures = self.failures, "Retrying");
        self.retry_at = Some(Instant::now() + delay);
    }

    fn publish(&mut self) {
        let classes = ResourceClass::ALL
            .into_iter()
            .map(|class| {
                let health = match self.degraded.get(&class) {
                    Some(error) => ClassHealth::Degraded {
                        error: error.clone(),
                    },
                    None if !self.observed => ClassHealth::Unknown,
                    None => self.model.class_health(class),
                };
                (class, health)
            })
            .collect();
        if self.model.is_clean() {
            self.applied_version = self.intent.as_ref().map(|i| i.version);
        }
        let report = HealthReport {
            classes,
            applied_version: self.applied_version,
        };
        self.health.send_if_modified(|current| {
            if *current == report {
                return false;
            }
            *current = report;
            true
        });
    }
}
