use crate::{
    calc::{self, CalcGraph, CalcMetrics, Coordinator},
    core::{HealthReport, IntentUpdate},
    dataplane::{
        self, Dataplane, IptablesConfig, IptablesDataplane, IptablesMode, MemoryDataplane,
        Reconciler, ReconcilerMetrics, RenderConfig,
    },
    k8s::{self, FeedEvent, FeedResource, Watch},
    status::{Reporter, StatusMetrics},
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Duration,
};
use tracing::{error, info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "policy-agent", about = "Enforces network policy on the local node")]
pub struct Args {
    #[clap(
        long,
        default_value = "policy_agent=info,warn",
        env = "POLICY_AGENT_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The node whose endpoints are enforced.
    #[clap(long, env = "NODENAME")]
    node_name: String,

    /// The mechanism that enforces policy: `iptables`, or `memory` to compute and log changes
    /// without touching the host.
    #[clap(long, default_value = "iptables")]
    dataplane: DataplaneKind,

    #[clap(long, default_value = "legacy")]
    iptables_mode: IptablesMode,

    /// The routing table that holds routes to local workloads.
    #[clap(long, default_value = "254")]
    route_table: u32,

    /// The name prefix of every workload interface.
    #[clap(long, default_value = "cali")]
    interface_prefix: String,

    #[clap(long, default_value = "100")]
    batch_quiescence_ms: u64,

    #[clap(long, default_value = "1000")]
    max_batch_delay_ms: u64,

    #[clap(long, default_value = "90")]
    resync_interval_secs: u64,

    #[clap(long, default_value = "30000")]
    apply_timeout_ms: u64,

    /// Consecutive apply failures after which the dataplane is reported as degraded.
    #[clap(long, default_value = "5")]
    retry_budget: u32,

    /// The capacity of the queues between the pipeline's stages.
    #[clap(long, default_value = "1000")]
    queue_depth: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DataplaneKind {
    Iptables,
    Memory,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            node_name,
            dataplane,
            iptables_mode,
            route_table,
            interface_prefix,
            batch_quiescence_ms,
            max_batch_delay_ms,
            resync_interval_secs,
            apply_timeout_ms,
            retry_budget,
            queue_depth,
        } = self;

        if queue_depth == 0 {
            bail!("--queue-depth must be positive");
        }
        if retry_budget == 0 {
            bail!("--retry-budget must be positive");
        }

        let mut prom = <Registry>::default();
        let calc_metrics = CalcMetrics::register(prom.sub_registry_with_prefix("calc"));
        let reconciler_metrics =
            ReconcilerMetrics::register(prom.sub_registry_with_prefix("dataplane"));
        let status_metrics = StatusMetrics::register(prom.sub_registry_with_prefix("status"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        info!(node = %node_name, ?dataplane, "Starting");

        // Spawn resource watches. Every watch feeds the same queue; events are only ordered per
        // resource.
        let (feed_tx, feed_rx) = mpsc::channel(queue_depth);

        let tiers = runtime.watch_all::<k8s::policy::Tier>(watcher::Config::default());
        spawn_watch(tiers, feed_tx.clone(), info_span!("tiers"));

        let policies = runtime.watch_all::<k8s::policy::NetworkPolicy>(watcher::Config::default());
        spawn_watch(policies, feed_tx.clone(), info_span!("networkpolicies"));

        let global_policies =
            runtime.watch_all::<k8s::policy::GlobalNetworkPolicy>(watcher::Config::default());
        spawn_watch(
            global_policies,
            feed_tx.clone(),
            info_span!("globalnetworkpolicies"),
        );

        let profiles = runtime.watch_all::<k8s::policy::Profile>(watcher::Config::default());
        spawn_watch(profiles, feed_tx.clone(), info_span!("profiles"));

        let workloads =
            runtime.watch_all::<k8s::endpoint::WorkloadEndpoint>(watcher::Config::default());
        spawn_watch(workloads, feed_tx.clone(), info_span!("workloadendpoints"));

        let hosts = runtime.watch_all::<k8s::endpoint::HostEndpoint>(watcher::Config::default());
        spawn_watch(hosts, feed_tx, info_span!("hostendpoints"));

        // Spawn the calculation graph. Snapshots requested by the reconciler coalesce in a
        // single-slot queue.
        let (resyncs_tx, resyncs_rx) = mpsc::channel(1);
        let (updates_tx, updates_rx) = mpsc::channel(queue_depth);
        let coordinator = Coordinator::new(
            CalcGraph::new(node_name),
            calc::Config {
                quiescence: Duration::from_millis(batch_quiescence_ms),
                max_batch_delay: Duration::from_millis(max_batch_delay_ms),
            },
            calc_metrics,
        );
        let drain = runtime.shutdown_handle();
        tokio::spawn(
            async move {
                if let Err(error) = coordinator
                    .run(feed_rx, resyncs_rx, updates_tx, drain)
                    .await
                {
                    error!(%error, "Calculation graph failed");
                }
            }
            .instrument(info_span!("calc")),
        );

        // Spawn the reconciler, the only task that touches the host.
        let (health_tx, health_rx) = watch::channel(HealthReport::default());
        let config = dataplane::Config {
            resync_interval: Duration::from_secs(resync_interval_secs),
            apply_timeout: Duration::from_millis(apply_timeout_ms),
            retry_budget,
            render: RenderConfig { interface_prefix },
            ..Default::default()
        };
        let reconciler = Pipeline {
            config,
            metrics: reconciler_metrics,
            health: health_tx,
            updates: updates_rx,
            resyncs: resyncs_tx,
        };
        let mut reconciler = match dataplane {
            DataplaneKind::Iptables => reconciler.spawn(IptablesDataplane::new(IptablesConfig {
                mode: iptables_mode,
                route_table,
            })),
            DataplaneKind::Memory => {
                info!("Using an in-memory dataplane; the host is not modified");
                reconciler.spawn(MemoryDataplane::default())
            }
        };

        tokio::spawn(
            Reporter::new(health_rx, status_metrics)
                .run(runtime.shutdown_handle())
                .instrument(info_span!("status")),
        );

        // Block the main thread on the shutdown signal. A reconciler that fails before then
        // leaves the node partially enforced, so the process exits to be restarted.
        let shutdown = runtime.run();
        tokio::pin!(shutdown);
        tokio::select! {
            res = &mut shutdown => {
                if res.is_err() {
                    bail!("Aborted");
                }
                reconciler
                    .await
                    .context("reconciler panicked")?
                    .context("dataplane reconciler failed")?;
            }
            res = &mut reconciler => {
                res.context("reconciler panicked")?
                    .context("dataplane reconciler failed")?;
                if shutdown.await.is_err() {
                    bail!("Aborted");
                }
            }
        }

        Ok(())
    }
}

/// The reconciler's end of the pipeline.
struct Pipeline {
    config: dataplane::Config,
    metrics: ReconcilerMetrics,
    health: watch::Sender<HealthReport>,
    updates: mpsc::Receiver<IntentUpdate>,
    resyncs: mpsc::Sender<()>,
}

impl Pipeline {
    fn spawn<D: Dataplane>(self, dataplane: D) -> JoinHandle<Result<()>> {
        let Self {
            config,
            metrics,
            health,
            updates,
            resyncs,
        } = self;
        let reconciler = Reconciler::new(dataplane, config, metrics, health);
        tokio::spawn(
            reconciler
                .run(updates, resyncs)
                .instrument(info_span!("dataplane")),
        )
    }
}

/// Forwards a resource watch onto the datastore feed.
fn spawn_watch<T, S>(events: S, tx: mpsc::Sender<FeedEvent>, span: tracing::Span)
where
    T: FeedResource,
    S: Stream<Item = watcher::Event<T>> + Send + 'static,
{
    let watch = Watch::from(events.map(Ok::<_, watcher::Error>)).instrument(span.clone());
    tokio::spawn(watch.forward(tx).instrument(span));
}

// === impl DataplaneKind ===

impl std::str::FromStr for DataplaneKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "iptables" => Ok(Self::Iptables),
            "memory" => Ok(Self::Memory),
            s => bail!("invalid dataplane: {s}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["policy-agent", "--node-name", "node-a"]).unwrap();
        assert_eq!(args.node_name, "node-a");
        assert_eq!(args.dataplane, DataplaneKind::Iptables);
        assert_eq!(args.iptables_mode, IptablesMode::Legacy);
        assert_eq!(args.route_table, 254);
        assert_eq!(args.interface_prefix, "cali");
        assert_eq!(args.queue_depth, 1000);
    }

    #[test]
    fn dataplane_flags() {
        let args = Args::try_parse_from([
            "policy-agent",
            "--node-name=node-a",
            "--dataplane=memory",
            "--iptables-mode=nft",
            "--retry-budget=3",
        ])
        .unwrap();
        assert_eq!(args.dataplane, DataplaneKind::Memory);
        assert_eq!(args.iptables_mode, IptablesMode::Nft);
        assert_eq!(args.retry_budget, 3);

        assert!(Args::try_parse_from([
            "policy-agent",
            "--node-name=node-a",
            "--dataplane=ebpf",
        ])
        .is_err());
    }
}
