use crate::metrics::StatusMetrics;
use policy_agent_core::{ClassHealth, HealthReport, ResourceClass};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Follows the reconciler's health reports, logging every change of a resource class and
/// exporting the current state of each class as metrics.
#[derive(Debug)]
pub struct Reporter {
    health: watch::Receiver<HealthReport>,
    metrics: StatusMetrics,
    last: HealthReport,
}

// === impl Reporter ===

impl Reporter {
    pub fn new(health: watch::Receiver<HealthReport>, metrics: StatusMetrics) -> Self {
        let last = HealthReport::default();
        for class in ResourceClass::ALL {
            metrics.set(class, last.get(class));
        }
        Self {
            health,
            metrics,
            last,
        }
    }

    /// Runs until the reconciler drops its end of the channel or shutdown is signaled. The latest
    /// report is recorded before returning.
    pub async fn run(mut self, drain: drain::Watch) {
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        loop {
            let report = self.health.borrow_and_update().clone();
            self.record(report);

            tokio::select! {
                biased;

                handle = &mut shutdown => {
                    let report = self.health.borrow_and_update().clone();
                    self.record(report);
                    drop(handle);
                    return;
                }

                res = self.health.changed() => {
                    if res.is_err() {
                        debug!("Health reports ended");
                        let report = self.health.borrow().clone();
                        self.record(report);
                        return;
                    }
                }
            }
        }
    }

    fn record(&mut self, report: HealthReport) {
        if report == self.last {
            return;
        }

        for class in ResourceClass::ALL {
            let prev = self.last.get(class);
            let next = report.get(class);
            if prev == next {
                continue;
            }
            self.metrics.transition(class, next);
            match (prev, next) {
                (_, ClassHealth::Degraded { error }) => {
                    warn!(%class, %error, "Dataplane degraded");
                }
                (ClassHealth::Degraded { .. }, ClassHealth::InSync) => {
                    info!(%class, "Dataplane recovered");
                }
                (ClassHealth::Unknown, ClassHealth::InSync) => {
                    info!(%class, "Dataplane in sync");
                }
                (prev, next) => {
                    debug!(%class, from = prev.as_str(), to = next.as_str(), "Health changed");
                }
            }
        }

        if report.applied_version != self.last.applied_version {
            if let Some(version) = report.applied_version {
                debug!(version, "Intent applied");
                self.metrics.applied(version);
            }
        }
        self.last = report;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(chains: ClassHealth, applied_version: Option<u64>) -> HealthReport {
        let mut report = HealthReport {
            applied_version,
            ..Default::default()
        };
        for class in ResourceClass::ALL {
            report.classes.insert(class, ClassHealth::InSync);
        }
        report.classes.insert(ResourceClass::Chains, chains);
        report
    }

    fn reporter() -> (watch::Sender<HealthReport>, Reporter, StatusMetrics) {
        let (tx, rx) = watch::channel(HealthReport::default());
        let metrics = StatusMetrics::register(&mut Default::default());
        (tx, Reporter::new(rx, metrics.clone()), metrics)
    }

    #[test]
    fn starts_unknown() {
        let (_tx, _reporter, metrics) = reporter();
        for class in ResourceClass::ALL {
            assert_eq!(metrics.state_of(class, "unknown"), 1);
            assert_eq!(metrics.state_of(class, "in_sync"), 0);
        }
    }

    #[test]
    fn tracks_class_transitions() {
        let (_tx, mut reporter, metrics) = reporter();

        reporter.record(report(ClassHealth::InSync, Some(1)));
        assert_eq!(metrics.state_of(ResourceClass::Chains, "in_sync"), 1);
        assert_eq!(metrics.state_of(ResourceClass::Chains, "unknown"), 0);
        assert_eq!(metrics.applied_version(), 1);

        let degraded = ClassHealth::Degraded {
            error: "resource busy".to_string(),
        };
        reporter.record(report(degraded.clone(), Some(1)));
        // An unchanged report is not a transition.
        reporter.record(report(degraded, Some(1)));
        assert_eq!(metrics.state_of(ResourceClass::Chains, "degraded"), 1);
        assert_eq!(metrics.state_of(ResourceClass::Chains, "in_sync"), 0);
        assert_eq!(metrics.state_of(ResourceClass::Routes, "in_sync"), 1);
        assert_eq!(metrics.transitions_to(ResourceClass::Chains, "degraded"), 1);

        reporter.record(report(ClassHealth::InSync, Some(2)));
        assert_eq!(metrics.state_of(ResourceClass::Chains, "in_sync"), 1);
        assert_eq!(metrics.transitions_to(ResourceClass::Chains, "in_sync"), 2);
        assert_eq!(metrics.transitions_to(ResourceClass::Routes, "in_sync"), 1);
        assert_eq!(metrics.applied_version(), 2);
    }

    #[tokio::test]
    async fn records_the_final_report_on_shutdown() {
        let (tx, reporter, metrics) = reporter();
        let (signal, watch) = drain::channel();
        let task = tokio::spawn(reporter.run(watch));

        tx.send_replace(report(ClassHealth::Dirty, None));
        signal.drain().await;
        task.await.unwrap();
        assert_eq!(metrics.state_of(ResourceClass::Chains, "dirty"), 1);
        assert_eq!(metrics.state_of(ResourceClass::IpSets, "in_sync"), 1);
    }

    #[tokio::test]
    async fn completes_when_the_reconciler_stops() {
        let (tx, reporter, metrics) = reporter();
        let (_signal, watch) = drain::channel();
        let task = tokio::spawn(reporter.run(watch));

        tx.send_replace(report(ClassHealth::InSync, Some(3)));
        drop(tx);
        task.await.unwrap();
        assert_eq!(metrics.applied_version(), 3);
    }
}
