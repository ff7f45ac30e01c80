use crate::{
    endpoint::{HostEndpoint, WorkloadEndpoint},
    feed::{EventType, FeedEvent, Kind, Payload, ResourceEvent, ResourceName},
    policy::{GlobalNetworkPolicy, NetworkPolicy, Profile, Tier},
};
use futures::prelude::*;
use kube::{runtime::watcher, ResourceExt};
use std::{collections::HashSet, pin::Pin};
use tokio::{sync::mpsc, time};
use tracing::{debug, info, Instrument};

/// A resource kind that can be carried on the datastore feed.
pub trait FeedResource:
    kube::Resource<DynamicType = ()> + Clone + std::fmt::Debug + Send + 'static
{
    const KIND: Kind;

    fn into_payload(self) -> Payload;
}

/// Adapts a watch of a single resource kind into feed events.
pub struct Watch<T> {
    span: tracing::Span,
    rx: Pin<Box<dyn Stream<Item = watcher::Result<watcher::Event<T>>> + Send + 'static>>,

    /// Names of the resources the feed has announced, so that applies can be reported as either
    /// additions or modifications.
    known: HashSet<ResourceName>,
}

// === impl Watch ===

impl<T, W> From<W> for Watch<T>
where
    W: Stream<Item = watcher::Result<watcher::Event<T>>> + Send + 'static,
{
    fn from(watch: W) -> Self {
        Self {
            rx: watch.boxed(),
            span: tracing::Span::current(),
            known: HashSet::new(),
        }
    }
}

impl<T: FeedResource> Watch<T> {
    pub fn instrument(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Receive the next feed event.
    ///
    /// If the stream fails, log the error and sleep for 1s before polling for a reset event.
    /// Returns `None` only if the underlying stream terminates.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        loop {
            let ev = self.rx.next().instrument(self.span.clone()).await?;
            match ev {
                Ok(ev) => return Some(self.to_feed(ev)),
                Err(error) => {
                    info!(parent: &self.span, %error, "Failed");
                    time::sleep(time::Duration::from_secs(1)).await;
                    info!(parent: &self.span, "Restarting");
                }
            }
        }
    }

    /// Forwards every event to `tx`, waiting for capacity so that no event is dropped.
    ///
    /// Completes when either the watch terminates or the receiver is dropped.
    pub async fn forward(mut self, tx: mpsc::Sender<FeedEvent>) {
        while let Some(ev) = self.recv().await {
            if tx.send(ev).await.is_err() {
                debug!(parent: &self.span, "Feed receiver dropped");
                return;
            }
        }
        info!(parent: &self.span, "Watch terminated");
    }

    fn to_feed(&mut self, ev: watcher::Event<T>) -> FeedEvent {
        match ev {
            watcher::Event::Init => {
                self.known.clear();
                FeedEvent::Restarted(T::KIND)
            }
            watcher::Event::InitDone => FeedEvent::Synced(T::KIND),
            watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => {
                let name = name_of(&obj);
                let event_type = if self.known.insert(name.clone()) {
                    EventType::Added
                } else {
                    EventType::Modified
                };
                let resource_version = obj.resource_version();
                FeedEvent::Resource(ResourceEvent {
                    kind: T::KIND,
                    name,
                    resource_version,
                    event_type,
                    payload: Some(obj.into_payload()),
                })
            }
            watcher::Event::Delete(obj) => {
                let name = name_of(&obj);
                self.known.remove(&name);
                FeedEvent::Resource(ResourceEvent {
                    kind: T::KIND,
                    resource_version: obj.resource_version(),
                    name,
                    event_type: EventType::Deleted,
                    payload: None,
                })
            }
        }
    }
}

fn name_of<T: kube::Resource>(obj: &T) -> ResourceName {
    ResourceName {
        namespace: obj.namespace(),
        name: obj.name_any(),
    }
}

// === impl FeedResource ===

impl FeedResource for Tier {
    const KIND: Kind = Kind::Tier;

    fn into_payload(self) -> Payload {
        Payload::Tier(self.spec)
    }
}

impl FeedResource for NetworkPolicy {
    const KIND: Kind = Kind::NetworkPolicy;

    fn into_payload(self) -> Payload {
        Payload::NetworkPolicy(self.spec)
    }
}

impl FeedResource for GlobalNetworkPolicy {
    const KIND: Kind = Kind::GlobalNetworkPolicy;

    fn into_payload(self) -> Payload {
        Payload::GlobalNetworkPolicy(self.spec)
    }
}

impl FeedResource for Profile {
    const KIND: Kind = Kind::Profile;

    fn into_payload(self) -> Payload {
        Payload::Profile(self.spec)
    }
}

impl FeedResource for WorkloadEndpoint {
    const KIND: Kind = Kind::WorkloadEndpoint;

    fn into_payload(self) -> Payload {
        Payload::WorkloadEndpoint {
            labels: self.metadata.labels.unwrap_or_default(),
            spec: self.spec,
        }
    }
}

impl FeedResource for HostEndpoint {
    const KIND: Kind = Kind::HostEndpoint;

    fn into_payload(self) -> Payload {
        Payload::HostEndpoint {
            labels: self.metadata.labels.unwrap_or_default(),
            spec: self.spec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::TierSpec;

    fn tier(name: &str) -> Tier {
        Tier::new(
            name,
            TierSpec {
                order: Some(10.0),
                default_action: None,
            },
        )
    }

    #[tokio::test]
    async fn relist_reports_restart_then_sync() {
        let events: Vec<watcher::Result<watcher::Event<Tier>>> = vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(tier("a"))),
            Ok(watcher::Event::InitDone),
            Ok(watcher::Event::Apply(tier("a"))),
            Ok(watcher::Event::Apply(tier("b"))),
            Ok(watcher::Event::Delete(tier("a"))),
        ];
        let mut watch = Watch::from(stream::iter(events));

        assert_eq!(watch.recv().await, Some(FeedEvent::Restarted(Kind::Tier)));

        let ev = match watch.recv().await {
            Some(FeedEvent::Resource(ev)) => ev,
            ev => panic!("unexpected event: {ev:?}"),
        };
        assert_eq!(ev.event_type, EventType::Added);
        assert_eq!(ev.name, ResourceName::cluster("a"));

        assert_eq!(watch.recv().await, Some(FeedEvent::Synced(Kind::Tier)));

        let types = [
            EventType::Modified,
            EventType::Added,
            EventType::Deleted,
        ];
        for expected in types {
            match watch.recv().await {
                Some(FeedEvent::Resource(ev)) => assert_eq!(ev.event_type, expected),
                ev => panic!("unexpected event: {ev:?}"),
            }
        }
        assert_eq!(watch.recv().await, None);
    }
}
