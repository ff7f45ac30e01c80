//! Incremental selector matching.
//!
//! The index holds the labels of every endpoint and every selector registered by the graph, and
//! reports the (selector, endpoint) pairs whose match status changes as either side is updated.
//!
//! Both directions are indexed by label key so that updates avoid scanning the whole population:
//!
//! - When an endpoint's labels change, only selectors that reference one of the changed keys are
//!   re-evaluated. A new endpoint is evaluated against selectors that reference one of its keys,
//!   plus selectors that match an empty label set (any other selector sees the new endpoint exactly
//!   as it would see an empty label set).
//! - When a selector is added, it is evaluated only against endpoints that carry the rarest of the
//!   keys it requires. Selectors that require no key are evaluated against every endpoint.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use policy_agent_k8s_api::{Labels, Selector};
use std::{collections::BTreeSet, hash::Hash};

/// A change in the match status of a (selector, endpoint) pair.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MatchDelta<E, S> {
    pub selector: S,
    pub endpoint: E,
    pub matched: bool,
}

#[derive(Debug)]
pub struct LabelIndex<E, S> {
    endpoints: HashMap<E, IndexedEndpoint<S>>,
    selectors: HashMap<S, IndexedSelector<E>>,

    /// Selectors by each label key they reference.
    selectors_by_key: HashMap<String, HashSet<S>>,

    /// Endpoints by each label key they carry.
    endpoints_by_key: HashMap<String, HashSet<E>>,

    /// Selectors that match an endpoint without labels.
    empty_matchers: HashSet<S>,

    evaluations: u64,
}

#[derive(Debug)]
struct IndexedEndpoint<S> {
    labels: Labels,
    selectors: HashSet<S>,
}

#[derive(Debug)]
struct IndexedSelector<E> {
    selector: Selector,
    keys: BTreeSet<String>,
    endpoints: HashSet<E>,
}

// === impl LabelIndex ===

impl<E, S> Default for LabelIndex<E, S> {
    fn default() -> Self {
        Self {
            endpoints: HashMap::default(),
            selectors: HashMap::default(),
            selectors_by_key: HashMap::default(),
            endpoints_by_key: HashMap::default(),
            empty_matchers: HashSet::default(),
            evaluations: 0,
        }
    }
}

impl<E, S> LabelIndex<E, S>
where
    E: Clone + Eq + Hash + Ord,
    S: Clone + Eq + Hash + Ord,
{
    /// Sets the labels of an endpoint, adding the endpoint if it is not yet indexed.
    pub fn update_endpoint_labels(&mut self, id: E, labels: Labels) -> Vec<MatchDelta<E, S>> {
        let candidates = match self.endpoints.get_mut(&id) {
            Some(ep) => {
                let changed = ep.labels.changed_keys(&labels);
                for key in &changed {
                    match (ep.labels.contains_key(key), labels.contains_key(key)) {
                        (true, false) => remove_from(&mut self.endpoints_by_key, key, &id),
                        (false, true) => {
                            self.endpoints_by_key
                                .entry(key.clone())
                                .or_default()
                                .insert(id.clone());
                        }
                        _ => {}
                    }
                }
                ep.labels = labels.clone();
                changed
                    .iter()
                    .filter_map(|k| self.selectors_by_key.get(k))
                    .flatten()
                    .cloned()
                    .collect::<HashSet<_>>()
            }
            None => {
                for key in labels.keys() {
                    self.endpoints_by_key
                        .entry(key.to_string())
                        .or_default()
                        .insert(id.clone());
                }
                self.endpoints.insert(
                    id.clone(),
                    IndexedEndpoint {
                        labels: labels.clone(),
                        selectors: HashSet::default(),
                    },
                );
                labels
                    .keys()
                    .filter_map(|k| self.selectors_by_key.get(k))
                    .flatten()
                    .chain(self.empty_matchers.iter())
                    .cloned()
                    .collect::<HashSet<_>>()
            }
        };

        let mut deltas = Vec::new();
        for sid in candidates {
            let Some(sel) = self.selectors.get_mut(&sid) else {
                continue;
            };
            self.evaluations += 1;
            let matches = sel.selector.matches(&labels);
            if matches == sel.endpoints.contains(&id) {
                continue;
            }
            if matches {
                sel.endpoints.insert(id.clone());
            } else {
                sel.endpoints.remove(&id);
            }
            if let Some(ep) = self.endpoints.get_mut(&id) {
                if matches {
                    ep.selectors.insert(sid.clone());
                } else {
                    ep.selectors.remove(&sid);
                }
            }
            deltas.push(MatchDelta {
                selector: sid,
                endpoint: id.clone(),
                matched: matches,
            });
        }
        deltas.sort();
        deltas
    }

    /// Removes an endpoint, reporting every match it loses.
    pub fn remove_endpoint(&mut self, id: &E) -> Vec<MatchDelta<E, S>> {
        let Some(ep) = self.endpoints.remove(id) else {
            return Vec::new();
        };
        for key in ep.labels.keys() {
            remove_from(&mut self.endpoints_by_key, key, id);
        }

        let mut deltas = ep
            .selectors
            .into_iter()
            .map(|sid| {
                if let Some(sel) = self.selectors.get_mut(&sid) {
                    sel.endpoints.remove(id);
                }
                MatchDelta {
                    selector: sid,
                    endpoint: id.clone(),
                    matched: false,
                }
            })
            .collect::<Vec<_>>();
        deltas.sort();
        deltas
    }

    /// Adds or replaces a selector.
    pub fn update_selector(&mut self, id: S, selector: Selector) -> Vec<MatchDelta<E, S>> {
        let previous = match self.selectors.remove(&id) {
            Some(prior) if prior.selector == selector => {
                self.selectors.insert(id, prior);
                return Vec::new();
            }
            Some(prior) => {
                self.unregister_keys(&id, &prior.keys);
                prior.endpoints
            }
            None => HashSet::default(),
        };

        let keys = selector.label_keys();
        for key in &keys {
            self.selectors_by_key
                .entry(key.clone())
                .or_default()
                .insert(id.clone());
        }
        if selector.matches(&Labels::default()) {
            self.empty_matchers.insert(id.clone());
        }

        let endpoints = {
            let required = selector.required_keys();
            let candidates: Box<dyn Iterator<Item = &E>> = if required.is_empty() {
                Box::new(self.endpoints.keys())
            } else {
                let rarest = required
                    .iter()
                    .map(|k| self.endpoints_by_key.get(k).map(|s| s.len()).unwrap_or(0))
                    .zip(&required)
                    .min()
                    .and_then(|(_, k)| self.endpoints_by_key.get(k));
                match rarest {
                    Some(eps) => Box::new(eps.iter()),
                    None => Box::new(std::iter::empty()),
                }
            };

            let mut endpoints = HashSet::default();
            for eid in candidates {
                let Some(ep) = self.endpoints.get(eid) else {
                    continue;
                };
                self.evaluations += 1;
                if selector.matches(&ep.labels) {
                    endpoints.insert(eid.clone());
                }
            }
            endpoints
        };

        let mut deltas = Vec::new();
        for eid in endpoints.difference(&previous) {
            if let Some(ep) = self.endpoints.get_mut(eid) {
                ep.selectors.insert(id.clone());
            }
            deltas.push(MatchDelta {
                selector: id.clone(),
                endpoint: eid.clone(),
                matched: true,
            });
        }
        for eid in previous.difference(&endpoints) {
            if let Some(ep) = self.endpoints.get_mut(eid) {
                ep.selectors.remove(&id);
            }
            deltas.push(MatchDelta {
                selector: id.clone(),
                endpoint: eid.clone(),
                matched: false,
            });
        }

        self.selectors.insert(
            id,
            IndexedSelector {
                selector,
                keys,
                endpoints,
            },
        );
        deltas.sort();
        deltas
    }

    /// Removes a selector, reporting every match it loses.
    pub fn remove_selector(&mut self, id: &S) -> Vec<MatchDelta<E, S>> {
        let Some(sel) = self.selectors.remove(id) else {
            return Vec::new();
        };
        self.unregister_keys(id, &sel.keys);

        let mut deltas = sel
            .endpoints
            .into_iter()
            .map(|eid| {
                if let Some(ep) = self.endpoints.get_mut(&eid) {
                    ep.selectors.remove(id);
                }
                MatchDelta {
                    selector: id.clone(),
                    endpoint: eid,
                    matched: false,
                }
            })
            .collect::<Vec<_>>();
        deltas.sort();
        deltas
    }

    fn unregister_keys(&mut self, id: &S, keys: &BTreeSet<String>) {
        for key in keys {
            remove_from(&mut self.selectors_by_key, key, id);
        }
        self.empty_matchers.remove(id);
    }

    /// The selectors that currently match an endpoint.
    pub fn selectors_for(&self, id: &E) -> impl Iterator<Item = &S> + '_ {
        self.endpoints
            .get(id)
            .into_iter()
            .flat_map(|ep| ep.selectors.iter())
    }

    /// The endpoints a selector currently matches.
    pub fn endpoints_for(&self, id: &S) -> impl Iterator<Item = &E> + '_ {
        self.selectors
            .get(id)
            .into_iter()
            .flat_map(|sel| sel.endpoints.iter())
    }

    pub fn labels(&self, id: &E) -> Option<&Labels> {
        self.endpoints.get(id).map(|ep| &ep.labels)
    }

    pub fn endpoints_len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn selectors_len(&self) -> usize {
        self.selectors.len()
    }

    /// The number of selector evaluations performed since the index was created.
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }
}

fn remove_from<K: Eq + Hash>(map: &mut HashMap<String, HashSet<K>>, key: &str, item: &K) {
    if let Some(items) = map.get_mut(key) {
        items.remove(item);
        if items.is_empty() {
            map.remove(key);
        }
    }
}
