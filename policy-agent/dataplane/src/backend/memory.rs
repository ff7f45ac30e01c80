//! An in-process dataplane that validates references between resources.
//!
//! Used for dry runs and by tests, which may inject failures and modify its state behind the
//! reconciler's back.

use super::{ApplyError, BackendError, Dataplane};
use crate::{
    model::{Chain, Observed},
    plan::Op,
};
use ipnet::IpNet;
use parking_lot::Mutex;
use policy_agent_core::{IpSet, Route, SetId};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};
use tracing::debug;

#[derive(Clone, Debug, Default)]
pub struct MemoryDataplane(Arc<Mutex<State>>);

#[derive(Debug, Default)]
struct State {
    ip_sets: BTreeMap<SetId, IpSet>,
    chains: BTreeMap<String, Chain>,
    routes: BTreeMap<IpNet, Route>,

    faults: VecDeque<Fault>,
    unavailable: bool,
    batches: usize,
    ops: usize,
}

/// A failure injected into a future batch.
#[derive(Clone, Debug)]
enum Fault {
    /// Fails the batch at the given operation.
    At(usize),
}

// === impl MemoryDataplane ===

impl MemoryDataplane {
    /// Fails the next batch when it reaches the given operation.
    pub fn fail_next_batch_at(&self, index: usize) {
        self.0.lock().faults.push_back(Fault::At(index));
    }

    /// Makes every subsequent call fail fatally.
    pub fn make_unavailable(&self) {
        self.0.lock().unavailable = true;
    }

    /// Deletes a chain without regard for references, as an external actor might.
    pub fn remove_chain(&self, name: &str) -> Option<Chain> {
        self.0.lock().chains.remove(name)
    }

    pub fn chain(&self, name: &str) -> Option<Chain> {
        self.0.lock().chains.get(name).cloned()
    }

    pub fn chain_names(&self) -> Vec<String> {
        self.0.lock().chains.keys().cloned().collect()
    }

    pub fn ip_set(&self, id: &SetId) -> Option<IpSet> {
        self.0.lock().ip_sets.get(id).cloned()
    }

    pub fn routes(&self) -> BTreeMap<IpNet, Route> {
        self.0.lock().routes.clone()
    }

    /// The number of batches and operations applied so far.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.0.lock();
        (state.batches, state.ops)
    }
}

#[async_trait::async_trait]
impl Dataplane for MemoryDataplane {
    async fn apply_batch(&self, ops: &[Op]) -> Result<(), ApplyError> {
        let mut state = self.0.lock();
        if state.unavailable {
            return Err(ApplyError {
                failed: 0,
                source: BackendError::Unavailable("memory dataplane shut down".to_string()),
            });
        }
        state.batches += 1;

        let fault = state.faults.pop_front();
        for (i, op) in ops.iter().enumerate() {
            if matches!(fault, Some(Fault::At(at)) if at == i) {
                return Err(ApplyError {
                    failed: i,
                    source: BackendError::Rejected("injected failure".to_string()),
                });
            }
            state
                .apply(op)
                .map_err(|source| ApplyError { failed: i, source })?;
            state.ops += 1;
        }
        debug!(ops = ops.len(), "Applied batch");
        Ok(())
    }

    async fn read_state(&self) -> Result<Observed, BackendError> {
        let state = self.0.lock();
        if state.unavailable {
            return Err(BackendError::Unavailable(
                "memory dataplane shut down".to_string(),
            ));
        }
        Ok(Observed {
            ip_sets: state.ip_sets.clone(),
            chains: state
                .chains
                .iter()
                .map(|(name, chain)| (name.clone(), chain.fingerprint()))
                .collect(),
            routes: state.routes.clone(),
        })
    }
}

// === impl State ===

impl State {
    fn apply(&mut self, op: &Op) -> Result<(), BackendError> {
        match op {
            Op::ReplaceSet { id, set } => {
                if let Some(live) = self.ip_sets.get(id) {
                    if live.kind != set.kind && self.set_referenced(id) {
                        return Err(reject(format!("set {id} is referenced")));
                    }
                }
                self.ip_sets.insert(id.clone(), set.clone());
            }
            Op::UpdateSet { id, added, removed } => {
                let set = self
                    .ip_sets
                    .get_mut(id)
                    .ok_or_else(|| reject(format!("set {id} does not exist")))?;
                for m in removed {
                    set.members.remove(m);
                }
                set.members.extend(added.iter().cloned());
            }
            Op::DeleteSet { id } => {
                if self.set_referenced(id) {
                    return Err(reject(format!("set {id} is referenced")));
                }
                self.ip_sets.remove(id);
            }
            Op::ReplaceChain { name, chain } => {
                if let Some(id) = chain.set_ids().find(|id| !self.ip_sets.contains_key(*id)) {
                    return Err(reject(format!("set {id} does not exist")));
                }
                if let Some(target) = chain.targets().find(|t| !self.chains.contains_key(*t)) {
                    return Err(reject(format!("chain {target} does not exist")));
                }
                self.chains.insert(name.clone(), chain.clone());
            }
            Op::DeleteChain { name } => {
                if let Some((by, _)) = self
                    .chains
                    .iter()
                    .find(|(by, c)| *by != name && c.targets().any(|t| t == name.as_str()))
                {
                    return Err(reject(format!("chain {name} is referenced by {by}")));
                }
                self.chains.remove(name);
            }
            Op::ReplaceRoute(route) => {
                self.routes.insert(route.dst, route.clone());
            }
            Op::DeleteRoute(dst) => {
                self.routes.remove(dst);
            }
        }
        Ok(())
    }

    fn set_referenced(&self, id: &SetId) -> bool {
        self.chains.values().any(|c| c.set_ids().any(|s| s == id))
    }
}

fn reject(msg: String) -> BackendError {
    BackendError::Rejected(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChainAction, ChainRule};
    use tokio_test::block_on;

    fn jump(target: &str) -> Chain {
        Chain::new(vec![ChainRule::always(ChainAction::Jump(target.to_string()))])
    }

    #[test]
    fn references_are_enforced() {
        let dp = MemoryDataplane::default();
        let err = block_on(dp.apply_batch(&[
            Op::ReplaceChain {
                name: "pa-pi-a".to_string(),
                chain: Chain::default(),
            },
            Op::ReplaceChain {
                name: "pa-tw-a".to_string(),
                chain: jump("pa-pi-missing"),
            },
        ]))
        .expect_err("missing target must be rejected");
        assert_eq!(err.failed, 1);
        assert!(dp.chain("pa-pi-a").is_some());
        assert!(dp.chain("pa-tw-a").is_none());

        block_on(dp.apply_batch(&[Op::ReplaceChain {
            name: "pa-tw-a".to_string(),
            chain: jump("pa-pi-a"),
        }]))
        .unwrap();
        let err = block_on(dp.apply_batch(&[Op::DeleteChain {
            name: "pa-pi-a".to_string(),
        }]))
        .expect_err("referenced chain must not be deleted");
        assert_eq!(err.failed, 0);
        assert!(!err.source.is_fatal());
    }

    #[test]
    fn injected_faults() {
        let dp = MemoryDataplane::default();
        dp.fail_next_batch_at(0);
        let op = Op::ReplaceChain {
            name: "pa-pi-a".to_string(),
            chain: Chain::default(),
        };
        assert!(block_on(dp.apply_batch(std::slice::from_ref(&op))).is_err());
        block_on(dp.apply_batch(std::slice::from_ref(&op))).unwrap();
        assert_eq!(dp.counts(), (2, 1));

        let observed = block_on(dp.read_state()).unwrap();
        assert_eq!(
            observed.chains["pa-pi-a"],
            Chain::default().fingerprint()
        );

        dp.make_unavailable();
        assert!(block_on(dp.read_state()).unwrap_err().is_fatal());
    }
}
