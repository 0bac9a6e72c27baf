//! Relay planning: one remote call per node instead of one per observer.

use crate::types::EntityId;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};

/// Chooses which member of a colocated group acts as relay.
pub trait RelaySelector: Send + Sync {
    /// Index into `group`, which is never empty.
    fn pick(&self, group: &[EntityId]) -> usize;
}

/// Always the first member.
#[derive(Clone, Copy, Debug, Default)]
pub struct FirstInGroup;

impl RelaySelector for FirstInGroup {
    fn pick(&self, _group: &[EntityId]) -> usize {
        0
    }
}

/// Uniformly random member from a seeded generator, reproducible per seed.
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    /// Selector whose choices are reproducible for a given `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RelaySelector for SeededRandom {
    fn pick(&self, group: &[EntityId]) -> usize {
        self.rng.lock().gen_range(0..group.len())
    }
}

/// One remote call of a fan-out.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub target: EntityId,
    /// Observers the target must forward to. `None` for a direct delivery.
    pub remainder: Option<Vec<EntityId>>,
}

/// Turn a delivery set into remote calls.
///
/// Targets are deduplicated by entity URI. Without `use_proxy` every target
/// gets its own call. With it, targets are grouped by node in order of first
/// appearance and one relay per group receives the rest of its group.
pub fn plan(targets: Vec<EntityId>, use_proxy: bool, selector: &dyn RelaySelector) -> Vec<Delivery> {
    let mut seen = HashSet::new();
    let targets: Vec<EntityId> = targets
        .into_iter()
        .filter(|t| seen.insert(t.entity_uri().to_string()))
        .collect();

    if !use_proxy {
        return targets
            .into_iter()
            .map(|target| Delivery {
                target,
                remainder: None,
            })
            .collect();
    }

    let mut groups: Vec<Vec<EntityId>> = Vec::new();
    let mut by_node: HashMap<String, usize> = HashMap::new();
    for target in targets {
        let slot = *by_node.entry(target.node().to_string()).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(target);
    }

    groups
        .into_iter()
        .map(|mut group| {
            let pick = selector.pick(&group).min(group.len() - 1);
            let relay = group.remove(pick);
            Delivery {
                target: relay,
                remainder: if group.is_empty() { None } else { Some(group) },
            }
        })
        .collect()
}
