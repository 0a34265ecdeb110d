//! Dependency graph between cached computations.
//!
//! Edges are stored twice: `dependencies[a]` lists what `a` read while it was
//! produced, `dependents[b]` lists who read `b`. Invalidation walks
//! `dependents`; cycle detection and eviction walk `dependencies`. Each method
//! locks at most one shard at a time, so graph operations never deadlock
//! against each other.

use dashmap::DashMap;
use kinetic_core::ComputationKey;
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Default)]
pub struct DependencyGraph {
    dependencies: DashMap<ComputationKey, HashSet<ComputationKey>>,
    dependents: DashMap<ComputationKey, HashSet<ComputationKey>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `dependent` read `dependency`.
    ///
    /// Self-edges are refused and reported with `false`.
    pub fn add_edge(&self, dependent: &ComputationKey, dependency: &ComputationKey) -> bool {
        if dependent == dependency {
            return false;
        }
        self.dependencies
            .entry(dependent.clone())
            .or_default()
            .insert(dependency.clone());
        self.dependents
            .entry(dependency.clone())
            .or_default()
            .insert(dependent.clone());
        true
    }

    pub fn dependencies_of(&self, key: &ComputationKey) -> Vec<ComputationKey> {
        self.dependencies
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, key: &ComputationKey) -> Vec<ComputationKey> {
        self.dependents
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_dependents(&self, key: &ComputationKey) -> bool {
        self.dependents
            .get(key)
            .is_some_and(|set| !set.is_empty())
    }

    /// Drop every outgoing edge of `key`, returning its former dependencies.
    pub fn clear_dependencies(&self, key: &ComputationKey) -> Vec<ComputationKey> {
        let Some((_, former)) = self.dependencies.remove(key) else {
            return Vec::new();
        };

        for dependency in &former {
            if let Some(mut dependents) = self.dependents.get_mut(dependency) {
                dependents.remove(key);
            }
            self.dependents
                .remove_if(dependency, |_, dependents| dependents.is_empty());
        }
        former.into_iter().collect()
    }

    /// True when `target` is reachable from `from` along dependency edges.
    pub fn depends_on(&self, from: &ComputationKey, target: &ComputationKey) -> bool {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([from.clone()]);

        while let Some(key) = queue.pop_front() {
            for next in self.dependencies_of(&key) {
                if &next == target {
                    return true;
                }
                if visited.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        false
    }

    pub fn edge_count(&self) -> usize {
        self.dependencies.iter().map(|entry| entry.value().len()).sum()
    }
}
