//! Replica placement and freshness for one table.
//!
//! Every known replica carries the update id it last applied. A replica is
//! active when that id equals the table's current update id and its node is
//! not known to have failed. Stale replicas stay in the set until they are
//! removed explicitly.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{DatabaseId, ReplicaEntry, ReplicaOutcomes};

/// Data replicas of one table and the update id each has applied.
#[derive(Clone, Debug, Default)]
pub struct ReplicaManager {
    replicas: BTreeMap<DatabaseId, ReplicaEntry>,
    current_update_id: u64,
}

impl ReplicaManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries; the current update id is the highest recorded.
    pub fn from_entries(entries: impl IntoIterator<Item = ReplicaEntry>) -> Self {
        let replicas: BTreeMap<DatabaseId, ReplicaEntry> = entries
            .into_iter()
            .map(|entry| (entry.node.clone(), entry))
            .collect();
        let current_update_id = replicas.values().map(|e| e.update_id).max().unwrap_or(0);
        let mut manager = Self {
            replicas,
            current_update_id,
        };
        manager.ensure_primary();
        manager
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Known replicas, stale ones included.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn current_update_id(&self) -> u64 {
        self.current_update_id
    }

    pub fn contains(&self, node: &DatabaseId) -> bool {
        self.replicas.contains_key(node)
    }

    pub fn primary(&self) -> Option<&DatabaseId> {
        self.replicas
            .values()
            .find(|entry| entry.primary)
            .map(|entry| &entry.node)
    }

    fn entry_is_active(&self, entry: &ReplicaEntry) -> bool {
        entry.alive && entry.update_id == self.current_update_id
    }

    pub fn is_active(&self, node: &DatabaseId) -> bool {
        self.replicas
            .get(node)
            .map(|entry| self.entry_is_active(entry))
            .unwrap_or(false)
    }

    /// Up-to-date replicas, primary first.
    pub fn active_replicas(&self) -> Vec<DatabaseId> {
        self.ordered(|entry| self.entry_is_active(entry))
    }

    /// Every known replica, stale ones included, primary first.
    pub fn all_replicas(&self) -> Vec<DatabaseId> {
        self.ordered(|_| true)
    }

    fn ordered(&self, keep: impl Fn(&ReplicaEntry) -> bool) -> Vec<DatabaseId> {
        let mut out: Vec<DatabaseId> = Vec::with_capacity(self.replicas.len());
        if let Some(primary) = self.replicas.values().find(|e| e.primary && keep(e)) {
            out.push(primary.node.clone());
        }
        out.extend(
            self.replicas
                .values()
                .filter(|e| !e.primary && keep(e))
                .map(|e| e.node.clone()),
        );
        out
    }

    pub fn entries(&self) -> Vec<ReplicaEntry> {
        self.replicas.values().cloned().collect()
    }

    fn active_set(&self) -> BTreeSet<DatabaseId> {
        self.active_replicas().into_iter().collect()
    }

    /// Register a replica holding data as of `update_id` (CREATE REPLICA).
    pub fn add_replica(&mut self, node: DatabaseId, update_id: u64) {
        let primary = self.replicas.is_empty();
        let entry = self
            .replicas
            .entry(node.clone())
            .or_insert_with(|| ReplicaEntry {
                node,
                update_id: 0,
                alive: true,
                primary,
            });
        entry.update_id = entry.update_id.max(update_id);
        entry.alive = true;
        self.current_update_id = self.current_update_id.max(update_id);
    }

    /// Permanently forget a replica (DROP REPLICA).
    pub fn remove_replica(&mut self, node: &DatabaseId) -> bool {
        let removed = self.replicas.remove(node).is_some();
        if removed {
            self.ensure_primary();
        }
        removed
    }

    /// Exclude a failed node from the active set until it applies a write again.
    pub fn mark_failed(&mut self, node: &DatabaseId) -> bool {
        let Some(entry) = self.replicas.get_mut(node) else {
            return false;
        };
        let was_alive = entry.alive;
        entry.alive = false;
        if entry.primary {
            self.ensure_primary();
        }
        was_alive
    }

    /// Used by DROP so a following CREATE starts from a fresh counter.
    pub fn reset_update_ids(&mut self) {
        for entry in self.replicas.values_mut() {
            entry.update_id = 0;
        }
        self.current_update_id = 0;
    }

    /// Apply the per-replica outcome of a write that carried `update_id`.
    ///
    /// On commit, succeeded replicas advance to `update_id` (never backwards)
    /// and so does the table counter. Replicas that failed or were not
    /// reported are left behind and drop out of the active set; a later
    /// report for the same id brings them back. Returns the replicas whose
    /// active status changed.
    pub fn complete_update(
        &mut self,
        commit: bool,
        update_id: u64,
        outcomes: &ReplicaOutcomes,
    ) -> BTreeSet<DatabaseId> {
        if !commit {
            return BTreeSet::new();
        }
        let succeeded: Vec<&DatabaseId> = outcomes
            .iter()
            .filter(|(_, ok)| **ok)
            .map(|(node, _)| node)
            .collect();
        if succeeded.is_empty() {
            return BTreeSet::new();
        }

        let before = self.active_set();
        let was_known: BTreeSet<DatabaseId> = self.replicas.keys().cloned().collect();

        for node in succeeded {
            self.add_replica(node.clone(), update_id);
        }
        self.ensure_primary();

        let after = self.active_set();
        before
            .symmetric_difference(&after)
            .filter(|node| was_known.contains(*node) || after.contains(*node))
            .cloned()
            .collect()
    }

    /// Keep exactly one primary, preferring an active replica.
    fn ensure_primary(&mut self) {
        let current = self
            .replicas
            .values()
            .find(|e| e.primary)
            .map(|e| (e.node.clone(), self.entry_is_active(e)));
        match current {
            Some((_, true)) => return,
            Some((node, false)) => {
                let replacement = self
                    .replicas
                    .values()
                    .find(|e| !e.primary && self.entry_is_active(e))
                    .map(|e| e.node.clone());
                let Some(replacement) = replacement else {
                    return;
                };
                if let Some(old) = self.replicas.get_mut(&node) {
                    old.primary = false;
                }
                if let Some(new) = self.replicas.get_mut(&replacement) {
                    new.primary = true;
                }
            }
            None => {
                let candidate = self
                    .replicas
                    .values()
                    .find(|e| self.entry_is_active(e))
                    .or_else(|| self.replicas.values().next())
                    .map(|e| e.node.clone());
                if let Some(candidate) = candidate {
                    if let Some(entry) = self.replicas.get_mut(&candidate) {
                        entry.primary = true;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u16) -> DatabaseId {
        DatabaseId::new(format!("127.0.0.1:{}", 7100 + n), format!("db{n}"))
    }

    fn outcomes(items: &[(u16, bool)]) -> ReplicaOutcomes {
        items.iter().map(|(n, ok)| (node(*n), *ok)).collect()
    }

    fn three_replicas() -> ReplicaManager {
        let mut replicas = ReplicaManager::new();
        replicas.complete_update(true, 1, &outcomes(&[(1, true), (2, true), (3, true)]));
        replicas
    }

    #[test]
    fn create_commit_registers_replicas_with_first_as_primary() {
        let mut replicas = ReplicaManager::new();
        let changed =
            replicas.complete_update(true, 1, &outcomes(&[(1, true), (2, true), (3, false)]));
        assert_eq!(replicas.all_replicas(), vec![node(1), node(2)]);
        assert_eq!(replicas.primary(), Some(&node(1)));
        assert_eq!(changed, [node(1), node(2)].into_iter().collect());
        assert_eq!(replicas.current_update_id(), 1);
    }

    #[test]
    fn partial_failure_demotes_one_replica() {
        let mut replicas = three_replicas();
        let changed =
            replicas.complete_update(true, 2, &outcomes(&[(1, true), (2, true), (3, false)]));
        assert_eq!(changed, [node(3)].into_iter().collect());
        assert_eq!(replicas.active_replicas(), vec![node(1), node(2)]);
        assert_eq!(replicas.all_replicas().len(), 3);
    }

    #[test]
    fn unreported_replica_is_demoted_in_first_phase_and_restored_by_deferred() {
        let mut replicas = three_replicas();
        replicas.complete_update(true, 2, &outcomes(&[(1, true), (2, true)]));
        assert!(!replicas.is_active(&node(3)));

        let changed = replicas.complete_update(true, 2, &outcomes(&[(3, true)]));
        assert_eq!(changed, [node(3)].into_iter().collect());
        assert_eq!(replicas.active_replicas().len(), 3);
    }

    #[test]
    fn aborted_write_changes_nothing() {
        let mut replicas = three_replicas();
        let changed = replicas.complete_update(false, 2, &outcomes(&[(1, true)]));
        assert!(changed.is_empty());
        assert_eq!(replicas.current_update_id(), 1);
        assert_eq!(replicas.active_replicas().len(), 3);
    }

    #[test]
    fn update_ids_never_move_backwards() {
        let mut replicas = three_replicas();
        replicas.complete_update(true, 5, &outcomes(&[(1, true), (2, true), (3, true)]));
        replicas.complete_update(true, 3, &outcomes(&[(1, true)]));
        let entry = replicas
            .entries()
            .into_iter()
            .find(|e| e.node == node(1))
            .expect("replica 1");
        assert_eq!(entry.update_id, 5);
        assert_eq!(replicas.current_update_id(), 5);
    }

    #[test]
    fn failed_primary_hands_over_to_an_active_replica() {
        let mut replicas = three_replicas();
        assert!(replicas.mark_failed(&node(1)));
        assert_eq!(replicas.primary(), Some(&node(2)));
        assert_eq!(replicas.active_replicas(), vec![node(2), node(3)]);

        replicas.complete_update(true, 2, &outcomes(&[(1, true), (2, true), (3, true)]));
        assert!(replicas.is_active(&node(1)));
    }

    #[test]
    fn reset_and_rebuild_from_entries() {
        let mut replicas = three_replicas();
        replicas.complete_update(true, 2, &outcomes(&[(1, true), (2, true)]));
        let rebuilt = ReplicaManager::from_entries(replicas.entries());
        assert_eq!(rebuilt.current_update_id(), 2);
        assert_eq!(rebuilt.active_replicas(), vec![node(1), node(2)]);

        replicas.reset_update_ids();
        assert_eq!(replicas.current_update_id(), 0);
        assert_eq!(replicas.active_replicas().len(), 3);
        assert!(replicas.remove_replica(&node(1)));
        assert_eq!(replicas.primary(), Some(&node(2)));
    }
}
