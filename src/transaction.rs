//! Per-request scratch state (§3 `Transaction`). Rather than mutating instances in place, three
//! disjoint maps of immutable `AppInstance` values are kept; "updating" an instance means
//! replacing the value stored under its `instance_id`. This gives trivial rollback (drop the
//! scratch) and a clean diff against the live graph (§9).

use indexmap::IndexMap;

use crate::types::{AppInstance, InstanceId};

#[derive(Debug, Clone, Default)]
pub struct Transaction {
    creating: IndexMap<InstanceId, AppInstance>,
    modifying: IndexMap<InstanceId, AppInstance>,
    deleting: IndexMap<InstanceId, AppInstance>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn creating(&self) -> impl Iterator<Item = &AppInstance> {
        self.creating.values()
    }

    pub fn modifying(&self) -> impl Iterator<Item = &AppInstance> {
        self.modifying.values()
    }

    pub fn deleting(&self) -> impl Iterator<Item = &AppInstance> {
        self.deleting.values()
    }

    pub fn is_empty(&self) -> bool {
        self.creating.is_empty() && self.modifying.is_empty() && self.deleting.is_empty()
    }

    /// Records `instance` as a fresh creation. Panics (an internal-invariant bug, not a user-facing
    /// error) if it's already tracked in another set — callers are expected to check `contains`
    /// first when that's reachable from untrusted input.
    pub fn mark_creating(&mut self, instance: AppInstance) {
        debug_assert!(!self.contains(instance.instance_id), "disjointness violated");
        self.modifying.shift_remove(&instance.instance_id);
        self.deleting.shift_remove(&instance.instance_id);
        self.creating.insert(instance.instance_id, instance);
    }

    pub fn mark_modifying(&mut self, instance: AppInstance) {
        if self.creating.contains_key(&instance.instance_id) {
            self.creating.insert(instance.instance_id, instance);
            return;
        }
        self.deleting.shift_remove(&instance.instance_id);
        self.modifying.insert(instance.instance_id, instance);
    }

    pub fn mark_deleting(&mut self, instance: AppInstance) {
        self.creating.shift_remove(&instance.instance_id);
        self.modifying.shift_remove(&instance.instance_id);
        self.deleting.insert(instance.instance_id, instance);
    }

    pub fn contains(&self, instance_id: InstanceId) -> bool {
        self.creating.contains_key(&instance_id)
            || self.modifying.contains_key(&instance_id)
            || self.deleting.contains_key(&instance_id)
    }

    pub fn get(&self, instance_id: InstanceId) -> Option<&AppInstance> {
        self.creating
            .get(&instance_id)
            .or_else(|| self.modifying.get(&instance_id))
    }

    pub fn is_deleting(&self, instance_id: InstanceId) -> bool {
        self.deleting.contains_key(&instance_id)
    }

    pub fn created_or_modified(&self) -> Vec<AppInstance> {
        self.creating
            .values()
            .chain(self.modifying.values())
            .cloned()
            .collect()
    }

    pub fn deleted(&self) -> Vec<AppInstance> {
        self.deleting.values().cloned().collect()
    }

    pub fn snapshot(&self) -> TemporaryApps {
        TemporaryApps {
            creating: self.creating.values().cloned().collect(),
            modifying: self.modifying.values().cloned().collect(),
            deleting: self.deleting.values().cloned().collect(),
        }
    }

    /// §8 invariant 1: an instance appears in at most one of the three sets. True by construction
    /// given `mark_*` above always removes from the other two maps first; kept as an explicit,
    /// independently checkable assertion for tests.
    pub fn is_disjoint(&self) -> bool {
        self.creating
            .keys()
            .all(|id| !self.modifying.contains_key(id) && !self.deleting.contains_key(id))
            && self
                .modifying
                .keys()
                .all(|id| !self.deleting.contains_key(id))
    }
}

/// Read-only snapshot returned by `TransactionPlanner::temporary_apps` (§6, §14).
#[derive(Debug, Clone, Default)]
pub struct TemporaryApps {
    pub creating: Vec<AppInstance>,
    pub modifying: Vec<AppInstance>,
    pub deleting: Vec<AppInstance>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn instance() -> AppInstance {
        AppInstance::new(Uuid::new_v4(), "App")
    }

    #[test]
    fn marking_creating_then_deleting_moves_between_sets() {
        let mut txn = Transaction::new();
        let instance = instance();
        let id = instance.instance_id;
        txn.mark_creating(instance.clone());
        assert!(txn.creating().any(|i| i.instance_id == id));

        txn.mark_deleting(instance);
        assert!(txn.deleting().any(|i| i.instance_id == id));
        assert!(!txn.creating().any(|i| i.instance_id == id));
        assert!(txn.is_disjoint());
    }

    #[test]
    fn created_or_modified_combines_both_sets() {
        let mut txn = Transaction::new();
        txn.mark_creating(instance());
        txn.mark_modifying(instance());
        assert_eq!(txn.created_or_modified().len(), 2);
        assert!(txn.is_disjoint());
    }
}
