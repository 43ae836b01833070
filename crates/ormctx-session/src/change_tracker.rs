//! Snapshot-based change tracking.
//!
//! A [`Snapshot`] is a copy of an instance's field values and association
//! links taken the moment it becomes managed (and again after every flush).
//! Dirty checking compares the live instance against it by value, so the
//! caller never has to mark anything as changed.

use crate::instance::{Association, EntityInstance, EntityRef};
use ormctx_core::{EntityKey, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

/// Snapshot of an instance's state at a point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    fields: BTreeMap<String, Value>,
    associations: BTreeMap<String, Association>,
    taken_at: Instant,
}

impl Snapshot {
    fn of(instance: &EntityInstance) -> Self {
        Self {
            fields: instance.fields().clone(),
            associations: instance.associations().clone(),
            taken_at: Instant::now(),
        }
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> &Value {
        self.fields.get(name).unwrap_or(&Value::Null)
    }

    pub fn association(&self, edge: &str) -> Option<&Association> {
        self.associations.get(edge)
    }

    /// Get the timestamp when the snapshot was taken.
    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// Members that differ from the snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changes {
    /// Changed fields with their new values.
    pub fields: BTreeMap<String, Value>,
    /// Associations whose links changed.
    pub links: BTreeSet<String>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.links.is_empty()
    }

    /// Names of all changed members.
    pub fn members(&self) -> BTreeSet<String> {
        self.fields
            .keys()
            .chain(self.links.iter())
            .cloned()
            .collect()
    }
}

/// Snapshots of every managed instance, keyed by entity key.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshots: HashMap<EntityKey, Snapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the current state of `instance` under `key`.
    #[tracing::instrument(level = "trace", skip(self, instance))]
    pub fn capture(&mut self, key: &EntityKey, instance: &EntityInstance) {
        tracing::trace!(
            entity = instance.entity(),
            fields = instance.fields().len(),
            "Taking snapshot"
        );
        self.snapshots.insert(key.clone(), Snapshot::of(instance));
    }

    /// Fields and links of `instance` that differ from its snapshot.
    ///
    /// Values compare by contents, so an embedded value replaced by an equal
    /// one is unchanged. Without a snapshot every member counts as changed.
    pub fn diff(&self, key: &EntityKey, instance: &EntityInstance) -> Changes {
        let Some(snapshot) = self.get(key) else {
            return Changes {
                fields: instance.fields().clone(),
                links: instance.associations().keys().cloned().collect(),
            };
        };

        let mut changes = Changes::default();
        let names: BTreeSet<&String> = snapshot
            .fields()
            .keys()
            .chain(instance.fields().keys())
            .collect();
        for name in names {
            let current = instance.get(name);
            if snapshot.field(name) != current {
                changes.fields.insert(name.clone(), current.clone());
            }
        }

        for (edge, current) in instance.associations() {
            let unchanged = match snapshot.association(edge) {
                Some(before) => before.same_as(current),
                None => matches!(current, Association::One(None) | Association::Unfetched(None))
                    || matches!(current, Association::Many(items) if items.is_empty()),
            };
            if !unchanged {
                changes.links.insert(edge.clone());
            }
        }
        for edge in snapshot.associations.keys() {
            if !instance.associations().contains_key(edge) {
                changes.links.insert(edge.clone());
            }
        }

        tracing::trace!(
            key = %key,
            fields = changes.fields.len(),
            links = changes.links.len(),
            snapshot_age_ms = snapshot.taken_at().elapsed().as_millis(),
            "Dirty check"
        );
        changes
    }

    /// Instances linked on `edge` in the snapshot but no longer linked now.
    ///
    /// An edge that is currently unfetched has no orphans.
    pub fn orphans(&self, key: &EntityKey, instance: &EntityInstance, edge: &str) -> Vec<EntityRef> {
        let Some(before) = self.get(key).and_then(|s| s.association(edge)) else {
            return Vec::new();
        };
        let current = match instance.association(edge) {
            Some(current) if !current.is_fetched() => return Vec::new(),
            Some(current) => current.targets(),
            None => Vec::new(),
        };
        before
            .targets()
            .into_iter()
            .filter(|old| !current.iter().any(|c| c.ptr_eq(old)))
            .collect()
    }

    /// Reset the baseline of one association, e.g. after fetching it.
    pub fn reset_link(&mut self, key: &EntityKey, edge: &str, value: Association) {
        if let Some(snapshot) = self.snapshots.get_mut(key) {
            snapshot.associations.insert(edge.to_string(), value);
        }
    }

    /// Move a snapshot to a new key.
    pub fn rekey(&mut self, old: &EntityKey, new: EntityKey) {
        if let Some(snapshot) = self.snapshots.remove(old) {
            self.snapshots.insert(new, snapshot);
        }
    }

    /// Get the snapshot for a key.
    pub fn get(&self, key: &EntityKey) -> Option<&Snapshot> {
        self.snapshots.get(key)
    }

    /// Discard the snapshot for one instance.
    pub fn discard(&mut self, key: &EntityKey) {
        self.snapshots.remove(key);
    }

    /// Discard all snapshots.
    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
