//! Runtime entity instances and shared handles to them.
//!
//! Application code never owns an [`EntityInstance`] directly once it has been
//! handed to a unit of work; both sides hold an [`EntityRef`], a cheap shared
//! handle. Two handles are the *same instance* when they point at the same
//! allocation, which is what the identity map guarantees for repeated loads.

use ormctx_core::{EntityKey, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lifecycle state of an instance relative to a unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Never shown to a unit of work.
    #[default]
    Transient,
    /// Tracked: registered in the identity map with a snapshot.
    Managed,
    /// Scheduled for deletion at the next flush.
    Removed,
    /// Was managed; no longer tracked.
    Detached,
}

impl LifecycleState {
    pub const fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Transient => "transient",
            LifecycleState::Managed => "managed",
            LifecycleState::Removed => "removed",
            LifecycleState::Detached => "detached",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping a unit of work attaches to the instances it tracks.
#[derive(Debug, Clone, Default)]
pub(crate) struct Lifecycle {
    pub state: LifecycleState,
    /// Unit of work the state refers to.
    pub context: Option<u64>,
    /// Identity-map key while tracked.
    pub key: Option<EntityKey>,
}

/// Current value of one association on an instance.
#[derive(Clone)]
pub enum Association {
    /// A ToOne edge; `None` is an explicit null.
    One(Option<EntityRef>),
    /// A ToMany collection.
    Many(Vec<EntityRef>),
    /// Not loaded yet. For owning edges this holds the foreign-key value.
    Unfetched(Option<Value>),
}

impl Association {
    /// Loaded associated instances; nothing for an unfetched edge.
    pub fn targets(&self) -> Vec<EntityRef> {
        match self {
            Association::One(target) => target.iter().cloned().collect(),
            Association::Many(items) => items.clone(),
            Association::Unfetched(_) => Vec::new(),
        }
    }

    pub fn is_fetched(&self) -> bool {
        !matches!(self, Association::Unfetched(_))
    }

    /// Check whether two association values link the same instances.
    ///
    /// Collections compare by membership. A loaded reference equals an
    /// unfetched foreign key when the referenced instance carries that id.
    pub fn same_as(&self, other: &Association) -> bool {
        match (self, other) {
            (Association::One(a), Association::One(b)) => match (a, b) {
                (None, None) => true,
                (Some(a), Some(b)) => a.ptr_eq(b),
                _ => false,
            },
            (Association::Many(a), Association::Many(b)) => {
                a.len() == b.len() && a.iter().all(|x| b.iter().any(|y| x.ptr_eq(y)))
            }
            (Association::Unfetched(a), Association::Unfetched(b)) => match (a, b) {
                (Some(a), Some(b)) => a.key_eq(b),
                (None, None) => true,
                _ => false,
            },
            (Association::One(target), Association::Unfetched(fk))
            | (Association::Unfetched(fk), Association::One(target)) => {
                match (target, fk) {
                    (None, None) => true,
                    (Some(t), Some(fk)) => t.id().is_some_and(|id| id.key_eq(fk)),
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Association::One(target) => f.debug_tuple("One").field(target).finish(),
            Association::Many(items) => f.debug_tuple("Many").field(items).finish(),
            Association::Unfetched(fk) => f.debug_tuple("Unfetched").field(fk).finish(),
        }
    }
}

/// A runtime value of some entity type.
#[derive(Clone)]
pub struct EntityInstance {
    entity: String,
    id: Option<Value>,
    fields: BTreeMap<String, Value>,
    associations: BTreeMap<String, Association>,
    pub(crate) lifecycle: Lifecycle,
}

impl EntityInstance {
    /// A transient instance of `entity` with no id and no field values.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            id: None,
            fields: BTreeMap::new(),
            associations: BTreeMap::new(),
            lifecycle: Lifecycle::default(),
        }
    }

    /// Set the primary key (builder form).
    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set a field (builder form).
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Concrete entity type name.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn id(&self) -> Option<&Value> {
        self.id.as_ref()
    }

    pub fn set_id(&mut self, id: Option<Value>) {
        self.id = id;
    }

    /// Field value; NULL when never set.
    pub fn get(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&Value::Null)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn association(&self, edge: &str) -> Option<&Association> {
        self.associations.get(edge)
    }

    pub fn associations(&self) -> &BTreeMap<String, Association> {
        &self.associations
    }

    pub fn set_association(&mut self, edge: impl Into<String>, value: Association) {
        self.associations.insert(edge.into(), value);
    }

    /// Point a ToOne edge at `target` (or null it).
    pub fn set_one(&mut self, edge: impl Into<String>, target: Option<EntityRef>) {
        self.associations.insert(edge.into(), Association::One(target));
    }

    /// Add `item` to a ToMany collection, creating the collection if needed.
    ///
    /// Adding to an unfetched collection starts a loaded one; fetch first to
    /// keep existing members.
    pub fn add_to(&mut self, edge: &str, item: EntityRef) {
        if let Some(Association::Many(items)) = self.associations.get_mut(edge) {
            if !items.iter().any(|i| i.ptr_eq(&item)) {
                items.push(item);
            }
            return;
        }
        self.associations
            .insert(edge.to_string(), Association::Many(vec![item]));
    }

    /// Remove `item` from a ToMany collection. Returns whether it was present.
    pub fn remove_from(&mut self, edge: &str, item: &EntityRef) -> bool {
        let Some(slot) = self.associations.get_mut(edge) else {
            return false;
        };
        match slot {
            Association::Many(items) => {
                let before = items.len();
                items.retain(|i| !i.ptr_eq(item));
                items.len() != before
            }
            Association::One(current) if current.as_ref().is_some_and(|c| c.ptr_eq(item)) => {
                *current = None;
                true
            }
            _ => false,
        }
    }

    /// Loaded instances on `edge`.
    pub fn related(&self, edge: &str) -> Vec<EntityRef> {
        self.associations
            .get(edge)
            .map(Association::targets)
            .unwrap_or_default()
    }

    /// Lifecycle state as last recorded by a unit of work.
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state
    }

    /// Replace all persistent values with those of `other`.
    pub(crate) fn copy_values_from(&mut self, other: &EntityInstance) {
        self.fields = other.fields.clone();
        self.associations = other.associations.clone();
    }

    pub(crate) fn replace_fields(&mut self, fields: BTreeMap<String, Value>) {
        self.fields = fields;
    }
}

impl fmt::Debug for EntityInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityInstance")
            .field("entity", &self.entity)
            .field("id", &self.id)
            .field("state", &self.lifecycle.state)
            .field("fields", &self.fields)
            .field("associations", &self.associations)
            .finish()
    }
}

/// Shared handle to an [`EntityInstance`].
///
/// ```
/// use ormctx_core::Value;
/// use ormctx_session::{EntityInstance, EntityRef};
///
/// let order = EntityRef::new(EntityInstance::new("Order").with("status", "NEW"));
/// let alias = order.clone();
/// alias.set("status", "PAID");
/// assert_eq!(order.get("status"), Value::from("PAID"));
/// assert!(order.ptr_eq(&alias));
/// ```
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<EntityInstance>>);

impl EntityRef {
    pub fn new(instance: EntityInstance) -> Self {
        Self(Arc::new(RwLock::new(instance)))
    }

    /// Lock for reading. A poisoned lock is recovered.
    pub fn read(&self) -> RwLockReadGuard<'_, EntityInstance> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock for writing. A poisoned lock is recovered.
    pub fn write(&self) -> RwLockWriteGuard<'_, EntityInstance> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check whether both handles point at the same instance.
    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address of the instance, usable as an identity token.
    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }

    pub fn entity(&self) -> String {
        self.read().entity.clone()
    }

    pub fn id(&self) -> Option<Value> {
        self.read().id.clone()
    }

    pub fn get(&self, field: &str) -> Value {
        self.read().get(field).clone()
    }

    pub fn set(&self, field: impl Into<String>, value: impl Into<Value>) {
        self.write().set(field, value);
    }

    pub fn related(&self, edge: &str) -> Vec<EntityRef> {
        self.read().related(edge)
    }

    /// The single instance on a ToOne edge, if loaded and set.
    pub fn one(&self, edge: &str) -> Option<EntityRef> {
        self.read().related(edge).into_iter().next()
    }

    pub fn state(&self) -> LifecycleState {
        self.read().lifecycle.state
    }

    /// Independent copy of the current values, as a transient instance.
    pub fn detached_copy(&self) -> EntityInstance {
        let guard = self.read();
        EntityInstance {
            entity: guard.entity.clone(),
            id: guard.id.clone(),
            fields: guard.fields.clone(),
            associations: guard.associations.clone(),
            lifecycle: Lifecycle::default(),
        }
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.read().lifecycle.clone()
    }
}

impl From<EntityInstance> for EntityRef {
    fn from(instance: EntityInstance) -> Self {
        Self::new(instance)
    }
}

impl fmt::Debug for EntityRef {
    // Associations may be cyclic; print only the identity.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.read();
        match &guard.id {
            Some(id) => write!(f, "EntityRef({}#{})", guard.entity, id),
            None => write!(f, "EntityRef({}#?)", guard.entity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_accessors() {
        let member = EntityInstance::new("Member")
            .with_id(Value::BigInt(1))
            .with("name", "Kim");
        assert_eq!(member.entity(), "Member");
        assert_eq!(member.id(), Some(&Value::BigInt(1)));
        assert_eq!(member.get("name"), &Value::from("Kim"));
        assert_eq!(member.get("missing"), &Value::Null);
        assert_eq!(member.state(), LifecycleState::Transient);
    }

    #[test]
    fn test_collection_membership() {
        let order = EntityRef::new(EntityInstance::new("Order"));
        let a = EntityRef::new(EntityInstance::new("OrderItem"));
        let b = EntityRef::new(EntityInstance::new("OrderItem"));
        {
            let mut guard = order.write();
            guard.add_to("items", a.clone());
            guard.add_to("items", b.clone());
            guard.add_to("items", a.clone());
        }
        assert_eq!(order.related("items").len(), 2);
        assert!(order.write().remove_from("items", &a));
        assert!(!order.write().remove_from("items", &a));
        assert!(order.related("items")[0].ptr_eq(&b));
    }

    #[test]
    fn test_association_same_as() {
        let target = EntityRef::new(EntityInstance::new("Order").with_id(Value::BigInt(7)));
        let other = EntityRef::new(EntityInstance::new("Order"));
        let one = Association::One(Some(target.clone()));
        assert!(one.same_as(&Association::One(Some(target.clone()))));
        assert!(!one.same_as(&Association::One(Some(other.clone()))));
        assert!(one.same_as(&Association::Unfetched(Some(Value::BigInt(7)))));
        assert!(!one.same_as(&Association::Unfetched(None)));
        assert!(Association::One(None).same_as(&Association::Unfetched(None)));

        let ab = Association::Many(vec![target.clone(), other.clone()]);
        let ba = Association::Many(vec![other, target.clone()]);
        assert!(ab.same_as(&ba));
        assert!(!ab.same_as(&Association::Many(vec![target])));
    }

    #[test]
    fn test_debug_does_not_recurse() {
        let parent = EntityRef::new(EntityInstance::new("Category").with_id(Value::BigInt(1)));
        let child = EntityRef::new(EntityInstance::new("Category"));
        parent.write().add_to("children", child.clone());
        child.write().set_one("parent", Some(parent.clone()));
        let rendered = format!("{:?}", parent.read());
        assert!(rendered.contains("EntityRef(Category#?)"));
        assert_eq!(format!("{:?}", parent), "EntityRef(Category#1)");
    }

    #[test]
    fn test_detached_copy_is_independent() {
        let original = EntityRef::new(EntityInstance::new("Member").with("name", "Kim"));
        let copy = EntityRef::new(original.detached_copy());
        copy.set("name", "Lee");
        assert_eq!(original.get("name"), Value::from("Kim"));
        assert!(!copy.ptr_eq(&original));
    }
}
