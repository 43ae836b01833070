//! Entity keys: the identity of a row within one unit of work.

use crate::value::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

/// The identifying part of an [`EntityKey`].
#[derive(Debug, Clone)]
pub enum KeyId {
    /// A primary-key value, assigned by the caller or the store.
    Value(Value),
    /// Placeholder for an instance whose store-generated key is not yet
    /// known. Replaced by the real key once its INSERT has run.
    Provisional(u64),
}

/// Composite of entity type name and primary-key value.
///
/// The type name is the hierarchy root's, so every concrete type in one
/// inheritance hierarchy shares a single key space.
#[derive(Debug, Clone)]
pub struct EntityKey {
    entity: String,
    id: KeyId,
}

impl EntityKey {
    /// Key for a persisted row.
    pub fn new(entity: impl Into<String>, id: Value) -> Self {
        Self {
            entity: entity.into(),
            id: KeyId::Value(id),
        }
    }

    /// Key for an instance awaiting a store-generated primary key.
    pub fn provisional(entity: impl Into<String>, seq: u64) -> Self {
        Self {
            entity: entity.into(),
            id: KeyId::Provisional(seq),
        }
    }

    /// Entity type name (hierarchy root).
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// The identifying part.
    pub fn id(&self) -> &KeyId {
        &self.id
    }

    /// The primary-key value, unless still provisional.
    pub fn value(&self) -> Option<&Value> {
        match &self.id {
            KeyId::Value(v) => Some(v),
            KeyId::Provisional(_) => None,
        }
    }

    /// Check whether the key still awaits a generated value.
    pub fn is_provisional(&self) -> bool {
        matches!(self.id, KeyId::Provisional(_))
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
            && match (&self.id, &other.id) {
                (KeyId::Value(a), KeyId::Value(b)) => a.key_eq(b),
                (KeyId::Provisional(a), KeyId::Provisional(b)) => a == b,
                _ => false,
            }
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        match &self.id {
            KeyId::Value(v) => {
                0u8.hash(state);
                v.hash_into(state);
            }
            KeyId::Provisional(seq) => {
                1u8.hash(state);
                seq.hash(state);
            }
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            KeyId::Value(v) => write!(f, "{}#{}", self.entity, v),
            KeyId::Provisional(seq) => write!(f, "{}#<unsaved {}>", self.entity, seq),
        }
    }
}
