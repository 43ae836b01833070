//! Identity Map pattern for tracking unique instances per entity key.
//!
//! The Identity Map ensures that each stored row corresponds to exactly one
//! instance within a unit of work. This provides:
//!
//! - **Uniqueness**: the same key always yields the same [`EntityRef`]
//! - **Cache**: avoids redundant reads for instances already loaded
//! - **Consistency**: changes to an instance are visible everywhere it's used
//!
//! Keys are always formed with the hierarchy root's name, so a `Book` and a
//! `Product` with the same id occupy the same slot.
//!
//! # Example
//!
//! ```
//! use ormctx_core::{EntityKey, Value};
//! use ormctx_session::{EntityInstance, EntityRef, IdentityMap};
//!
//! let mut map = IdentityMap::new();
//! let key = EntityKey::new("Member", Value::BigInt(1));
//! let member = EntityRef::new(EntityInstance::new("Member"));
//! map.register(key.clone(), member.clone()).unwrap();
//!
//! // Same key, same instance.
//! assert!(map.lookup(&key).unwrap().ptr_eq(&member));
//!
//! // A different instance under the same key is rejected.
//! let other = EntityRef::new(EntityInstance::new("Member"));
//! assert!(map.register(key, other).is_err());
//! ```

use crate::instance::EntityRef;
use ormctx_core::{EntityKey, Error, Result};
use std::collections::HashMap;

/// Identity Map for tracking unique instances.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<EntityKey, EntityRef>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Get the instance bound to `key`.
    ///
    /// The returned handle is a clone of the stored one, so modifications are
    /// shared.
    pub fn lookup(&self, key: &EntityKey) -> Option<EntityRef> {
        self.entries.get(key).cloned()
    }

    /// Bind `key` to `instance`.
    ///
    /// Re-registering the same instance under its key is a no-op; binding a
    /// different instance to an occupied key fails with
    /// [`Error::DuplicateKey`].
    pub fn register(&mut self, key: EntityKey, instance: EntityRef) -> Result<()> {
        if let Some(existing) = self.entries.get(&key) {
            if existing.ptr_eq(&instance) {
                return Ok(());
            }
            tracing::debug!(key = %key, "Identity map rejected a second instance");
            return Err(Error::DuplicateKey { key });
        }
        tracing::trace!(key = %key, "Registered in identity map");
        self.entries.insert(key, instance);
        Ok(())
    }

    /// Move the instance bound to `old` under `new`.
    ///
    /// Used when a store-generated id replaces a provisional key.
    pub fn rekey(&mut self, old: &EntityKey, new: EntityKey) -> Result<()> {
        let Some(instance) = self.entries.remove(old) else {
            return Ok(());
        };
        if let Err(e) = self.register(new, instance.clone()) {
            self.entries.insert(old.clone(), instance);
            return Err(e);
        }
        Ok(())
    }

    /// Check if an instance is bound to `key`.
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove the binding for `key`.
    pub fn remove(&mut self, key: &EntityKey) -> Option<EntityRef> {
        self.entries.remove(key)
    }

    /// Clear all entries from the identity map.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Get the number of entries in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All bound keys, in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entries.keys()
    }
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMap")
            .field("entries", &self.entries.len())
            .finish()
    }
}
