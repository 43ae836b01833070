//! The unit of work: one persistence context over one store.
//!
//! A [`UnitOfWork`] binds an identity map, a snapshot store and the queue of
//! pending inserts and deletes to a store it owns exclusively. Application
//! code hands it [`EntityRef`]s; changes made through those handles are found
//! by dirty checking and written by [`UnitOfWork::flush`].
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new(registry, store)?;
//! let order = EntityRef::new(EntityInstance::new("Order").with("status", "NEW"));
//! uow.persist(&order)?;
//! uow.flush()?;
//!
//! let again = uow.find("Order", order.id().unwrap())?.unwrap();
//! assert!(again.ptr_eq(&order));
//! uow.commit()?;
//! ```

use crate::cascade::{CascadeTarget, Visited, cascade};
use crate::change_tracker::SnapshotStore;
use crate::flush::{FlushOrderer, FlushPlan, FlushResult, PendingWrite};
use crate::identity_map::IdentityMap;
use crate::instance::{Association, EntityInstance, EntityRef, Lifecycle, LifecycleState};
use crate::state::{Operation, Transition, transition};
use ormctx_core::{EntityKey, Error, Result, SchemaError, SchemaErrorKind, Value};
use ormctx_query::Storage;
use ormctx_schema::{
    AssociationEdge, CascadeType, FetchPolicy, IdGeneration, ReadPlan, SchemaRegistry,
    collection_read_plan, polymorphic_read_plan, read_plan_by_id,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Events
// ============================================================================

/// Callbacks receive no arguments and return `Result<()>`.
/// Returning `Err` from a before-flush callback aborts the flush.
type EventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Lifecycle events of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkEvent {
    /// Fired before flush computes and executes pending writes.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired after the store transaction commits.
    AfterCommit,
    /// Fired after the store transaction is aborted.
    AfterRollback,
}

#[derive(Default)]
struct EventCallbacks {
    before_flush: Vec<EventFn>,
    after_flush: Vec<EventFn>,
    after_commit: Vec<EventFn>,
    after_rollback: Vec<EventFn>,
}

impl std::fmt::Debug for EventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl EventCallbacks {
    fn fire(&mut self, event: UnitOfWorkEvent) -> Result<()> {
        let callbacks = match event {
            UnitOfWorkEvent::BeforeFlush => &mut self.before_flush,
            UnitOfWorkEvent::AfterFlush => &mut self.after_flush,
            UnitOfWorkEvent::AfterCommit => &mut self.after_commit,
            UnitOfWorkEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for unit-of-work behavior.
#[derive(Debug, Clone)]
pub struct UnitOfWorkConfig {
    /// Begin a store transaction when the unit of work starts.
    pub auto_begin: bool,
    /// Flush pending changes before running a query.
    pub flush_before_query: bool,
    /// Re-run persist cascades over managed instances at flush, picking up
    /// instances linked after they were persisted.
    pub cascade_on_flush: bool,
}

impl Default for UnitOfWorkConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            flush_before_query: false,
            cascade_on_flush: true,
        }
    }
}

/// Snapshot of unit-of-work bookkeeping, for debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugState {
    /// Instances in the managed state.
    pub managed: usize,
    /// Instances scheduled for removal and not yet flushed.
    pub removed: usize,
    /// INSERTs queued for the next flush.
    pub pending_inserts: usize,
    /// DELETEs queued for the next flush.
    pub pending_deletes: usize,
    /// Entries in the identity map.
    pub identity_map: usize,
    /// Snapshots held for dirty checking.
    pub snapshots: usize,
    pub in_transaction: bool,
    pub poisoned: bool,
}

/// A queued INSERT. The key is kept even if the instance is detached later.
#[derive(Debug, Clone)]
struct PendingInsert {
    key: EntityKey,
    instance: EntityRef,
}

// ============================================================================
// Unit of work
// ============================================================================

/// A persistence context over an exclusively owned store.
///
/// Confined to one thread of control; nothing inside is synchronized beyond
/// the per-instance locks of [`EntityRef`].
pub struct UnitOfWork<S: Storage> {
    id: u64,
    registry: Arc<SchemaRegistry>,
    storage: S,
    config: UnitOfWorkConfig,
    identity_map: IdentityMap,
    snapshots: SnapshotStore,
    /// Tracked instances in the order they became managed.
    managed: Vec<EntityRef>,
    pending_inserts: Vec<PendingInsert>,
    pending_deletes: Vec<EntityRef>,
    next_provisional: u64,
    in_transaction: bool,
    poisoned: bool,
    events: EventCallbacks,
}

impl<S: Storage> UnitOfWork<S> {
    /// Start a unit of work with the default configuration.
    pub fn new(registry: Arc<SchemaRegistry>, storage: S) -> Result<Self> {
        Self::with_config(registry, storage, UnitOfWorkConfig::default())
    }

    /// Start a unit of work against the process-wide schema registry.
    pub fn with_global_schema(storage: S) -> Result<Self> {
        let registry = SchemaRegistry::global().ok_or_else(|| {
            SchemaError::new(
                SchemaErrorKind::Config,
                "no process-wide schema registry is installed",
            )
        })?;
        Self::new(registry, storage)
    }

    /// Start a unit of work with custom configuration.
    pub fn with_config(
        registry: Arc<SchemaRegistry>,
        storage: S,
        config: UnitOfWorkConfig,
    ) -> Result<Self> {
        let mut uow = Self {
            id: NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed),
            registry,
            storage,
            config,
            identity_map: IdentityMap::new(),
            snapshots: SnapshotStore::new(),
            managed: Vec::new(),
            pending_inserts: Vec::new(),
            pending_deletes: Vec::new(),
            next_provisional: 0,
            in_transaction: false,
            poisoned: false,
            events: EventCallbacks::default(),
        };
        if uow.config.auto_begin {
            uow.begin()?;
        }
        tracing::debug!(unit = uow.id, "Unit of work started");
        Ok(uow)
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &UnitOfWorkConfig {
        &self.config
    }

    /// Get a reference to the underlying store.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Register a callback fired before each flush.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.before_flush.push(Box::new(f));
    }

    /// Register a callback fired after each successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.after_flush.push(Box::new(f));
    }

    /// Register a callback fired after commit.
    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.after_commit.push(Box::new(f));
    }

    /// Register a callback fired after rollback.
    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    /// Make a transient instance managed and queue its INSERT.
    ///
    /// Cascades along edges with the `persist` policy. Persisting an already
    /// managed instance only re-runs the cascade.
    #[tracing::instrument(level = "debug", skip(self, instance), fields(entity = %instance.entity()))]
    pub fn persist(&mut self, instance: &EntityRef) -> Result<()> {
        self.check_open("persist", instance)?;
        self.persist_one(instance)?;
        cascade(self, Operation::Persist, instance, &mut Visited::new())
    }

    /// Schedule a managed instance for deletion at the next flush.
    ///
    /// An instance persisted in this unit of work and not yet flushed is
    /// simply dropped: its INSERT is cancelled and no DELETE is issued.
    #[tracing::instrument(level = "debug", skip(self, instance), fields(entity = %instance.entity()))]
    pub fn remove(&mut self, instance: &EntityRef) -> Result<()> {
        self.check_open("remove", instance)?;
        let state = self.state_of(instance);
        self.require(Operation::Remove, instance, state)?;
        self.remove_one(instance)?;
        cascade(self, Operation::Remove, instance, &mut Visited::new())
    }

    /// Stop tracking a managed instance.
    ///
    /// An INSERT queued by an earlier `persist` is not cancelled: it still
    /// runs at the next flush, although the instance is no longer dirty
    /// checked.
    #[tracing::instrument(level = "debug", skip(self, instance), fields(entity = %instance.entity()))]
    pub fn detach(&mut self, instance: &EntityRef) -> Result<()> {
        self.check_open("detach", instance)?;
        let state = self.state_of(instance);
        if self.require(Operation::Detach, instance, state)? == Transition::NoOp {
            return Ok(());
        }
        self.detach_one(instance);
        cascade(self, Operation::Detach, instance, &mut Visited::new())
    }

    /// Re-read a managed instance from the store, discarding unflushed
    /// changes. Cascades along edges with the `refresh` policy.
    #[tracing::instrument(level = "debug", skip(self, instance), fields(entity = %instance.entity()))]
    pub fn refresh(&mut self, instance: &EntityRef) -> Result<()> {
        self.check_open("refresh", instance)?;
        let state = self.state_of(instance);
        self.require(Operation::Refresh, instance, state)?;
        self.refresh_one(instance)?;
        cascade(self, Operation::Refresh, instance, &mut Visited::new())
    }

    /// Copy the state of `instance` into the managed instance for the same
    /// row and return the managed instance.
    ///
    /// The result is `instance` itself only if it is already managed here.
    /// Edges with the `merge` policy are merged recursively.
    #[tracing::instrument(level = "debug", skip(self, instance), fields(entity = %instance.entity()))]
    pub fn merge(&mut self, instance: &EntityRef) -> Result<EntityRef> {
        self.check_open("merge", instance)?;
        self.merge_one(instance, &mut HashMap::new())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Find an instance of `entity` (or a subtype) by primary key.
    ///
    /// Repeated finds of the same row return the same instance. Instances
    /// scheduled for removal are never returned.
    #[tracing::instrument(level = "debug", skip(self, id))]
    pub fn find(&mut self, entity: &str, id: impl Into<Value>) -> Result<Option<EntityRef>> {
        if self.poisoned {
            return Err(self.poisoned_error(entity, "find"));
        }
        self.find_internal(entity, id.into())
    }

    /// Run a read plan and return managed instances, one per row.
    ///
    /// Rows for instances already in the identity map resolve to those
    /// instances; their in-memory state wins over the row.
    #[tracing::instrument(level = "debug", skip(self, plan), fields(entity = %plan.entity()))]
    pub fn query(&mut self, plan: &ReadPlan) -> Result<Vec<EntityRef>> {
        if self.poisoned {
            return Err(self.poisoned_error(plan.entity(), "query"));
        }
        if self.config.flush_before_query {
            self.flush()?;
        }
        self.run_query(plan)
    }

    /// All instances of `entity` and its subtypes.
    pub fn query_all(&mut self, entity: &str) -> Result<Vec<EntityRef>> {
        let plan = polymorphic_read_plan(&self.registry, entity)?;
        self.query(&plan)
    }

    /// Instances of `entity` (or a subtype) whose `member` equals `value`.
    pub fn query_by(
        &mut self,
        entity: &str,
        member: &str,
        value: impl Into<Value>,
    ) -> Result<Vec<EntityRef>> {
        let plan = polymorphic_read_plan(&self.registry, entity)?.with_filter(member, value.into())?;
        self.query(&plan)
    }

    /// Load an association and return the linked instances.
    ///
    /// Already loaded associations are returned as they are.
    #[tracing::instrument(level = "debug", skip(self, instance), fields(entity = %instance.entity()))]
    pub fn fetch(&mut self, instance: &EntityRef, edge: &str) -> Result<Vec<EntityRef>> {
        self.check_open("fetch", instance)?;
        match self.state_of(instance) {
            LifecycleState::Managed | LifecycleState::Removed => {}
            state => {
                return Err(Error::illegal_state(
                    instance.entity(),
                    "fetch",
                    format!("the instance is {}", state),
                ));
            }
        }
        if !instance
            .read()
            .association(edge)
            .is_some_and(Association::is_fetched)
        {
            self.load_edge(instance, edge)?;
        }
        Ok(instance.related(edge))
    }

    // ========================================================================
    // Bidirectional mutators
    // ========================================================================

    /// Link `target` to `owner` on `edge` and mirror the link on the other
    /// side of the relationship, if the schema declares one.
    pub fn associate(&mut self, owner: &EntityRef, edge: &str, target: &EntityRef) -> Result<()> {
        self.check_open("associate", owner)?;
        let def = self.edge_def(&owner.entity(), edge)?;
        if !def.is_to_many() {
            let previous = owner.one(edge);
            if let Some(previous) = previous.filter(|p| !p.ptr_eq(target)) {
                self.unlink_mirror(owner, &def, &previous)?;
            }
        }
        link(owner, &def, target);
        if let Some(mirror) = self.mirror_of(&def, target)? {
            link(target, &mirror, owner);
        }
        Ok(())
    }

    /// Unlink `target` from `owner` on `edge`, on both sides.
    pub fn dissociate(&mut self, owner: &EntityRef, edge: &str, target: &EntityRef) -> Result<()> {
        self.check_open("dissociate", owner)?;
        let def = self.edge_def(&owner.entity(), edge)?;
        unlink(owner, &def, target);
        self.unlink_mirror(owner, &def, target)
    }

    // ========================================================================
    // Flush / transaction
    // ========================================================================

    /// Write all pending changes to the store.
    ///
    /// If any statement fails, the error carries the key of the failing
    /// instance and this unit of work refuses further operations.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn flush(&mut self) -> Result<FlushResult> {
        if self.poisoned {
            return Err(self.poisoned_error("UnitOfWork", "flush"));
        }
        self.events.fire(UnitOfWorkEvent::BeforeFlush)?;
        let plan = self.prepare_flush()?;
        if plan.is_empty() {
            tracing::debug!("Nothing to flush");
            self.events.fire(UnitOfWorkEvent::AfterFlush)?;
            return Ok(FlushResult::default());
        }

        let result = match self.execute_flush(&plan) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "Flush failed; unit of work must be discarded");
                self.poisoned = true;
                return Err(e);
            }
        };
        self.events.fire(UnitOfWorkEvent::AfterFlush)?;
        Ok(result)
    }

    /// Begin a store transaction.
    pub fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(Error::illegal_state(
                "UnitOfWork",
                "begin",
                "a transaction is already open",
            ));
        }
        self.storage.begin()?;
        self.in_transaction = true;
        Ok(())
    }

    /// Flush, commit the store transaction and end the unit of work.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn commit(mut self) -> Result<()> {
        let result = self.flush()?;
        if self.in_transaction {
            self.storage.commit()?;
            self.in_transaction = false;
        }
        tracing::info!(statements = result.total(), "Committed");
        self.events.fire(UnitOfWorkEvent::AfterCommit)
    }

    /// Abort the store transaction and end the unit of work.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn rollback(mut self) -> Result<()> {
        if self.in_transaction {
            self.in_transaction = false;
            self.storage.abort()?;
        }
        tracing::info!("Rolled back");
        self.events.fire(UnitOfWorkEvent::AfterRollback)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Lifecycle state of `instance` relative to this unit of work.
    ///
    /// Instances managed by another unit of work count as detached here.
    pub fn state_of(&self, instance: &EntityRef) -> LifecycleState {
        let lifecycle = instance.lifecycle();
        match lifecycle.state {
            LifecycleState::Managed | LifecycleState::Removed
                if lifecycle.context != Some(self.id) =>
            {
                LifecycleState::Detached
            }
            state => state,
        }
    }

    /// Check whether `instance` is managed by this unit of work.
    pub fn contains(&self, instance: &EntityRef) -> bool {
        self.state_of(instance) == LifecycleState::Managed
    }

    /// Check whether a flush failed and this unit of work must be discarded.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Dump bookkeeping counts for debugging.
    pub fn debug_state(&self) -> DebugState {
        let removed = self
            .managed
            .iter()
            .filter(|i| self.state_of(i) == LifecycleState::Removed)
            .count();
        DebugState {
            managed: self.managed.len() - removed,
            removed,
            pending_inserts: self.pending_inserts.len(),
            pending_deletes: self.pending_deletes.len(),
            identity_map: self.identity_map.len(),
            snapshots: self.snapshots.len(),
            in_transaction: self.in_transaction,
            poisoned: self.poisoned,
        }
    }

    // ========================================================================
    // Internals: state transitions
    // ========================================================================

    fn check_open(&self, operation: &'static str, instance: &EntityRef) -> Result<()> {
        if self.poisoned {
            return Err(self.poisoned_error(&instance.entity(), operation));
        }
        Ok(())
    }

    fn poisoned_error(&self, entity: &str, operation: &'static str) -> Error {
        Error::illegal_state(
            entity,
            operation,
            "a previous flush failed; the unit of work must be discarded",
        )
    }

    fn require(
        &self,
        op: Operation,
        instance: &EntityRef,
        state: LifecycleState,
    ) -> Result<Transition> {
        transition(op, state)
            .map_err(|reason| Error::illegal_state(instance.entity(), op.as_str(), reason))
    }

    fn persist_one(&mut self, instance: &EntityRef) -> Result<()> {
        let state = self.state_of(instance);
        match self.require(Operation::Persist, instance, state)? {
            Transition::Manage => self.manage_new(instance),
            _ => Ok(()),
        }
    }

    fn manage_new(&mut self, instance: &EntityRef) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let entity = instance.entity();
        let meta = registry.entity(&entity)?;
        if meta.is_abstract() {
            return Err(Error::illegal_state(
                entity,
                "persist",
                "abstract types cannot be instantiated",
            ));
        }
        let id_desc = meta.id();

        let id = match (instance.id(), &id_desc.generation) {
            (Some(id), _) => Some(id),
            (None, IdGeneration::Assigned) => {
                return Err(Error::illegal_state(
                    entity,
                    "persist",
                    format!("primary key '{}' must be assigned before persist", id_desc.field),
                ));
            }
            (None, IdGeneration::Sequence(sequence)) => {
                let id = self.storage.next_sequence_value(sequence)?;
                tracing::trace!(sequence = %sequence, id = %id, "Drew primary key");
                instance.write().set_id(Some(id.clone()));
                Some(id)
            }
            (None, IdGeneration::Identity) => None,
        };

        let key = match id {
            Some(id) => {
                if !id_desc.key_type.accepts(&id) {
                    return Err(Error::illegal_state(
                        entity,
                        "persist",
                        format!("primary key {} does not match the key type", id),
                    ));
                }
                EntityKey::new(meta.root(), id)
            }
            None => {
                self.next_provisional += 1;
                EntityKey::provisional(meta.root(), self.next_provisional)
            }
        };

        self.identity_map.register(key.clone(), instance.clone())?;
        self.track(instance, key.clone());
        self.pending_inserts.push(PendingInsert {
            key: key.clone(),
            instance: instance.clone(),
        });
        tracing::debug!(key = %key, "Persisted");
        Ok(())
    }

    /// Mark `instance` managed under `key` and take its snapshot.
    fn track(&mut self, instance: &EntityRef, key: EntityKey) {
        instance.write().lifecycle = Lifecycle {
            state: LifecycleState::Managed,
            context: Some(self.id),
            key: Some(key.clone()),
        };
        self.snapshots.capture(&key, &instance.read());
        self.managed.push(instance.clone());
    }

    /// Forget `instance` entirely: identity map, snapshot, managed list.
    fn untrack(&mut self, instance: &EntityRef) -> Option<EntityKey> {
        let key = instance.lifecycle().key;
        if let Some(key) = &key {
            if self
                .identity_map
                .lookup(key)
                .is_some_and(|bound| bound.ptr_eq(instance))
            {
                self.identity_map.remove(key);
            }
            self.snapshots.discard(key);
        }
        self.managed.retain(|m| !m.ptr_eq(instance));
        key
    }

    fn is_pending_insert(&self, instance: &EntityRef) -> bool {
        self.pending_inserts
            .iter()
            .any(|p| p.instance.ptr_eq(instance))
    }

    fn remove_one(&mut self, instance: &EntityRef) -> Result<()> {
        if self.is_pending_insert(instance) {
            self.pending_inserts.retain(|p| !p.instance.ptr_eq(instance));
            let key = self.untrack(instance);
            let mut guard = instance.write();
            guard.lifecycle.state = LifecycleState::Removed;
            guard.lifecycle.key = None;
            drop(guard);
            tracing::debug!(key = ?key, "Cancelled pending insert");
            return Ok(());
        }
        instance.write().lifecycle.state = LifecycleState::Removed;
        self.pending_deletes.push(instance.clone());
        tracing::debug!(key = ?instance.lifecycle().key, "Scheduled for removal");
        Ok(())
    }

    fn detach_one(&mut self, instance: &EntityRef) {
        let key = self.untrack(instance);
        instance.write().lifecycle = Lifecycle {
            state: LifecycleState::Detached,
            context: None,
            key: None,
        };
        tracing::debug!(key = ?key, "Detached");
    }

    fn refresh_one(&mut self, instance: &EntityRef) -> Result<()> {
        let entity = instance.entity();
        let Some(id) = instance.id() else {
            return Err(Error::illegal_state(entity, "refresh", "the instance has no primary key"));
        };
        let registry = Arc::clone(&self.registry);
        let plan = read_plan_by_id(&registry, &entity, id.clone())?;
        let rows = self.storage.query(&plan.query())?;
        let Some(row) = rows.first() else {
            return Err(Error::EntityNotFound {
                entity,
                id: id.to_string(),
            });
        };
        let hydrated = plan.hydrate(row)?;
        let meta = registry.entity(&hydrated.entity)?;
        let mut fields = hydrated.fields;
        fields.extend(self.read_collections(&hydrated.entity, &id)?);

        let mut reload = Vec::new();
        {
            let mut guard = instance.write();
            guard.replace_fields(fields);
            for member in meta.edges() {
                let edge = &member.edge;
                let was_loaded = guard
                    .association(&edge.name)
                    .is_some_and(Association::is_fetched);
                let value = if edge.is_owning() {
                    Association::Unfetched(non_null(hydrated.foreign_keys.get(&edge.name)))
                } else {
                    Association::Unfetched(None)
                };
                guard.set_association(edge.name.clone(), value);
                if was_loaded || edge.fetch_policy() == FetchPolicy::Eager {
                    reload.push(edge.name.clone());
                }
            }
        }
        if let Some(key) = instance.lifecycle().key {
            self.snapshots.capture(&key, &instance.read());
        }
        for edge in reload {
            self.load_edge(instance, &edge)?;
        }
        tracing::debug!(entity = %instance.entity(), "Refreshed");
        Ok(())
    }

    fn merge_one(
        &mut self,
        source: &EntityRef,
        merged: &mut HashMap<usize, EntityRef>,
    ) -> Result<EntityRef> {
        if let Some(done) = merged.get(&source.addr()) {
            return Ok(done.clone());
        }
        let entity = source.entity();
        let state = self.state_of(source);
        // A transient instance carrying an id is matched to its row like a
        // detached one.
        let result = match (self.require(Operation::Merge, source, state)?, source.id()) {
            (Transition::AlreadyManaged, _) => source.clone(),
            (transition, Some(id)) => match self.find_for_merge(&entity, id.clone())? {
                Some(managed) => {
                    let fields = source.read().fields().clone();
                    managed.write().replace_fields(fields);
                    managed
                }
                None => {
                    let generation = self.registry.entity(&entity)?.id().generation.clone();
                    if transition == Transition::CopyOntoManaged
                        && generation != IdGeneration::Assigned
                    {
                        return Err(Error::EntityNotFound {
                            entity,
                            id: id.to_string(),
                        });
                    }
                    self.persist_copy(source)?
                }
            },
            (_, None) => self.persist_copy(source)?,
        };
        merged.insert(source.addr(), result.clone());
        self.merge_associations(source, &result, merged)?;
        tracing::debug!(entity = %entity, same = source.ptr_eq(&result), "Merged");
        Ok(result)
    }

    /// Like `find_internal`, but a row already scheduled for removal is an
    /// error rather than absent.
    fn find_for_merge(&mut self, entity: &str, id: Value) -> Result<Option<EntityRef>> {
        let key = EntityKey::new(self.registry.entity(entity)?.root(), id.clone());
        let removed = self
            .identity_map
            .lookup(&key)
            .is_some_and(|held| self.state_of(&held) == LifecycleState::Removed);
        if removed {
            return Err(Error::illegal_state(
                entity,
                "merge",
                "the instance with this key is scheduled for removal",
            ));
        }
        self.find_internal(entity, id)
    }

    fn persist_copy(&mut self, source: &EntityRef) -> Result<EntityRef> {
        let copy = EntityRef::new(source.detached_copy());
        self.persist_one(&copy)?;
        Ok(copy)
    }

    /// Carry associations from `source` onto the merged instance.
    fn merge_associations(
        &mut self,
        source: &EntityRef,
        result: &EntityRef,
        merged: &mut HashMap<usize, EntityRef>,
    ) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let meta = registry.entity(&result.entity())?;
        let associations = source.read().associations().clone();

        for member in meta.edges() {
            let edge = &member.edge;
            let Some(value) = associations.get(&edge.name) else {
                continue;
            };
            let carried = if edge.cascades(CascadeType::Merge) {
                match value {
                    Association::One(Some(target)) => {
                        Association::One(Some(self.merge_one(target, merged)?))
                    }
                    Association::Many(items) => {
                        let mut out = Vec::with_capacity(items.len());
                        for item in items {
                            out.push(self.merge_one(item, merged)?);
                        }
                        Association::Many(out)
                    }
                    other => other.clone(),
                }
            } else if edge.is_owning() {
                match value {
                    Association::One(Some(target)) => self.managed_reference(target)?,
                    other => other.clone(),
                }
            } else {
                continue;
            };
            if source.ptr_eq(result)
                && result
                    .read()
                    .association(&edge.name)
                    .is_some_and(|current| current.same_as(&carried))
            {
                continue;
            }
            result.write().set_association(edge.name.clone(), carried);
        }
        Ok(())
    }

    /// The managed counterpart of a referenced instance, or its key.
    fn managed_reference(&mut self, target: &EntityRef) -> Result<Association> {
        match self.state_of(target) {
            LifecycleState::Managed | LifecycleState::Transient => {
                Ok(Association::One(Some(target.clone())))
            }
            _ => match target.id() {
                Some(id) => match self.find_internal(&target.entity(), id.clone())? {
                    Some(managed) => Ok(Association::One(Some(managed))),
                    None => Ok(Association::Unfetched(Some(id))),
                },
                None => Ok(Association::One(Some(target.clone()))),
            },
        }
    }

    // ========================================================================
    // Internals: reads
    // ========================================================================

    fn find_internal(&mut self, entity: &str, id: Value) -> Result<Option<EntityRef>> {
        let registry = Arc::clone(&self.registry);
        let meta = registry.entity(entity)?;
        let key = EntityKey::new(meta.root(), id.clone());

        if let Some(existing) = self.identity_map.lookup(&key) {
            if self.state_of(&existing) == LifecycleState::Removed
                || !registry.is_subtype(&existing.entity(), entity)
            {
                return Ok(None);
            }
            tracing::trace!(key = %key, "Identity map hit");
            return Ok(Some(existing));
        }

        let plan = read_plan_by_id(&registry, entity, id)?;
        let rows = self.storage.query(&plan.query())?;
        match rows.first() {
            Some(row) => self.hydrate(&plan, row).map(Some),
            None => Ok(None),
        }
    }

    fn run_query(&mut self, plan: &ReadPlan) -> Result<Vec<EntityRef>> {
        let rows = self.storage.query(&plan.query())?;
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let instance = self.hydrate(plan, row)?;
            if self.state_of(&instance) == LifecycleState::Removed || !seen.insert(instance.addr()) {
                continue;
            }
            out.push(instance);
        }
        tracing::debug!(rows = rows.len(), returned = out.len(), "Query hydrated");
        Ok(out)
    }

    /// Resolve one result row to a managed instance.
    ///
    /// The instance is registered before its eager associations are fetched,
    /// so cyclic eager edges resolve through the identity map.
    fn hydrate(&mut self, plan: &ReadPlan, row: &ormctx_core::Row) -> Result<EntityRef> {
        let hydrated = plan.hydrate(row)?;
        let registry = Arc::clone(&self.registry);
        let meta = registry.entity(&hydrated.entity)?;
        let key = EntityKey::new(meta.root(), hydrated.id.clone());
        if let Some(existing) = self.identity_map.lookup(&key) {
            return Ok(existing);
        }

        let mut fields = hydrated.fields;
        fields.extend(self.read_collections(&hydrated.entity, &hydrated.id)?);
        let mut instance = EntityInstance::new(hydrated.entity.clone()).with_id(hydrated.id);
        instance.replace_fields(fields);
        let mut eager = Vec::new();
        for member in meta.edges() {
            let edge = &member.edge;
            let value = if edge.is_owning() {
                Association::Unfetched(non_null(hydrated.foreign_keys.get(&edge.name)))
            } else {
                Association::Unfetched(None)
            };
            instance.set_association(edge.name.clone(), value);
            if edge.fetch_policy() == FetchPolicy::Eager {
                eager.push(edge.name.clone());
            }
        }

        let instance = EntityRef::new(instance);
        self.identity_map.register(key.clone(), instance.clone())?;
        self.track(&instance, key.clone());
        tracing::trace!(key = %key, "Loaded");

        for edge in eager {
            self.load_edge(&instance, &edge)?;
        }
        Ok(instance)
    }

    /// Read the value collections of row `id`, each as one list.
    fn read_collections(&mut self, entity: &str, id: &Value) -> Result<Vec<(String, Value)>> {
        let registry = Arc::clone(&self.registry);
        let mut loaded = Vec::new();
        for member in registry.entity(entity)?.collections() {
            let plan = collection_read_plan(&registry, entity, &member.field.name, id.clone())?;
            let rows = self.storage.query(&plan.query())?;
            tracing::trace!(entity, collection = plan.field(), rows = rows.len(), "Loaded collection");
            loaded.push((member.field.name.clone(), plan.decode(&rows)));
        }
        Ok(loaded)
    }

    /// Read `edge` of `instance` from the store and reset its snapshot
    /// baseline to the loaded value.
    fn load_edge(&mut self, instance: &EntityRef, edge: &str) -> Result<()> {
        let entity = instance.entity();
        let def = self.edge_def(&entity, edge)?;

        let value = match def.mapped_by() {
            None => {
                let fk = match instance.read().association(edge) {
                    Some(Association::Unfetched(fk)) => fk.clone(),
                    Some(Association::One(_)) => return Ok(()),
                    _ => None,
                };
                match fk {
                    Some(fk) => Association::One(self.find_internal(&def.target, fk)?),
                    None => Association::One(None),
                }
            }
            Some(mapped_by) => {
                let Some(id) = instance.id() else {
                    return Ok(());
                };
                if self.is_pending_insert(instance) {
                    return Ok(());
                }
                let plan = polymorphic_read_plan(&self.registry, &def.target)?
                    .with_filter(mapped_by, id)?;
                let related = self.run_query(&plan)?;
                if def.is_to_many() {
                    Association::Many(related)
                } else {
                    Association::One(related.into_iter().next())
                }
            }
        };

        tracing::trace!(entity = %entity, edge = edge, "Fetched association");
        instance.write().set_association(edge, value.clone());
        if let Some(key) = instance.lifecycle().key {
            self.snapshots.reset_link(&key, edge, value);
        }
        Ok(())
    }

    fn edge_def(&self, entity: &str, edge: &str) -> Result<AssociationEdge> {
        self.registry
            .entity(entity)?
            .edge(edge)
            .map(|member| member.edge.clone())
            .ok_or_else(|| {
                SchemaError::new(
                    SchemaErrorKind::UnknownMember,
                    format!("'{}' has no association '{}'", entity, edge),
                )
                .into()
            })
    }

    /// The edge on `target`'s type mirroring `def`, if declared.
    fn mirror_of(&self, def: &AssociationEdge, target: &EntityRef) -> Result<Option<AssociationEdge>> {
        let meta = self.registry.entity(&target.entity())?;
        let mirror = match def.mapped_by() {
            Some(mapped_by) => meta.edge(mapped_by),
            None => meta
                .edges()
                .iter()
                .find(|m| m.edge.mapped_by() == Some(def.name.as_str())),
        };
        Ok(mirror.map(|m| m.edge.clone()))
    }

    fn unlink_mirror(
        &mut self,
        owner: &EntityRef,
        def: &AssociationEdge,
        target: &EntityRef,
    ) -> Result<()> {
        if let Some(mirror) = self.mirror_of(def, target)? {
            unlink(target, &mirror, owner);
        }
        Ok(())
    }

    // ========================================================================
    // Internals: flush
    // ========================================================================

    /// Run flush-time cascades and orphan removal, then diff every managed
    /// instance and order the resulting writes.
    fn prepare_flush(&mut self) -> Result<FlushPlan> {
        if self.config.cascade_on_flush {
            let mut visited = Visited::new();
            for instance in self.managed.clone() {
                if visited.contains(&instance) || !self.contains(&instance) {
                    continue;
                }
                cascade(self, Operation::Persist, &instance, &mut visited)?;
            }
        }

        self.remove_orphans()?;

        let registry = Arc::clone(&self.registry);
        let mut writes = Vec::new();
        for instance in &self.pending_deletes {
            let key = match instance.lifecycle().key {
                Some(key) => key,
                None => {
                    let meta = registry.entity(&instance.entity())?;
                    EntityKey::new(meta.root(), instance.id().unwrap_or(Value::Null))
                }
            };
            writes.push(PendingWrite::delete(key, instance.clone()));
        }
        for pending in &self.pending_inserts {
            writes.push(PendingWrite::insert(
                pending.key.clone(),
                pending.instance.clone(),
            ));
        }
        for instance in &self.managed {
            if !self.contains(instance) || self.is_pending_insert(instance) {
                continue;
            }
            let Some(key) = instance.lifecycle().key else {
                continue;
            };
            let meta = registry.entity(&instance.entity())?;
            let changes = self.snapshots.diff(&key, &instance.read());
            let changed: BTreeSet<String> = changes
                .members()
                .into_iter()
                .filter(|name| {
                    meta.field(name).is_some()
                        || meta.edge(name).is_some_and(|m| m.edge.is_owning())
                })
                .collect();
            if !changed.is_empty() {
                tracing::trace!(key = %key, changed = ?changed, "Dirty");
                writes.push(PendingWrite::update(key, instance.clone(), changed));
            }
        }

        FlushOrderer::new(registry).order(writes)
    }

    /// Schedule removal of instances unlinked from orphan-removal edges.
    fn remove_orphans(&mut self) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        for instance in self.managed.clone() {
            if !self.contains(&instance) {
                continue;
            }
            let Some(key) = instance.lifecycle().key else {
                continue;
            };
            let meta = registry.entity(&instance.entity())?;
            for member in meta.edges().iter().filter(|m| m.edge.orphan_removal) {
                let orphans = self
                    .snapshots
                    .orphans(&key, &instance.read(), &member.edge.name);
                for orphan in orphans {
                    if !self.contains(&orphan) {
                        continue;
                    }
                    tracing::debug!(
                        parent = %key,
                        edge = %member.edge.name,
                        orphan = ?orphan,
                        "Removing orphan"
                    );
                    self.remove_one(&orphan)?;
                    cascade(self, Operation::Remove, &orphan, &mut Visited::new())?;
                }
            }
        }
        Ok(())
    }

    /// Execute the plan and bring the bookkeeping in line with the store.
    fn execute_flush(&mut self, plan: &FlushPlan) -> Result<FlushResult> {
        let result = plan.execute(&mut self.storage)?;

        for pending in std::mem::take(&mut self.pending_inserts) {
            if !pending.key.is_provisional() || !self.contains(&pending.instance) {
                continue;
            }
            let Some(id) = pending.instance.id() else {
                continue;
            };
            let key = EntityKey::new(pending.key.entity(), id);
            self.identity_map.rekey(&pending.key, key.clone())?;
            self.snapshots.rekey(&pending.key, key.clone());
            pending.instance.write().lifecycle.key = Some(key);
        }

        for instance in std::mem::take(&mut self.pending_deletes) {
            self.untrack(&instance);
        }

        for instance in &self.managed {
            if let Some(key) = instance.lifecycle().key {
                self.snapshots.capture(&key, &instance.read());
            }
        }
        Ok(result)
    }
}

impl<S: Storage> CascadeTarget for UnitOfWork<S> {
    fn registry(&self) -> Arc<SchemaRegistry> {
        Arc::clone(&self.registry)
    }

    fn ensure_fetched(&mut self, instance: &EntityRef, edge: &str) -> Result<()> {
        let loaded = instance
            .read()
            .association(edge)
            .is_some_and(Association::is_fetched);
        if loaded || instance.id().is_none() || self.is_pending_insert(instance) {
            return Ok(());
        }
        self.load_edge(instance, edge)
    }

    fn apply(&mut self, op: Operation, instance: &EntityRef) -> Result<bool> {
        let state = self.state_of(instance);
        match op {
            Operation::Persist => {
                if state == LifecycleState::Removed {
                    return Ok(false);
                }
                self.persist_one(instance)?;
                Ok(true)
            }
            Operation::Remove => match state {
                LifecycleState::Managed => {
                    self.remove_one(instance)?;
                    Ok(true)
                }
                LifecycleState::Detached => {
                    self.require(Operation::Remove, instance, state)?;
                    Ok(false)
                }
                LifecycleState::Transient | LifecycleState::Removed => Ok(false),
            },
            Operation::Refresh => {
                if state != LifecycleState::Managed || self.is_pending_insert(instance) {
                    return Ok(false);
                }
                self.refresh_one(instance)?;
                Ok(true)
            }
            Operation::Detach => {
                if state != LifecycleState::Managed {
                    return Ok(false);
                }
                self.detach_one(instance);
                Ok(true)
            }
            Operation::Merge => Ok(false),
        }
    }
}

impl<S: Storage> Drop for UnitOfWork<S> {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Err(e) = self.storage.abort() {
                tracing::warn!(error = %e, "Failed to abort transaction while dropping unit of work");
            }
            self.in_transaction = false;
        }
        for instance in self.managed.drain(..) {
            let mut guard = instance.write();
            if guard.lifecycle.context == Some(self.id) {
                guard.lifecycle = Lifecycle {
                    state: LifecycleState::Detached,
                    context: None,
                    key: None,
                };
            }
        }
        self.identity_map.clear();
        self.snapshots.clear();
        tracing::debug!(unit = self.id, "Unit of work ended");
    }
}

impl<S: Storage> std::fmt::Debug for UnitOfWork<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("state", &self.debug_state())
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

fn non_null(value: Option<&Value>) -> Option<Value> {
    value.filter(|v| !v.is_null()).cloned()
}

fn link(owner: &EntityRef, def: &AssociationEdge, target: &EntityRef) {
    let mut guard = owner.write();
    if def.is_to_many() {
        guard.add_to(&def.name, target.clone());
    } else {
        guard.set_one(def.name.clone(), Some(target.clone()));
    }
}

fn unlink(owner: &EntityRef, def: &AssociationEdge, target: &EntityRef) {
    // Read before locking `owner`; the two may be the same instance.
    let target_id = target.id();
    let mut guard = owner.write();
    if guard.remove_from(&def.name, target) || def.is_to_many() {
        return;
    }
    let points_at_target = match guard.association(&def.name) {
        Some(Association::Unfetched(Some(fk))) => target_id.is_some_and(|id| id.key_eq(fk)),
        _ => false,
    };
    if points_at_target {
        guard.set_one(def.name.clone(), None);
    }
}
