//! ormctx - an embeddable object-relational persistence context.
//!
//! ormctx keeps an in-memory object graph consistent with a relational store
//! for the length of one unit of work:
//!
//! - Two lookups of the same row return the same instance (identity map)
//! - Changed fields are found by comparing against load-time snapshots, and
//!   only those columns are written
//! - Persist, remove, merge, refresh and detach follow association edges
//!   according to each edge's static cascade policy
//! - Single-table, joined and table-per-class inheritance are mapped to the
//!   right tables for writes and to the right query shape for polymorphic reads
//! - Value collections live in their own table keyed by the owner and are
//!   rewritten whenever their contents change
//!
//! The store is a collaborator behind the [`Storage`] trait. [`MemoryStore`]
//! is a complete in-process implementation.
//!
//! # Quick Start
//!
//! ```
//! use ormctx::prelude::*;
//! use std::sync::Arc;
//!
//! let registry = SchemaRegistry::builder()
//!     .register(
//!         EntityDescriptor::new("Member")
//!             .table("members")
//!             .id(IdDescriptor::new("id", "member_id").identity())
//!             .field(FieldDescriptor::new("name", "name")),
//!     )
//!     .build()
//!     .unwrap();
//! let registry = Arc::new(registry);
//! let store = MemoryStore::new();
//!
//! let mut uow = UnitOfWork::new(Arc::clone(&registry), store.clone()).unwrap();
//! let kim = EntityRef::new(EntityInstance::new("Member").with("name", "Kim"));
//! uow.persist(&kim).unwrap();
//! uow.commit().unwrap();
//! let id = kim.id().unwrap();
//!
//! let mut uow = UnitOfWork::new(registry, store).unwrap();
//! let found = uow.find("Member", id.clone()).unwrap().unwrap();
//! assert!(uow.find("Member", id).unwrap().unwrap().ptr_eq(&found));
//! found.set("name", "Kim Minji");
//! assert_eq!(uow.flush().unwrap().updated, 1);
//! ```

pub use ormctx_core::{
    EntityKey, Error, KeyId, Result, Row, SchemaError, SchemaErrorKind, StorageError,
    StorageErrorKind, TypeError, Value,
};

pub use ormctx_query::{
    ColumnRef, Condition, Executed, Join, JoinType, QueryPlan, Select, Source, Statement,
    StatementKind, Storage,
};

pub use ormctx_schema::{
    AssociationEdge, Cardinality, CascadePolicy, CascadeType, CollectionPlan, EntityDescriptor,
    EntityMeta, FetchPolicy, FieldDescriptor, FieldKind, Hydrated, IdDescriptor, IdGeneration,
    InheritanceStrategy, KeyType, ReadPlan, RowImage, SchemaRegistry, WriteScope,
    collection_read_plan, polymorphic_read_plan, read_plan_by_id, targets_for,
};

pub use ormctx_session::{
    Association, DebugState, EntityInstance, EntityRef, FlushResult, LifecycleState, Operation,
    UnitOfWork, UnitOfWorkConfig, UnitOfWorkEvent,
};

pub use ormctx_memory::MemoryStore;

/// Lower-level building blocks, for callers that drive flushes or cascades
/// themselves.
pub mod session {
    pub use ormctx_session::{
        CascadeTarget, Changes, FlushOrderer, FlushPlan, IdentityMap, PendingWrite, Snapshot,
        SnapshotStore, Transition, Visited, cascade, transition,
    };
}

pub mod prelude {
    pub use crate::{
        // Associations
        Association,
        AssociationEdge,
        CascadePolicy,
        // Schema
        EntityDescriptor,
        // Instances
        EntityInstance,
        EntityKey,
        EntityRef,
        // Errors
        Error,
        FetchPolicy,
        FieldDescriptor,
        IdDescriptor,
        InheritanceStrategy,
        LifecycleState,
        // Store
        MemoryStore,
        Result,
        SchemaRegistry,
        Storage,
        // Unit of work
        UnitOfWork,
        UnitOfWorkConfig,
        Value,
        polymorphic_read_plan,
    };
}
