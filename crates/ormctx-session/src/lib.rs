//! Unit of work for ormctx.
//!
//! `ormctx-session` is the **persistence-context layer**. It coordinates
//! object identity, change tracking and transactional writes over a
//! [`Storage`](ormctx_query::Storage) it owns.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one in-memory instance per stored row.
//! - **Change tracking**: snapshots taken at load time are diffed at flush.
//! - **Cascades**: persist, remove, merge, refresh and detach follow edges
//!   whose policy asks for it.
//! - **Flush ordering**: deletes, then inserts, then updates, each in an order
//!   that satisfies foreign keys between tables.
//!
//! # Design
//!
//! - **Explicit flush**: nothing is written until [`UnitOfWork::flush`] or
//!   [`UnitOfWork::commit`], unless `flush_before_query` is configured.
//! - **Ownership**: a unit of work owns its store; instances are shared with
//!   the application through [`EntityRef`] handles.
//! - **Dynamic instances**: entity values are field maps checked against the
//!   schema registry, so any registered type can be handled without codegen.
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new(registry, store)?;
//!
//! // Persist: INSERTed on flush, children follow by cascade
//! uow.persist(&order)?;
//!
//! // Find by primary key (uses identity map)
//! let member = uow.find("Member", 1)?;
//!
//! // Schedule deletion
//! uow.remove(&old_order)?;
//!
//! // Write and commit
//! uow.commit()?;
//! ```

pub mod cascade;
pub mod change_tracker;
pub mod flush;
pub mod identity_map;
pub mod instance;
pub mod state;
pub mod unit_of_work;

pub use cascade::{CascadeTarget, Visited, cascade};
pub use change_tracker::{Changes, Snapshot, SnapshotStore};
pub use flush::{FlushOrderer, FlushPlan, FlushResult, PendingWrite};
pub use identity_map::IdentityMap;
pub use instance::{Association, EntityInstance, EntityRef, LifecycleState};
pub use state::{Operation, Transition, transition};
pub use unit_of_work::{DebugState, UnitOfWork, UnitOfWorkConfig, UnitOfWorkEvent};
