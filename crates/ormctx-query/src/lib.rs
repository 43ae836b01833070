//! Statements, read plans and the storage contract for ormctx.
//!
//! The persistence context never hands raw SQL to its store. It issues
//! structured single-table [`Statement`]s and [`QueryPlan`]s; a store may
//! render them with `to_sql()` or interpret them directly.

pub mod plan;
pub mod select;
pub mod statement;
pub mod storage;

pub use plan::{QueryPlan, SetOpType};
pub use select::{ColumnRef, Condition, Join, JoinType, Projection, Select, Source, TableRef};
pub use statement::{Delete, Insert, Statement, StatementKind, Update};
pub use storage::{Executed, Storage};
