//! Entity mapping metadata for ormctx.
//!
//! Entity types are described by [`EntityDescriptor`]s and registered in a
//! [`SchemaRegistry`], which validates them and resolves inheritance. The
//! registry then answers the two mapping questions a persistence context asks:
//!
//! - [`targets_for`]: which tables and columns a write touches.
//! - [`polymorphic_read_plan`]: how to read a type and all its subtypes.
//!
//! Value collections are read per owner with [`collection_read_plan`].

pub mod association;
pub mod descriptor;
pub mod field;
pub mod mapping;
pub mod read_plan;
pub mod registry;

pub use association::{
    AssociationEdge, AssociationSide, Cardinality, CascadePolicy, CascadeType, FetchPolicy,
};
pub use descriptor::{
    EntityDescriptor, IdDescriptor, IdGeneration, InheritanceRole, InheritanceStrategy, KeyType,
};
pub use field::{ComponentDescriptor, FieldDescriptor, FieldKind};
pub use mapping::{RowImage, WriteScope, targets_for};
pub use read_plan::{
    CollectionPlan, ENTITY_TAG, Hydrated, ReadPlan, RowLayout, Slot, TypeResolver,
    collection_read_plan, polymorphic_read_plan, read_plan_by_id,
};
pub use registry::{EntityMeta, MemberEdge, MemberField, SchemaBuilder, SchemaRegistry};
