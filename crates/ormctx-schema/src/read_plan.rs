//! Polymorphic read plans.
//!
//! A [`ReadPlan`] for type `T` selects every row whose concrete type is `T` or
//! one of its subtypes, and knows how to turn each result row back into a
//! concrete type name plus member values. How that works depends on the
//! hierarchy's strategy:
//!
//! | strategy        | query shape                                  | type resolved by        |
//! |-----------------|----------------------------------------------|-------------------------|
//! | none            | plain SELECT                                 | fixed                   |
//! | single table    | one table, discriminator IN filter           | discriminator column    |
//! | joined          | root table, INNER JOIN parents, LEFT JOIN subtypes | deepest present table |
//! | table per class | UNION ALL over concrete tables, NULL padding | `__entity` tag column   |

use crate::field::FieldKind;
use crate::registry::{EntityMeta, SchemaRegistry};
use ormctx_core::{Error, Result, Row, SchemaError, SchemaErrorKind, Value};
use ormctx_query::{ColumnRef, Condition, JoinType, Projection, QueryPlan, Select, Source};
use std::collections::BTreeMap;

/// Output column carrying the concrete type name in table-per-class unions.
pub const ENTITY_TAG: &str = "__entity";

/// How a result row maps to a concrete type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeResolver {
    /// Every row has this type.
    Fixed(String),
    /// The discriminator column's value selects the type.
    Discriminator {
        column: String,
        values: Vec<(Value, String)>,
    },
    /// The first marker column that is not NULL selects the type.
    TablePresence {
        markers: Vec<(String, String)>,
        fallback: Option<String>,
    },
    /// A literal tag column names the type.
    Tag { column: String },
}

impl TypeResolver {
    /// Determine the concrete type of a row.
    pub fn resolve(&self, row: &Row) -> Result<String> {
        match self {
            TypeResolver::Fixed(name) => Ok(name.clone()),
            TypeResolver::Discriminator { column, values } => {
                let value = row.require(column)?;
                values
                    .iter()
                    .find(|(v, _)| v == value)
                    .map(|(_, name)| name.clone())
                    .ok_or_else(|| unresolved(format!("discriminator value {} matches no type", value)))
            }
            TypeResolver::TablePresence { markers, fallback } => markers
                .iter()
                .find(|(column, _)| row.get_by_name(column).is_some_and(|v| !v.is_null()))
                .map(|(_, name)| name.clone())
                .or_else(|| fallback.clone())
                .ok_or_else(|| unresolved("row matches no concrete subtype".to_string())),
            TypeResolver::Tag { column } => row
                .require(column)?
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| unresolved(format!("column '{}' does not hold a type name", column))),
        }
    }
}

fn unresolved(message: String) -> Error {
    Error::Schema(SchemaError::new(SchemaErrorKind::UnknownEntity, message))
}

/// Where one member's value is read from.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Column(String),
    /// `(component, output column)` pairs of an embedded field.
    Embedded(Vec<(String, String)>),
    /// Foreign key of an owning association.
    ForeignKey(String),
}

/// Output columns of one concrete type.
#[derive(Debug, Clone, PartialEq)]
pub struct RowLayout {
    pub id: String,
    pub slots: Vec<(String, Slot)>,
}

/// One result row decoded into a concrete type and member values.
#[derive(Debug, Clone, PartialEq)]
pub struct Hydrated {
    pub entity: String,
    pub id: Value,
    pub fields: BTreeMap<String, Value>,
    /// Foreign-key values of owning associations, keyed by edge name.
    pub foreign_keys: BTreeMap<String, Value>,
}

/// A read query for a type and all its subtypes.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPlan {
    entity: String,
    branches: Vec<Select>,
    /// Per branch: member name to the column holding it.
    members: Vec<BTreeMap<String, ColumnRef>>,
    resolver: TypeResolver,
    layouts: BTreeMap<String, RowLayout>,
}

impl ReadPlan {
    /// Type this plan was built for.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// The query to hand to the store.
    pub fn query(&self) -> QueryPlan {
        QueryPlan::union_all(self.branches.clone())
    }

    pub fn resolver(&self) -> &TypeResolver {
        &self.resolver
    }

    pub fn layout(&self, entity: &str) -> Option<&RowLayout> {
        self.layouts.get(entity)
    }

    /// Restrict to rows whose `member` equals `value`.
    ///
    /// Union branches for types that lack the member are dropped. For an
    /// owning association the value is the referenced instance's id.
    pub fn with_filter(mut self, member: &str, value: Value) -> Result<Self> {
        if !self.members.iter().any(|m| m.contains_key(member)) {
            return Err(Error::Schema(SchemaError::new(
                SchemaErrorKind::UnknownMember,
                format!("'{}' has no filterable member '{}'", self.entity, member),
            )));
        }
        let mut branches = Vec::with_capacity(self.branches.len());
        let mut members = Vec::with_capacity(self.members.len());
        for (select, map) in self.branches.into_iter().zip(self.members) {
            if let Some(column) = map.get(member) {
                branches.push(select.filter(Condition::Eq(column.clone(), value.clone())));
                members.push(map);
            }
        }
        self.branches = branches;
        self.members = members;
        Ok(self)
    }

    /// Decode one result row.
    pub fn hydrate(&self, row: &Row) -> Result<Hydrated> {
        let entity = self.resolver.resolve(row)?;
        let layout = self
            .layouts
            .get(&entity)
            .ok_or_else(|| unresolved(format!("'{}' is not part of this read plan", entity)))?;
        let read = |column: &str| row.get_by_name(column).cloned().unwrap_or(Value::Null);

        let mut fields = BTreeMap::new();
        let mut foreign_keys = BTreeMap::new();
        for (member, slot) in &layout.slots {
            match slot {
                Slot::Column(column) => {
                    fields.insert(member.clone(), read(column));
                }
                Slot::Embedded(components) => {
                    let parts: Vec<(String, Value)> = components
                        .iter()
                        .map(|(name, column)| (name.clone(), read(column)))
                        .collect();
                    let value = if parts.iter().all(|(_, v)| v.is_null()) {
                        Value::Null
                    } else {
                        Value::Embedded(parts.into_iter().collect())
                    };
                    fields.insert(member.clone(), value);
                }
                Slot::ForeignKey(column) => {
                    foreign_keys.insert(member.clone(), read(column));
                }
            }
        }
        Ok(Hydrated {
            id: row.require(&layout.id)?.clone(),
            entity,
            fields,
            foreign_keys,
        })
    }
}

/// Build the read plan for `entity` and its subtypes.
pub fn polymorphic_read_plan(registry: &SchemaRegistry, entity: &str) -> Result<ReadPlan> {
    let meta = registry.entity(entity)?;
    let concrete = registry.concrete_types(entity)?;
    let plan = match meta.strategy() {
        crate::InheritanceStrategy::None => plain_plan(meta),
        crate::InheritanceStrategy::SingleTable {
            discriminator_column,
        } => single_table_plan(registry, meta, &concrete, discriminator_column),
        crate::InheritanceStrategy::Joined => joined_plan(registry, meta, &concrete),
        crate::InheritanceStrategy::TablePerClass => table_per_class_plan(meta, &concrete),
    }?;
    tracing::trace!(entity, branches = plan.branches.len(), "Built read plan");
    Ok(plan)
}

/// Plan reading the single instance of `entity` (or a subtype) with key `id`.
pub fn read_plan_by_id(registry: &SchemaRegistry, entity: &str, id: Value) -> Result<ReadPlan> {
    let meta = registry.entity(entity)?;
    polymorphic_read_plan(registry, entity)?.with_filter(&meta.id().field, id)
}

/// Read query for the elements of one value collection of one owner.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionPlan {
    field: String,
    select: Select,
    /// Output column of a scalar element.
    column: String,
    /// `(component, output column)` pairs of a value-object element.
    components: Vec<(String, String)>,
}

impl CollectionPlan {
    /// Name of the collection field.
    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn query(&self) -> QueryPlan {
        QueryPlan::Select(self.select.clone())
    }

    /// Gather element rows into a [`Value::List`], in row order.
    pub fn decode(&self, rows: &[Row]) -> Value {
        let read = |row: &Row, column: &str| row.get_by_name(column).cloned().unwrap_or(Value::Null);
        Value::List(
            rows.iter()
                .map(|row| {
                    if self.components.is_empty() {
                        read(row, &self.column)
                    } else {
                        Value::Embedded(
                            self.components
                                .iter()
                                .map(|(name, column)| (name.clone(), read(row, column)))
                                .collect(),
                        )
                    }
                })
                .collect(),
        )
    }
}

/// Plan reading the elements of collection `field` owned by the `entity`
/// instance with key `owner`.
pub fn collection_read_plan(
    registry: &SchemaRegistry,
    entity: &str,
    field: &str,
    owner: Value,
) -> Result<CollectionPlan> {
    let meta = registry.entity(entity)?;
    let Some(FieldKind::Collection {
        table,
        join_column,
        components,
    }) = meta.field(field).map(|m| &m.field.kind)
    else {
        return Err(Error::Schema(SchemaError::new(
            SchemaErrorKind::UnknownMember,
            format!("'{}' has no value collection '{}'", entity, field),
        )));
    };
    let column = meta
        .field(field)
        .map(|m| m.field.column.clone())
        .unwrap_or_default();

    let mut select = Select::from(table.as_str(), "c")
        .filter(Condition::Eq(ColumnRef::new("c", join_column), owner));
    let mut parts = Vec::with_capacity(components.len());
    if components.is_empty() {
        select = select.column(ColumnRef::new("c", &column), column.clone());
    } else {
        for component in components {
            select = select.column(
                ColumnRef::new("c", &component.column),
                component.column.clone(),
            );
            parts.push((component.name.clone(), component.column.clone()));
        }
    }
    Ok(CollectionPlan {
        field: field.to_string(),
        select,
        column,
        components: parts,
    })
}

/// Collects projections so every output column appears once.
struct Projector {
    select: Select,
    names: Vec<String>,
}

impl Projector {
    fn new(select: Select) -> Self {
        Self {
            select,
            names: Vec::new(),
        }
    }

    fn column(&mut self, column: ColumnRef, name: String) -> String {
        if !self.names.contains(&name) {
            self.names.push(name.clone());
            self.select.projections.push(Projection {
                source: Source::Column(column),
                name: name.clone(),
            });
        }
        name
    }
}

/// Lay out `meta`'s members, naming each column with `name_of(declared_by, column)`.
fn layout_for(
    meta: &EntityMeta,
    id_output: &str,
    mut name_of: impl FnMut(&str, &str) -> (ColumnRef, String),
    members: &mut BTreeMap<String, ColumnRef>,
    projector: &mut Projector,
) -> RowLayout {
    let mut slots = Vec::new();
    for member in meta.fields() {
        let field = &member.field;
        match &field.kind {
            FieldKind::Scalar => {
                let (colref, name) = name_of(&member.declared_by, &field.column);
                members.insert(field.name.clone(), colref.clone());
                let name = projector.column(colref, name);
                slots.push((field.name.clone(), Slot::Column(name)));
            }
            FieldKind::Embedded { components } => {
                let mut parts = Vec::with_capacity(components.len());
                for component in components {
                    let (colref, name) = name_of(&member.declared_by, &component.column);
                    parts.push((component.name.clone(), projector.column(colref, name)));
                }
                slots.push((field.name.clone(), Slot::Embedded(parts)));
            }
            // Read separately, see `collection_read_plan`.
            FieldKind::Collection { .. } => {}
        }
    }
    for member in meta.owning_edges() {
        if let Some(column) = member.edge.join_column() {
            let (colref, name) = name_of(&member.declared_by, column);
            members.insert(member.edge.name.clone(), colref.clone());
            let name = projector.column(colref, name);
            slots.push((member.edge.name.clone(), Slot::ForeignKey(name)));
        }
    }
    RowLayout {
        id: id_output.to_string(),
        slots,
    }
}

fn table_of(meta: &EntityMeta) -> Result<&str> {
    meta.write_tables().first().map(String::as_str).ok_or_else(|| {
        Error::Schema(SchemaError::new(
            SchemaErrorKind::InheritanceMismatch,
            format!("'{}' has no table to read from", meta.name()),
        ))
    })
}

fn plain_plan(meta: &EntityMeta) -> Result<ReadPlan> {
    let id_column = meta.id().column.clone();
    let mut projector = Projector::new(Select::from(table_of(meta)?, "t0"));
    let mut members = BTreeMap::new();
    members.insert(meta.id().field.clone(), ColumnRef::new("t0", &id_column));
    let id = projector.column(ColumnRef::new("t0", &id_column), id_column.clone());
    let layout = layout_for(
        meta,
        &id,
        |_, column| (ColumnRef::new("t0", column), column.to_string()),
        &mut members,
        &mut projector,
    );
    Ok(ReadPlan {
        entity: meta.name().to_string(),
        branches: vec![projector.select],
        members: vec![members],
        resolver: TypeResolver::Fixed(meta.name().to_string()),
        layouts: BTreeMap::from([(meta.name().to_string(), layout)]),
    })
}

fn single_table_plan(
    registry: &SchemaRegistry,
    meta: &EntityMeta,
    concrete: &[&EntityMeta],
    discriminator: &str,
) -> Result<ReadPlan> {
    let root = registry.entity(meta.root())?;
    let id_column = meta.id().column.clone();
    let mut projector = Projector::new(Select::from(table_of(root)?, "t0"));
    let mut members = BTreeMap::new();
    members.insert(meta.id().field.clone(), ColumnRef::new("t0", &id_column));
    let id = projector.column(ColumnRef::new("t0", &id_column), id_column.clone());
    let disc = projector.column(ColumnRef::new("t0", discriminator), discriminator.to_string());

    let mut layouts = BTreeMap::new();
    let mut values = Vec::with_capacity(concrete.len());
    for ty in concrete {
        let layout = layout_for(
            ty,
            &id,
            |_, column| (ColumnRef::new("t0", column), column.to_string()),
            &mut members,
            &mut projector,
        );
        layouts.insert(ty.name().to_string(), layout);
        values.push((
            Value::Text(ty.discriminator_value().to_string()),
            ty.name().to_string(),
        ));
    }

    let mut select = projector.select;
    if !meta.is_root() {
        select = select.filter(Condition::In(
            ColumnRef::new("t0", discriminator),
            values.iter().map(|(v, _)| v.clone()).collect(),
        ));
    }
    Ok(ReadPlan {
        entity: meta.name().to_string(),
        branches: vec![select],
        members: vec![members],
        resolver: TypeResolver::Discriminator {
            column: disc,
            values,
        },
        layouts,
    })
}

fn joined_plan(
    registry: &SchemaRegistry,
    meta: &EntityMeta,
    concrete: &[&EntityMeta],
) -> Result<ReadPlan> {
    let id_column = meta.id().column.clone();

    // One alias per type with a table: the chain first, then subtypes.
    let mut aliases: BTreeMap<String, String> = BTreeMap::new();
    let mut ordered: Vec<&EntityMeta> = Vec::new();
    for name in meta.chain().iter().chain(meta.subtypes()) {
        let ty = registry.entity(name)?;
        aliases.insert(name.clone(), format!("t{}", ordered.len()));
        ordered.push(ty);
    }
    let alias_of = |name: &str| aliases.get(name).cloned().unwrap_or_default();

    let root = ordered[0];
    let root_table = root.descriptor().table.clone().unwrap_or_default();
    let mut select = Select::from(root_table, "t0");
    let pk = ColumnRef::new("t0", &id_column);
    for (i, ty) in ordered.iter().enumerate().skip(1) {
        let join_type = if i < meta.chain().len() {
            JoinType::Inner
        } else {
            JoinType::Left
        };
        let table = ty.descriptor().table.clone().unwrap_or_default();
        select = select.join(join_type, table, alias_of(ty.name()), pk.clone(), &id_column);
    }

    let output = |alias: &str, column: &str| format!("{}_{}", alias, column);
    let mut projector = Projector::new(select);
    let mut members = BTreeMap::new();
    members.insert(meta.id().field.clone(), pk.clone());
    let id = projector.column(pk, output("t0", &id_column));

    let mut layouts = BTreeMap::new();
    for ty in concrete {
        let layout = layout_for(
            ty,
            &id,
            |declared_by, column| {
                let alias = alias_of(declared_by);
                (ColumnRef::new(&alias, column), output(&alias, column))
            },
            &mut members,
            &mut projector,
        );
        layouts.insert(ty.name().to_string(), layout);
    }

    let resolver = if meta.subtypes().is_empty() {
        TypeResolver::Fixed(meta.name().to_string())
    } else {
        let mut subs: Vec<&&EntityMeta> = concrete.iter().filter(|t| t.name() != meta.name()).collect();
        subs.sort_by(|a, b| b.depth().cmp(&a.depth()));
        let mut markers = Vec::with_capacity(subs.len());
        for ty in subs {
            let alias = alias_of(ty.name());
            let marker = output(&alias, &id_column);
            projector.column(ColumnRef::new(&alias, &id_column), marker.clone());
            markers.push((marker, ty.name().to_string()));
        }
        TypeResolver::TablePresence {
            markers,
            fallback: (!meta.is_abstract()).then(|| meta.name().to_string()),
        }
    };

    Ok(ReadPlan {
        entity: meta.name().to_string(),
        branches: vec![projector.select],
        members: vec![members],
        resolver,
        layouts,
    })
}

fn table_per_class_plan(meta: &EntityMeta, concrete: &[&EntityMeta]) -> Result<ReadPlan> {
    let id_column = meta.id().column.clone();

    // Output columns shared by every branch, in first-seen order.
    let mut columns: Vec<String> = vec![id_column.clone()];
    for ty in concrete {
        let mut scratch = BTreeMap::new();
        let mut shape = Projector::new(Select::from("", ""));
        layout_for(
            ty,
            &id_column,
            |_, column| (ColumnRef::new("t0", column), column.to_string()),
            &mut scratch,
            &mut shape,
        );
        for name in shape.names {
            if !columns.contains(&name) {
                columns.push(name);
            }
        }
    }

    let mut branches = Vec::with_capacity(concrete.len());
    let mut members = Vec::with_capacity(concrete.len());
    let mut layouts = BTreeMap::new();
    for ty in concrete {
        let mut map = BTreeMap::new();
        map.insert(meta.id().field.clone(), ColumnRef::new("t0", &id_column));
        let mut own = Projector::new(Select::from("", ""));
        let layout = layout_for(
            ty,
            &id_column,
            |_, column| (ColumnRef::new("t0", column), column.to_string()),
            &mut map,
            &mut own,
        );
        let mut select = Select::from(table_of(ty)?, "t0");
        for name in &columns {
            select = if *name == id_column || own.names.contains(name) {
                select.column(ColumnRef::new("t0", name), name.clone())
            } else {
                select.literal(Value::Null, name.clone())
            };
        }
        select = select.literal(Value::Text(ty.name().to_string()), ENTITY_TAG);
        branches.push(select);
        members.push(map);
        layouts.insert(ty.name().to_string(), layout);
    }

    Ok(ReadPlan {
        entity: meta.name().to_string(),
        branches,
        members,
        resolver: TypeResolver::Tag {
            column: ENTITY_TAG.to_string(),
        },
        layouts,
    })
}
