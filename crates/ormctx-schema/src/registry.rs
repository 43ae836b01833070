//! The schema registry: validated, resolved entity metadata.
//!
//! Descriptors are registered once at startup. Building the registry resolves
//! every inheritance chain, inherited members and physical tables, validates
//! the mapping, and ranks tables by foreign-key dependency so a flush can
//! order its writes. The result is immutable and may be shared freely.

use crate::association::{AssociationEdge, Cardinality};
use crate::descriptor::{EntityDescriptor, IdDescriptor, IdGeneration, InheritanceRole, InheritanceStrategy};
use crate::field::FieldDescriptor;
use ormctx_core::{Error, Result, SchemaError, SchemaErrorKind, is_valid_identifier};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, OnceLock};

/// A persistent field together with the type that declares it.
#[derive(Debug, Clone)]
pub struct MemberField {
    pub field: FieldDescriptor,
    pub declared_by: String,
}

/// An association edge together with the type that declares it.
#[derive(Debug, Clone)]
pub struct MemberEdge {
    pub edge: AssociationEdge,
    pub declared_by: String,
}

/// Resolved metadata for one entity type.
#[derive(Debug, Clone)]
pub struct EntityMeta {
    descriptor: EntityDescriptor,
    root: String,
    /// Hierarchy root first, this type last.
    chain: Vec<String>,
    strategy: InheritanceStrategy,
    id: IdDescriptor,
    fields: Vec<MemberField>,
    edges: Vec<MemberEdge>,
    subtypes: Vec<String>,
    write_tables: Vec<String>,
    member_tables: BTreeMap<String, String>,
}

impl EntityMeta {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    /// Name of the hierarchy root.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn is_root(&self) -> bool {
        self.chain.len() == 1
    }

    /// Type names from the root down to this type.
    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    /// Distance from the hierarchy root.
    pub fn depth(&self) -> usize {
        self.chain.len() - 1
    }

    pub fn is_abstract(&self) -> bool {
        self.descriptor.is_abstract
    }

    /// Strategy of the whole hierarchy.
    pub fn strategy(&self) -> &InheritanceStrategy {
        &self.strategy
    }

    /// Primary key, as declared by the root.
    pub fn id(&self) -> &IdDescriptor {
        &self.id
    }

    /// All persistent fields, inherited ones first.
    pub fn fields(&self) -> &[MemberField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&MemberField> {
        self.fields.iter().find(|f| f.field.name == name)
    }

    /// All association edges, inherited ones first.
    pub fn edges(&self) -> &[MemberEdge] {
        &self.edges
    }

    pub fn edge(&self, name: &str) -> Option<&MemberEdge> {
        self.edges.iter().find(|e| e.edge.name == name)
    }

    /// Owning edges, i.e. those that write a foreign-key column.
    pub fn owning_edges(&self) -> impl Iterator<Item = &MemberEdge> {
        self.edges.iter().filter(|e| e.edge.is_owning())
    }

    /// Value-collection fields, each stored in its own table.
    pub fn collections(&self) -> impl Iterator<Item = &MemberField> {
        self.fields.iter().filter(|f| f.field.is_collection())
    }

    /// Tables holding this type's value collections.
    pub fn collection_tables(&self) -> Vec<&str> {
        self.collections()
            .filter_map(|f| f.field.collection_table())
            .collect()
    }

    /// Check whether `name` is the id field, a field or an edge of this type.
    pub fn has_member(&self, name: &str) -> bool {
        self.id.field == name || self.field(name).is_some() || self.edge(name).is_some()
    }

    /// All strict subtypes, in registration order.
    pub fn subtypes(&self) -> &[String] {
        &self.subtypes
    }

    /// Tables an instance of this type writes, in dependency order.
    pub fn write_tables(&self) -> &[String] {
        &self.write_tables
    }

    /// Table holding the members declared by `declared_by` for instances of
    /// this type.
    pub fn table_for(&self, declared_by: &str) -> Option<&str> {
        self.member_tables.get(declared_by).map(String::as_str)
    }

    /// Discriminator column, for single-table hierarchies.
    pub fn discriminator_column(&self) -> Option<&str> {
        match &self.strategy {
            InheritanceStrategy::SingleTable {
                discriminator_column,
            } => Some(discriminator_column),
            _ => None,
        }
    }

    /// Discriminator value, defaulting to the type name.
    pub fn discriminator_value(&self) -> &str {
        self.descriptor
            .discriminator
            .as_deref()
            .unwrap_or(&self.descriptor.name)
    }
}

/// Builder collecting descriptors in registration order.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    descriptors: Vec<EntityDescriptor>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one entity type.
    pub fn register(mut self, descriptor: EntityDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Validate and resolve the schema.
    pub fn build(self) -> Result<SchemaRegistry> {
        SchemaRegistry::from_descriptors(self.descriptors)
    }
}

#[derive(Deserialize)]
struct SchemaDocument {
    entities: Vec<EntityDescriptor>,
}

/// Immutable, validated set of entity types.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    metas: Vec<EntityMeta>,
    index: HashMap<String, usize>,
    table_order: Vec<String>,
    table_rank: HashMap<String, usize>,
}

fn schema_err(kind: SchemaErrorKind, message: impl Into<String>) -> Error {
    Error::Schema(SchemaError::new(kind, message))
}

fn check_identifier(what: &str, owner: &str, name: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(schema_err(
            SchemaErrorKind::InvalidIdentifier,
            format!("{} '{}' of {} is not a valid identifier", what, name, owner),
        ))
    }
}

impl SchemaRegistry {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    /// Parse a JSON schema document of the form `{"entities": [...]}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: SchemaDocument = serde_json::from_str(json)
            .map_err(|e| schema_err(SchemaErrorKind::Config, e.to_string()))?;
        Self::from_descriptors(doc.entities)
    }

    /// Validate and resolve an ordered list of descriptors.
    #[tracing::instrument(level = "debug", skip(descriptors), fields(count = descriptors.len()))]
    pub fn from_descriptors(descriptors: Vec<EntityDescriptor>) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, d) in descriptors.iter().enumerate() {
            if index.insert(d.name.clone(), i).is_some() {
                return Err(schema_err(
                    SchemaErrorKind::Duplicate,
                    format!("entity '{}' registered twice", d.name),
                ));
            }
            Self::check_identifiers(d)?;
        }

        let mut metas = Vec::with_capacity(descriptors.len());
        for d in &descriptors {
            metas.push(Self::resolve(d, &descriptors, &index)?);
        }

        // Subtype lists.
        for i in 0..metas.len() {
            let name = metas[i].name().to_string();
            let ancestors: Vec<String> = metas[i].chain[..metas[i].chain.len() - 1].to_vec();
            for ancestor in ancestors {
                if let Some(&j) = index.get(&ancestor) {
                    metas[j].subtypes.push(name.clone());
                }
            }
        }

        let mut registry = Self {
            metas,
            index,
            table_order: Vec::new(),
            table_rank: HashMap::new(),
        };
        registry.check_discriminators()?;
        registry.check_columns()?;
        registry.check_collections()?;
        registry.check_associations()?;
        registry.rank_tables();

        tracing::debug!(
            entities = registry.metas.len(),
            tables = registry.table_order.len(),
            "Schema registry built"
        );
        Ok(registry)
    }

    fn check_identifiers(d: &EntityDescriptor) -> Result<()> {
        if let Some(table) = &d.table {
            check_identifier("table", &d.name, table)?;
        }
        if let Some(id) = &d.id {
            check_identifier("column", &d.name, &id.column)?;
            if let IdGeneration::Sequence(seq) = &id.generation {
                check_identifier("sequence", &d.name, seq)?;
            }
        }
        for field in &d.fields {
            for column in field.columns() {
                check_identifier("column", &d.name, column)?;
            }
            if let Some(table) = field.collection_table() {
                check_identifier("collection table", &d.name, table)?;
            }
            for column in field.collection_columns() {
                check_identifier("collection column", &d.name, column)?;
            }
        }
        for edge in &d.associations {
            if let Some(column) = edge.join_column() {
                check_identifier("join column", &d.name, column)?;
            }
        }
        if let InheritanceRole::Root(InheritanceStrategy::SingleTable {
            discriminator_column,
        }) = &d.role
        {
            check_identifier("discriminator column", &d.name, discriminator_column)?;
        }
        Ok(())
    }

    fn resolve(
        d: &EntityDescriptor,
        all: &[EntityDescriptor],
        index: &HashMap<String, usize>,
    ) -> Result<EntityMeta> {
        // Walk up to the root.
        let mut chain = vec![d.name.clone()];
        let mut current = d;
        while let Some(parent) = current.role.parent() {
            let Some(&pi) = index.get(parent) else {
                return Err(schema_err(
                    SchemaErrorKind::UnknownEntity,
                    format!("parent '{}' of '{}' is not registered", parent, current.name),
                ));
            };
            if chain.len() > all.len() {
                return Err(schema_err(
                    SchemaErrorKind::InheritanceMismatch,
                    format!("inheritance cycle through '{}'", d.name),
                ));
            }
            current = &all[pi];
            chain.push(current.name.clone());
        }
        chain.reverse();
        let root = current;

        let InheritanceRole::Root(strategy) = &root.role else {
            return Err(schema_err(
                SchemaErrorKind::InheritanceMismatch,
                format!("'{}' has no root", d.name),
            ));
        };
        let Some(id) = root.id.clone() else {
            return Err(schema_err(
                SchemaErrorKind::MissingPrimaryKey,
                format!("hierarchy root '{}' declares no primary key", root.name),
            ));
        };

        let chain_descs: Vec<&EntityDescriptor> = chain
            .iter()
            .filter_map(|n| index.get(n).map(|&i| &all[i]))
            .collect();

        for member in &chain_descs[1..] {
            if !member.role.fits(strategy) {
                return Err(schema_err(
                    SchemaErrorKind::InheritanceMismatch,
                    format!(
                        "'{}' has role {:?} under a {} hierarchy",
                        member.name,
                        member.role,
                        strategy.name()
                    ),
                ));
            }
            if member.id.is_some() {
                return Err(schema_err(
                    SchemaErrorKind::InheritanceMismatch,
                    format!(
                        "'{}' redeclares the primary key; only the hierarchy root may",
                        member.name
                    ),
                ));
            }
        }

        if *strategy == InheritanceStrategy::TablePerClass
            && id.generation == IdGeneration::Identity
        {
            return Err(schema_err(
                SchemaErrorKind::IdGenerator,
                format!(
                    "table-per-class hierarchy '{}' cannot use identity keys; use a shared sequence",
                    root.name
                ),
            ));
        }

        // Physical tables.
        let require_table = |desc: &EntityDescriptor| -> Result<String> {
            desc.table.clone().ok_or_else(|| {
                schema_err(
                    SchemaErrorKind::InheritanceMismatch,
                    format!(
                        "'{}' needs a table under the {} strategy",
                        desc.name,
                        strategy.name()
                    ),
                )
            })
        };
        let mut member_tables = BTreeMap::new();
        let write_tables = match strategy {
            InheritanceStrategy::None => {
                let table = require_table(d)?;
                member_tables.insert(d.name.clone(), table.clone());
                vec![table]
            }
            InheritanceStrategy::SingleTable { .. } => {
                let table = require_table(root)?;
                if let Some(own) = &d.table {
                    if *own != table {
                        return Err(schema_err(
                            SchemaErrorKind::InheritanceMismatch,
                            format!(
                                "'{}' declares table '{}' but its single-table hierarchy uses '{}'",
                                d.name, own, table
                            ),
                        ));
                    }
                }
                for name in &chain {
                    member_tables.insert(name.clone(), table.clone());
                }
                vec![table]
            }
            InheritanceStrategy::Joined => {
                let mut tables = Vec::with_capacity(chain_descs.len());
                for desc in &chain_descs {
                    let table = require_table(desc)?;
                    member_tables.insert(desc.name.clone(), table.clone());
                    tables.push(table);
                }
                tables
            }
            InheritanceStrategy::TablePerClass if d.table.is_none() && d.is_abstract => Vec::new(),
            InheritanceStrategy::TablePerClass => {
                let table = require_table(d)?;
                for name in &chain {
                    member_tables.insert(name.clone(), table.clone());
                }
                vec![table]
            }
        };

        // Inherited members, root first.
        let mut fields = Vec::new();
        let mut edges = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        seen.insert(&id.field);
        for desc in &chain_descs {
            for field in &desc.fields {
                if !seen.insert(&field.name) {
                    return Err(schema_err(
                        SchemaErrorKind::Duplicate,
                        format!("member '{}' declared twice in '{}'", field.name, d.name),
                    ));
                }
                fields.push(MemberField {
                    field: field.clone(),
                    declared_by: desc.name.clone(),
                });
            }
            for edge in &desc.associations {
                if !seen.insert(&edge.name) {
                    return Err(schema_err(
                        SchemaErrorKind::Duplicate,
                        format!("member '{}' declared twice in '{}'", edge.name, d.name),
                    ));
                }
                edges.push(MemberEdge {
                    edge: edge.clone(),
                    declared_by: desc.name.clone(),
                });
            }
        }

        Ok(EntityMeta {
            descriptor: d.clone(),
            root: root.name.clone(),
            chain,
            strategy: strategy.clone(),
            id,
            fields,
            edges,
            subtypes: Vec::new(),
            write_tables,
            member_tables,
        })
    }

    fn check_discriminators(&self) -> Result<()> {
        let mut seen: HashMap<(&str, &str), &str> = HashMap::new();
        for meta in &self.metas {
            if meta.discriminator_column().is_none() || meta.is_abstract() {
                continue;
            }
            let value = meta.discriminator_value();
            if let Some(other) = seen.insert((meta.root(), value), meta.name()) {
                return Err(schema_err(
                    SchemaErrorKind::Duplicate,
                    format!(
                        "'{}' and '{}' share discriminator value '{}'",
                        other,
                        meta.name(),
                        value
                    ),
                ));
            }
        }
        Ok(())
    }

    fn check_columns(&self) -> Result<()> {
        for meta in &self.metas {
            let mut columns: Vec<(String, String)> = Vec::new();
            for table in &meta.write_tables {
                columns.push((table.clone(), meta.id.column.clone()));
            }
            if let (Some(col), Some(table)) = (meta.discriminator_column(), meta.write_tables.first()) {
                columns.push((table.clone(), col.to_string()));
            }
            for f in &meta.fields {
                if let Some(table) = meta.table_for(&f.declared_by) {
                    for col in f.field.columns() {
                        columns.push((table.to_string(), col.to_string()));
                    }
                }
            }
            for e in meta.owning_edges() {
                if let (Some(table), Some(col)) = (meta.table_for(&e.declared_by), e.edge.join_column()) {
                    columns.push((table.to_string(), col.to_string()));
                }
            }
            let mut unique: HashSet<(String, String)> = HashSet::new();
            for (table, column) in columns {
                if !unique.insert((table.clone(), column.clone())) {
                    return Err(schema_err(
                        SchemaErrorKind::Duplicate,
                        format!(
                            "column '{}' of table '{}' is mapped twice in '{}'",
                            column,
                            table,
                            meta.name()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Every collection table belongs to exactly one field and to no entity.
    fn check_collections(&self) -> Result<()> {
        let entity_tables: HashSet<&str> = self
            .metas
            .iter()
            .flat_map(|m| m.write_tables.iter().map(String::as_str))
            .collect();
        let mut owners: HashMap<&str, (&str, &str)> = HashMap::new();
        for meta in &self.metas {
            for member in meta.collections() {
                if member.declared_by != meta.name() {
                    continue;
                }
                let Some(table) = member.field.collection_table() else {
                    continue;
                };
                let field = member.field.name.as_str();
                if entity_tables.contains(table) {
                    return Err(schema_err(
                        SchemaErrorKind::Duplicate,
                        format!(
                            "collection '{}.{}' uses entity table '{}'",
                            meta.name(),
                            field,
                            table
                        ),
                    ));
                }
                if let Some((other, other_field)) = owners.insert(table, (meta.name(), field)) {
                    return Err(schema_err(
                        SchemaErrorKind::Duplicate,
                        format!(
                            "collections '{}.{}' and '{}.{}' share table '{}'",
                            other,
                            other_field,
                            meta.name(),
                            field,
                            table
                        ),
                    ));
                }
                let columns = member.field.collection_columns();
                let unique: HashSet<&str> = columns.iter().copied().collect();
                if unique.len() != columns.len() {
                    return Err(schema_err(
                        SchemaErrorKind::Duplicate,
                        format!(
                            "collection '{}.{}' maps a column of '{}' twice",
                            meta.name(),
                            field,
                            table
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_associations(&self) -> Result<()> {
        for meta in &self.metas {
            for MemberEdge { edge, declared_by } in &meta.edges {
                if declared_by != meta.name() {
                    continue;
                }
                let target = self.entity(&edge.target).map_err(|_| {
                    schema_err(
                        SchemaErrorKind::InvalidAssociation,
                        format!(
                            "'{}.{}' targets unknown entity '{}'",
                            meta.name(),
                            edge.name,
                            edge.target
                        ),
                    )
                })?;
                match edge.mapped_by() {
                    None if edge.cardinality == Cardinality::ToMany => {
                        return Err(schema_err(
                            SchemaErrorKind::InvalidAssociation,
                            format!(
                                "'{}.{}' is a ToMany edge and must be mapped by a ToOne edge on '{}'",
                                meta.name(),
                                edge.name,
                                edge.target
                            ),
                        ));
                    }
                    None => {}
                    Some(mapped_by) => {
                        let owner = target.edge(mapped_by).filter(|m| {
                            m.edge.is_owning()
                                && m.edge.cardinality == Cardinality::ToOne
                                && (self.is_subtype(meta.name(), &m.edge.target)
                                    || self.is_subtype(&m.edge.target, meta.name()))
                        });
                        if owner.is_none() {
                            return Err(schema_err(
                                SchemaErrorKind::InvalidAssociation,
                                format!(
                                    "'{}.{}' is mapped by '{}.{}', which is not an owning ToOne edge back to '{}'",
                                    meta.name(),
                                    edge.name,
                                    edge.target,
                                    mapped_by,
                                    meta.name()
                                ),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Tables a foreign key to `target` may reference.
    fn key_tables(&self, target: &EntityMeta) -> Vec<String> {
        match target.strategy() {
            InheritanceStrategy::TablePerClass => std::iter::once(target.name())
                .chain(target.subtypes().iter().map(String::as_str))
                .filter_map(|n| self.get(n))
                .flat_map(|m| m.write_tables.iter().cloned())
                .collect(),
            _ => self
                .get(target.root())
                .and_then(|root| root.write_tables.first().cloned())
                .into_iter()
                .collect(),
        }
    }

    fn rank_tables(&mut self) {
        let mut order: Vec<String> = Vec::new();
        let mut deps: HashMap<String, HashSet<String>> = HashMap::new();
        for meta in &self.metas {
            for table in &meta.write_tables {
                if !order.contains(table) {
                    order.push(table.clone());
                }
            }
            for pair in meta.write_tables.windows(2) {
                deps.entry(pair[1].clone())
                    .or_default()
                    .insert(pair[0].clone());
            }
            for member in meta.collections() {
                let (Some(owner), Some(table)) = (
                    meta.table_for(&member.declared_by),
                    member.field.collection_table(),
                ) else {
                    continue;
                };
                if !order.iter().any(|t| t == table) {
                    order.push(table.to_string());
                }
                deps.entry(table.to_string())
                    .or_default()
                    .insert(owner.to_string());
            }
            for e in meta.owning_edges() {
                let (Some(holding), Some(target)) =
                    (meta.table_for(&e.declared_by), self.get(&e.edge.target))
                else {
                    continue;
                };
                for referenced in self.key_tables(target) {
                    if referenced != holding {
                        deps.entry(holding.to_string())
                            .or_default()
                            .insert(referenced);
                    }
                }
            }
        }

        let mut placed: Vec<String> = Vec::with_capacity(order.len());
        let mut remaining = order;
        while !remaining.is_empty() {
            let ready = remaining.iter().position(|t| {
                deps.get(t)
                    .is_none_or(|d| d.iter().all(|dep| placed.contains(dep)))
            });
            let next = match ready {
                Some(i) => i,
                None => {
                    tracing::warn!(
                        table = %remaining[0],
                        "Foreign-key cycle between tables; falling back to registration order"
                    );
                    0
                }
            };
            placed.push(remaining.remove(next));
        }

        self.table_rank = placed
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();
        self.table_order = placed;
    }

    /// Look up an entity type.
    pub fn entity(&self, name: &str) -> Result<&EntityMeta> {
        self.get(name).ok_or_else(|| {
            schema_err(
                SchemaErrorKind::UnknownEntity,
                format!("entity '{}' is not registered", name),
            )
        })
    }

    pub fn get(&self, name: &str) -> Option<&EntityMeta> {
        self.index.get(name).map(|&i| &self.metas[i])
    }

    /// All entity types, in registration order.
    pub fn entities(&self) -> impl Iterator<Item = &EntityMeta> {
        self.metas.iter()
    }

    /// Check whether `sub` is `sup` or one of its subtypes.
    pub fn is_subtype(&self, sub: &str, sup: &str) -> bool {
        self.get(sub)
            .is_some_and(|m| m.chain.iter().any(|n| n == sup))
    }

    /// `name` and all its subtypes that can be instantiated.
    pub fn concrete_types(&self, name: &str) -> Result<Vec<&EntityMeta>> {
        let meta = self.entity(name)?;
        Ok(std::iter::once(meta)
            .chain(meta.subtypes.iter().filter_map(|n| self.get(n)))
            .filter(|m| !m.is_abstract())
            .collect())
    }

    /// Position of a table in foreign-key dependency order.
    ///
    /// Referenced tables rank lower than the tables referencing them.
    /// Unknown tables rank last.
    pub fn table_rank(&self, table: &str) -> usize {
        self.table_rank
            .get(table)
            .copied()
            .unwrap_or(self.table_order.len())
    }

    /// All tables in dependency order.
    pub fn tables(&self) -> &[String] {
        &self.table_order
    }

    /// Install this registry as the process-wide schema.
    ///
    /// Succeeds once; the installed registry is never mutated afterwards.
    pub fn install(self) -> Result<Arc<SchemaRegistry>> {
        let registry = Arc::new(self);
        GLOBAL.set(Arc::clone(&registry)).map_err(|_| {
            schema_err(
                SchemaErrorKind::AlreadyInstalled,
                "a process-wide schema registry is already installed",
            )
        })?;
        tracing::info!(entities = registry.metas.len(), "Schema registry installed");
        Ok(registry)
    }

    /// The process-wide schema, if one was installed.
    pub fn global() -> Option<Arc<SchemaRegistry>> {
        GLOBAL.get().cloned()
    }
}

static GLOBAL: OnceLock<Arc<SchemaRegistry>> = OnceLock::new();

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::{AssociationSide, CascadePolicy};

    fn shop() -> Vec<EntityDescriptor> {
        vec![
            EntityDescriptor::new("OrderItem")
                .table("order_items")
                .id(IdDescriptor::new("id", "item_id").identity())
                .field(FieldDescriptor::new("quantity", "quantity"))
                .association(AssociationEdge::to_one("order", "Order", "order_id"))
                .association(AssociationEdge::to_one("product", "Product", "product_id")),
            EntityDescriptor::new("Order")
                .table("orders")
                .id(IdDescriptor::new("id", "order_id").identity())
                .association(
                    AssociationEdge::to_many("items", "OrderItem", "order")
                        .cascade(CascadePolicy::ALL),
                ),
            EntityDescriptor::root("Product", InheritanceStrategy::Joined)
                .table("products")
                .id(IdDescriptor::new("id", "product_id").identity())
                .field(FieldDescriptor::new("name", "name")),
            EntityDescriptor::joined_child("Book", "Product")
                .table("books")
                .field(FieldDescriptor::new("isbn", "isbn")),
        ]
    }

    fn kind_of(err: Error) -> SchemaErrorKind {
        match err {
            Error::Schema(e) => e.kind,
            other => panic!("expected schema error, got {other}"),
        }
    }

    #[test]
    fn test_resolves_joined_chain() {
        let registry = SchemaRegistry::from_descriptors(shop()).unwrap();
        let book = registry.entity("Book").unwrap();
        assert_eq!(book.root(), "Product");
        assert_eq!(book.depth(), 1);
        assert_eq!(book.id().column, "product_id");
        assert_eq!(book.write_tables(), ["products", "books"]);
        assert_eq!(book.table_for("Product"), Some("products"));
        assert_eq!(book.table_for("Book"), Some("books"));
        assert!(book.has_member("name"));
        assert!(book.has_member("isbn"));
        assert!(registry.is_subtype("Book", "Product"));
        assert!(!registry.is_subtype("Product", "Book"));
        assert_eq!(registry.entity("Product").unwrap().subtypes(), ["Book"]);
    }

    #[test]
    fn test_table_rank_follows_foreign_keys() {
        let registry = SchemaRegistry::from_descriptors(shop()).unwrap();
        let rank = |t: &str| registry.table_rank(t);
        assert!(rank("orders") < rank("order_items"));
        assert!(rank("products") < rank("order_items"));
        assert!(rank("products") < rank("books"));
        assert_eq!(registry.tables().len(), 4);
        assert_eq!(rank("unknown"), 4);
    }

    #[test]
    fn test_single_table_discriminators() {
        let registry = SchemaRegistry::builder()
            .register(
                EntityDescriptor::root(
                    "Product",
                    InheritanceStrategy::SingleTable {
                        discriminator_column: "product_type".to_string(),
                    },
                )
                .table("products")
                .abstract_type()
                .id(IdDescriptor::new("id", "product_id").identity()),
            )
            .register(EntityDescriptor::single_table_child("Book", "Product").discriminator("B"))
            .register(EntityDescriptor::single_table_child("Movie", "Product"))
            .build()
            .unwrap();
        let book = registry.entity("Book").unwrap();
        assert_eq!(book.write_tables(), ["products"]);
        assert_eq!(book.discriminator_column(), Some("product_type"));
        assert_eq!(book.discriminator_value(), "B");
        assert_eq!(registry.entity("Movie").unwrap().discriminator_value(), "Movie");
        let concrete: Vec<&str> = registry
            .concrete_types("Product")
            .unwrap()
            .iter()
            .map(|m| m.name())
            .collect();
        assert_eq!(concrete, ["Book", "Movie"]);
    }

    #[test]
    fn test_rejects_identity_under_table_per_class() {
        let err = SchemaRegistry::builder()
            .register(
                EntityDescriptor::root("Item", InheritanceStrategy::TablePerClass)
                    .abstract_type()
                    .id(IdDescriptor::new("id", "item_id").identity()),
            )
            .register(EntityDescriptor::concrete_table_child("Album", "Item").table("albums"))
            .build()
            .unwrap_err();
        assert_eq!(kind_of(err), SchemaErrorKind::IdGenerator);
    }

    #[test]
    fn test_rejects_mismatched_roles() {
        let err = SchemaRegistry::builder()
            .register(
                EntityDescriptor::root("Product", InheritanceStrategy::Joined)
                    .table("products")
                    .id(IdDescriptor::new("id", "product_id")),
            )
            .register(EntityDescriptor::single_table_child("Book", "Product"))
            .build()
            .unwrap_err();
        assert_eq!(kind_of(err), SchemaErrorKind::InheritanceMismatch);

        let err = SchemaRegistry::builder()
            .register(
                EntityDescriptor::new("Member")
                    .table("members")
                    .id(IdDescriptor::new("id", "member_id")),
            )
            .register(EntityDescriptor::joined_child("Vip", "Member").table("vips"))
            .build()
            .unwrap_err();
        assert_eq!(kind_of(err), SchemaErrorKind::InheritanceMismatch);
    }

    #[test]
    fn test_rejects_missing_pieces() {
        let err = SchemaRegistry::builder()
            .register(EntityDescriptor::new("Member").table("members"))
            .build()
            .unwrap_err();
        assert_eq!(kind_of(err), SchemaErrorKind::MissingPrimaryKey);

        let err = SchemaRegistry::builder()
            .register(
                EntityDescriptor::new("Member")
                    .table("members; drop")
                    .id(IdDescriptor::new("id", "member_id")),
            )
            .build()
            .unwrap_err();
        assert_eq!(kind_of(err), SchemaErrorKind::InvalidIdentifier);

        let err = SchemaRegistry::builder()
            .register(EntityDescriptor::joined_child("Book", "Product").table("books"))
            .build()
            .unwrap_err();
        assert_eq!(kind_of(err), SchemaErrorKind::UnknownEntity);

        let mut descriptors = shop();
        descriptors.push(shop().remove(1));
        assert_eq!(
            kind_of(SchemaRegistry::from_descriptors(descriptors).unwrap_err()),
            SchemaErrorKind::Duplicate
        );
    }

    #[test]
    fn test_rejects_duplicate_columns() {
        let err = SchemaRegistry::builder()
            .register(
                EntityDescriptor::new("Member")
                    .table("members")
                    .id(IdDescriptor::new("id", "member_id"))
                    .field(FieldDescriptor::new("name", "name"))
                    .field(FieldDescriptor::new("nickname", "name")),
            )
            .build()
            .unwrap_err();
        assert_eq!(kind_of(err), SchemaErrorKind::Duplicate);
    }

    #[test]
    fn test_rejects_bad_associations() {
        let mut descriptors = shop();
        descriptors[1] = EntityDescriptor::new("Order")
            .table("orders")
            .id(IdDescriptor::new("id", "order_id"))
            .association(AssociationEdge::to_many("items", "OrderItem", "product"));
        assert_eq!(
            kind_of(SchemaRegistry::from_descriptors(descriptors).unwrap_err()),
            SchemaErrorKind::InvalidAssociation
        );

        let mut owning_many = AssociationEdge::to_many("tags", "Tag", "unused");
        owning_many.side = AssociationSide::Owning {
            join_column: "tag_id".to_string(),
        };
        let err = SchemaRegistry::builder()
            .register(
                EntityDescriptor::new("Tag")
                    .table("tags")
                    .id(IdDescriptor::new("id", "tag_id")),
            )
            .register(
                EntityDescriptor::new("Post")
                    .table("posts")
                    .id(IdDescriptor::new("id", "post_id"))
                    .association(owning_many),
            )
            .build()
            .unwrap_err();
        assert_eq!(kind_of(err), SchemaErrorKind::InvalidAssociation);

        let err = SchemaRegistry::builder()
            .register(
                EntityDescriptor::new("Post")
                    .table("posts")
                    .id(IdDescriptor::new("id", "post_id"))
                    .association(AssociationEdge::to_one("author", "Author", "author_id")),
            )
            .build()
            .unwrap_err();
        assert_eq!(kind_of(err), SchemaErrorKind::InvalidAssociation);
    }

    #[test]
    fn test_from_json() {
        let registry = SchemaRegistry::from_json(
            r#"{"entities": [
                {"name": "Member", "table": "members",
                 "id": {"field": "id", "column": "member_id", "generation": "identity"},
                 "fields": [{"name": "name", "column": "name", "nullable": false}]}
            ]}"#,
        )
        .unwrap();
        let member = registry.entity("Member").unwrap();
        assert_eq!(member.id().generation, IdGeneration::Identity);
        assert!(!member.field("name").unwrap().field.nullable);

        let err = SchemaRegistry::from_json("{\"entities\": 3}").unwrap_err();
        assert_eq!(kind_of(err), SchemaErrorKind::Config);
    }

    #[test]
    fn test_unknown_entity_lookup() {
        let registry = SchemaRegistry::from_descriptors(shop()).unwrap();
        assert!(registry.get("Nope").is_none());
        assert_eq!(
            kind_of(registry.entity("Nope").unwrap_err()),
            SchemaErrorKind::UnknownEntity
        );
    }

    #[test]
    fn test_collection_tables_rank_after_their_owner() {
        let registry = SchemaRegistry::builder()
            .register(
                EntityDescriptor::new("Product")
                    .table("products")
                    .id(IdDescriptor::new("id", "product_id").identity())
                    .field(FieldDescriptor::embedded_collection(
                        "sizes",
                        "product_sizes",
                        "product_id",
                        [("label", "size_label"), ("stock", "stock")],
                    )),
            )
            .build()
            .unwrap();
        let product = registry.entity("Product").unwrap();
        assert_eq!(product.collection_tables(), ["product_sizes"]);
        assert!(registry.table_rank("products") < registry.table_rank("product_sizes"));
        assert_eq!(registry.tables(), ["products", "product_sizes"]);
    }

    #[test]
    fn test_rejects_clashing_collection_tables() {
        let product = || {
            EntityDescriptor::new("Product")
                .table("products")
                .id(IdDescriptor::new("id", "product_id"))
        };
        let err = SchemaRegistry::builder()
            .register(product().field(FieldDescriptor::collection(
                "tags",
                "products",
                "product_id",
                "tag",
            )))
            .build()
            .unwrap_err();
        assert_eq!(kind_of(err), SchemaErrorKind::Duplicate);

        let err = SchemaRegistry::builder()
            .register(
                product()
                    .field(FieldDescriptor::collection("tags", "labels", "product_id", "tag"))
                    .field(FieldDescriptor::collection("notes", "labels", "product_id", "note")),
            )
            .build()
            .unwrap_err();
        assert_eq!(kind_of(err), SchemaErrorKind::Duplicate);

        let err = SchemaRegistry::builder()
            .register(product().field(FieldDescriptor::collection(
                "tags",
                "product_tags",
                "product_id",
                "product_id",
            )))
            .build()
            .unwrap_err();
        assert_eq!(kind_of(err), SchemaErrorKind::Duplicate);

        let err = SchemaRegistry::builder()
            .register(product().field(FieldDescriptor::collection(
                "tags",
                "product tags",
                "product_id",
                "tag",
            )))
            .build()
            .unwrap_err();
        assert_eq!(kind_of(err), SchemaErrorKind::InvalidIdentifier);
    }
}
