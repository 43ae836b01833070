//! Write-side inheritance mapping.
//!
//! [`targets_for`] turns the persistent state of one instance into the
//! single-table statements that write it, honoring the hierarchy's strategy:
//! one table for single-table and table-per-class hierarchies, the chain of
//! parent and subtype tables for joined ones.
//!
//! Value collections live in tables of their own, one row per element keyed
//! by the owner's id. They are written after the owner's rows, removed before
//! them, and rewritten as a whole (delete, then re-insert) when they change.

use crate::field::{FieldDescriptor, FieldKind};
use crate::registry::{EntityMeta, SchemaRegistry};
use ormctx_core::{Error, Result, Value};
use ormctx_query::{Delete, Insert, Statement, Update};
use std::collections::{BTreeMap, BTreeSet};

/// Persistent state of one instance, keyed by member name.
///
/// Field members map to their value (an embedded field to a
/// [`Value::Embedded`], a collection field to a [`Value::List`]); owning
/// association members map to the foreign-key value of the referenced
/// instance. Absent members are written as NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowImage {
    pub id: Option<Value>,
    pub values: BTreeMap<String, Value>,
}

impl RowImage {
    pub fn new(id: Option<Value>) -> Self {
        Self {
            id,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, member: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(member.into(), value.into());
        self
    }

    pub fn get(&self, member: &str) -> &Value {
        self.values.get(member).unwrap_or(&Value::Null)
    }
}

/// Which kind of write to plan.
#[derive(Debug, Clone, Copy)]
pub enum WriteScope<'a> {
    Insert,
    /// Only the named members changed.
    Update(&'a BTreeSet<String>),
    Delete,
}

/// Plan the statements writing `image` as an instance of `entity`.
///
/// INSERTs come in dependency order (parent tables first). An INSERT without
/// a known id carries `generated_key` on the first table only; the caller
/// back-fills the id before executing the rest. Collection rows need the id,
/// so they are only planned once it is known. UPDATEs touch only tables with
/// changed columns, plus a delete and re-insert of every changed collection.
/// DELETEs come collection tables first, then child tables before parents.
///
/// ```
/// use ormctx_schema::{
///     EntityDescriptor, FieldDescriptor, IdDescriptor, InheritanceStrategy, RowImage,
///     SchemaRegistry, WriteScope, targets_for,
/// };
///
/// let registry = SchemaRegistry::builder()
///     .register(
///         EntityDescriptor::root("Product", InheritanceStrategy::Joined)
///             .table("products")
///             .id(IdDescriptor::new("id", "product_id"))
///             .field(FieldDescriptor::new("name", "name")),
///     )
///     .register(
///         EntityDescriptor::joined_child("Book", "Product")
///             .table("books")
///             .field(FieldDescriptor::new("isbn", "isbn")),
///     )
///     .build()
///     .unwrap();
///
/// let image = RowImage::new(Some(7.into())).with("name", "Dune").with("isbn", "978");
/// let targets = targets_for(&registry, "Book", &image, WriteScope::Insert).unwrap();
/// let tables: Vec<&str> = targets.iter().map(|s| s.table()).collect();
/// assert_eq!(tables, ["products", "books"]);
/// ```
pub fn targets_for(
    registry: &SchemaRegistry,
    entity: &str,
    image: &RowImage,
    scope: WriteScope<'_>,
) -> Result<Vec<Statement>> {
    let meta = registry.entity(entity)?;
    if meta.is_abstract() {
        return Err(Error::illegal_state(
            entity,
            "write",
            "abstract types are never instantiated",
        ));
    }
    let id_column = meta.id().column.clone();

    match scope {
        WriteScope::Insert => {
            let mut statements = Vec::with_capacity(meta.write_tables().len());
            for (i, table) in meta.write_tables().iter().enumerate() {
                let mut values = Vec::new();
                let mut generated_key = None;
                match &image.id {
                    Some(id) => values.push((id_column.clone(), id.clone())),
                    None if i == 0 => generated_key = Some(id_column.clone()),
                    None => {}
                }
                if i == 0 {
                    if let Some(column) = meta.discriminator_column() {
                        values.push((
                            column.to_string(),
                            Value::Text(meta.discriminator_value().to_string()),
                        ));
                    }
                }
                values.extend(table_columns(meta, table, image, None)?);
                statements.push(Statement::Insert(Insert {
                    table: table.clone(),
                    values,
                    key: Some(id_column.clone()),
                    generated_key,
                }));
            }
            if let Some(id) = &image.id {
                for member in meta.collections() {
                    statements.extend(collection_rows(meta, &member.field, id, image)?);
                }
            }
            Ok(statements)
        }
        WriteScope::Update(changed) => {
            let id = require_id(meta, image, "update")?;
            let mut statements = Vec::new();
            for table in meta.write_tables() {
                let set = table_columns(meta, table, image, Some(changed))?;
                if set.is_empty() {
                    continue;
                }
                statements.push(Statement::Update(Update {
                    table: table.clone(),
                    set,
                    key: (id_column.clone(), id.clone()),
                }));
            }
            for member in meta.collections() {
                if !changed.contains(&member.field.name) {
                    continue;
                }
                if let Some(clear) = collection_clear(&member.field, id) {
                    statements.push(clear);
                }
                statements.extend(collection_rows(meta, &member.field, id, image)?);
            }
            Ok(statements)
        }
        WriteScope::Delete => {
            let id = require_id(meta, image, "delete")?;
            let clears = meta
                .collections()
                .filter_map(|member| collection_clear(&member.field, id));
            let rows = meta.write_tables().iter().rev().map(|table| {
                Statement::Delete(Delete {
                    table: table.clone(),
                    key: (id_column.clone(), id.clone()),
                })
            });
            Ok(clears.chain(rows).collect())
        }
    }
}

fn require_id<'a>(meta: &EntityMeta, image: &'a RowImage, operation: &'static str) -> Result<&'a Value> {
    image.id.as_ref().ok_or_else(|| {
        Error::illegal_state(meta.name(), operation, "the instance has no primary key yet")
    })
}

/// DELETE of every element row of a collection field.
fn collection_clear(field: &FieldDescriptor, id: &Value) -> Option<Statement> {
    let FieldKind::Collection {
        table, join_column, ..
    } = &field.kind
    else {
        return None;
    };
    Some(Statement::Delete(Delete {
        table: table.clone(),
        key: (join_column.clone(), id.clone()),
    }))
}

/// One keyless INSERT per element of a collection field.
fn collection_rows(
    meta: &EntityMeta,
    field: &FieldDescriptor,
    id: &Value,
    image: &RowImage,
) -> Result<Vec<Statement>> {
    let FieldKind::Collection {
        table,
        join_column,
        components,
    } = &field.kind
    else {
        return Ok(Vec::new());
    };
    let value = image.get(&field.name);
    let Some(elements) = value.as_list() else {
        return Err(Error::illegal_state(
            meta.name(),
            "write",
            format!(
                "collection '{}' holds a {}, not a list",
                field.name,
                value.type_name()
            ),
        ));
    };

    let mut rows = Vec::with_capacity(elements.len());
    for element in elements {
        if element.is_null() {
            return Err(Error::illegal_state(
                meta.name(),
                "write",
                format!("collection '{}' holds a NULL element", field.name),
            ));
        }
        let mut values = vec![(join_column.clone(), id.clone())];
        if components.is_empty() {
            values.push((field.column.clone(), element.clone()));
        } else {
            for component in components {
                let part = element.component(&component.name);
                if part.is_null() && !component.nullable {
                    return Err(Error::illegal_state(
                        meta.name(),
                        "write",
                        format!(
                            "component '{}.{}' must not be null",
                            field.name, component.name
                        ),
                    ));
                }
                values.push((component.column.clone(), part));
            }
        }
        rows.push(Statement::Insert(Insert {
            table: table.clone(),
            values,
            key: None,
            generated_key: None,
        }));
    }
    Ok(rows)
}

/// Columns of `table` written for the members in `only` (or all members).
fn table_columns(
    meta: &EntityMeta,
    table: &str,
    image: &RowImage,
    only: Option<&BTreeSet<String>>,
) -> Result<Vec<(String, Value)>> {
    let wanted = |member: &str| only.is_none_or(|set| set.contains(member));
    let mut columns = Vec::new();

    for member in meta.fields() {
        let field = &member.field;
        if field.is_collection()
            || meta.table_for(&member.declared_by) != Some(table)
            || !wanted(&field.name)
        {
            continue;
        }
        let value = image.get(&field.name);
        if value.is_null() && !field.nullable {
            return Err(Error::illegal_state(
                meta.name(),
                "write",
                format!("field '{}' must not be null", field.name),
            ));
        }
        match &field.kind {
            FieldKind::Scalar => columns.push((field.column.clone(), value.clone())),
            FieldKind::Embedded { components } => {
                for component in components {
                    let part = value.component(&component.name);
                    if part.is_null() && !value.is_null() && !component.nullable {
                        return Err(Error::illegal_state(
                            meta.name(),
                            "write",
                            format!(
                                "component '{}.{}' must not be null",
                                field.name, component.name
                            ),
                        ));
                    }
                    columns.push((component.column.clone(), part));
                }
            }
            FieldKind::Collection { .. } => {}
        }
    }

    for member in meta.owning_edges() {
        let edge = &member.edge;
        if meta.table_for(&member.declared_by) != Some(table) || !wanted(&edge.name) {
            continue;
        }
        if let Some(column) = edge.join_column() {
            columns.push((column.to_string(), image.get(&edge.name).clone()));
        }
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::AssociationEdge;
    use crate::descriptor::{EntityDescriptor, IdDescriptor, InheritanceStrategy};
    use crate::field::FieldDescriptor;
    use ormctx_query::StatementKind;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::builder()
            .register(
                EntityDescriptor::root(
                    "Product",
                    InheritanceStrategy::SingleTable {
                        discriminator_column: "product_type".to_string(),
                    },
                )
                .table("products")
                .abstract_type()
                .id(IdDescriptor::new("id", "product_id").identity())
                .field(FieldDescriptor::new("name", "name").not_null())
                .field(FieldDescriptor::embedded(
                    "maker",
                    [("name", "maker_name"), ("country", "maker_country")],
                )),
            )
            .register(
                EntityDescriptor::single_table_child("Book", "Product")
                    .discriminator("B")
                    .field(FieldDescriptor::new("isbn", "isbn")),
            )
            .register(
                EntityDescriptor::new("Review")
                    .table("reviews")
                    .id(IdDescriptor::new("id", "review_id"))
                    .field(FieldDescriptor::new("stars", "stars"))
                    .association(AssociationEdge::to_one("product", "Product", "product_id")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_insert_single_table_with_generated_key() {
        let registry = registry();
        let image = RowImage::new(None)
            .with("name", "Dune")
            .with("isbn", "978")
            .with(
                "maker",
                Value::embedded([("name", Value::from("Chilton")), ("country", Value::Null)]),
            );
        let targets = targets_for(&registry, "Book", &image, WriteScope::Insert).unwrap();
        assert_eq!(targets.len(), 1);
        let Statement::Insert(insert) = &targets[0] else {
            panic!("expected insert");
        };
        assert_eq!(insert.table, "products");
        assert_eq!(insert.generated_key.as_deref(), Some("product_id"));
        assert_eq!(
            targets[0].columns(),
            ["product_type", "name", "maker_name", "maker_country", "isbn"]
        );
        assert_eq!(targets[0].value_of("product_type"), Some(&Value::from("B")));
        assert_eq!(targets[0].value_of("maker_name"), Some(&Value::from("Chilton")));
        assert_eq!(targets[0].value_of("maker_country"), Some(&Value::Null));
    }

    #[test]
    fn test_update_only_changed_members() {
        let registry = registry();
        let image = RowImage::new(Some(Value::BigInt(3)))
            .with("stars", 4)
            .with("product", Value::BigInt(9));
        let changed: BTreeSet<String> = ["product".to_string()].into();
        let targets =
            targets_for(&registry, "Review", &image, WriteScope::Update(&changed)).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].kind(), StatementKind::Update);
        assert_eq!(targets[0].columns(), ["product_id"]);
        assert_eq!(targets[0].value_of("review_id"), Some(&Value::BigInt(3)));

        let nothing = BTreeSet::new();
        assert!(
            targets_for(&registry, "Review", &image, WriteScope::Update(&nothing))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_rejects_null_in_non_nullable_field() {
        let registry = registry();
        let err = targets_for(&registry, "Book", &RowImage::new(None), WriteScope::Insert)
            .unwrap_err();
        assert!(err.is_illegal_state());
    }

    #[test]
    fn test_rejects_abstract_and_keyless_writes() {
        let registry = registry();
        let image = RowImage::new(None).with("name", "x");
        assert!(
            targets_for(&registry, "Product", &image, WriteScope::Insert)
                .unwrap_err()
                .is_illegal_state()
        );
        assert!(
            targets_for(&registry, "Book", &image, WriteScope::Delete)
                .unwrap_err()
                .is_illegal_state()
        );
    }

    #[test]
    fn test_delete_joined_child_first() {
        let registry = SchemaRegistry::builder()
            .register(
                EntityDescriptor::root("Product", InheritanceStrategy::Joined)
                    .table("products")
                    .id(IdDescriptor::new("id", "product_id")),
            )
            .register(EntityDescriptor::joined_child("Book", "Product").table("books"))
            .build()
            .unwrap();
        let image = RowImage::new(Some(Value::BigInt(1)));
        let targets = targets_for(&registry, "Book", &image, WriteScope::Delete).unwrap();
        let tables: Vec<&str> = targets.iter().map(Statement::table).collect();
        assert_eq!(tables, ["books", "products"]);
        assert!(targets.iter().all(|s| s.kind() == StatementKind::Delete));
    }

    fn shirts() -> SchemaRegistry {
        SchemaRegistry::builder()
            .register(
                EntityDescriptor::new("Shirt")
                    .table("shirts")
                    .id(IdDescriptor::new("id", "shirt_id").identity())
                    .field(FieldDescriptor::new("name", "name"))
                    .field(FieldDescriptor::embedded_collection(
                        "sizes",
                        "shirt_sizes",
                        "shirt_id",
                        [("label", "size_label"), ("stock", "stock")],
                    ))
                    .field(FieldDescriptor::collection("tags", "shirt_tags", "shirt_id", "tag")),
            )
            .build()
            .unwrap()
    }

    fn size(label: &str, stock: i64) -> Value {
        Value::embedded([("label", Value::from(label)), ("stock", Value::from(stock))])
    }

    #[test]
    fn test_collection_rows_follow_the_owner_once_keyed() {
        let registry = shirts();
        let image = RowImage::new(None)
            .with("name", "Tee")
            .with("sizes", Value::list([size("S", 3), size("M", 5)]))
            .with("tags", Value::list(["cotton"]));
        let targets = targets_for(&registry, "Shirt", &image, WriteScope::Insert).unwrap();
        assert_eq!(targets.len(), 1);

        let image = RowImage { id: Some(Value::BigInt(4)), ..image };
        let targets = targets_for(&registry, "Shirt", &image, WriteScope::Insert).unwrap();
        let tables: Vec<&str> = targets.iter().map(Statement::table).collect();
        assert_eq!(tables, ["shirts", "shirt_sizes", "shirt_sizes", "shirt_tags"]);
        assert_eq!(targets[2].columns(), ["shirt_id", "size_label", "stock"]);
        assert_eq!(targets[2].value_of("size_label"), Some(&Value::from("M")));
        assert_eq!(targets[3].value_of("tag"), Some(&Value::from("cotton")));
        let Statement::Insert(row) = &targets[1] else {
            panic!("expected insert");
        };
        assert_eq!(row.key, None);
    }

    #[test]
    fn test_changed_collection_is_rewritten() {
        let registry = shirts();
        let image = RowImage::new(Some(Value::BigInt(4)))
            .with("name", "Tee")
            .with("sizes", Value::list([size("L", 1)]));
        let changed: BTreeSet<String> = ["sizes".to_string()].into();
        let targets =
            targets_for(&registry, "Shirt", &image, WriteScope::Update(&changed)).unwrap();
        let kinds: Vec<(StatementKind, &str)> =
            targets.iter().map(|s| (s.kind(), s.table())).collect();
        assert_eq!(
            kinds,
            [
                (StatementKind::Delete, "shirt_sizes"),
                (StatementKind::Insert, "shirt_sizes")
            ]
        );
        assert_eq!(targets[0].value_of("shirt_id"), Some(&Value::BigInt(4)));

        let cleared: BTreeSet<String> = ["tags".to_string()].into();
        let targets =
            targets_for(&registry, "Shirt", &image, WriteScope::Update(&cleared)).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].kind(), StatementKind::Delete);
    }

    #[test]
    fn test_delete_clears_collections_before_the_owner() {
        let registry = shirts();
        let image = RowImage::new(Some(Value::BigInt(4)));
        let targets = targets_for(&registry, "Shirt", &image, WriteScope::Delete).unwrap();
        let tables: Vec<&str> = targets.iter().map(Statement::table).collect();
        assert_eq!(tables, ["shirt_sizes", "shirt_tags", "shirts"]);
    }

    #[test]
    fn test_rejects_null_elements_and_non_lists() {
        let registry = shirts();
        let image = RowImage::new(Some(Value::BigInt(4))).with("tags", Value::list([Value::Null]));
        assert!(
            targets_for(&registry, "Shirt", &image, WriteScope::Insert)
                .unwrap_err()
                .is_illegal_state()
        );
        let image = RowImage::new(Some(Value::BigInt(4))).with("tags", "cotton");
        assert!(
            targets_for(&registry, "Shirt", &image, WriteScope::Insert)
                .unwrap_err()
                .is_illegal_state()
        );
    }
}
