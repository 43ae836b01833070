//! Persistent field descriptors.

use serde::{Deserialize, Serialize};

/// One component of an embedded value object, mapped to its own column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    pub name: String,
    pub column: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

/// How a field maps onto columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// A single column.
    #[default]
    Scalar,
    /// A value object flattened into one column per component.
    Embedded { components: Vec<ComponentDescriptor> },
    /// Values kept in their own table, one row per element, keyed by the
    /// owner's id in `join_column`.
    ///
    /// Elements are scalars stored in the field's `column`, or value objects
    /// spread over `components`. The whole collection is compared by value
    /// and rewritten when it changes.
    Collection {
        table: String,
        join_column: String,
        #[serde(default)]
        components: Vec<ComponentDescriptor>,
    },
}

/// Metadata about a persistent field.
///
/// ```
/// use ormctx_schema::FieldDescriptor;
///
/// let name = FieldDescriptor::new("name", "member_name").not_null();
/// assert_eq!(name.columns(), vec!["member_name"]);
///
/// let price = FieldDescriptor::embedded(
///     "price",
///     [("amount", "price_amount"), ("currency", "price_currency")],
/// );
/// assert_eq!(price.columns(), vec!["price_amount", "price_currency"]);
///
/// let tags = FieldDescriptor::collection("tags", "product_tags", "product_id", "tag");
/// assert!(tags.columns().is_empty());
/// assert_eq!(tags.collection_table(), Some("product_tags"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Field name on the entity.
    pub name: String,
    /// Column name (unused for embedded fields and value-object collections).
    #[serde(default)]
    pub column: String,
    /// Whether NULL is an acceptable value.
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub kind: FieldKind,
}

fn default_nullable() -> bool {
    true
}

impl FieldDescriptor {
    /// Scalar field stored in `column`.
    pub fn new(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            nullable: true,
            kind: FieldKind::Scalar,
        }
    }

    /// Embedded value object with `(component, column)` pairs.
    pub fn embedded<N, C, I>(name: impl Into<String>, components: I) -> Self
    where
        N: Into<String>,
        C: Into<String>,
        I: IntoIterator<Item = (N, C)>,
    {
        Self {
            name: name.into(),
            column: String::new(),
            nullable: true,
            kind: FieldKind::Embedded {
                components: components
                    .into_iter()
                    .map(|(n, c)| ComponentDescriptor {
                        name: n.into(),
                        column: c.into(),
                        nullable: true,
                    })
                    .collect(),
            },
        }
    }

    /// Collection of scalars stored as `(join_column, column)` rows of `table`.
    pub fn collection(
        name: impl Into<String>,
        table: impl Into<String>,
        join_column: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            nullable: true,
            kind: FieldKind::Collection {
                table: table.into(),
                join_column: join_column.into(),
                components: Vec::new(),
            },
        }
    }

    /// Collection of value objects, one `table` row per element with a
    /// column per `(component, column)` pair.
    pub fn embedded_collection<N, C, I>(
        name: impl Into<String>,
        table: impl Into<String>,
        join_column: impl Into<String>,
        components: I,
    ) -> Self
    where
        N: Into<String>,
        C: Into<String>,
        I: IntoIterator<Item = (N, C)>,
    {
        Self {
            name: name.into(),
            column: String::new(),
            nullable: true,
            kind: FieldKind::Collection {
                table: table.into(),
                join_column: join_column.into(),
                components: components
                    .into_iter()
                    .map(|(n, c)| ComponentDescriptor {
                        name: n.into(),
                        column: c.into(),
                        nullable: true,
                    })
                    .collect(),
            },
        }
    }

    /// Reject NULL values for this field.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self.kind, FieldKind::Embedded { .. })
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, FieldKind::Collection { .. })
    }

    /// Embedded components, of the field or of each collection element.
    pub fn components(&self) -> &[ComponentDescriptor] {
        match &self.kind {
            FieldKind::Scalar => &[],
            FieldKind::Embedded { components } | FieldKind::Collection { components, .. } => {
                components
            }
        }
    }

    /// Columns this field occupies in the owner's table.
    pub fn columns(&self) -> Vec<&str> {
        match &self.kind {
            FieldKind::Scalar => vec![self.column.as_str()],
            FieldKind::Embedded { components } => {
                components.iter().map(|c| c.column.as_str()).collect()
            }
            FieldKind::Collection { .. } => Vec::new(),
        }
    }

    /// Table holding the elements of a collection field.
    pub fn collection_table(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::Collection { table, .. } => Some(table),
            _ => None,
        }
    }

    /// Columns of the collection table, join column first.
    pub fn collection_columns(&self) -> Vec<&str> {
        let FieldKind::Collection {
            join_column,
            components,
            ..
        } = &self.kind
        else {
            return Vec::new();
        };
        let mut columns = vec![join_column.as_str()];
        if components.is_empty() {
            columns.push(self.column.as_str());
        } else {
            columns.extend(components.iter().map(|c| c.column.as_str()));
        }
        columns
    }
}
