//! Entity descriptors: the static, per-type mapping metadata.

use crate::association::AssociationEdge;
use crate::field::FieldDescriptor;
use ormctx_core::Value;
use serde::{Deserialize, Serialize};

/// Semantic type of a primary key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    #[default]
    Integer,
    Text,
    Uuid,
}

impl KeyType {
    /// Check whether a value can serve as a key of this type.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            KeyType::Integer => matches!(value, Value::Int(_) | Value::BigInt(_)),
            KeyType::Text => matches!(value, Value::Text(_)),
            KeyType::Uuid => matches!(value, Value::Uuid(_)),
        }
    }
}

/// How primary-key values are produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdGeneration {
    /// The caller sets the key before persisting.
    #[default]
    Assigned,
    /// The store generates the key on INSERT (auto-increment).
    Identity,
    /// The key is drawn from a named store sequence at persist time.
    Sequence(String),
}

/// Primary-key field of a hierarchy root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdDescriptor {
    pub field: String,
    pub column: String,
    #[serde(default, rename = "type")]
    pub key_type: KeyType,
    #[serde(default)]
    pub generation: IdGeneration,
}

impl IdDescriptor {
    pub fn new(field: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            column: column.into(),
            key_type: KeyType::Integer,
            generation: IdGeneration::Assigned,
        }
    }

    pub fn key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = key_type;
        self
    }

    /// Use a store-generated identity column.
    pub fn identity(mut self) -> Self {
        self.generation = IdGeneration::Identity;
        self
    }

    /// Draw keys from the named sequence.
    pub fn sequence(mut self, name: impl Into<String>) -> Self {
        self.generation = IdGeneration::Sequence(name.into());
        self
    }
}

/// Physical layout of an inheritance hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InheritanceStrategy {
    /// Not part of a hierarchy.
    #[default]
    None,
    /// One table for the whole hierarchy, rows tagged by a discriminator column.
    SingleTable { discriminator_column: String },
    /// Root table plus one table per subtype sharing the primary key.
    Joined,
    /// One complete table per concrete type.
    TablePerClass,
}

impl InheritanceStrategy {
    pub const fn name(&self) -> &'static str {
        match self {
            InheritanceStrategy::None => "none",
            InheritanceStrategy::SingleTable { .. } => "single_table",
            InheritanceStrategy::Joined => "joined",
            InheritanceStrategy::TablePerClass => "table_per_class",
        }
    }
}

/// Placement of an entity type within its hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InheritanceRole {
    Root(InheritanceStrategy),
    SingleTableChild { parent: String },
    JoinedChild { parent: String },
    ConcreteTableChild { parent: String },
}

impl Default for InheritanceRole {
    fn default() -> Self {
        InheritanceRole::Root(InheritanceStrategy::None)
    }
}

impl InheritanceRole {
    /// Parent type name, for non-root roles.
    pub fn parent(&self) -> Option<&str> {
        match self {
            InheritanceRole::Root(_) => None,
            InheritanceRole::SingleTableChild { parent }
            | InheritanceRole::JoinedChild { parent }
            | InheritanceRole::ConcreteTableChild { parent } => Some(parent),
        }
    }

    /// Check whether a child role belongs under `strategy`.
    pub fn fits(&self, strategy: &InheritanceStrategy) -> bool {
        matches!(
            (self, strategy),
            (InheritanceRole::Root(_), _)
                | (
                    InheritanceRole::SingleTableChild { .. },
                    InheritanceStrategy::SingleTable { .. }
                )
                | (InheritanceRole::JoinedChild { .. }, InheritanceStrategy::Joined)
                | (
                    InheritanceRole::ConcreteTableChild { .. },
                    InheritanceStrategy::TablePerClass
                )
        )
    }
}

/// Static mapping metadata for one entity type.
///
/// Only the fields and associations the type itself declares are listed;
/// inherited members are resolved by the registry.
///
/// ```
/// use ormctx_schema::{EntityDescriptor, FieldDescriptor, IdDescriptor};
///
/// let member = EntityDescriptor::new("Member")
///     .table("members")
///     .id(IdDescriptor::new("id", "member_id").identity())
///     .field(FieldDescriptor::new("name", "name"));
/// assert_eq!(member.name, "Member");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    #[serde(default)]
    pub table: Option<String>,
    /// Present on hierarchy roots only.
    #[serde(default)]
    pub id: Option<IdDescriptor>,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub associations: Vec<AssociationEdge>,
    #[serde(default)]
    pub role: InheritanceRole,
    /// Single-table discriminator value; defaults to the type name.
    #[serde(default)]
    pub discriminator: Option<String>,
    /// Abstract types are never instantiated on their own.
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
}

impl EntityDescriptor {
    /// A standalone (non-inherited) entity type.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            id: None,
            fields: Vec::new(),
            associations: Vec::new(),
            role: InheritanceRole::default(),
            discriminator: None,
            is_abstract: false,
        }
    }

    /// Root of a hierarchy mapped with `strategy`.
    pub fn root(name: impl Into<String>, strategy: InheritanceStrategy) -> Self {
        Self {
            role: InheritanceRole::Root(strategy),
            ..Self::new(name)
        }
    }

    /// Subtype of `parent` sharing its single table.
    pub fn single_table_child(name: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            role: InheritanceRole::SingleTableChild {
                parent: parent.into(),
            },
            ..Self::new(name)
        }
    }

    /// Subtype of `parent` with its own joined table.
    pub fn joined_child(name: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            role: InheritanceRole::JoinedChild {
                parent: parent.into(),
            },
            ..Self::new(name)
        }
    }

    /// Concrete subtype of `parent` with its own complete table.
    pub fn concrete_table_child(name: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            role: InheritanceRole::ConcreteTableChild {
                parent: parent.into(),
            },
            ..Self::new(name)
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn id(mut self, id: IdDescriptor) -> Self {
        self.id = Some(id);
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn association(mut self, edge: AssociationEdge) -> Self {
        self.associations.push(edge);
        self
    }

    pub fn discriminator(mut self, value: impl Into<String>) -> Self {
        self.discriminator = Some(value.into());
        self
    }

    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_type_accepts() {
        assert!(KeyType::Integer.accepts(&Value::BigInt(1)));
        assert!(KeyType::Integer.accepts(&Value::Int(1)));
        assert!(!KeyType::Integer.accepts(&Value::from("1")));
        assert!(KeyType::Text.accepts(&Value::from("a")));
        assert!(KeyType::Uuid.accepts(&Value::Uuid([0; 16])));
        assert!(!KeyType::Uuid.accepts(&Value::Null));
    }

    #[test]
    fn test_role_fits_strategy() {
        let single = InheritanceStrategy::SingleTable {
            discriminator_column: "dtype".to_string(),
        };
        let child = InheritanceRole::SingleTableChild {
            parent: "Product".to_string(),
        };
        assert!(child.fits(&single));
        assert!(!child.fits(&InheritanceStrategy::Joined));
        assert_eq!(child.parent(), Some("Product"));
        assert_eq!(InheritanceRole::default().parent(), None);
    }

    #[test]
    fn test_descriptor_from_json() {
        let json = r#"{
            "name": "Product",
            "table": "products",
            "abstract": true,
            "id": {"field": "id", "column": "product_id", "generation": {"sequence": "product_seq"}},
            "role": {"root": {"single_table": {"discriminator_column": "product_type"}}},
            "fields": [{"name": "name", "column": "name"}]
        }"#;
        let desc: EntityDescriptor = serde_json::from_str(json).unwrap();
        assert!(desc.is_abstract);
        assert_eq!(
            desc.id.as_ref().map(|id| id.generation.clone()),
            Some(IdGeneration::Sequence("product_seq".to_string()))
        );
        assert_eq!(desc.role.parent(), None);
        assert_eq!(desc.fields.len(), 1);
    }
}
