//! Association edges between entity types.
//!
//! An edge is directed: it lives on the owning entity type and names a target
//! type. For a bidirectional pair exactly one side is [`AssociationSide::Owning`]
//! and carries the join column; the other side is
//! [`AssociationSide::Inverse`] and is never written by a flush.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cardinality of an association edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    ToOne,
    ToMany,
}

/// A single operation that may cascade along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeType {
    Persist,
    Remove,
    Merge,
    Refresh,
    Detach,
    /// Every operation above.
    All,
}

impl CascadeType {
    const fn bits(self) -> u8 {
        match self {
            CascadeType::Persist => 1,
            CascadeType::Remove => 1 << 1,
            CascadeType::Merge => 1 << 2,
            CascadeType::Refresh => 1 << 3,
            CascadeType::Detach => 1 << 4,
            CascadeType::All => 0b1_1111,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            CascadeType::Persist => "persist",
            CascadeType::Remove => "remove",
            CascadeType::Merge => "merge",
            CascadeType::Refresh => "refresh",
            CascadeType::Detach => "detach",
            CascadeType::All => "all",
        }
    }
}

/// Set of operations that cascade along an edge.
///
/// ```
/// use ormctx_schema::{CascadePolicy, CascadeType};
///
/// let policy = CascadePolicy::PERSIST.with(CascadeType::Remove);
/// assert!(policy.includes(CascadeType::Persist));
/// assert!(policy.includes(CascadeType::Remove));
/// assert!(!policy.includes(CascadeType::Merge));
/// assert!(CascadePolicy::ALL.includes(CascadeType::Detach));
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<CascadeType>", into = "Vec<CascadeType>")]
pub struct CascadePolicy(u8);

impl CascadePolicy {
    pub const NONE: Self = Self(0);
    pub const PERSIST: Self = Self(CascadeType::Persist.bits());
    pub const REMOVE: Self = Self(CascadeType::Remove.bits());
    pub const MERGE: Self = Self(CascadeType::Merge.bits());
    pub const REFRESH: Self = Self(CascadeType::Refresh.bits());
    pub const DETACH: Self = Self(CascadeType::Detach.bits());
    pub const ALL: Self = Self(CascadeType::All.bits());

    /// Add an operation to the set.
    pub const fn with(self, op: CascadeType) -> Self {
        Self(self.0 | op.bits())
    }

    /// Check whether `op` cascades under this policy.
    pub const fn includes(self, op: CascadeType) -> bool {
        let bits = op.bits();
        self.0 & bits == bits
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl From<Vec<CascadeType>> for CascadePolicy {
    fn from(ops: Vec<CascadeType>) -> Self {
        ops.into_iter().fold(Self::NONE, Self::with)
    }
}

impl From<CascadePolicy> for Vec<CascadeType> {
    fn from(policy: CascadePolicy) -> Self {
        if policy == CascadePolicy::ALL {
            return vec![CascadeType::All];
        }
        [
            CascadeType::Persist,
            CascadeType::Remove,
            CascadeType::Merge,
            CascadeType::Refresh,
            CascadeType::Detach,
        ]
        .into_iter()
        .filter(|op| policy.includes(*op))
        .collect()
    }
}

impl fmt::Debug for CascadePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ops: Vec<CascadeType> = (*self).into();
        let names: Vec<&str> = ops.iter().map(|op| op.as_str()).collect();
        write!(f, "CascadePolicy[{}]", names.join(", "))
    }
}

/// When an association is read from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchPolicy {
    /// Loaded together with the owning instance.
    Eager,
    /// Loaded on request.
    Lazy,
}

/// Which side of a relationship an edge is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationSide {
    /// Holds the foreign key in `join_column` of the declaring type's table.
    Owning { join_column: String },
    /// Mirrors the owning edge named `mapped_by` on the target type.
    Inverse { mapped_by: String },
}

/// A directed relationship from the declaring entity type to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationEdge {
    pub name: String,
    pub target: String,
    pub cardinality: Cardinality,
    pub side: AssociationSide,
    #[serde(default)]
    pub cascade: CascadePolicy,
    #[serde(default)]
    pub orphan_removal: bool,
    /// Defaults to eager for ToOne and lazy for ToMany.
    #[serde(default)]
    pub fetch: Option<FetchPolicy>,
}

impl AssociationEdge {
    /// Owning ToOne edge whose foreign key lives in `join_column`.
    pub fn to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        join_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            cardinality: Cardinality::ToOne,
            side: AssociationSide::Owning {
                join_column: join_column.into(),
            },
            cascade: CascadePolicy::NONE,
            orphan_removal: false,
            fetch: None,
        }
    }

    /// Inverse ToOne edge mirroring `mapped_by` on the target.
    pub fn to_one_inverse(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        Self {
            cardinality: Cardinality::ToOne,
            side: AssociationSide::Inverse {
                mapped_by: mapped_by.into(),
            },
            ..Self::to_one(name, target, String::new())
        }
    }

    /// Inverse ToMany collection mirroring `mapped_by` on the target.
    pub fn to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        Self {
            cardinality: Cardinality::ToMany,
            ..Self::to_one_inverse(name, target, mapped_by)
        }
    }

    /// Set the cascade policy.
    pub fn cascade(mut self, cascade: CascadePolicy) -> Self {
        self.cascade = cascade;
        self
    }

    /// Remove associated instances once they are unlinked from this edge.
    pub fn orphan_removal(mut self, value: bool) -> Self {
        self.orphan_removal = value;
        self
    }

    /// Override the fetch policy.
    pub fn fetch(mut self, fetch: FetchPolicy) -> Self {
        self.fetch = Some(fetch);
        self
    }

    /// Effective fetch policy.
    pub fn fetch_policy(&self) -> FetchPolicy {
        self.fetch.unwrap_or(match self.cardinality {
            Cardinality::ToOne => FetchPolicy::Eager,
            Cardinality::ToMany => FetchPolicy::Lazy,
        })
    }

    pub fn is_owning(&self) -> bool {
        matches!(self.side, AssociationSide::Owning { .. })
    }

    pub fn is_to_many(&self) -> bool {
        self.cardinality == Cardinality::ToMany
    }

    /// Foreign-key column, for owning edges.
    pub fn join_column(&self) -> Option<&str> {
        match &self.side {
            AssociationSide::Owning { join_column } => Some(join_column),
            AssociationSide::Inverse { .. } => None,
        }
    }

    /// Name of the mirrored owning edge, for inverse edges.
    pub fn mapped_by(&self) -> Option<&str> {
        match &self.side {
            AssociationSide::Owning { .. } => None,
            AssociationSide::Inverse { mapped_by } => Some(mapped_by),
        }
    }

    /// Check whether `op` cascades along this edge.
    pub fn cascades(&self, op: CascadeType) -> bool {
        self.cascade.includes(op)
    }
}
