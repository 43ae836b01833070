//! Error types for persistence-context operations.
//!
//! Lifecycle and identity violations ([`Error::DuplicateKey`],
//! [`Error::IllegalState`]) are raised at the call that caused them. Write
//! failures only ever surface from a flush, wrapped in [`Error::Flush`] with
//! the key of the entity whose statement failed.

use crate::key::EntityKey;
use std::fmt;
use thiserror::Error;

/// Result type for persistence-context operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The primary error type.
#[derive(Debug, Error)]
pub enum Error {
    /// The identity map already binds this key to a different instance.
    #[error("duplicate key: {key} is already bound to a different instance")]
    DuplicateKey {
        /// The contested key.
        key: EntityKey,
    },

    /// An operation was attempted on an entity in an incompatible lifecycle state.
    #[error("illegal state: cannot {operation} {entity}: {reason}")]
    IllegalState {
        /// Entity type name.
        entity: String,
        /// The attempted operation.
        operation: &'static str,
        /// Why the operation is not allowed.
        reason: String,
    },

    /// A load or merge target row does not exist.
    #[error("entity not found: {entity} with id {id}")]
    EntityNotFound {
        /// Entity type name.
        entity: String,
        /// Rendered primary-key value.
        id: String,
    },

    /// A physical write failed during flush.
    #[error("flush failed for {key}: {source}")]
    Flush {
        /// Key of the entity whose statement failed.
        key: EntityKey,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Schema registration or lookup error.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Storage collaborator error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Value conversion error.
    #[error(transparent)]
    Type(#[from] TypeError),

    /// Custom error with message.
    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// Build an [`Error::IllegalState`].
    pub fn illegal_state(
        entity: impl Into<String>,
        operation: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Error::IllegalState {
            entity: entity.into(),
            operation,
            reason: reason.into(),
        }
    }

    /// Wrap a write failure with the key of the entity being flushed.
    pub fn flush(key: EntityKey, source: Error) -> Self {
        Error::Flush {
            key,
            source: Box::new(source),
        }
    }

    /// The failing entity key, for flush errors.
    pub fn flush_key(&self) -> Option<&EntityKey> {
        match self {
            Error::Flush { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Check whether this is (or wraps) an illegal-state error.
    pub fn is_illegal_state(&self) -> bool {
        match self {
            Error::IllegalState { .. } => true,
            Error::Flush { source, .. } => source.is_illegal_state(),
            _ => false,
        }
    }

    /// Check whether the store rejected a write on a constraint.
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            Error::Storage(e) => e.kind == StorageErrorKind::Constraint,
            Error::Flush { source, .. } => source.is_constraint_violation(),
            _ => false,
        }
    }
}

/// Schema registration and lookup errors.
#[derive(Debug, Error)]
#[error("schema error ({kind:?}): {message}")]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

impl SchemaError {
    pub fn new(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Entity type was never registered.
    UnknownEntity,
    /// Field or association name does not exist on the entity type.
    UnknownMember,
    /// Two descriptors share a name, or two members share a column.
    Duplicate,
    /// Table or column name is not a valid identifier.
    InvalidIdentifier,
    /// Inheritance roles do not agree with the hierarchy's strategy.
    InheritanceMismatch,
    /// The primary-key generator is not allowed for this hierarchy.
    IdGenerator,
    /// Root descriptor has no primary key.
    MissingPrimaryKey,
    /// Association edge is inconsistent with its target.
    InvalidAssociation,
    /// Schema document could not be parsed.
    Config,
    /// The process-wide registry was already installed.
    AlreadyInstalled,
}

/// Errors reported by the storage collaborator.
#[derive(Debug, Error)]
#[error("storage error ({kind:?}): {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
    /// Rendered statement, when one was being executed.
    pub sql: Option<String>,
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            sql: None,
        }
    }

    /// Attach the statement text being executed.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Constraint violation (unique, primary key, foreign key).
    Constraint,
    /// An UPDATE or DELETE matched no row.
    StaleRow,
    /// Table or sequence does not exist.
    NotFound,
    /// Transaction primitive used out of order.
    Transaction,
    /// Other store failure.
    Database,
}

/// Value conversion error.
#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type error: expected {}, found {}", self.expected, self.actual)?;
        if let Some(col) = &self.column {
            write!(f, " in column '{}'", col)?;
        }
        Ok(())
    }
}

impl std::error::Error for TypeError {}
