//! Core types for ormctx.
//!
//! This crate provides the foundational vocabulary shared by every layer of
//! the persistence context:
//!
//! - `Value` for column values, including embedded value objects
//! - `Row` for tabular results handed back by the store
//! - `EntityKey` for row identity within a unit of work
//! - `Error` for the error taxonomy

pub mod error;
pub mod identifiers;
pub mod key;
pub mod row;
pub mod value;

pub use error::{
    Error, Result, SchemaError, SchemaErrorKind, StorageError, StorageErrorKind, TypeError,
};
pub use identifiers::{is_valid_identifier, quote_ident};
pub use key::{EntityKey, KeyId};
pub use row::{ColumnInfo, Row};
pub use value::Value;
