//! Core types and traits for entcache.
//!
//! This crate provides the plain-data vocabulary the unit-of-work cache is
//! built on:
//!
//! - `Value` for dynamically typed column values
//! - `KeyValue` for resolved identity keys
//! - `ColumnDef` / `TableDef` descriptors for cached tables
//! - `BatchExecutor`, the storage collaborator the flush engine drives
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod column;
pub mod error;
pub mod executor;
pub mod key;
pub mod table;
pub mod types;
pub mod value;

pub use column::{ColumnDef, ForeignKey};
pub use error::{
    BatchDataInconsistentError, CyclicDependencyError, EntityNotFoundError, Error, ExecutorError,
    Result, StatementExecutionError, StatementKind, UnresolvedIdentityError,
};
pub use executor::{BatchExecutor, ColumnValues};
pub use key::{KeyKind, KeyValue};
pub use table::{TableDef, TableRef};
pub use types::SqlType;
pub use value::Value;
