//! Error types for cache and flush operations.

use crate::key::KeyValue;
use std::fmt;

/// Failure reported by a [`BatchExecutor`](crate::BatchExecutor).
///
/// The cache never inspects it; it is carried as the source of
/// [`StatementExecutionError`].
pub type ExecutorError = Box<dyn std::error::Error + Send + Sync>;

/// The primary error type for all cache operations.
#[derive(Debug)]
pub enum Error {
    /// An identity could not be resolved, even after flushing its table
    UnresolvedIdentity(UnresolvedIdentityError),
    /// A batch mixes rows that disagree on a column that cannot be defaulted
    BatchDataInconsistent(BatchDataInconsistentError),
    /// No valid insertion order exists for a set of tables
    CyclicDependency(CyclicDependencyError),
    /// The batch executor failed
    StatementExecution(StatementExecutionError),
    /// A row expected in storage is missing
    EntityNotFound(EntityNotFoundError),
    /// An update was attempted on a row of an immutable table
    ImmutableEntity { table: &'static str, key: KeyValue },
    /// The column does not exist on the entity's table
    UnknownColumn { table: &'static str, column: String },
    /// A non-nullable column has no value in the snapshot or delta
    MissingValue {
        table: &'static str,
        column: &'static str,
    },
    /// The executor returned a generated-key set that cannot be matched to the batch
    GeneratedKeysMismatch {
        table: &'static str,
        expected: usize,
        actual: usize,
    },
    /// The entity is not attached to a live unit of work
    DetachedEntity { table: &'static str },
    /// A freshly inserted row got a key another cached record already holds
    IdentityConflict { table: &'static str, key: KeyValue },
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct UnresolvedIdentityError {
    pub table: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct BatchDataInconsistentError {
    pub table: &'static str,
    /// Columns that some rows set and others omit without a fallback
    pub columns: Vec<&'static str>,
    pub message: String,
}

#[derive(Debug)]
pub struct CyclicDependencyError {
    /// Tables on the cycle, in dependency order, first table repeated at the end
    pub tables: Vec<&'static str>,
}

/// Which kind of statement a [`StatementExecutionError`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Query,
    Insert,
    Update,
    Delete,
    Upsert,
}

#[derive(Debug)]
pub struct StatementExecutionError {
    pub table: &'static str,
    pub statement: StatementKind,
    pub source: ExecutorError,
}

#[derive(Debug)]
pub struct EntityNotFoundError {
    pub table: &'static str,
    pub key: KeyValue,
}

impl Error {
    /// Is this an unresolved identity error?
    pub fn is_unresolved_identity(&self) -> bool {
        matches!(self, Error::UnresolvedIdentity(_))
    }

    /// Is this a batch consistency error?
    pub fn is_batch_inconsistent(&self) -> bool {
        matches!(self, Error::BatchDataInconsistent(_))
    }

    /// Is this a cyclic dependency error?
    pub fn is_cyclic_dependency(&self) -> bool {
        matches!(self, Error::CyclicDependency(_))
    }

    /// Is this an executor failure?
    pub fn is_statement_execution(&self) -> bool {
        matches!(self, Error::StatementExecution(_))
    }

    /// Is this a missing-row error?
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::EntityNotFound(_))
    }

    /// Table the error concerns, when there is exactly one.
    pub fn table(&self) -> Option<&'static str> {
        match self {
            Error::UnresolvedIdentity(e) => Some(e.table),
            Error::BatchDataInconsistent(e) => Some(e.table),
            Error::StatementExecution(e) => Some(e.table),
            Error::EntityNotFound(e) => Some(e.table),
            Error::ImmutableEntity { table, .. }
            | Error::IdentityConflict { table, .. }
            | Error::UnknownColumn { table, .. }
            | Error::MissingValue { table, .. }
            | Error::GeneratedKeysMismatch { table, .. }
            | Error::DetachedEntity { table } => Some(*table),
            Error::CyclicDependency(_) | Error::Custom(_) => None,
        }
    }

    /// Build an [`Error::UnresolvedIdentity`].
    pub fn unresolved(table: &'static str, message: impl Into<String>) -> Self {
        Error::UnresolvedIdentity(UnresolvedIdentityError {
            table,
            message: message.into(),
        })
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatementKind::Query => "query",
            StatementKind::Insert => "insert",
            StatementKind::Update => "update",
            StatementKind::Delete => "delete",
            StatementKind::Upsert => "upsert",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnresolvedIdentity(e) => {
                write!(f, "Unresolved identity in table '{}': {}", e.table, e.message)
            }
            Error::BatchDataInconsistent(e) => write!(
                f,
                "Inconsistent batch for table '{}' (columns: {}): {}",
                e.table,
                e.columns.join(", "),
                e.message
            ),
            Error::CyclicDependency(e) => {
                write!(f, "Cyclic dependency between tables: {}", e.tables.join(" -> "))
            }
            Error::StatementExecution(e) => write!(
                f,
                "Statement execution failed ({} on '{}'): {}",
                e.statement, e.table, e.source
            ),
            Error::EntityNotFound(e) => {
                write!(f, "Entity not found: {} with key {}", e.table, e.key)
            }
            Error::ImmutableEntity { table, key } => {
                write!(f, "Cannot update immutable entity {} with key {}", table, key)
            }
            Error::UnknownColumn { table, column } => {
                write!(f, "Unknown column '{}' on table '{}'", column, table)
            }
            Error::MissingValue { table, column } => write!(
                f,
                "Column '{}.{}' has no value and is not nullable",
                table, column
            ),
            Error::GeneratedKeysMismatch {
                table,
                expected,
                actual,
            } => write!(
                f,
                "Batch insert into '{}' returned {} generated rows for {} inserted rows",
                table, actual, expected
            ),
            Error::DetachedEntity { table } => {
                write!(f, "Entity of table '{}' is not attached to a unit of work", table)
            }
            Error::IdentityConflict { table, key } => write!(
                f,
                "Inserted row {} with key {} is already cached as another entity",
                table, key
            ),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::StatementExecution(e) => Some(&*e.source as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
