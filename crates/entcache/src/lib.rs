//! entcache - entity identity cache and write batching for Rust ORMs.
//!
//! entcache provides the unit-of-work layer an ORM needs between its entity
//! objects and the database:
//!
//! - One record per identity within a transaction
//! - Identities that resolve lazily once their insert runs
//! - Batched inserts in foreign key order, including self-referencing rows
//! - Batched updates grouped by changed columns
//! - Memoized relationship queries with write-driven invalidation
//! - Change events for created, updated and removed records
//!
//! SQL generation is left to the host: everything that touches storage goes
//! through a [`BatchExecutor`].
//!
//! # Quick Start
//!
//! ```ignore
//! use entcache::prelude::*;
//!
//! static USERS: TableDef = TableDef::new(
//!     "users",
//!     &[
//!         ColumnDef::new("id", SqlType::BigInt).primary_key(true).auto_increment(true),
//!         ColumnDef::new("name", SqlType::Text),
//!     ],
//! );
//!
//! async fn example(cx: &Cx, executor: impl BatchExecutor) -> Outcome<(), Error> {
//!     let uow = UnitOfWork::new(executor);
//!     let ann = match uow.create(&USERS, [("name", "Ann")]) {
//!         Ok(entity) => entity,
//!         Err(e) => return Outcome::Err(e),
//!     };
//!
//!     // Reading the key flushes the pending insert
//!     let id = ann.get(cx, &uow, "id").await;
//!
//!     uow.before_commit(cx).await.map(|_| ())
//! }
//! ```

// Re-export asupersync primitives
pub use asupersync::{Cx, Outcome};

pub use entcache_core::{
    BatchDataInconsistentError, BatchExecutor, ColumnDef, ColumnValues, CyclicDependencyError,
    EntityNotFoundError, Error, ExecutorError, ForeignKey, KeyKind, KeyValue, Result, SqlType,
    StatementExecutionError, StatementKind, TableDef, TableRef, UnresolvedIdentityError, Value,
};

pub use entcache_session::{
    CacheConfig, ChangeEvent, ChangeKind, ChangeNotifier, ColumnRef, DependencySorter, Entity,
    EntityId, EntityState, FieldValue, IdentityKey, IdentityMap, NestedGuard, ReferrerCache,
    SharedCache, Statement, Subscriber, SubscriberRegistry, SubscriptionId, UnitOfWork,
    UnitOfWorkBuilder, UnitOfWorkId, UpdateBatch, sort_tables,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use entcache::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        BatchExecutor,
        CacheConfig,
        ChangeEvent,
        ChangeKind,
        ColumnDef,
        ColumnValues,
        Cx,
        Entity,
        EntityId,
        EntityState,
        Error,
        ExecutorError,
        FieldValue,
        KeyValue,
        Outcome,
        SqlType,
        Statement,
        StatementKind,
        SubscriberRegistry,
        TableDef,
        TableRef,
        UnitOfWork,
        Value,
    };
}
