//! Unit of Work cache.
//!
//! A [`UnitOfWork`] is bound to one logical transaction. Within it every
//! identity maps to at most one [`Entity`], new records wait in per-table
//! pending-insert lists until a flush, and relationship query results are
//! memoized until a write to a related table invalidates them.
//!
//! # Example
//!
//! ```ignore
//! let uow = UnitOfWork::new(executor);
//!
//! let ann = uow.create(&USERS, [("name", FieldValue::from("Ann"))])?;
//! let post = uow.create(&POSTS, [("author_id", FieldValue::from(&ann))])?;
//!
//! // Inserts users first, then posts, resolving the reference
//! uow.flush(&cx, None).await;
//! ```
//!
//! All state lives behind interior mutability so the unit of work can be
//! shared by reference across suspension points; callers keep one writer
//! at a time.

use crate::CacheConfig;
use crate::entity::{Entity, EntityState, FieldValue};
use crate::identity::EntityId;
use crate::identity_map::IdentityMap;
use crate::notifier::{ChangeEvent, ChangeKind, ChangeNotifier, SubscriberRegistry};
use crate::referrers::{ColumnRef, ReferrerCache};
use crate::shared_cache::SharedCache;
use entcache_core::{
    BatchExecutor, ColumnValues, Cx, Error, ExecutorError, KeyValue, Outcome,
    StatementExecutionError, StatementKind, TableRef,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

static NEXT_UNIT_OF_WORK: AtomicU64 = AtomicU64::new(1);

/// Identifier carried by every change event of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitOfWorkId(u64);

impl UnitOfWorkId {
    pub(crate) fn next() -> Self {
        Self(NEXT_UNIT_OF_WORK.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitOfWorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uow-{}", self.0)
    }
}

/// State entities point back at.
///
/// Lock order: `map` before any entity, `map` before `referrers`. No
/// entity lock is held while taking `map`.
pub(crate) struct CacheCore {
    pub(crate) id: UnitOfWorkId,
    pub(crate) map: Mutex<IdentityMap>,
    pub(crate) referrers: Mutex<ReferrerCache>,
    pub(crate) notifier: ChangeNotifier,
}

/// Wrap an executor failure into [`Error::StatementExecution`].
pub(crate) fn lift<T>(
    outcome: Outcome<T, ExecutorError>,
    table: &'static str,
    statement: StatementKind,
) -> Outcome<T, Error> {
    match outcome {
        Outcome::Ok(v) => Outcome::Ok(v),
        Outcome::Err(source) => Outcome::Err(Error::StatementExecution(StatementExecutionError {
            table,
            statement,
            source,
        })),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

/// Identity-mapped entity cache for one logical transaction.
pub struct UnitOfWork<E: BatchExecutor> {
    core: Arc<CacheCore>,
    executor: E,
    config: CacheConfig,
    shared: Arc<SharedCache>,
    depth: AtomicUsize,
}

/// Builder for [`UnitOfWork`].
pub struct UnitOfWorkBuilder<E: BatchExecutor> {
    executor: E,
    config: CacheConfig,
    registry: Option<Arc<SubscriberRegistry>>,
    shared: Option<Arc<SharedCache>>,
}

impl<E: BatchExecutor> UnitOfWorkBuilder<E> {
    /// Set the cache configuration.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Dispatch change events to this registry instead of the global one.
    pub fn registry(mut self, registry: Arc<SubscriberRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use this shared cache instead of the global one.
    pub fn shared_cache(mut self, shared: Arc<SharedCache>) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Build the unit of work.
    pub fn build(self) -> UnitOfWork<E> {
        let id = UnitOfWorkId::next();
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::clone(SubscriberRegistry::global()));
        let shared = self
            .shared
            .unwrap_or_else(|| Arc::clone(SharedCache::global()));
        tracing::debug!(unit_of_work = %id, "Unit of work opened");

        UnitOfWork {
            core: Arc::new(CacheCore {
                id,
                map: Mutex::new(IdentityMap::new()),
                referrers: Mutex::new(ReferrerCache::new()),
                notifier: ChangeNotifier::new(id, registry, self.config.keep_event_log),
            }),
            executor: self.executor,
            config: self.config,
            shared,
            depth: AtomicUsize::new(0),
        }
    }
}

impl<E: BatchExecutor> UnitOfWork<E> {
    /// Create a unit of work with the default configuration, the global
    /// subscriber registry and the global shared cache.
    pub fn new(executor: E) -> Self {
        Self::builder(executor).build()
    }

    /// Start configuring a unit of work.
    pub fn builder(executor: E) -> UnitOfWorkBuilder<E> {
        UnitOfWorkBuilder {
            executor,
            config: CacheConfig::default(),
            registry: None,
            shared: None,
        }
    }

    /// Identifier of this unit of work.
    pub fn id(&self) -> UnitOfWorkId {
        self.core.id
    }

    /// The batch executor.
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// The cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The subscriber registry change events go to.
    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        self.core.notifier.registry()
    }

    /// The shared cache for immutable tables.
    pub fn shared_cache(&self) -> &Arc<SharedCache> {
        &self.shared
    }

    pub(crate) fn core(&self) -> &Arc<CacheCore> {
        &self.core
    }

    pub(crate) fn depth(&self) -> &AtomicUsize {
        &self.depth
    }

    // ==================== Records ====================

    /// Queue a new record for insertion. No statement runs until a flush.
    pub fn schedule_insert(&self, entity: &Entity) -> Result<(), Error> {
        let table = entity.table();
        if entity.state() != EntityState::New {
            return Err(Error::Custom(format!(
                "Only new entities can be scheduled for insert, got {:?} {}",
                entity.state(),
                entity.id()
            )));
        }
        if entity.attached_to(&self.core) == Some(false) {
            return Err(Error::Custom(format!(
                "Entity {} belongs to another unit of work",
                entity.id()
            )));
        }

        {
            let mut map = self.core.map.lock();
            if let Some(key) = entity.id().value() {
                if map.get(table.name, key).is_some_and(|e| !Entity::ptr_eq(&e, entity)) {
                    return Err(Error::Custom(format!(
                        "Another entity is already cached as {}",
                        entity.id()
                    )));
                }
            }
            map.schedule_insert(entity);
        }
        entity.attach(&self.core);
        tracing::trace!(entity = %entity.id(), "Insert scheduled");
        Ok(())
    }

    /// Build a new record from column values and schedule its insert.
    pub fn create<I, V>(&self, table: TableRef, values: I) -> Result<Entity, Error>
    where
        I: IntoIterator<Item = (&'static str, V)>,
        V: Into<FieldValue>,
    {
        let entity = Entity::new(table);
        for (column, value) in values {
            entity.set(column, value)?;
        }
        self.schedule_insert(&entity)?;
        Ok(entity)
    }

    /// Look up a cached record, including pending inserts with a known key.
    pub fn find(&self, table: TableRef, key: &KeyValue) -> Option<Entity> {
        self.core.map.lock().get(table.name, key)
    }

    /// Check if a record is waiting in its table's pending-insert list.
    pub fn is_pending_insert(&self, entity: &Entity) -> bool {
        self.core
            .map
            .lock()
            .pending(entity.table().name)
            .iter()
            .any(|e| Entity::ptr_eq(e, entity))
    }

    /// Return the cached record for `key`, or materialize it from the row
    /// the loader produces.
    ///
    /// The loader runs at most once per miss. Rows of immutable tables are
    /// served from, and stored into, the shared cache.
    pub async fn find_or_create<F, Fut>(
        &self,
        table: TableRef,
        key: KeyValue,
        loader: F,
    ) -> Outcome<Option<Entity>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<Option<ColumnValues>, Error>>,
    {
        if let Some(entity) = self.find(table, &key) {
            return Outcome::Ok(Some(entity));
        }

        if table.immutable {
            if let Some(row) = self.shared.get(table.name, &key) {
                tracing::trace!(table = table.name, key = %key, "Shared cache hit");
                return Outcome::Ok(Some(self.materialize(table, key, row)));
            }
        }

        let Some(row) = try_outcome!(loader().await) else {
            return Outcome::Ok(None);
        };
        if table.immutable {
            self.shared.put(table.name, key.clone(), row.clone());
        }
        Outcome::Ok(Some(self.materialize(table, key, row)))
    }

    /// Load a record through the executor's `select`, using the cache first.
    pub async fn load(
        &self,
        cx: &Cx,
        table: TableRef,
        key: KeyValue,
    ) -> Outcome<Option<Entity>, Error> {
        let lookup = key.clone();
        self.find_or_create(table, key, || async move {
            lift(
                self.executor.select(cx, table, &lookup).await,
                table.name,
                StatementKind::Query,
            )
        })
        .await
    }

    /// Materialize a row loaded by a query.
    ///
    /// Returns the cached record when one exists, refreshing its snapshot
    /// if it has no pending writes.
    pub fn wrap_row(&self, table: TableRef, row: ColumnValues) -> Result<Entity, Error> {
        let Some(key) = table.key_from_row(&row) else {
            return Err(Error::Custom(format!(
                "Row of table '{}' has no usable key",
                table.name
            )));
        };
        if let Some(cached) = self.find(table, &key) {
            if cached.state() == EntityState::Persistent {
                cached.reload(row);
            }
            return Ok(cached);
        }
        Ok(self.materialize(table, key, row))
    }

    /// Store a loaded row, unless another record got cached under its key.
    fn materialize(&self, table: TableRef, key: KeyValue, row: ColumnValues) -> Entity {
        let entity = Entity::from_row(table, key, row);
        let existing = self.core.map.lock().store(&entity);
        match existing {
            Some(existing) => existing,
            None => {
                entity.attach(&self.core);
                entity
            }
        }
    }

    // ==================== Referrers ====================

    /// Drop relationship results that involve any of `tables`.
    ///
    /// With `clear_identity_maps` the keyed records of those tables are
    /// evicted as well; they become detached. Pending inserts are kept.
    /// Unflushed changes of evicted records are discarded, so callers that
    /// want them written flush `tables` first, as
    /// [`UnitOfWork::before_execution`] does.
    pub fn invalidate_referrers(&self, tables: &[TableRef], clear_identity_maps: bool) {
        let names: Vec<&str> = tables.iter().map(|t| t.name).collect();
        let mut evicted = Vec::new();
        {
            let mut map = self.core.map.lock();
            if clear_identity_maps {
                for name in &names {
                    evicted.extend(map.clear_table(name));
                }
            }
            let dropped = self.core.referrers.lock().invalidate_tables(&names);
            if dropped > 0 || !evicted.is_empty() {
                tracing::debug!(
                    tables = ?names,
                    dropped,
                    evicted = evicted.len(),
                    "Invalidated referrers"
                );
            }
        }
        for entity in evicted {
            entity.detach();
        }
    }

    /// Memoize a relationship query keyed by (owner, join column).
    ///
    /// The query runs at most once per miss. `table` and `column` name the
    /// join column, which must exist.
    pub async fn get_or_put_referrers<F, Fut>(
        &self,
        owner: &EntityId,
        table: TableRef,
        column: &str,
        query: F,
    ) -> Outcome<Vec<Entity>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<Vec<Entity>, Error>>,
    {
        let column = match ColumnRef::new(table, column) {
            Ok(column) => column,
            Err(e) => return Outcome::Err(e),
        };
        let key = owner.key();
        if let Some(hit) = self.core.referrers.lock().get(&key, &column) {
            return Outcome::Ok(hit);
        }

        let entities = try_outcome!(query().await);
        tracing::trace!(owner = %owner, column = column.column, count = entities.len(), "Referrers cached");
        self.core
            .referrers
            .lock()
            .put(key, column, entities.clone());
        Outcome::Ok(entities)
    }

    /// Keep a relationship result across structural writes.
    ///
    /// Only a rollback drops a protected entry. Returns false if nothing is
    /// cached for (owner, column).
    pub fn protect_referrers(
        &self,
        owner: &EntityId,
        table: TableRef,
        column: &str,
    ) -> Result<bool, Error> {
        let column = ColumnRef::new(table, column)?;
        Ok(self.core.referrers.lock().protect(&owner.key(), &column))
    }

    // ==================== Events ====================

    /// Queue a change event.
    pub fn register_change(&self, table: TableRef, id: EntityId, kind: ChangeKind) -> bool {
        self.core.notifier.register_change(table, id, kind)
    }

    /// Deliver queued change events to the subscribers.
    pub fn dispatch(&self) -> usize {
        self.core.notifier.dispatch()
    }

    // ==================== Introspection ====================

    /// Pending inserts across all tables.
    pub fn pending_insert_count(&self) -> usize {
        self.core.map.lock().pending_count()
    }

    /// Cached relationship results.
    pub fn referrer_count(&self) -> usize {
        self.core.referrers.lock().len()
    }

    /// Keyed records cached for a table.
    pub fn cached_count(&self, table: TableRef) -> usize {
        self.core.map.lock().len(table.name)
    }

    /// Every change registered in this unit of work.
    pub fn registered_changes(&self) -> Vec<ChangeEvent> {
        self.core.notifier.registered_changes()
    }

    /// Changes not dispatched yet.
    pub fn unprocessed_changes(&self) -> Vec<ChangeEvent> {
        self.core.notifier.unprocessed()
    }
}

impl<E: BatchExecutor> fmt::Debug for UnitOfWork<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.core.id)
            .field("pending_inserts", &self.pending_insert_count())
            .field("referrers", &self.referrer_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
