//! Cached entity records.
//!
//! An [`Entity`] is a cheap handle to one row: a snapshot of the last values
//! known to be in storage plus a write delta of pending changes. The unit of
//! work hands out at most one record per identity, so every clone of a handle
//! sees the same state.

use crate::flush::UpdateBatch;
use crate::identity::EntityId;
use crate::lifecycle::Statement;
use crate::notifier::ChangeKind;
use crate::referrers::ColumnRef;
use crate::unit_of_work::{CacheCore, UnitOfWork, lift};
use entcache_core::{
    BatchExecutor, ColumnDef, ColumnValues, Cx, EntityNotFoundError, Error, KeyValue, Outcome,
    StatementKind, TableRef, Value,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// A value written into an entity's delta.
///
/// `Ref` points at another entity's identity, which may not be resolved yet;
/// it becomes the referenced key when the delta is flushed.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Value(Value),
    Ref(EntityId),
}

impl FieldValue {
    /// Check if this value equals a stored column value.
    pub fn matches(&self, stored: &Value) -> bool {
        match self {
            FieldValue::Value(v) => v == stored,
            FieldValue::Ref(id) => id.value().is_some_and(|key| key.to_value() == *stored),
        }
    }

    /// The identity this value points at, if it is a reference.
    pub fn as_ref_id(&self) -> Option<&EntityId> {
        match self {
            FieldValue::Ref(id) => Some(id),
            FieldValue::Value(_) => None,
        }
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        FieldValue::Value(v)
    }
}

impl From<EntityId> for FieldValue {
    fn from(id: EntityId) -> Self {
        FieldValue::Ref(id)
    }
}

impl From<&Entity> for FieldValue {
    fn from(entity: &Entity) -> Self {
        FieldValue::Ref(entity.id().clone())
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Value(Value::from(v))
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Value(Value::from(v))
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Value(Value::from(v))
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Value(Value::from(v))
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Value(Value::from(v))
    }
}

/// Lifecycle state of an entity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Not inserted yet.
    New,
    /// Known to exist in storage.
    Persistent,
    /// Deleted through the unit of work.
    Deleted,
    /// Evicted by a rollback; no longer tracked.
    Detached,
}

struct EntityData {
    snapshot: ColumnValues,
    delta: BTreeMap<&'static str, FieldValue>,
    state: EntityState,
    cache: Weak<CacheCore>,
}

struct EntityInner {
    table: TableRef,
    id: EntityId,
    data: Mutex<EntityData>,
}

/// Handle to one cached row.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

impl Entity {
    /// A new record that will be inserted on flush.
    ///
    /// If the key column has a client-side default, the key is generated
    /// immediately and the identity starts resolved.
    pub fn new(table: TableRef) -> Self {
        let id = match table.client_generated_key() {
            Some(key) => EntityId::resolved(table, key),
            None => EntityId::unresolved(table),
        };
        Self::build(table, id, ColumnValues::new(), EntityState::New)
    }

    /// A new record with an explicit key.
    pub fn with_id(table: TableRef, key: KeyValue) -> Self {
        Self::build(
            table,
            EntityId::resolved(table, key),
            ColumnValues::new(),
            EntityState::New,
        )
    }

    /// A record materialized from a stored row.
    pub(crate) fn from_row(table: TableRef, key: KeyValue, row: ColumnValues) -> Self {
        Self::build(
            table,
            EntityId::resolved(table, key),
            row,
            EntityState::Persistent,
        )
    }

    fn build(table: TableRef, id: EntityId, snapshot: ColumnValues, state: EntityState) -> Self {
        Self {
            inner: Arc::new(EntityInner {
                table,
                id,
                data: Mutex::new(EntityData {
                    snapshot,
                    delta: BTreeMap::new(),
                    state,
                    cache: Weak::new(),
                }),
            }),
        }
    }

    /// Table of this record.
    pub fn table(&self) -> TableRef {
        self.inner.table
    }

    /// Identity of this record. Shared by all clones.
    pub fn id(&self) -> &EntityId {
        &self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EntityState {
        self.inner.data.lock().state
    }

    /// Check if the record has not been inserted yet.
    pub fn is_new(&self) -> bool {
        self.state() == EntityState::New
    }

    /// Check if the record has pending writes.
    pub fn is_dirty(&self) -> bool {
        !self.inner.data.lock().delta.is_empty()
    }

    /// Check if two handles point at the same record.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Last known value of a column without resolving anything.
    ///
    /// Looks at the delta first, then the snapshot.
    pub fn peek(&self, column: &str) -> Option<FieldValue> {
        let data = self.inner.data.lock();
        if let Some(v) = data.delta.get(column) {
            return Some(v.clone());
        }
        data.snapshot.get(column).cloned().map(FieldValue::Value)
    }

    /// Copy of the stored snapshot.
    pub fn snapshot(&self) -> ColumnValues {
        self.inner.data.lock().snapshot.clone()
    }

    /// Columns with pending writes, in name order.
    pub fn changed_columns(&self) -> Vec<&'static str> {
        self.inner.data.lock().delta.keys().copied().collect()
    }

    fn column_def(&self, column: &str) -> Result<&'static ColumnDef, Error> {
        self.inner
            .table
            .column(column)
            .ok_or_else(|| Error::UnknownColumn {
                table: self.inner.table.name,
                column: column.to_string(),
            })
    }

    /// Write a column value.
    ///
    /// The value only enters the delta if it differs from the snapshot;
    /// writing the snapshot value back drops the pending write. Changing a
    /// foreign key column drops the relationship results cached for it. A
    /// change to a record already materialized in a unit of work registers
    /// an `Updated` event there.
    pub fn set(&self, column: &str, value: impl Into<FieldValue>) -> Result<(), Error> {
        let table = self.inner.table;
        let col = self.column_def(column)?;
        if col.primary_key {
            return Err(Error::Custom(format!(
                "Cannot set key column '{}.{}'; keys are assigned through the identity",
                table.name, col.name
            )));
        }
        if col.generated {
            return Err(Error::Custom(format!(
                "Column '{}.{}' is generated by the database",
                table.name, col.name
            )));
        }
        let value = value.into();

        let (changed, state, cache) = {
            let mut data = self.inner.data.lock();
            match data.state {
                EntityState::Deleted => {
                    return Err(Error::Custom(format!(
                        "Cannot modify deleted entity {}",
                        self.inner.id
                    )));
                }
                EntityState::Persistent if table.immutable => {
                    return Err(match self.inner.id.value() {
                        Some(key) => Error::ImmutableEntity {
                            table: table.name,
                            key: key.clone(),
                        },
                        None => Error::unresolved(table.name, "persistent entity has no key"),
                    });
                }
                _ => {}
            }

            let matches_snapshot = data
                .snapshot
                .get(col.name)
                .is_some_and(|stored| value.matches(stored));
            let changed = if matches_snapshot {
                data.delta.remove(col.name).is_some()
            } else if data.delta.get(col.name) == Some(&value) {
                false
            } else {
                data.delta.insert(col.name, value);
                true
            };
            (changed, data.state, data.cache.upgrade())
        };

        if !changed {
            return Ok(());
        }
        tracing::trace!(entity = %self.inner.id, column = col.name, "Column written");

        let Some(cache) = cache else {
            return Ok(());
        };
        if col.is_foreign_key() {
            let column = ColumnRef {
                table: table.name,
                column: col.name,
                referee: col.foreign_key.map(|fk| fk.table),
            };
            cache
                .referrers
                .lock()
                .forget_column(&self.inner.id.key(), &column);
        }
        if state == EntityState::Persistent && cache.map.lock().contains(self) {
            cache
                .notifier
                .register_change(table, self.inner.id.clone(), ChangeKind::Updated);
        }
        Ok(())
    }

    /// Read a column value.
    ///
    /// Resolution order: a key column resolves the identity (flushing the
    /// table's inserts if needed); then the pending delta; for a new record
    /// a database-generated column forces its insert; then the snapshot;
    /// then the column's client default (kept in the delta so repeated reads
    /// agree); then `Null` for nullable columns.
    pub async fn get<E: BatchExecutor>(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<E>,
        column: &str,
    ) -> Outcome<Value, Error> {
        let table = self.inner.table;
        let col = match self.column_def(column) {
            Ok(col) => col,
            Err(e) => return Outcome::Err(e),
        };

        if col.primary_key {
            let key = try_outcome!(self.inner.id.resolve(cx, uow).await);
            let value = table
                .key_values(&key)
                .into_iter()
                .find(|(name, _)| *name == col.name)
                .map_or(Value::Null, |(_, v)| v);
            return Outcome::Ok(value);
        }

        let (pending, state) = {
            let data = self.inner.data.lock();
            (data.delta.get(col.name).cloned(), data.state)
        };
        match pending {
            Some(FieldValue::Value(v)) => return Outcome::Ok(v),
            Some(FieldValue::Ref(id)) => {
                let key = try_outcome!(id.resolve(cx, uow).await);
                return Outcome::Ok(key.to_value());
            }
            None => {}
        }

        if state == EntityState::New && col.is_database_generated() {
            tracing::debug!(
                entity = %self.inner.id,
                column = col.name,
                "Generated column read before insert; flushing"
            );
            try_outcome!(uow.flush_inserts_for_table(cx, table).await);
        }

        let mut data = self.inner.data.lock();
        if let Some(v) = data.snapshot.get(col.name) {
            return Outcome::Ok(v.clone());
        }
        if let Some(default) = col.client_default {
            let v = default();
            if data.state == EntityState::New {
                data.delta.insert(col.name, FieldValue::Value(v.clone()));
            }
            return Outcome::Ok(v);
        }
        if col.nullable {
            return Outcome::Ok(Value::Null);
        }
        Outcome::Err(Error::MissingValue {
            table: table.name,
            column: col.name,
        })
    }

    /// Write pending changes of this record.
    ///
    /// A pending insert flushes its table's inserts. A persistent record
    /// with a delta joins `batch` when one is supplied (the caller executes
    /// it) or runs its own single-row update otherwise. The delta is merged
    /// into the snapshot only once the update has executed. Returns false
    /// when there was nothing to write.
    pub async fn flush<E: BatchExecutor>(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<E>,
        batch: Option<&mut UpdateBatch>,
    ) -> Outcome<bool, Error> {
        let table = self.inner.table;
        let (state, dirty) = {
            let data = self.inner.data.lock();
            (data.state, !data.delta.is_empty())
        };

        match state {
            EntityState::New => {
                if !uow.is_pending_insert(self) {
                    return Outcome::Err(Error::DetachedEntity { table: table.name });
                }
                try_outcome!(uow.flush_inserts_for_table(cx, table).await);
                Outcome::Ok(true)
            }
            EntityState::Deleted => Outcome::Ok(false),
            EntityState::Detached if dirty => {
                Outcome::Err(Error::DetachedEntity { table: table.name })
            }
            EntityState::Detached => Outcome::Ok(false),
            EntityState::Persistent if !dirty => Outcome::Ok(false),
            EntityState::Persistent => match batch {
                Some(batch) => match batch.add(self) {
                    Ok(added) => Outcome::Ok(added),
                    Err(e) => Outcome::Err(e),
                },
                None => {
                    let mut batch = UpdateBatch::new(table);
                    if let Err(e) = batch.add(self) {
                        return Outcome::Err(e);
                    }
                    let updated = try_outcome!(batch.execute(cx, uow).await);
                    Outcome::Ok(updated > 0)
                }
            },
        }
    }

    /// Delete this record.
    ///
    /// A record that was never inserted is only evicted from the unit of
    /// work: no statement runs and no event is registered. Otherwise the
    /// whole unit of work is flushed, then the row is deleted immediately
    /// and a `Removed` event is registered.
    #[tracing::instrument(level = "debug", skip(self, cx, uow), fields(entity = %self.inner.id))]
    pub async fn delete<E: BatchExecutor>(&self, cx: &Cx, uow: &UnitOfWork<E>) -> Outcome<(), Error> {
        let table = self.inner.table;
        match self.state() {
            EntityState::New => {
                uow.core().map.lock().remove(self);
                self.mark_deleted();
                tracing::debug!("Evicted never-inserted entity");
                return Outcome::Ok(());
            }
            EntityState::Deleted => return Outcome::Ok(()),
            EntityState::Detached => {
                return Outcome::Err(Error::DetachedEntity { table: table.name });
            }
            EntityState::Persistent => {}
        }

        let Some(key) = self.inner.id.value().cloned() else {
            return Outcome::Err(Error::unresolved(
                table.name,
                "persistent entity has no resolved identity",
            ));
        };

        try_outcome!(uow.flush(cx, None).await);

        let statement = Statement::delete(&[table]);
        let _nested = uow.enter_nested();
        uow.statement_started(&statement);
        let affected = try_outcome!(lift(
            uow.executor().delete(cx, table, &key).await,
            table.name,
            StatementKind::Delete,
        ));

        uow.core().map.lock().remove(self);
        self.mark_deleted();
        uow.register_change(table, self.inner.id.clone(), ChangeKind::Removed);
        tracing::debug!(affected, "Entity deleted");
        uow.after_execution(&statement);
        Outcome::Ok(())
    }

    /// Reload the snapshot from storage.
    ///
    /// With `flush` the pending changes are written first; without it they
    /// are discarded. A missing row is an [`Error::EntityNotFound`].
    pub async fn refresh<E: BatchExecutor>(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<E>,
        flush: bool,
    ) -> Outcome<(), Error> {
        let table = self.inner.table;
        if flush {
            try_outcome!(self.flush(cx, uow, None).await);
        }
        let Some(key) = self.inner.id.value().cloned() else {
            return Outcome::Err(Error::unresolved(
                table.name,
                "cannot refresh an entity that has not been inserted",
            ));
        };
        if !flush {
            self.inner.data.lock().delta.clear();
        }

        let row = try_outcome!(lift(
            uow.executor().select(cx, table, &key).await,
            table.name,
            StatementKind::Query,
        ));
        let Some(row) = row else {
            return Outcome::Err(Error::EntityNotFound(EntityNotFoundError {
                table: table.name,
                key,
            }));
        };

        let mut data = self.inner.data.lock();
        data.snapshot = row;
        if data.state == EntityState::New {
            data.state = EntityState::Persistent;
        }
        tracing::trace!(entity = %self.inner.id, "Snapshot refreshed");
        Outcome::Ok(())
    }

    pub(crate) fn delta(&self) -> BTreeMap<&'static str, FieldValue> {
        self.inner.data.lock().delta.clone()
    }

    pub(crate) fn attach(&self, cache: &Arc<CacheCore>) {
        self.inner.data.lock().cache = Arc::downgrade(cache);
    }

    pub(crate) fn attached_to(&self, cache: &Arc<CacheCore>) -> Option<bool> {
        let data = self.inner.data.lock();
        data.cache
            .upgrade()
            .map(|current| Arc::ptr_eq(&current, cache))
    }

    /// Merge written values into the snapshot and drop the delta entries
    /// that were written, unless they changed in the meantime.
    pub(crate) fn merge_flushed(
        &self,
        captured: &BTreeMap<&'static str, FieldValue>,
        written: ColumnValues,
    ) {
        let mut data = self.inner.data.lock();
        data.snapshot.extend(written);
        data.delta
            .retain(|column, value| captured.get(column) != Some(value));
        if data.state == EntityState::New {
            data.state = EntityState::Persistent;
        }
    }

    /// Replace the snapshot with a freshly loaded row unless writes are pending.
    pub(crate) fn reload(&self, row: ColumnValues) -> bool {
        let mut data = self.inner.data.lock();
        if !data.delta.is_empty() {
            return false;
        }
        data.snapshot = row;
        true
    }

    pub(crate) fn mark_deleted(&self) {
        let mut data = self.inner.data.lock();
        data.state = EntityState::Deleted;
        data.delta.clear();
    }

    pub(crate) fn detach(&self) {
        let mut data = self.inner.data.lock();
        data.state = EntityState::Detached;
        data.cache = Weak::new();
    }
}

/// Convert a delta into column values.
///
/// Every reference must already be resolved.
pub(crate) fn write_values(
    table: TableRef,
    delta: &BTreeMap<&'static str, FieldValue>,
) -> Result<ColumnValues, Error> {
    delta
        .iter()
        .map(|(column, value)| match value {
            FieldValue::Value(v) => Ok((*column, v.clone())),
            FieldValue::Ref(id) => id
                .value()
                .map(|key| (*column, key.to_value()))
                .ok_or_else(|| {
                    Error::unresolved(
                        table.name,
                        format!("column '{column}' references unresolved identity {id}"),
                    )
                }),
        })
        .collect()
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.inner.data.lock();
        f.debug_struct("Entity")
            .field("id", &self.inner.id)
            .field("state", &data.state)
            .field("snapshot", &data.snapshot)
            .field("delta", &data.delta)
            .finish()
    }
}
