//! Flush engine.
//!
//! Turns pending inserts and write deltas into batched executor calls.
//!
//! # Inserts
//!
//! [`UnitOfWork::flush_inserts_for_table`] first flushes every other table
//! whose pending records the requested table's records point at, in
//! dependency order. Each table's pending list is then taken as a whole and
//! drained in rounds: records referencing a not-yet-inserted sibling of the
//! same table wait for a later round, so a chain of self-references resolves
//! in one call. A round with no insertable record is an
//! [`Error::UnresolvedIdentity`].
//!
//! # Updates
//!
//! Dirty records are grouped by the set of columns they change; each group
//! is one executor `update` call. Deltas are merged into snapshots only
//! after their statement succeeded.

use crate::dependency::{DependencySorter, sort_tables};
use crate::entity::{Entity, EntityState, FieldValue, write_values};
use crate::identity::EntityId;
use crate::lifecycle::Statement;
use crate::notifier::ChangeKind;
use crate::unit_of_work::{UnitOfWork, lift};
use entcache_core::{
    BatchDataInconsistentError, BatchExecutor, ColumnValues, Cx, Error, KeyValue, Outcome,
    StatementKind, TableRef,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Rows of one validated insert batch.
struct InsertBatch {
    table: TableRef,
    /// Column values sent to the executor, one map per record, all with the
    /// same columns.
    rows: Vec<ColumnValues>,
    /// Deltas as they were when the batch was built.
    captured: Vec<BTreeMap<&'static str, FieldValue>>,
}

impl InsertBatch {
    /// Build and validate a batch.
    ///
    /// Columns some rows set and others omit are filled from the column's
    /// default; a column without one fails the whole batch before anything
    /// executes. Columns no row sets get their client defaults.
    fn build(table: TableRef, records: &[Entity]) -> Result<Self, Error> {
        let mut rows = Vec::with_capacity(records.len());
        let mut captured = Vec::with_capacity(records.len());
        for entity in records {
            let delta = entity.delta();
            let mut row = write_values(table, &delta)?;
            if let Some(key) = entity.id().value() {
                row.extend(table.key_values(key));
            }
            rows.push(row);
            captured.push(delta);
        }

        let mut columns: BTreeSet<&'static str> =
            rows.iter().flat_map(|row| row.keys().copied()).collect();
        for col in table.columns {
            if col.client_default.is_some() && !col.primary_key {
                columns.insert(col.name);
            }
        }

        for col in table.columns {
            if columns.contains(col.name) || col.is_defaultable() {
                continue;
            }
            return Err(Error::MissingValue {
                table: table.name,
                column: col.name,
            });
        }

        let mut inconsistent = BTreeSet::new();
        for row in &mut rows {
            for column in &columns {
                if row.contains_key(column) {
                    continue;
                }
                match table.column(column).and_then(|c| c.fill_value()) {
                    Some(value) => {
                        row.insert(*column, value);
                    }
                    None => {
                        inconsistent.insert(*column);
                    }
                }
            }
        }
        if !inconsistent.is_empty() {
            return Err(Error::BatchDataInconsistent(BatchDataInconsistentError {
                table: table.name,
                columns: inconsistent.into_iter().collect(),
                message: "some rows omit columns that are not nullable and have no default"
                    .to_string(),
            }));
        }

        Ok(Self {
            table,
            rows,
            captured,
        })
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Pending writes of persistent records of one table.
///
/// Filled by [`Entity::flush`] or the unit of work's update flush and
/// executed as one executor call per distinct column set.
pub struct UpdateBatch {
    table: TableRef,
    entries: Vec<(Entity, BTreeMap<&'static str, FieldValue>)>,
}

impl UpdateBatch {
    /// Create an empty batch for `table`.
    pub fn new(table: TableRef) -> Self {
        Self {
            table,
            entries: Vec::new(),
        }
    }

    /// Table this batch updates.
    pub fn table(&self) -> TableRef {
        self.table
    }

    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a record's current delta.
    ///
    /// Returns false if the record has nothing to write or is already in
    /// the batch.
    pub fn add(&mut self, entity: &Entity) -> Result<bool, Error> {
        let table = entity.table();
        if table.name != self.table.name {
            return Err(Error::Custom(format!(
                "Entity {} does not belong to update batch for '{}'",
                entity.id(),
                self.table.name
            )));
        }
        if entity.state() != EntityState::Persistent {
            return Err(Error::Custom(format!(
                "Only persistent entities can be updated, got {:?} {}",
                entity.state(),
                entity.id()
            )));
        }
        if table.immutable {
            return Err(match entity.id().value() {
                Some(key) => Error::ImmutableEntity {
                    table: table.name,
                    key: key.clone(),
                },
                None => Error::unresolved(table.name, "persistent entity has no key"),
            });
        }
        if self.entries.iter().any(|(e, _)| Entity::ptr_eq(e, entity)) {
            return Ok(false);
        }
        let delta = entity.delta();
        if delta.is_empty() {
            return Ok(false);
        }
        self.entries.push((entity.clone(), delta));
        Ok(true)
    }

    /// Run the batch. Returns the number of records written.
    #[tracing::instrument(level = "debug", skip(self, cx, uow), fields(table = self.table.name))]
    pub async fn execute<E: BatchExecutor>(
        self,
        cx: &Cx,
        uow: &UnitOfWork<E>,
    ) -> Outcome<usize, Error> {
        if self.entries.is_empty() {
            return Outcome::Ok(0);
        }
        let table = self.table;

        // Resolving a reference may flush inserts of other tables.
        let mut prepared = Vec::with_capacity(self.entries.len());
        for (entity, delta) in &self.entries {
            for id in delta.values().filter_map(FieldValue::as_ref_id) {
                try_outcome!(id.resolve(cx, uow).await);
            }
            let Some(key) = entity.id().value().cloned() else {
                return Outcome::Err(Error::unresolved(
                    table.name,
                    "persistent entity has no key",
                ));
            };
            let row = match write_values(table, delta) {
                Ok(row) => row,
                Err(e) => return Outcome::Err(e),
            };
            prepared.push((key, row));
        }

        let mut groups: Vec<(Vec<&'static str>, Vec<usize>)> = Vec::new();
        for (idx, (_, row)) in prepared.iter().enumerate() {
            let shape: Vec<&'static str> = row.keys().copied().collect();
            match groups.iter_mut().find(|(s, _)| *s == shape) {
                Some((_, members)) => members.push(idx),
                None => groups.push((shape, vec![idx])),
            }
        }

        let statement = Statement::update(&[table]);
        let _nested = uow.enter_nested();
        uow.statement_started(&statement);
        let mut written = 0;
        for (shape, members) in groups {
            let rows: Vec<(KeyValue, ColumnValues)> =
                members.iter().map(|&i| prepared[i].clone()).collect();
            tracing::debug!(columns = ?shape, count = rows.len(), "Executing update batch");
            let affected = try_outcome!(lift(
                uow.executor().update(cx, table, &rows).await,
                table.name,
                StatementKind::Update,
            ));
            if affected < rows.len() as u64 {
                tracing::warn!(
                    expected = rows.len(),
                    affected,
                    "Update batch affected fewer rows than expected"
                );
            }

            for (&i, (_, row)) in members.iter().zip(rows) {
                let (entity, delta) = &self.entries[i];
                entity.merge_flushed(delta, row);
                written += 1;
            }
        }
        uow.after_execution(&statement);
        Outcome::Ok(written)
    }
}

impl<E: BatchExecutor> UnitOfWork<E> {
    /// Write all pending state of `tables`, or of every table the unit of
    /// work touched when `None`.
    ///
    /// Tables are processed in foreign key order; each table's inserts run
    /// before its updates. Returns the identities created.
    #[tracing::instrument(level = "debug", skip(self, cx, tables))]
    pub async fn flush(&self, cx: &Cx, tables: Option<&[TableRef]>) -> Outcome<Vec<EntityId>, Error> {
        let tables = match tables {
            Some(tables) => tables.to_vec(),
            None => self.core().map.lock().tables(),
        };
        if tables.is_empty() {
            return Outcome::Ok(Vec::new());
        }
        let order = match sort_tables(&tables) {
            Ok(order) => order,
            Err(e) => return Outcome::Err(e),
        };

        tracing::info!(
            unit_of_work = %self.id(),
            tables = order.len(),
            "Flushing unit of work"
        );
        let mut created = Vec::new();
        let mut updated = 0;
        for table in order {
            created.extend(try_outcome!(self.flush_inserts_for_table(cx, table).await));
            updated += try_outcome!(self.flush_updates_for_table(cx, table).await);
        }
        tracing::info!(
            unit_of_work = %self.id(),
            created = created.len(),
            updated,
            "Flush complete"
        );
        Outcome::Ok(created)
    }

    /// Insert every pending record of `table`.
    ///
    /// Pending records of other tables that these records reference are
    /// inserted first. Returns the identities created, in insertion order.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(table = table.name))]
    pub async fn flush_inserts_for_table(
        &self,
        cx: &Cx,
        table: TableRef,
    ) -> Outcome<Vec<EntityId>, Error> {
        let order = match self.insert_order(table) {
            Ok(order) => order,
            Err(e) => return Outcome::Err(e),
        };
        let mut created = Vec::new();
        for t in order {
            created.extend(try_outcome!(self.drain_pending_inserts(cx, t).await));
        }
        Outcome::Ok(created)
    }

    /// Tables whose pending inserts must run for `table`'s, ending with `table`.
    fn insert_order(&self, table: TableRef) -> Result<Vec<TableRef>, Error> {
        let map = self.core().map.lock();
        let mut sorter = DependencySorter::new();
        sorter.add_table(table);
        let mut visited: HashSet<&'static str> = HashSet::new();
        let mut queue = vec![table];

        while let Some(current) = queue.pop() {
            if !visited.insert(current.name) {
                continue;
            }
            for entity in map.pending(current.name) {
                for value in entity.delta().values() {
                    let Some(target) = value.as_ref_id() else {
                        continue;
                    };
                    if target.is_resolved() || target.table().name == current.name {
                        continue;
                    }
                    let target_table = target.table();
                    sorter.add_table(target_table);
                    sorter.add_dependency(current.name, target_table.name, false);
                    queue.push(target_table);
                }
            }
        }

        if sorter.len() == 1 {
            return Ok(vec![table]);
        }
        let order = sorter.sort()?;
        tracing::debug!(
            table = table.name,
            order = ?order.iter().map(|t| t.name).collect::<Vec<_>>(),
            "Pending inserts reference other tables"
        );
        Ok(order)
    }

    /// Take `table`'s pending list and insert it round by round.
    async fn drain_pending_inserts(&self, cx: &Cx, table: TableRef) -> Outcome<Vec<EntityId>, Error> {
        let mut pending = self.core().map.lock().take_pending(table.name);
        pending.retain(|e| e.state() == EntityState::New);
        let mut created = Vec::new();

        while !pending.is_empty() {
            let (ready, blocked): (Vec<Entity>, Vec<Entity>) = pending
                .iter()
                .cloned()
                .partition(|entity| !references_pending_sibling(entity, table));

            if ready.is_empty() {
                let count = pending.len();
                self.core().map.lock().restore_pending(table, pending);
                return Outcome::Err(Error::unresolved(
                    table.name,
                    format!("{count} pending inserts only reference each other"),
                ));
            }

            match self.insert_batch(cx, table, &ready).await {
                Outcome::Ok(ids) => created.extend(ids),
                failed => {
                    self.core().map.lock().restore_pending(table, pending);
                    return failed;
                }
            }
            pending = blocked;
        }

        Outcome::Ok(created)
    }

    /// Execute one insert batch and reconcile its records.
    async fn insert_batch(
        &self,
        cx: &Cx,
        table: TableRef,
        records: &[Entity],
    ) -> Outcome<Vec<EntityId>, Error> {
        let batch = match InsertBatch::build(table, records) {
            Ok(batch) => batch,
            Err(e) => return Outcome::Err(e),
        };

        let statement = Statement::insert(&[table]);
        let _nested = self.enter_nested();
        self.statement_started(&statement);
        tracing::debug!(table = table.name, count = batch.len(), "Executing insert batch");
        let generated = try_outcome!(lift(
            self.executor().insert(cx, table, &batch.rows).await,
            table.name,
            StatementKind::Insert,
        ));

        let keys = match self.match_generated(&batch, records, generated) {
            Ok(keys) => keys,
            Err(e) => return Outcome::Err(e),
        };
        {
            let map = self.core().map.lock();
            for (entity, (key, _)) in records.iter().zip(&keys) {
                if let Some(existing) = map.get(table.name, key) {
                    if !Entity::ptr_eq(&existing, entity) {
                        return Outcome::Err(Error::IdentityConflict {
                            table: table.name,
                            key: key.clone(),
                        });
                    }
                }
            }
        }

        let mut created = Vec::with_capacity(records.len());
        for (((entity, row), delta), (key, generated)) in records
            .iter()
            .zip(batch.rows)
            .zip(&batch.captured)
            .zip(keys)
        {
            let mut written: ColumnValues =
                row.into_iter().filter(|(_, v)| !v.is_default()).collect();
            written.extend(generated);
            if !entity.id().assign(key) {
                tracing::warn!(entity = %entity.id(), "Inserted entity already had a different key");
            }
            entity.merge_flushed(delta, written);

            self.core().map.lock().store(entity);
            self.register_change(table, entity.id().clone(), ChangeKind::Created);
            tracing::trace!(entity = %entity.id(), "Insert reconciled");
            created.push(entity.id().clone());
        }

        self.after_execution(&statement);
        Outcome::Ok(created)
    }

    /// Pair every inserted row with its key and generated values.
    ///
    /// Nothing is reconciled unless every row can be matched.
    fn match_generated(
        &self,
        batch: &InsertBatch,
        records: &[Entity],
        generated: Vec<ColumnValues>,
    ) -> Result<Vec<(KeyValue, ColumnValues)>, Error> {
        let table = batch.table;
        let expected = batch.len();
        let mismatch = |actual| Error::GeneratedKeysMismatch {
            table: table.name,
            expected,
            actual,
        };

        let generated = if generated.len() == expected {
            generated
        } else if generated.is_empty() && records.iter().all(|e| e.id().is_resolved()) {
            vec![ColumnValues::new(); expected]
        } else if generated.len() == 1
            && expected > 1
            && table.has_auto_increment_key()
            && self.config().derive_keys_from_last_id
            && records.iter().all(|e| !e.id().is_resolved())
        {
            derive_from_last_id(table, &generated[0], expected).ok_or_else(|| mismatch(1))?
        } else {
            return Err(mismatch(generated.len()));
        };

        records
            .iter()
            .zip(&batch.rows)
            .zip(generated)
            .enumerate()
            .map(|(idx, ((entity, row), generated))| {
                if let Some(key) = entity.id().value() {
                    return Ok((key.clone(), generated));
                }
                let mut merged = row.clone();
                merged.extend(generated.iter().map(|(c, v)| (*c, v.clone())));
                let key = table.key_from_row(&merged).ok_or_else(|| {
                    Error::unresolved(
                        table.name,
                        format!("insert returned no key for row {idx}"),
                    )
                })?;
                Ok((key, generated))
            })
            .collect()
    }

    /// Send the deltas of every dirty cached record of `table`.
    async fn flush_updates_for_table(&self, cx: &Cx, table: TableRef) -> Outcome<usize, Error> {
        let cached = self.core().map.lock().entities(table.name);
        let dirty: Vec<Entity> = cached.into_iter().filter(Entity::is_dirty).collect();
        if dirty.is_empty() {
            return Outcome::Ok(0);
        }

        let mut batch = UpdateBatch::new(table);
        for entity in &dirty {
            if let Err(e) = batch.add(entity) {
                return Outcome::Err(e);
            }
        }
        batch.execute(cx, self).await
    }
}

fn references_pending_sibling(entity: &Entity, table: TableRef) -> bool {
    entity.delta().values().any(|value| {
        value
            .as_ref_id()
            .is_some_and(|id| !id.is_resolved() && id.table().name == table.name)
    })
}

/// Back-derive the keys of a batch from the last generated key.
///
/// Assumes the engine assigned strictly consecutive keys to the batch,
/// which holds for single-statement inserts on common engines but is not
/// guaranteed.
fn derive_from_last_id(
    table: TableRef,
    last: &ColumnValues,
    count: usize,
) -> Option<Vec<ColumnValues>> {
    let last_key = table.key_from_row(last)?;
    // auto-increment sequences start at 1
    let first = last_key.preceding(count.checked_sub(1)? as u64)?;
    if first.to_value().as_i64().is_some_and(|v| v < 1) {
        return None;
    }
    tracing::warn!(
        table = table.name,
        last = %last_key,
        rows = count,
        "Executor returned only the last generated key; deriving the others"
    );
    (0..count)
        .map(|i| {
            let key = last_key.preceding((count - 1 - i) as u64)?;
            let mut row: ColumnValues = table.key_values(&key).into_iter().collect();
            if i == count - 1 {
                row.extend(last.iter().map(|(c, v)| (*c, v.clone())));
            }
            Some(row)
        })
        .collect()
}
