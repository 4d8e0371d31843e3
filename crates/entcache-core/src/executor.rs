//! The batch-execute collaborator.
//!
//! The cache never produces SQL. Everything it needs from storage goes through
//! [`BatchExecutor`], which a driver layer implements on top of its
//! connection. All operations take a `Cx` for cancellation and return an
//! asupersync `Outcome`.

use crate::error::ExecutorError;
use crate::key::KeyValue;
use crate::table::TableDef;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::collections::BTreeMap;

/// One row worth of column values, keyed by column name.
pub type ColumnValues = BTreeMap<&'static str, Value>;

/// Executes row mutations and lookups on behalf of the cache.
pub trait BatchExecutor: Send + Sync {
    /// Insert `rows` into `table` as one batch.
    ///
    /// Every row carries the same column set. The result holds the generated
    /// column values for each row, in input order. Engines that can only
    /// report the last generated id return a single map for the whole batch.
    fn insert(
        &self,
        cx: &Cx,
        table: &'static TableDef,
        rows: &[ColumnValues],
    ) -> impl Future<Output = Outcome<Vec<ColumnValues>, ExecutorError>> + Send;

    /// Update rows keyed by identity. All rows carry the same column set.
    ///
    /// Returns the number of rows affected.
    fn update(
        &self,
        cx: &Cx,
        table: &'static TableDef,
        rows: &[(KeyValue, ColumnValues)],
    ) -> impl Future<Output = Outcome<u64, ExecutorError>> + Send;

    /// Delete the row with the given identity.
    fn delete(
        &self,
        cx: &Cx,
        table: &'static TableDef,
        key: &KeyValue,
    ) -> impl Future<Output = Outcome<u64, ExecutorError>> + Send;

    /// Load the row with the given identity, if it exists.
    fn select(
        &self,
        cx: &Cx,
        table: &'static TableDef,
        key: &KeyValue,
    ) -> impl Future<Output = Outcome<Option<ColumnValues>, ExecutorError>> + Send;
}
