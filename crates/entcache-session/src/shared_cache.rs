//! Process-wide read cache for immutable tables.
//!
//! Rows of an immutable table never change once written, so their column
//! values can outlive a single unit of work. `find_or_create` consults this
//! cache before running its loader; commits expire the tables that gained
//! rows.

use crate::identity::EntityId;
use entcache_core::{ColumnValues, KeyValue};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

/// Rows of immutable tables shared across units of work.
#[derive(Debug, Default)]
pub struct SharedCache {
    tables: RwLock<HashMap<&'static str, HashMap<KeyValue, ColumnValues>>>,
}

impl SharedCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache.
    pub fn global() -> &'static Arc<SharedCache> {
        static GLOBAL: OnceLock<Arc<SharedCache>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(SharedCache::new()))
    }

    /// Look up a row.
    pub fn get(&self, table: &str, key: &KeyValue) -> Option<ColumnValues> {
        self.tables.read().get(table)?.get(key).cloned()
    }

    /// Store a row.
    pub fn put(&self, table: &'static str, key: KeyValue, row: ColumnValues) {
        self.tables
            .write()
            .entry(table)
            .or_default()
            .insert(key, row);
    }

    /// Drop every row of a table. Returns the number of rows dropped.
    pub fn expire_table(&self, table: &str) -> usize {
        self.tables.write().remove(table).map_or(0, |rows| rows.len())
    }

    /// Expire the tables the given identities belong to.
    ///
    /// Returns the number of distinct tables expired.
    pub fn expire_created(&self, created: &[EntityId]) -> usize {
        let tables: HashSet<&'static str> = created
            .iter()
            .filter(|id| id.table().immutable)
            .map(|id| id.table().name)
            .collect();
        for table in &tables {
            let dropped = self.expire_table(table);
            tracing::debug!(table = *table, dropped, "Expired shared cache table");
        }
        tables.len()
    }

    /// Number of cached rows for a table.
    pub fn len(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, HashMap::len)
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.tables.write().clear();
    }
}
