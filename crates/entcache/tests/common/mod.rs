//! Shared schema and spy executor for the integration tests.

#![allow(dead_code)]

use asupersync::{Cx, Outcome};
use entcache::prelude::*;
use entcache::{KeyValue, SharedCache, SubscriberRegistry};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(v) => panic!("expected an error, got {v:?}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

// ==================== Schema ====================

const ID: ColumnDef = ColumnDef::new("id", SqlType::BigInt)
    .primary_key(true)
    .auto_increment(true);

pub static USERS: TableDef = TableDef::new("users", &[ID, ColumnDef::new("name", SqlType::Text)]);

pub static POSTS: TableDef = TableDef::new(
    "posts",
    &[
        ID,
        ColumnDef::new("title", SqlType::Text),
        ColumnDef::new("author_id", SqlType::BigInt).references("users", "id"),
    ],
);

pub static EMPLOYEES: TableDef = TableDef::new(
    "employees",
    &[
        ID,
        ColumnDef::new("name", SqlType::Text),
        ColumnDef::new("manager_id", SqlType::BigInt)
            .nullable(true)
            .references("employees", "id"),
    ],
);

pub static DOCS: TableDef = TableDef::new(
    "docs",
    &[
        ID,
        ColumnDef::new("title", SqlType::Text),
        ColumnDef::new("slug", SqlType::Text).generated(true),
    ],
);

pub static COUNTRIES: TableDef = TableDef::new(
    "countries",
    &[
        ColumnDef::new("id", SqlType::Integer).primary_key(true),
        ColumnDef::new("name", SqlType::Text),
    ],
)
.immutable(true);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

fn next_token() -> Value {
    Value::Text(format!("tok-{}", NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)))
}

pub static TOKENS: TableDef = TableDef::new(
    "tokens",
    &[
        ColumnDef::new("id", SqlType::Uuid)
            .primary_key(true)
            .client_default(next_token),
        ColumnDef::new("label", SqlType::Text),
    ],
);

pub static EGGS: TableDef = TableDef::new(
    "eggs",
    &[ID, ColumnDef::new("chicken_id", SqlType::BigInt).references("chickens", "id")],
);

pub static CHICKENS: TableDef = TableDef::new(
    "chickens",
    &[ID, ColumnDef::new("egg_id", SqlType::BigInt).references("eggs", "id")],
);

// ==================== Spy executor ====================

/// One executor call.
#[derive(Debug, Clone)]
pub enum Call {
    Insert {
        table: &'static str,
        rows: Vec<ColumnValues>,
    },
    Update {
        table: &'static str,
        rows: Vec<(KeyValue, ColumnValues)>,
    },
    Delete {
        table: &'static str,
        key: KeyValue,
    },
    Select {
        table: &'static str,
        key: KeyValue,
    },
}

impl Call {
    pub fn table(&self) -> &'static str {
        match self {
            Call::Insert { table, .. }
            | Call::Update { table, .. }
            | Call::Delete { table, .. }
            | Call::Select { table, .. } => table,
        }
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    next_id: HashMap<&'static str, i64>,
    stored: HashMap<(&'static str, KeyValue), ColumnValues>,
    last_id_only: bool,
    failing_table: Option<&'static str>,
}

/// In-memory executor recording every call.
#[derive(Clone, Default)]
pub struct MockExecutor {
    state: Arc<Mutex<MockState>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report only the last generated row of each insert batch.
    pub fn last_id_only(&self, value: bool) {
        self.state.lock().last_id_only = value;
    }

    /// Make every write to `table` fail.
    pub fn fail_on(&self, table: &'static str) {
        self.state.lock().failing_table = Some(table);
    }

    pub fn clear_failure(&self) {
        self.state.lock().failing_table = None;
    }

    /// Put a row into storage without recording a call. Generated keys
    /// continue after the seeded one.
    pub fn seed(&self, table: &'static TableDef, row: ColumnValues) {
        let key = table.key_from_row(&row).expect("seeded row has a key");
        let mut state = self.state.lock();
        if let KeyValue::Long(id) = key {
            let next = state.next_id.entry(table.name).or_insert(0);
            *next = (*next).max(id);
        }
        state.stored.insert((table.name, key), row);
    }

    /// Drop a row from storage without recording a call.
    pub fn forget(&self, table: &'static TableDef, key: &KeyValue) {
        self.state.lock().stored.remove(&(table.name, key.clone()));
    }

    pub fn stored(&self, table: &'static TableDef, key: &KeyValue) -> Option<ColumnValues> {
        self.state.lock().stored.get(&(table.name, key.clone())).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Row batches of every insert into `table`.
    pub fn inserts(&self, table: &str) -> Vec<Vec<ColumnValues>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Insert { table: t, rows } if t == table => Some(rows),
                _ => None,
            })
            .collect()
    }

    /// Row batches of every update of `table`.
    pub fn updates(&self, table: &str) -> Vec<Vec<(KeyValue, ColumnValues)>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Update { table: t, rows } if t == table => Some(rows),
                _ => None,
            })
            .collect()
    }

    pub fn deletes(&self, table: &str) -> Vec<KeyValue> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Delete { table: t, key } if t == table => Some(key),
                _ => None,
            })
            .collect()
    }

    pub fn selects(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Select { .. }))
            .count()
    }
}

impl BatchExecutor for MockExecutor {
    async fn insert(
        &self,
        _cx: &Cx,
        table: &'static TableDef,
        rows: &[ColumnValues],
    ) -> Outcome<Vec<ColumnValues>, ExecutorError> {
        let mut state = self.state.lock();
        state.calls.push(Call::Insert {
            table: table.name,
            rows: rows.to_vec(),
        });
        if state.failing_table == Some(table.name) {
            return Outcome::Err(format!("insert into {} failed", table.name).into());
        }

        let key_column = table.single_key_column().map(|c| c.name);
        let mut generated = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = ColumnValues::new();
            let mut full = row.clone();
            if table.has_auto_increment_key() {
                if let Some(column) = key_column.filter(|c| !row.contains_key(c)) {
                    let next = state.next_id.entry(table.name).or_insert(0);
                    *next += 1;
                    values.insert(column, Value::BigInt(*next));
                }
            }
            let sequence = state.stored.len() + 1;
            for col in table.columns.iter().filter(|c| c.generated) {
                values.insert(col.name, Value::Text(format!("{}-{}", col.name, sequence)));
            }
            full.extend(values.iter().map(|(c, v)| (*c, v.clone())));
            if let Some(key) = table.key_from_row(&full) {
                state.stored.insert((table.name, key), full);
            }
            generated.push(values);
        }

        if state.last_id_only && generated.len() > 1 {
            let last = generated.pop().unwrap_or_default();
            return Outcome::Ok(vec![last]);
        }
        Outcome::Ok(generated)
    }

    async fn update(
        &self,
        _cx: &Cx,
        table: &'static TableDef,
        rows: &[(KeyValue, ColumnValues)],
    ) -> Outcome<u64, ExecutorError> {
        let mut state = self.state.lock();
        state.calls.push(Call::Update {
            table: table.name,
            rows: rows.to_vec(),
        });
        if state.failing_table == Some(table.name) {
            return Outcome::Err(format!("update of {} failed", table.name).into());
        }

        let mut affected = 0;
        for (key, values) in rows {
            if let Some(stored) = state.stored.get_mut(&(table.name, key.clone())) {
                stored.extend(values.iter().map(|(c, v)| (*c, v.clone())));
                affected += 1;
            }
        }
        Outcome::Ok(affected)
    }

    async fn delete(
        &self,
        _cx: &Cx,
        table: &'static TableDef,
        key: &KeyValue,
    ) -> Outcome<u64, ExecutorError> {
        let mut state = self.state.lock();
        state.calls.push(Call::Delete {
            table: table.name,
            key: key.clone(),
        });
        if state.failing_table == Some(table.name) {
            return Outcome::Err(format!("delete from {} failed", table.name).into());
        }
        Outcome::Ok(u64::from(
            state.stored.remove(&(table.name, key.clone())).is_some(),
        ))
    }

    async fn select(
        &self,
        _cx: &Cx,
        table: &'static TableDef,
        key: &KeyValue,
    ) -> Outcome<Option<ColumnValues>, ExecutorError> {
        let mut state = self.state.lock();
        state.calls.push(Call::Select {
            table: table.name,
            key: key.clone(),
        });
        Outcome::Ok(state.stored.get(&(table.name, key.clone())).cloned())
    }
}

// ==================== Helpers ====================

/// A unit of work isolated from the global registry and shared cache.
pub fn uow(executor: MockExecutor) -> UnitOfWork<MockExecutor> {
    uow_with(executor, CacheConfig::default())
}

pub fn uow_with(executor: MockExecutor, config: CacheConfig) -> UnitOfWork<MockExecutor> {
    UnitOfWork::builder(executor)
        .config(config)
        .registry(Arc::new(SubscriberRegistry::new()))
        .shared_cache(Arc::new(SharedCache::new()))
        .build()
}

pub fn user_row(id: i64, name: &str) -> ColumnValues {
    let mut row = ColumnValues::new();
    row.insert("id", Value::BigInt(id));
    row.insert("name", Value::Text(name.into()));
    row
}

pub fn post_row(id: i64, title: &str, author_id: i64) -> ColumnValues {
    let mut row = ColumnValues::new();
    row.insert("id", Value::BigInt(id));
    row.insert("title", Value::Text(title.into()));
    row.insert("author_id", Value::BigInt(author_id));
    row
}

pub fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}
