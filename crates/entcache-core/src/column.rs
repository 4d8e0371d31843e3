//! Column descriptors.
//!
//! A [`ColumnDef`] is plain data: type, nullability, defaults and foreign key
//! linkage. It is `const`-constructible so tables can be declared as statics:
//!
//! ```
//! use entcache_core::{ColumnDef, SqlType, Value};
//!
//! fn active() -> Value {
//!     Value::Bool(true)
//! }
//!
//! const AUTHOR_ID: ColumnDef = ColumnDef::new("author_id", SqlType::BigInt).references("users", "id");
//! const ACTIVE: ColumnDef = ColumnDef::new("active", SqlType::Boolean).client_default(active);
//! assert!(AUTHOR_ID.is_foreign_key());
//! assert!(ACTIVE.is_defaultable());
//! ```

use crate::types::SqlType;
use crate::value::Value;

/// Foreign key target of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    /// Referenced table name.
    pub table: &'static str,
    /// Referenced column name.
    pub column: &'static str,
}

/// Metadata about one column of a cached table.
#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    /// Database column name
    pub name: &'static str,
    /// SQL type for this column
    pub sql_type: SqlType,
    /// Whether this column accepts NULL
    pub nullable: bool,
    /// Whether this column is (part of) the primary key
    pub primary_key: bool,
    /// Whether the database assigns this column on insert
    pub auto_increment: bool,
    /// Whether the database computes this column (never user-writable)
    pub generated: bool,
    /// Client-side default, evaluated when an insert omits the column
    pub client_default: Option<fn() -> Value>,
    /// Database-side default expression
    pub db_default: Option<&'static str>,
    /// Foreign key reference
    pub foreign_key: Option<ForeignKey>,
}

impl ColumnDef {
    /// Create a non-nullable column with no defaults.
    pub const fn new(name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            sql_type,
            nullable: false,
            primary_key: false,
            auto_increment: false,
            generated: false,
            client_default: None,
            db_default: None,
            foreign_key: None,
        }
    }

    /// Set nullable flag.
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Set primary key flag.
    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    /// Set auto-increment flag.
    pub const fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self
    }

    /// Mark this column as computed by the database.
    pub const fn generated(mut self, value: bool) -> Self {
        self.generated = value;
        self
    }

    /// Set a client-side default function.
    pub const fn client_default(mut self, f: fn() -> Value) -> Self {
        self.client_default = Some(f);
        self
    }

    /// Set a database-side default expression.
    pub const fn db_default(mut self, expr: &'static str) -> Self {
        self.db_default = Some(expr);
        self
    }

    /// Set the foreign key target.
    pub const fn references(mut self, table: &'static str, column: &'static str) -> Self {
        self.foreign_key = Some(ForeignKey { table, column });
        self
    }

    /// Check if this column participates in a foreign key.
    pub const fn is_foreign_key(&self) -> bool {
        self.foreign_key.is_some()
    }

    /// Check if the database fills this column in on insert.
    pub const fn is_database_generated(&self) -> bool {
        self.generated || self.auto_increment
    }

    /// Check if an insert may omit this column.
    ///
    /// True when the column is nullable, has a client or database default,
    /// or is filled in by the database.
    pub const fn is_defaultable(&self) -> bool {
        self.nullable
            || self.client_default.is_some()
            || self.db_default.is_some()
            || self.is_database_generated()
    }

    /// The value to send for this column when a batched insert row omits it.
    ///
    /// Returns `None` when the column cannot be omitted.
    pub fn fill_value(&self) -> Option<Value> {
        if let Some(f) = self.client_default {
            Some(f())
        } else if self.db_default.is_some() || self.is_database_generated() {
            Some(Value::Default)
        } else if self.nullable {
            Some(Value::Null)
        } else {
            None
        }
    }
}
