//! Table descriptors.

use crate::column::{ColumnDef, ForeignKey};
use crate::executor::ColumnValues;
use crate::key::KeyValue;
use crate::value::Value;

/// Static description of a cached table.
///
/// Tables are compared by name; two descriptors with the same name are
/// assumed to describe the same table.
#[derive(Debug)]
pub struct TableDef {
    /// Table name
    pub name: &'static str,
    /// All columns, in declaration order
    pub columns: &'static [ColumnDef],
    /// Rows of an immutable table are never updated once persisted
    pub immutable: bool,
}

/// Shorthand for the table references entities and identities carry.
pub type TableRef = &'static TableDef;

impl TableDef {
    /// Create a mutable table descriptor.
    pub const fn new(name: &'static str, columns: &'static [ColumnDef]) -> Self {
        Self {
            name,
            columns,
            immutable: false,
        }
    }

    /// Set the immutable flag.
    pub const fn immutable(mut self, value: bool) -> Self {
        self.immutable = value;
        self
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&'static ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Primary key columns, in declaration order.
    pub fn key_columns(&self) -> impl Iterator<Item = &'static ColumnDef> + use<> {
        self.columns.iter().filter(|c| c.primary_key)
    }

    /// The single primary key column, if the key is not composite.
    pub fn single_key_column(&self) -> Option<&'static ColumnDef> {
        let mut keys = self.key_columns();
        match (keys.next(), keys.next()) {
            (Some(col), None) => Some(col),
            _ => None,
        }
    }

    /// Check if this table's key is one database-assigned integer column.
    pub fn has_auto_increment_key(&self) -> bool {
        self.single_key_column()
            .is_some_and(|c| c.auto_increment && c.sql_type.is_integer())
    }

    /// Foreign key columns with their targets.
    pub fn foreign_keys(&self) -> impl Iterator<Item = (&'static ColumnDef, ForeignKey)> + use<> {
        self.columns
            .iter()
            .filter_map(|c| c.foreign_key.map(|fk| (c, fk)))
    }

    /// Check if any column of this table references `table`.
    pub fn references(&self, table: &str) -> bool {
        self.foreign_keys().any(|(_, fk)| fk.table == table)
    }

    /// Extract the identity key from a row.
    ///
    /// Returns `None` if any key column is missing or cannot be coerced.
    pub fn key_from_row(&self, row: &ColumnValues) -> Option<KeyValue> {
        let mut parts = Vec::new();
        for col in self.key_columns() {
            let kind = col.sql_type.key_kind()?;
            parts.push(KeyValue::from_value(kind, row.get(col.name)?)?);
        }
        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(KeyValue::Composite(parts)),
        }
    }

    /// Spread a key over its columns.
    pub fn key_values(&self, key: &KeyValue) -> Vec<(&'static str, Value)> {
        match key {
            KeyValue::Composite(parts) => self
                .key_columns()
                .zip(parts)
                .map(|(col, part)| (col.name, part.to_value()))
                .collect(),
            single => self
                .key_columns()
                .take(1)
                .map(|col| (col.name, single.to_value()))
                .collect(),
        }
    }

    /// Key produced client-side, when the key column has a client default.
    pub fn client_generated_key(&self) -> Option<KeyValue> {
        let col = self.single_key_column()?;
        let default = col.client_default?;
        KeyValue::from_value(col.sql_type.key_kind()?, &default())
    }
}

impl PartialEq for TableDef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for TableDef {}
