//! Column type definitions.

use crate::key::KeyKind;

/// Column types the cache distinguishes.
///
/// The cache never renders SQL, so this only needs enough detail to coerce
/// key values and describe columns in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    // Integer types
    SmallInt,
    Integer,
    BigInt,
    UnsignedInteger,
    UnsignedBigInt,

    // Floating point / fixed precision
    Double,
    Decimal { precision: u8, scale: u8 },

    Boolean,

    // String types
    VarChar(u32),
    Text,

    Blob,
    Timestamp,
    Uuid,
    Json,

    // Custom type name
    Custom(&'static str),
}

impl SqlType {
    /// Get the SQL type name for this type.
    pub fn sql_name(&self) -> String {
        match self {
            SqlType::SmallInt => "SMALLINT".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::UnsignedInteger => "INTEGER UNSIGNED".to_string(),
            SqlType::UnsignedBigInt => "BIGINT UNSIGNED".to_string(),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Decimal { precision, scale } => format!("DECIMAL({}, {})", precision, scale),
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::VarChar(len) => format!("VARCHAR({})", len),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Blob => "BLOB".to_string(),
            SqlType::Timestamp => "TIMESTAMP".to_string(),
            SqlType::Uuid => "UUID".to_string(),
            SqlType::Json => "JSON".to_string(),
            SqlType::Custom(name) => name.to_string(),
        }
    }

    /// Check if this type is an integer type.
    pub const fn is_integer(&self) -> bool {
        matches!(
            self,
            SqlType::SmallInt
                | SqlType::Integer
                | SqlType::BigInt
                | SqlType::UnsignedInteger
                | SqlType::UnsignedBigInt
        )
    }

    /// The key scalar variant used when a column of this type is (part of) a
    /// primary key, or `None` if the type cannot back an identity.
    pub const fn key_kind(&self) -> Option<KeyKind> {
        match self {
            SqlType::SmallInt | SqlType::Integer => Some(KeyKind::Int),
            SqlType::BigInt => Some(KeyKind::Long),
            SqlType::UnsignedInteger => Some(KeyKind::UInt),
            SqlType::UnsignedBigInt => Some(KeyKind::ULong),
            SqlType::Uuid | SqlType::VarChar(_) | SqlType::Text => Some(KeyKind::Uuid),
            _ => None,
        }
    }
}
