//! Identity key scalars.
//!
//! Every cached row is addressed by a [`KeyValue`]: one of a small closed set of
//! scalar variants, or a composite of them for multi-column primary keys.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar variant a primary key column maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Int,
    Long,
    UInt,
    ULong,
    Uuid,
}

/// A resolved primary key value.
///
/// Ordering is derived, so keys of the same variant order naturally; the
/// identity map relies on this for deterministic flush order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyValue {
    Int(i32),
    Long(i64),
    UInt(u32),
    ULong(u64),
    /// String-based UUID (canonical hyphenated lowercase form when built from bytes).
    Uuid(String),
    /// Multi-column key, in primary key column order.
    Composite(Vec<KeyValue>),
}

impl KeyValue {
    /// Coerce a column value into a key of the given kind.
    ///
    /// Returns `None` for NULL, DEFAULT, or values that do not fit the kind.
    pub fn from_value(kind: KeyKind, value: &Value) -> Option<Self> {
        match kind {
            KeyKind::Int => value
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(KeyValue::Int),
            KeyKind::Long => value.as_i64().map(KeyValue::Long),
            KeyKind::UInt => value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .map(KeyValue::UInt),
            KeyKind::ULong => value.as_u64().map(KeyValue::ULong),
            KeyKind::Uuid => match value {
                Value::Uuid(bytes) => Some(KeyValue::Uuid(format_uuid(bytes))),
                Value::Text(s) => Some(KeyValue::Uuid(s.clone())),
                _ => None,
            },
        }
    }

    /// Convert back into a column value.
    pub fn to_value(&self) -> Value {
        match self {
            KeyValue::Int(v) => Value::Int(*v),
            KeyValue::Long(v) => Value::BigInt(*v),
            KeyValue::UInt(v) => Value::from(*v),
            KeyValue::ULong(v) => Value::from_u64(*v),
            KeyValue::Uuid(s) => Value::Text(s.clone()),
            KeyValue::Composite(parts) => Value::Array(parts.iter().map(Self::to_value).collect()),
        }
    }

    /// Scalar kind of this key, `None` for composites.
    pub const fn kind(&self) -> Option<KeyKind> {
        match self {
            KeyValue::Int(_) => Some(KeyKind::Int),
            KeyValue::Long(_) => Some(KeyKind::Long),
            KeyValue::UInt(_) => Some(KeyKind::UInt),
            KeyValue::ULong(_) => Some(KeyKind::ULong),
            KeyValue::Uuid(_) => Some(KeyKind::Uuid),
            KeyValue::Composite(_) => None,
        }
    }

    /// The key `steps` positions before this one in an integer sequence.
    ///
    /// Used to back-derive the ids of earlier rows in a batch when the
    /// database only reports the last generated id. `None` on underflow or
    /// for non-integer keys.
    pub fn preceding(&self, steps: u64) -> Option<Self> {
        match self {
            KeyValue::Int(v) => i32::try_from(steps)
                .ok()
                .and_then(|s| v.checked_sub(s))
                .map(KeyValue::Int),
            KeyValue::Long(v) => i64::try_from(steps)
                .ok()
                .and_then(|s| v.checked_sub(s))
                .map(KeyValue::Long),
            KeyValue::UInt(v) => u32::try_from(steps)
                .ok()
                .and_then(|s| v.checked_sub(s))
                .map(KeyValue::UInt),
            KeyValue::ULong(v) => v.checked_sub(steps).map(KeyValue::ULong),
            KeyValue::Uuid(_) | KeyValue::Composite(_) => None,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::Long(v) => write!(f, "{}", v),
            KeyValue::UInt(v) => write!(f, "{}", v),
            KeyValue::ULong(v) => write!(f, "{}", v),
            KeyValue::Uuid(s) => write!(f, "{}", s),
            KeyValue::Composite(parts) => {
                write!(f, "(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", part)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<i32> for KeyValue {
    fn from(v: i32) -> Self {
        KeyValue::Int(v)
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Long(v)
    }
}

impl From<u32> for KeyValue {
    fn from(v: u32) -> Self {
        KeyValue::UInt(v)
    }
}

impl From<u64> for KeyValue {
    fn from(v: u64) -> Self {
        KeyValue::ULong(v)
    }
}

fn format_uuid(bytes: &[u8; 16]) -> String {
    let mut out = String::with_capacity(36);
    for (i, b) in bytes.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        out.push_str(&format!("{:02x}", b));
    }
    out
}
