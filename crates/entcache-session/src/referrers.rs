//! Memoized relationship query results.
//!
//! Results are keyed by (owning identity, join column): the posts of user 1
//! are stored under `(users:1, posts.author_id)`, the author of post 7 under
//! `(posts:7, posts.author_id)`.

use crate::entity::Entity;
use crate::identity::IdentityKey;
use entcache_core::{Error, TableRef};
use std::collections::HashMap;

/// A join column, with the table its foreign key points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    /// Table owning the column.
    pub table: &'static str,
    /// Column name.
    pub column: &'static str,
    /// Referenced table, when the column is a foreign key.
    pub referee: Option<&'static str>,
}

impl ColumnRef {
    /// Resolve a column of `table` by name.
    pub fn new(table: TableRef, column: &str) -> Result<Self, Error> {
        let def = table.column(column).ok_or_else(|| Error::UnknownColumn {
            table: table.name,
            column: column.to_string(),
        })?;
        Ok(Self {
            table: table.name,
            column: def.name,
            referee: def.foreign_key.map(|fk| fk.table),
        })
    }

    /// Check if a structural write to `table` can change results over this column.
    pub fn touches(&self, table: &str) -> bool {
        self.table == table || self.referee == Some(table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReferrerKey {
    owner: IdentityKey,
    column: ColumnRef,
}

struct ReferrerEntry {
    entities: Vec<Entity>,
    protected: bool,
}

/// Relationship results of one unit of work.
#[derive(Default)]
pub struct ReferrerCache {
    entries: HashMap<ReferrerKey, ReferrerEntry>,
}

impl ReferrerCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached result for (owner, column).
    pub fn get(&self, owner: &IdentityKey, column: &ColumnRef) -> Option<Vec<Entity>> {
        let key = ReferrerKey {
            owner: owner.clone(),
            column: *column,
        };
        self.entries.get(&key).map(|e| e.entities.clone())
    }

    /// Store a result, replacing any previous one.
    pub fn put(&mut self, owner: IdentityKey, column: ColumnRef, entities: Vec<Entity>) {
        self.entries.insert(
            ReferrerKey { owner, column },
            ReferrerEntry {
                entities,
                protected: false,
            },
        );
    }

    /// Exempt an entry from structural-write invalidation.
    pub fn protect(&mut self, owner: &IdentityKey, column: &ColumnRef) -> bool {
        let key = ReferrerKey {
            owner: owner.clone(),
            column: *column,
        };
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.protected = true;
                true
            }
            None => false,
        }
    }

    /// Drop unprotected entries affected by a write to any of `tables`.
    ///
    /// An entry is affected when its owner belongs to one of the tables or
    /// its column is owned by, or references, one of them.
    pub fn invalidate_tables(&mut self, tables: &[&str]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            entry.protected
                || !tables
                    .iter()
                    .any(|t| key.owner.table() == *t || key.column.touches(t))
        });
        before - self.entries.len()
    }

    /// Drop entries for a column that changed on `owner`.
    ///
    /// Removes the cached reference of `owner` through `column`, and every
    /// unprotected referrer list over the same column, since the changed
    /// row may move between lists.
    pub fn forget_column(&mut self, owner: &IdentityKey, column: &ColumnRef) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            if key.column != *column {
                return true;
            }
            if key.owner == *owner {
                return false;
            }
            entry.protected
        });
        before - self.entries.len()
    }

    /// Number of cached results.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything, protected entries included.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entcache_core::{ColumnDef, KeyValue, SqlType, TableDef};

    const ID: ColumnDef = ColumnDef::new("id", SqlType::BigInt)
        .primary_key(true)
        .auto_increment(true);
    static USERS: TableDef = TableDef::new("users", &[ID]);
    static POSTS: TableDef = TableDef::new(
        "posts",
        &[
            ID,
            ColumnDef::new("author_id", SqlType::BigInt).references("users", "id"),
        ],
    );
    static TAGS: TableDef = TableDef::new("tags", &[ID]);

    fn owner(table: &'static str, id: i64) -> IdentityKey {
        IdentityKey::Resolved {
            table,
            key: KeyValue::Long(id),
        }
    }

    #[test]
    fn test_column_ref_requires_known_column() {
        let col = ColumnRef::new(&POSTS, "author_id").unwrap();
        assert_eq!(col.referee, Some("users"));
        assert!(col.touches("posts"));
        assert!(col.touches("users"));
        assert!(!col.touches("tags"));
        assert!(ColumnRef::new(&POSTS, "nope").is_err());
    }

    #[test]
    fn test_invalidate_by_owner_and_column_tables() {
        let author = ColumnRef::new(&POSTS, "author_id").unwrap();
        let tag_id = ColumnRef::new(&TAGS, "id").unwrap();
        let mut cache = ReferrerCache::new();
        cache.put(owner("users", 1), author, Vec::new());
        cache.put(owner("tags", 1), tag_id, Vec::new());

        assert_eq!(cache.invalidate_tables(&["comments"]), 0);
        assert_eq!(cache.invalidate_tables(&["posts"]), 1);
        assert!(cache.get(&owner("users", 1), &author).is_none());
        assert!(cache.get(&owner("tags", 1), &tag_id).is_some());
    }

    #[test]
    fn test_protected_entries_survive_invalidation() {
        let author = ColumnRef::new(&POSTS, "author_id").unwrap();
        let mut cache = ReferrerCache::new();
        cache.put(owner("users", 1), author, Vec::new());
        assert!(cache.protect(&owner("users", 1), &author));
        assert!(!cache.protect(&owner("users", 2), &author));

        assert_eq!(cache.invalidate_tables(&["users", "posts"]), 0);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_forget_column() {
        let author = ColumnRef::new(&POSTS, "author_id").unwrap();
        let mut cache = ReferrerCache::new();
        cache.put(owner("posts", 7), author, Vec::new());
        cache.put(owner("users", 1), author, Vec::new());
        cache.put(owner("users", 2), author, Vec::new());
        cache.protect(&owner("users", 2), &author);

        assert_eq!(cache.forget_column(&owner("posts", 7), &author), 2);
        assert!(cache.get(&owner("users", 2), &author).is_some());
    }
}
