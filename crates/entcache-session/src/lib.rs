//! Unit-of-work entity cache for entcache.
//!
//! `entcache-session` sits between an ORM's entity layer and its transaction
//! machinery. It keeps one record per identity, defers writes until a flush
//! and turns them into batched executor calls.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one [`Entity`] per (table, key) within a [`UnitOfWork`].
//! - **Lazy identities**: [`EntityId`] resolves on first read, flushing the
//!   owning table's inserts if needed.
//! - **Flush engine**: pending inserts per table in foreign key order, with
//!   same-table references resolved round by round; updates batched by the
//!   set of changed columns.
//! - **Change events**: [`ChangeNotifier`] queues created/updated/removed
//!   events and delivers them to a [`SubscriberRegistry`].
//! - **Lifecycle hooks**: before/after statement, commit and rollback.
//!
//! All operations that can reach storage take a `Cx` and return an
//! asupersync `Outcome`; local operations are synchronous.
//!
//! # Example
//!
//! ```ignore
//! let uow = UnitOfWork::new(executor);
//! let ann = uow.create(&USERS, [("name", "Ann")])?;
//! let bob = uow.create(&USERS, [("name", "Bob")])?;
//!
//! // One insert batch with both rows
//! uow.flush_inserts_for_table(&cx, &USERS).await;
//! assert!(ann.id().is_resolved());
//! ```

pub use entcache_core::{Cx, Outcome};

/// Forward non-`Ok` outcomes to the caller.
macro_rules! try_outcome {
    ($e:expr) => {
        match $e {
            $crate::Outcome::Ok(v) => v,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(e),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}

pub mod dependency;
pub mod entity;
pub mod flush;
pub mod identity;
pub mod identity_map;
pub mod lifecycle;
pub mod notifier;
pub mod referrers;
pub mod shared_cache;
pub mod unit_of_work;

pub use dependency::{DependencySorter, sort_tables};
pub use entity::{Entity, EntityState, FieldValue};
pub use flush::UpdateBatch;
pub use identity::{EntityId, IdentityKey};
pub use identity_map::IdentityMap;
pub use lifecycle::{NestedGuard, Statement};
pub use notifier::{
    ChangeEvent, ChangeKind, ChangeNotifier, Subscriber, SubscriberRegistry, SubscriptionId,
};
pub use referrers::{ColumnRef, ReferrerCache};
pub use shared_cache::SharedCache;
pub use unit_of_work::{UnitOfWork, UnitOfWorkBuilder, UnitOfWorkId};

use entcache_core::Error;
use serde::{Deserialize, Serialize};

/// Cache behavior switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Flush the target tables before a read query runs.
    pub flush_before_query: bool,
    /// Dispatch change events after each statement.
    pub dispatch_after_statement: bool,
    /// Derive the keys of a multi-row insert from the last generated key
    /// when the executor reports only that one.
    pub derive_keys_from_last_id: bool,
    /// Keep every registered event for [`UnitOfWork::registered_changes`].
    pub keep_event_log: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            flush_before_query: true,
            dispatch_after_statement: true,
            derive_keys_from_last_id: true,
            keep_event_log: true,
        }
    }
}

impl CacheConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::Custom(format!("Invalid cache config: {e}")))
    }

    /// Set whether the target tables are flushed before a read query.
    pub fn flush_before_query(mut self, value: bool) -> Self {
        self.flush_before_query = value;
        self
    }

    /// Set whether change events are dispatched after each statement.
    pub fn dispatch_after_statement(mut self, value: bool) -> Self {
        self.dispatch_after_statement = value;
        self
    }

    /// Set whether multi-row insert keys may be derived from the last generated key.
    pub fn derive_keys_from_last_id(mut self, value: bool) -> Self {
        self.derive_keys_from_last_id = value;
        self
    }

    /// Set whether registered events are kept for introspection.
    pub fn keep_event_log(mut self, value: bool) -> Self {
        self.keep_event_log = value;
        self
    }
}
