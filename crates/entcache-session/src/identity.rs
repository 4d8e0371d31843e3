//! Lazily-resolved entity identities.
//!
//! A freshly created entity has no key until its insert runs. [`EntityId`]
//! is a shared, write-once slot: every clone observes the key as soon as the
//! flush engine fills it in, so write deltas of other entities can point at
//! an identity before it exists in storage.

use crate::unit_of_work::UnitOfWork;
use entcache_core::{BatchExecutor, Cx, Error, KeyValue, Outcome, TableRef};
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};

static NEXT_PENDING_TOKEN: AtomicU64 = AtomicU64::new(1);

struct IdSlot {
    table: TableRef,
    value: OnceLock<KeyValue>,
    /// Distinguishes unresolved identities from each other.
    pending_token: u64,
}

/// Identity of one row of one table, possibly not yet assigned.
///
/// Equality and ordering are over (table, resolved key); unresolved
/// identities are only equal to their own clones. Because resolution changes
/// the compared value, `EntityId` is deliberately not `Hash`; use
/// [`EntityId::key`] for map keys.
#[derive(Clone)]
pub struct EntityId {
    slot: Arc<IdSlot>,
}

/// Hashable snapshot of an [`EntityId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdentityKey {
    Resolved { table: &'static str, key: KeyValue },
    Pending { table: &'static str, token: u64 },
}

impl IdentityKey {
    /// Table the identity belongs to.
    pub fn table(&self) -> &'static str {
        match self {
            IdentityKey::Resolved { table, .. } | IdentityKey::Pending { table, .. } => *table,
        }
    }
}

impl EntityId {
    /// A new identity that will be assigned on insert.
    pub fn unresolved(table: TableRef) -> Self {
        Self::from_parts(table, None)
    }

    /// An identity with a known key.
    pub fn resolved(table: TableRef, key: KeyValue) -> Self {
        Self::from_parts(table, Some(key))
    }

    fn from_parts(table: TableRef, key: Option<KeyValue>) -> Self {
        let value = OnceLock::new();
        if let Some(key) = key {
            let _ = value.set(key);
        }
        Self {
            slot: Arc::new(IdSlot {
                table,
                value,
                pending_token: NEXT_PENDING_TOKEN.fetch_add(1, AtomicOrdering::Relaxed),
            }),
        }
    }

    /// Table this identity belongs to.
    pub fn table(&self) -> TableRef {
        self.slot.table
    }

    /// The key, if already assigned. Never triggers a flush.
    pub fn value(&self) -> Option<&KeyValue> {
        self.slot.value.get()
    }

    /// Check if the key has been assigned.
    pub fn is_resolved(&self) -> bool {
        self.slot.value.get().is_some()
    }

    /// Hashable snapshot of the current state.
    pub fn key(&self) -> IdentityKey {
        match self.value() {
            Some(key) => IdentityKey::Resolved {
                table: self.slot.table.name,
                key: key.clone(),
            },
            None => IdentityKey::Pending {
                table: self.slot.table.name,
                token: self.slot.pending_token,
            },
        }
    }

    /// Check if two handles share one slot.
    pub fn same_slot(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.slot, &b.slot)
    }

    /// Assign the key. An identity never changes once resolved; returns
    /// false if a different key was already set.
    pub(crate) fn assign(&self, key: KeyValue) -> bool {
        match self.slot.value.set(key) {
            Ok(()) => true,
            Err(key) => self.slot.value.get() == Some(&key),
        }
    }

    /// Return the key, flushing pending inserts of the owning table first if
    /// it is not assigned yet.
    pub async fn resolve<E: BatchExecutor>(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<E>,
    ) -> Outcome<KeyValue, Error> {
        if let Some(key) = self.value() {
            return Outcome::Ok(key.clone());
        }

        tracing::debug!(
            table = self.slot.table.name,
            "Identity read before insert; flushing pending inserts"
        );
        try_outcome!(uow.flush_inserts_for_table(cx, self.slot.table).await);

        match self.value() {
            Some(key) => Outcome::Ok(key.clone()),
            None => Outcome::Err(Error::unresolved(
                self.slot.table.name,
                "identity is still pending after flushing the table's inserts",
            )),
        }
    }
}

impl PartialEq for EntityId {
    fn eq(&self, other: &Self) -> bool {
        if Self::same_slot(self, other) {
            return true;
        }
        self.slot.table.name == other.slot.table.name
            && matches!((self.value(), other.value()), (Some(a), Some(b)) if a == b)
    }
}

impl Eq for EntityId {}

impl PartialOrd for EntityId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntityId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.slot
            .table
            .name
            .cmp(other.slot.table.name)
            .then_with(|| self.key().cmp(&other.key()))
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({self})")
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(key) => write!(f, "{}:{}", self.slot.table.name, key),
            None => write!(
                f,
                "{}:<pending #{}>",
                self.slot.table.name, self.slot.pending_token
            ),
        }
    }
}
