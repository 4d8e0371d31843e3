//! Identity Map pattern for tracking unique entity instances per key.
//!
//! The Identity Map ensures that each database row corresponds to exactly one
//! [`Entity`] within a unit of work. This provides:
//!
//! - **Uniqueness**: the same key always returns the same entity handle
//! - **Cache**: avoids redundant loads for the same row
//! - **Consistency**: changes to an entity are visible everywhere it's used
//!
//! Each table also keeps its not-yet-inserted entities, in scheduling order.
//! An entity lives either in the pending list or in the keyed map of its
//! table, never both.

use crate::entity::Entity;
use entcache_core::{KeyValue, TableRef};
use std::collections::{BTreeMap, HashMap};

/// Per-table storage.
struct TableSlot {
    table: TableRef,
    entities: BTreeMap<KeyValue, Entity>,
    pending_inserts: Vec<Entity>,
}

impl TableSlot {
    fn new(table: TableRef) -> Self {
        Self {
            table,
            entities: BTreeMap::new(),
            pending_inserts: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.pending_inserts.is_empty()
    }
}

/// Keyed and pending entities of every table touched by a unit of work.
#[derive(Default)]
pub struct IdentityMap {
    slots: HashMap<&'static str, TableSlot>,
}

impl IdentityMap {
    /// Create an empty identity map.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_mut(&mut self, table: TableRef) -> &mut TableSlot {
        self.slots
            .entry(table.name)
            .or_insert_with(|| TableSlot::new(table))
    }

    /// Look up an entity by key.
    ///
    /// Pending inserts with an up-front key (client-generated or explicit)
    /// are found too.
    pub fn get(&self, table: &str, key: &KeyValue) -> Option<Entity> {
        let slot = self.slots.get(table)?;
        if let Some(entity) = slot.entities.get(key) {
            return Some(entity.clone());
        }
        slot.pending_inserts
            .iter()
            .find(|e| e.id().value() == Some(key))
            .cloned()
    }

    /// Check if this exact entity is stored under its key.
    pub fn contains(&self, entity: &Entity) -> bool {
        let Some(key) = entity.id().value() else {
            return false;
        };
        self.slots
            .get(entity.table().name)
            .and_then(|slot| slot.entities.get(key))
            .is_some_and(|stored| Entity::ptr_eq(stored, entity))
    }

    /// Store an entity under its resolved key.
    ///
    /// Returns the entity already stored under that key, if any; in that
    /// case nothing is replaced.
    pub fn store(&mut self, entity: &Entity) -> Option<Entity> {
        let key = entity.id().value()?.clone();
        let slot = self.slot_mut(entity.table());
        if let Some(existing) = slot.entities.get(&key) {
            return Some(existing.clone());
        }
        slot.entities.insert(key, entity.clone());
        None
    }

    /// Remove an entity from its table's map and pending list.
    pub fn remove(&mut self, entity: &Entity) -> bool {
        let Some(slot) = self.slots.get_mut(entity.table().name) else {
            return false;
        };
        let before = slot.pending_inserts.len();
        slot.pending_inserts.retain(|e| !Entity::ptr_eq(e, entity));
        let mut removed = before != slot.pending_inserts.len();

        if let Some(key) = entity.id().value() {
            if slot
                .entities
                .get(key)
                .is_some_and(|stored| Entity::ptr_eq(stored, entity))
            {
                slot.entities.remove(key);
                removed = true;
            }
        }
        removed
    }

    /// Append to the table's pending-insert list. Returns false if already queued.
    pub fn schedule_insert(&mut self, entity: &Entity) -> bool {
        let slot = self.slot_mut(entity.table());
        if slot
            .pending_inserts
            .iter()
            .any(|e| Entity::ptr_eq(e, entity))
        {
            return false;
        }
        slot.pending_inserts.push(entity.clone());
        true
    }

    /// Take the whole pending-insert list of a table.
    pub fn take_pending(&mut self, table: &str) -> Vec<Entity> {
        self.slots
            .get_mut(table)
            .map(|slot| std::mem::take(&mut slot.pending_inserts))
            .unwrap_or_default()
    }

    /// Put entities back at the front of the pending list, keeping their order.
    pub fn restore_pending(&mut self, table: TableRef, mut entities: Vec<Entity>) {
        if entities.is_empty() {
            return;
        }
        let slot = self.slot_mut(table);
        entities.append(&mut slot.pending_inserts);
        slot.pending_inserts = entities;
    }

    /// Pending inserts of a table, in scheduling order.
    pub fn pending(&self, table: &str) -> &[Entity] {
        self.slots
            .get(table)
            .map(|slot| slot.pending_inserts.as_slice())
            .unwrap_or(&[])
    }

    /// Check if a table has pending inserts.
    pub fn has_pending(&self, table: &str) -> bool {
        !self.pending(table).is_empty()
    }

    /// Pending inserts across all tables.
    pub fn pending_count(&self) -> usize {
        self.slots.values().map(|s| s.pending_inserts.len()).sum()
    }

    /// Keyed entities of a table, in key order.
    pub fn entities(&self, table: &str) -> Vec<Entity> {
        self.slots
            .get(table)
            .map(|slot| slot.entities.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of keyed entities of a table.
    pub fn len(&self, table: &str) -> usize {
        self.slots.get(table).map_or(0, |slot| slot.entities.len())
    }

    /// Check if nothing is cached or pending.
    pub fn is_empty(&self) -> bool {
        self.slots.values().all(TableSlot::is_empty)
    }

    /// Tables with keyed or pending entities, sorted by name.
    pub fn tables(&self) -> Vec<TableRef> {
        let mut tables: Vec<TableRef> = self
            .slots
            .values()
            .filter(|slot| !slot.is_empty())
            .map(|slot| slot.table)
            .collect();
        tables.sort_by_key(|t| t.name);
        tables
    }

    /// Drop the keyed entities of a table, keeping its pending inserts.
    ///
    /// Returns the evicted entities.
    pub fn clear_table(&mut self, table: &str) -> Vec<Entity> {
        self.slots
            .get_mut(table)
            .map(|slot| std::mem::take(&mut slot.entities).into_values().collect())
            .unwrap_or_default()
    }

    /// Drop everything. Returns all evicted entities, keyed and pending.
    pub fn clear(&mut self) -> Vec<Entity> {
        let mut evicted = Vec::new();
        for (_, slot) in self.slots.drain() {
            evicted.extend(slot.entities.into_values());
            evicted.extend(slot.pending_inserts);
        }
        evicted
    }
}
