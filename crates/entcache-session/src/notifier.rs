//! Change events and their subscribers.
//!
//! Every unit of work owns a [`ChangeNotifier`] with two queues: the
//! unprocessed queue, drained on [`ChangeNotifier::dispatch`], and the
//! permanent log kept for [`ChangeNotifier::registered_changes`]. Subscribers
//! live in a [`SubscriberRegistry`] shared by all units of work in the
//! process, so a callback may run for several units of work concurrently.

use crate::identity::EntityId;
use crate::unit_of_work::UnitOfWorkId;
use entcache_core::TableRef;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Updated,
    Removed,
}

/// One registered change.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Table of the changed entity.
    pub table: TableRef,
    /// Identity of the changed entity.
    pub id: EntityId,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Unit of work the change was registered in.
    pub unit_of_work: UnitOfWorkId,
}

impl ChangeEvent {
    /// Check if two events describe the same change of the same entity.
    pub fn same_change(&self, other: &ChangeEvent) -> bool {
        self.table.name == other.table.name && self.kind == other.kind && self.id == other.id
    }
}

/// Callback invoked for every dispatched event.
pub type Subscriber = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Handle returned by [`SubscriberRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Process-wide list of change subscribers.
///
/// Pass one registry to every unit of work that should report to the same
/// subscribers. [`SubscriberRegistry::global`] is created on first use.
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static Arc<SubscriberRegistry> {
        static GLOBAL: OnceLock<Arc<SubscriberRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(SubscriberRegistry::new()))
    }

    /// Add a subscriber.
    pub fn subscribe(&self, f: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(f)));
        tracing::debug!(subscription = id.0, "Change subscriber added");
        id
    }

    /// Remove a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        before != subscribers.len()
    }

    /// Number of subscribers.
    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Check if there are no subscribers.
    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Drop every subscriber.
    pub fn reset(&self) {
        self.subscribers.write().clear();
    }

    /// Deliver one event to every subscriber.
    ///
    /// The list is copied first so a subscriber may (un)subscribe while
    /// being called.
    pub fn notify(&self, event: &ChangeEvent) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();
        for subscriber in subscribers {
            subscriber(event);
        }
    }
}

/// Per-unit-of-work event queues.
pub struct ChangeNotifier {
    unit_of_work: UnitOfWorkId,
    registry: Arc<SubscriberRegistry>,
    unprocessed: Mutex<VecDeque<ChangeEvent>>,
    log: Mutex<Vec<ChangeEvent>>,
    keep_log: bool,
    dispatching: AtomicBool,
}

impl ChangeNotifier {
    pub fn new(unit_of_work: UnitOfWorkId, registry: Arc<SubscriberRegistry>, keep_log: bool) -> Self {
        Self {
            unit_of_work,
            registry,
            unprocessed: Mutex::new(VecDeque::new()),
            log: Mutex::new(Vec::new()),
            keep_log,
            dispatching: AtomicBool::new(false),
        }
    }

    /// The registry events are dispatched to.
    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Queue a change.
    ///
    /// An event identical to the last unprocessed one is dropped; returns
    /// false in that case.
    pub fn register_change(&self, table: TableRef, id: EntityId, kind: ChangeKind) -> bool {
        let event = ChangeEvent {
            table,
            id,
            kind,
            unit_of_work: self.unit_of_work,
        };

        let mut unprocessed = self.unprocessed.lock();
        if unprocessed.back().is_some_and(|last| last.same_change(&event)) {
            tracing::trace!(table = table.name, id = %event.id, ?kind, "Duplicate change skipped");
            return false;
        }
        tracing::trace!(table = table.name, id = %event.id, ?kind, "Change registered");
        if self.keep_log {
            self.log.lock().push(event.clone());
        }
        unprocessed.push_back(event);
        true
    }

    /// Deliver all unprocessed events to the subscribers, in FIFO order.
    ///
    /// Events registered by a subscriber during dispatch are delivered by the
    /// same loop. A nested call while dispatching returns immediately.
    /// Returns the number of events delivered by this call.
    pub fn dispatch(&self) -> usize {
        if self.dispatching.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let _guard = DispatchGuard(&self.dispatching);

        let mut delivered = 0;
        loop {
            let next = self.unprocessed.lock().pop_front();
            let Some(event) = next else {
                break;
            };
            self.registry.notify(&event);
            delivered += 1;
        }

        if delivered > 0 {
            tracing::debug!(
                unit_of_work = %self.unit_of_work,
                delivered,
                "Dispatched change events"
            );
        }
        delivered
    }

    /// The permanent event log.
    pub fn registered_changes(&self) -> Vec<ChangeEvent> {
        self.log.lock().clone()
    }

    /// Events waiting for the next dispatch.
    pub fn unprocessed(&self) -> Vec<ChangeEvent> {
        self.unprocessed.lock().iter().cloned().collect()
    }

    /// Drop all undelivered events.
    pub fn discard_unprocessed(&self) -> usize {
        let mut unprocessed = self.unprocessed.lock();
        let dropped = unprocessed.len();
        unprocessed.clear();
        dropped
    }
}

struct DispatchGuard<'a>(&'a AtomicBool);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
