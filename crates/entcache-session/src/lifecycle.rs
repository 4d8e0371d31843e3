//! Transaction lifecycle hooks.
//!
//! The transaction layer calls these around every statement it executes and
//! at commit and rollback, so that reads observe pending writes, bulk writes
//! drop stale cache entries and change events reach subscribers.
//!
//! Statements the cache runs itself (insert, update and delete batches) are
//! executed inside a [`NestedGuard`]. While nested, the before-statement hook
//! does not flush and bulk writes keep the identity maps.

use crate::identity::EntityId;
use crate::notifier::{ChangeEvent, SubscriberRegistry, SubscriptionId};
use crate::unit_of_work::UnitOfWork;
use entcache_core::{BatchExecutor, Cx, Error, Outcome, StatementKind, TableRef};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A statement about to run, as seen by the lifecycle hooks.
#[derive(Debug, Clone)]
pub struct Statement {
    kind: StatementKind,
    targets: Vec<TableRef>,
}

impl Statement {
    /// Describe a statement of `kind` touching `targets`.
    pub fn new(kind: StatementKind, targets: &[TableRef]) -> Self {
        Self {
            kind,
            targets: targets.to_vec(),
        }
    }

    /// A read query over `targets`.
    pub fn query(targets: &[TableRef]) -> Self {
        Self::new(StatementKind::Query, targets)
    }

    /// An insert into `targets`.
    pub fn insert(targets: &[TableRef]) -> Self {
        Self::new(StatementKind::Insert, targets)
    }

    /// A bulk update of `targets`.
    pub fn update(targets: &[TableRef]) -> Self {
        Self::new(StatementKind::Update, targets)
    }

    /// A delete from `targets`.
    pub fn delete(targets: &[TableRef]) -> Self {
        Self::new(StatementKind::Delete, targets)
    }

    /// An upsert into `targets`.
    pub fn upsert(targets: &[TableRef]) -> Self {
        Self::new(StatementKind::Upsert, targets)
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn targets(&self) -> &[TableRef] {
        &self.targets
    }
}

/// Marks statements executed on behalf of the cache. Released on drop.
#[must_use = "the nested scope ends when the guard is dropped"]
pub struct NestedGuard<'a> {
    depth: &'a AtomicUsize,
}

impl Drop for NestedGuard<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

struct SubscriptionGuard<'a> {
    registry: &'a Arc<SubscriberRegistry>,
    id: SubscriptionId,
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        self.registry.unsubscribe(self.id);
    }
}

impl<E: BatchExecutor> UnitOfWork<E> {
    /// Enter a nested lifecycle scope.
    pub fn enter_nested(&self) -> NestedGuard<'_> {
        self.depth().fetch_add(1, Ordering::AcqRel);
        NestedGuard {
            depth: self.depth(),
        }
    }

    /// Check if a cache-driven statement is in progress.
    pub fn is_nested(&self) -> bool {
        self.depth().load(Ordering::Acquire) > 0
    }

    /// Hook run before the transaction executes `statement`.
    ///
    /// - query: flushes the target tables (if `flush_before_query`)
    /// - insert: flushes everything and drops referrers of the targets
    /// - update, delete, upsert: flushes everything, drops referrers of the
    ///   targets and clears their identity maps
    ///
    /// Inside a nested scope nothing is flushed and identity maps are kept.
    pub async fn before_execution(&self, cx: &Cx, statement: &Statement) -> Outcome<(), Error> {
        if !self.is_nested() {
            match statement.kind {
                StatementKind::Query => {
                    if self.config().flush_before_query {
                        try_outcome!(self.flush(cx, Some(&statement.targets)).await);
                    }
                }
                _ => {
                    try_outcome!(self.flush(cx, None).await);
                }
            }
        }
        self.statement_started(statement);
        Outcome::Ok(())
    }

    /// Invalidation part of [`UnitOfWork::before_execution`].
    pub(crate) fn statement_started(&self, statement: &Statement) {
        match statement.kind {
            StatementKind::Query => {}
            StatementKind::Insert => self.invalidate_referrers(&statement.targets, false),
            StatementKind::Update | StatementKind::Delete | StatementKind::Upsert => {
                self.invalidate_referrers(&statement.targets, !self.is_nested());
            }
        }
    }

    /// Hook run after the transaction executed `statement`.
    ///
    /// Dispatches queued change events, except after an insert the cache
    /// ran itself. Returns the number of events delivered.
    pub fn after_execution(&self, statement: &Statement) -> usize {
        if !self.config().dispatch_after_statement {
            return 0;
        }
        if statement.kind == StatementKind::Insert && self.is_nested() {
            return 0;
        }
        self.dispatch()
    }

    /// Hook run before the transaction commits.
    ///
    /// Flushes, dispatches, then flushes and dispatches again for anything
    /// subscribers changed. Shared-cache tables that gained rows are expired.
    /// Returns the identities created by both flushes.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(unit_of_work = %self.id()))]
    pub async fn before_commit(&self, cx: &Cx) -> Outcome<Vec<EntityId>, Error> {
        let mut created = try_outcome!(self.flush(cx, None).await);
        self.dispatch();
        created.extend(try_outcome!(self.flush(cx, None).await));
        self.dispatch();

        let expired = self.shared_cache().expire_created(&created);
        tracing::info!(
            created = created.len(),
            expired_tables = expired,
            "Unit of work ready to commit"
        );
        Outcome::Ok(created)
    }

    /// Hook run when the transaction rolls back.
    ///
    /// Drops every cached relationship result, record and pending insert;
    /// the dropped records become detached. Undelivered events are
    /// discarded while the event log is kept. Returns the number of records
    /// dropped.
    pub fn before_rollback(&self) -> usize {
        let evicted = {
            let mut map = self.core().map.lock();
            self.core().referrers.lock().clear();
            map.clear()
        };
        let discarded = self.core().notifier.discard_unprocessed();
        for entity in &evicted {
            entity.detach();
        }
        tracing::info!(
            unit_of_work = %self.id(),
            evicted = evicted.len(),
            discarded_events = discarded,
            "Unit of work rolled back"
        );
        evicted.len()
    }

    /// Run `body` with `hook` subscribed, then commit-flush.
    ///
    /// The hook sees the events of the body and of the commit flushes; it
    /// is unsubscribed afterwards even if the body fails.
    pub async fn with_hook<H, F, Fut, T>(&self, cx: &Cx, hook: H, body: F) -> Outcome<T, Error>
    where
        H: Fn(&ChangeEvent) + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T, Error>>,
    {
        let registry = self.registry();
        let _subscription = SubscriptionGuard {
            registry,
            id: registry.subscribe(hook),
        };
        let value = try_outcome!(body().await);
        try_outcome!(self.before_commit(cx).await);
        Outcome::Ok(value)
    }
}
