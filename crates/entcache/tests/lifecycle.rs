mod common;

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::*;
use entcache::prelude::*;

#[test]
fn rollback_detaches_everything() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let exec = MockExecutor::new();
        exec.seed(&USERS, user_row(1, "Ann"));
        let uow = uow(exec.clone());
        let ann = unwrap_outcome(uow.load(&cx, &USERS, KeyValue::Long(1)).await).expect("row");
        let bob = uow.create(&USERS, [("name", "Bob")]).expect("create Bob");
        ann.set("name", "Anna").expect("set name");
        assert_eq!(uow.unprocessed_changes().len(), 1);

        assert_eq!(uow.before_rollback(), 2);
        assert!(uow.find(&USERS, &KeyValue::Long(1)).is_none());
        assert_eq!(uow.pending_insert_count(), 0);
        assert!(uow.unprocessed_changes().is_empty());
        assert_eq!(uow.registered_changes().len(), 1);
        assert_eq!(ann.state(), EntityState::Detached);
        assert_eq!(bob.state(), EntityState::Detached);

        let err = expect_err(ann.flush(&cx, &uow, None).await);
        assert!(matches!(err, Error::DetachedEntity { table: "users" }));
        let flushed = unwrap_outcome(uow.flush(&cx, None).await);
        assert!(flushed.is_empty());
        assert_eq!(exec.calls().len(), 1);

        // the next lookup goes back to storage
        let reloaded =
            unwrap_outcome(uow.load(&cx, &USERS, KeyValue::Long(1)).await).expect("row");
        assert!(!Entity::ptr_eq(&reloaded, &ann));
        assert_eq!(exec.selects(), 2);
        assert_eq!(uow.referrer_count(), 0);
    });
}

#[test]
fn repeated_changes_are_queued_once() {
    let uow = uow(MockExecutor::new());
    let user = uow.wrap_row(&USERS, user_row(1, "Ann")).expect("wrap row");

    user.set("name", "A").expect("set name");
    user.set("name", "B").expect("set name");
    assert_eq!(uow.unprocessed_changes().len(), 1);
    assert!(!uow.register_change(&USERS, user.id().clone(), ChangeKind::Updated));

    assert!(uow.register_change(&USERS, user.id().clone(), ChangeKind::Removed));
    assert!(uow.register_change(&USERS, user.id().clone(), ChangeKind::Updated));
    assert_eq!(uow.unprocessed_changes().len(), 3);
    assert_eq!(uow.dispatch(), 3);
    assert!(uow.unprocessed_changes().is_empty());
}

#[test]
fn deleting_a_persistent_record_runs_immediately() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let exec = MockExecutor::new();
        exec.seed(&USERS, user_row(1, "Ann"));
        let uow = uow(exec.clone());
        let ann = unwrap_outcome(uow.load(&cx, &USERS, KeyValue::Long(1)).await).expect("row");

        unwrap_outcome(ann.delete(&cx, &uow).await);
        assert_eq!(exec.deletes("users"), vec![KeyValue::Long(1)]);
        assert_eq!(ann.state(), EntityState::Deleted);
        assert!(uow.find(&USERS, &KeyValue::Long(1)).is_none());
        assert!(ann.set("name", "Ghost").is_err());

        let removed = uow.registered_changes();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].kind, ChangeKind::Removed);

        // deleting twice is a no-op
        unwrap_outcome(ann.delete(&cx, &uow).await);
        assert_eq!(exec.deletes("users").len(), 1);
    });
}

#[test]
fn delete_writes_pending_changes_first() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let exec = MockExecutor::new();
        exec.seed(&USERS, user_row(1, "Ann"));
        exec.seed(&USERS, user_row(2, "Bob"));
        let uow = uow(exec.clone());
        let ann = unwrap_outcome(uow.load(&cx, &USERS, KeyValue::Long(1)).await).expect("row");
        let bob = unwrap_outcome(uow.load(&cx, &USERS, KeyValue::Long(2)).await).expect("row");
        bob.set("name", "Robert").expect("set name");
        let post = uow
            .create(
                &POSTS,
                [
                    ("title", FieldValue::from("Hello")),
                    ("author_id", FieldValue::from(&ann)),
                ],
            )
            .expect("create post");

        unwrap_outcome(ann.delete(&cx, &uow).await);

        let writes: Vec<String> = exec
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                common::Call::Insert { table, .. } => Some(format!("insert {table}")),
                common::Call::Update { table, .. } => Some(format!("update {table}")),
                common::Call::Delete { table, .. } => Some(format!("delete {table}")),
                common::Call::Select { .. } => None,
            })
            .collect();
        assert_eq!(writes, vec!["update users", "insert posts", "delete users"]);
        assert_eq!(uow.pending_insert_count(), 0);
        assert!(!bob.is_dirty());
        assert_eq!(post.state(), EntityState::Persistent);
        assert_eq!(ann.state(), EntityState::Deleted);
    });
}

#[test]
fn deleting_a_pending_insert_only_evicts_it() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let exec = MockExecutor::new();
        let uow = uow(exec.clone());
        let draft = uow.create(&USERS, [("name", "Draft")]).expect("create draft");

        unwrap_outcome(draft.delete(&cx, &uow).await);
        assert_eq!(draft.state(), EntityState::Deleted);
        assert_eq!(uow.pending_insert_count(), 0);
        assert!(uow.registered_changes().is_empty());

        unwrap_outcome(uow.flush(&cx, None).await);
        assert!(exec.calls().is_empty());
    });
}

#[test]
fn hook_sees_the_changes_of_its_body() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let exec = MockExecutor::new();
        let uow = uow(exec.clone());
        let seen: Arc<Mutex<Vec<(ChangeKind, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let uow_ref = &uow;
        let value = unwrap_outcome(
            uow.with_hook(
                &cx,
                move |event: &ChangeEvent| sink.lock().push((event.kind, event.id.to_string())),
                || async move {
                    match uow_ref.create(&USERS, [("name", "Ann")]) {
                        Ok(_) => Outcome::Ok(7),
                        Err(e) => Outcome::Err(e),
                    }
                },
            )
            .await,
        );

        assert_eq!(value, 7);
        assert_eq!(
            *seen.lock(),
            vec![(ChangeKind::Created, "users:1".to_string())]
        );
        assert!(uow.registry().is_empty());
        assert_eq!(exec.inserts("users").len(), 1);
    });
}

#[test]
fn commit_flushes_and_dispatches() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let exec = MockExecutor::new();
        exec.seed(&USERS, user_row(1, "Ann"));
        let uow = uow(exec.clone());
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        uow.registry().subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let ann = unwrap_outcome(uow.load(&cx, &USERS, KeyValue::Long(1)).await).expect("row");
        ann.set("name", "Anna").expect("set name");
        uow.create(&USERS, [("name", "Bob")]).expect("create Bob");

        let created = unwrap_outcome(uow.before_commit(&cx).await);
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].value(), Some(&KeyValue::Long(2)));
        assert_eq!(exec.inserts("users").len(), 1);
        assert_eq!(exec.updates("users").len(), 1);
        assert!(!ann.is_dirty());
        // updated + created
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        assert!(uow.unprocessed_changes().is_empty());
    });
}

#[test]
fn query_flushes_only_its_targets() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let exec = MockExecutor::new();
        let uow = uow(exec.clone());
        uow.create(&USERS, [("name", "Ann")]).expect("create Ann");

        unwrap_outcome(uow.before_execution(&cx, &Statement::query(&[&POSTS])).await);
        assert!(exec.calls().is_empty());

        unwrap_outcome(uow.before_execution(&cx, &Statement::query(&[&USERS])).await);
        assert_eq!(exec.inserts("users").len(), 1);
    });
}

#[test]
fn query_flush_can_be_disabled() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let exec = MockExecutor::new();
        let uow = uow_with(exec.clone(), CacheConfig::new().flush_before_query(false));
        uow.create(&USERS, [("name", "Ann")]).expect("create Ann");

        unwrap_outcome(uow.before_execution(&cx, &Statement::query(&[&USERS])).await);
        assert!(exec.calls().is_empty());
        assert_eq!(uow.pending_insert_count(), 1);
    });
}

#[test]
fn bulk_writes_clear_the_identity_map() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let exec = MockExecutor::new();
        let uow = uow(exec.clone());
        let ann = uow.wrap_row(&USERS, user_row(7, "Ann")).expect("wrap row");
        let bob = uow.create(&USERS, [("name", "Bob")]).expect("create Bob");

        unwrap_outcome(uow.before_execution(&cx, &Statement::upsert(&[&USERS])).await);
        assert_eq!(exec.inserts("users").len(), 1);
        assert_eq!(uow.cached_count(&USERS), 0);
        assert_eq!(ann.state(), EntityState::Detached);
        assert_eq!(bob.state(), EntityState::Detached);

        // insert statements keep cached records
        let cy = uow.wrap_row(&USERS, user_row(3, "Cy")).expect("wrap row");
        unwrap_outcome(uow.before_execution(&cx, &Statement::insert(&[&USERS])).await);
        assert_eq!(uow.cached_count(&USERS), 1);
        assert_eq!(cy.state(), EntityState::Persistent);
    });
}

#[test]
fn nested_insert_does_not_dispatch() {
    let uow = uow_with(MockExecutor::new(), CacheConfig::new());
    let id = EntityId::resolved(&USERS, KeyValue::Long(1));
    uow.register_change(&USERS, id, ChangeKind::Created);

    {
        let _nested = uow.enter_nested();
        assert!(uow.is_nested());
        assert_eq!(uow.after_execution(&Statement::insert(&[&USERS])), 0);
    }
    assert!(!uow.is_nested());
    assert_eq!(uow.after_execution(&Statement::update(&[&USERS])), 1);

    let quiet = uow_with(
        MockExecutor::new(),
        CacheConfig::new().dispatch_after_statement(false),
    );
    quiet.register_change(&USERS, EntityId::resolved(&USERS, KeyValue::Long(2)), ChangeKind::Created);
    assert_eq!(quiet.after_execution(&Statement::query(&[])), 0);
    assert_eq!(quiet.unprocessed_changes().len(), 1);
}

#[test]
fn invalidating_with_identity_maps_drops_unflushed_changes() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let exec = MockExecutor::new();
        let uow = uow(exec.clone());
        let ann = uow.wrap_row(&USERS, user_row(1, "Ann")).expect("wrap row");
        ann.set("name", "Anna").expect("set name");

        uow.invalidate_referrers(&[&USERS], true);
        assert_eq!(ann.state(), EntityState::Detached);
        assert!(uow.find(&USERS, &KeyValue::Long(1)).is_none());

        unwrap_outcome(uow.flush(&cx, None).await);
        assert!(exec.updates("users").is_empty());
    });
}

#[test]
fn referrer_results_are_memoized_and_invalidated() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let exec = MockExecutor::new();
        let uow = uow(exec.clone());
        let author = uow.wrap_row(&USERS, user_row(1, "Ann")).expect("wrap row");
        let post = uow.wrap_row(&POSTS, post_row(5, "Hi", 1)).expect("wrap row");
        let runs = &AtomicUsize::new(0);
        let query = || {
            let post = post.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Outcome::Ok(vec![post])
            }
        };

        let first = unwrap_outcome(
            uow.get_or_put_referrers(author.id(), &POSTS, "author_id", query)
                .await,
        );
        let second = unwrap_outcome(
            uow.get_or_put_referrers(author.id(), &POSTS, "author_id", query)
                .await,
        );
        assert_eq!(first.len(), 1);
        assert!(Entity::ptr_eq(&first[0], &second[0]));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(uow.referrer_count(), 1);

        let unknown = uow
            .get_or_put_referrers(author.id(), &POSTS, "nope", query)
            .await;
        assert!(matches!(unknown, Outcome::Err(Error::UnknownColumn { .. })));

        // inserting into the referencing table drops the result
        unwrap_outcome(uow.before_execution(&cx, &Statement::insert(&[&POSTS])).await);
        assert_eq!(uow.referrer_count(), 0);
        assert_eq!(uow.cached_count(&USERS), 1);
    });
}

#[test]
fn protected_referrers_survive_bulk_writes() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let uow = uow(MockExecutor::new());
        let author = uow.wrap_row(&USERS, user_row(1, "Ann")).expect("wrap row");

        assert!(!uow.protect_referrers(author.id(), &POSTS, "author_id").expect("column exists"));
        unwrap_outcome(
            uow.get_or_put_referrers(author.id(), &POSTS, "author_id", || async {
                Outcome::Ok(Vec::new())
            })
            .await,
        );
        assert!(uow.protect_referrers(author.id(), &POSTS, "author_id").expect("column exists"));

        unwrap_outcome(uow.before_execution(&cx, &Statement::delete(&[&POSTS])).await);
        assert_eq!(uow.referrer_count(), 1);

        uow.before_rollback();
        assert_eq!(uow.referrer_count(), 0);
    });
}

#[test]
fn changing_a_foreign_key_forgets_its_referrers() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");

    rt.block_on(async {
        let uow = uow(MockExecutor::new());
        let author = uow.wrap_row(&USERS, user_row(1, "Ann")).expect("wrap row");
        let post = uow.wrap_row(&POSTS, post_row(5, "Hi", 1)).expect("wrap row");
        let listed = post.clone();
        unwrap_outcome(
            uow.get_or_put_referrers(author.id(), &POSTS, "author_id", || async move {
                Outcome::Ok(vec![listed])
            })
            .await,
        );
        assert_eq!(uow.referrer_count(), 1);

        post.set("title", "Renamed").expect("set title");
        assert_eq!(uow.referrer_count(), 1);
        post.set("author_id", 2_i64).expect("set author");
        assert_eq!(uow.referrer_count(), 0);
    });
}
