mod common;

use common::{init_tracing, member, shop, shop_store};
use ormctx::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn events_fire_in_order_through_a_commit() {
    init_tracing();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut uow = UnitOfWork::new(shop(), shop_store()).unwrap();
    for (name, register) in [
        ("before_flush", 0),
        ("after_flush", 1),
        ("after_commit", 2),
        ("after_rollback", 3),
    ] {
        let log = Arc::clone(&log);
        let push = move || -> ormctx::Result<()> {
            log.lock().unwrap().push(name);
            Ok(())
        };
        match register {
            0 => uow.on_before_flush(push),
            1 => uow.on_after_flush(push),
            2 => uow.on_after_commit(push),
            _ => uow.on_after_rollback(push),
        }
    }

    uow.persist(&member("Kim")).unwrap();
    uow.commit().unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        ["before_flush", "after_flush", "after_commit"]
    );
}

#[test]
fn rollback_discards_flushed_writes() {
    init_tracing();
    let store = shop_store();
    let rolled_back = Arc::new(AtomicUsize::new(0));
    let mut uow = UnitOfWork::new(shop(), store.clone()).unwrap();
    let counter = Arc::clone(&rolled_back);
    uow.on_after_rollback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    uow.persist(&member("Kim")).unwrap();
    uow.flush().unwrap();
    assert_eq!(store.row_count("members"), 1);
    uow.rollback().unwrap();

    assert_eq!(store.row_count("members"), 0);
    assert!(!store.in_transaction());
    assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
}

#[test]
fn queries_see_pending_writes_only_when_configured_to_flush_first() {
    init_tracing();
    let store = shop_store();
    let mut uow = UnitOfWork::new(shop(), store.clone()).unwrap();
    uow.persist(&member("Kim")).unwrap();
    assert!(uow.query_all("Member").unwrap().is_empty());
    drop(uow);

    let config = UnitOfWorkConfig {
        flush_before_query: true,
        ..UnitOfWorkConfig::default()
    };
    let mut uow = UnitOfWork::with_config(shop(), store.clone(), config).unwrap();
    let kim = member("Kim");
    uow.persist(&kim).unwrap();
    let found = uow.query_by("Member", "name", "Kim").unwrap();
    assert_eq!(found.len(), 1);
    assert!(found[0].ptr_eq(&kim));
}

#[test]
fn without_auto_begin_writes_are_not_transactional() {
    init_tracing();
    let store = shop_store();
    let config = UnitOfWorkConfig {
        auto_begin: false,
        ..UnitOfWorkConfig::default()
    };
    {
        let mut uow = UnitOfWork::with_config(shop(), store.clone(), config.clone()).unwrap();
        assert!(!uow.in_transaction());
        uow.persist(&member("Kim")).unwrap();
        uow.flush().unwrap();
    }
    assert_eq!(store.row_count("members"), 1);

    let mut uow = UnitOfWork::with_config(shop(), store.clone(), config).unwrap();
    uow.begin().unwrap();
    assert!(uow.begin().unwrap_err().is_illegal_state());
    uow.persist(&member("Lee")).unwrap();
    uow.commit().unwrap();
    assert_eq!(store.row_count("members"), 2);
}

#[test]
fn debug_state_tracks_bookkeeping() {
    init_tracing();
    let mut uow = UnitOfWork::new(shop(), shop_store()).unwrap();
    let kim = member("Kim");
    let lee = member("Lee");
    uow.persist(&kim).unwrap();
    uow.persist(&lee).unwrap();
    uow.flush().unwrap();
    uow.remove(&lee).unwrap();

    let state = uow.debug_state();
    assert_eq!(state.managed, 1);
    assert_eq!(state.removed, 1);
    assert_eq!(state.pending_inserts, 0);
    assert_eq!(state.pending_deletes, 1);
    assert_eq!(state.identity_map, 2);
    assert!(state.in_transaction);
    assert!(!state.poisoned);
    assert!(format!("{:?}", uow).contains("UnitOfWork"));
}
