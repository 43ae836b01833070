mod common;

use common::{init_tracing, member, shop, shop_store};
use ormctx::prelude::*;
use std::sync::Arc;

fn committed_member(registry: &Arc<SchemaRegistry>, store: &MemoryStore, name: &str) -> Value {
    let mut uow = UnitOfWork::new(Arc::clone(registry), store.clone()).unwrap();
    let created = member(name);
    uow.persist(&created).unwrap();
    uow.commit().unwrap();
    store.clear_log();
    created.id().unwrap()
}

#[test]
fn merging_a_modified_copy_updates_a_distinct_managed_instance() {
    init_tracing();
    let registry = shop();
    let store = shop_store();
    let id = committed_member(&registry, &store, "Kim");

    let mut uow = UnitOfWork::new(registry, store.clone()).unwrap();
    let original = uow.find("Member", id.clone()).unwrap().unwrap();
    uow.detach(&original).unwrap();

    let copy = EntityRef::new(original.detached_copy());
    copy.set("name", "Kim Minji");
    let merged = uow.merge(&copy).unwrap();

    assert!(!merged.ptr_eq(&original));
    assert!(!merged.ptr_eq(&copy));
    assert_eq!(merged.get("name"), Value::from("Kim Minji"));
    assert!(uow.contains(&merged));
    assert!(!uow.contains(&copy));
    assert!(uow.find("Member", id).unwrap().unwrap().ptr_eq(&merged));

    assert_eq!(uow.flush().unwrap().updated, 1);
    assert_eq!(
        store.rows("members")[0].get_by_name("name"),
        Some(&Value::from("Kim Minji"))
    );
}

#[test]
fn merging_a_managed_instance_returns_it() {
    init_tracing();
    let registry = shop();
    let store = shop_store();
    let id = committed_member(&registry, &store, "Kim");

    let mut uow = UnitOfWork::new(registry, store).unwrap();
    let found = uow.find("Member", id).unwrap().unwrap();
    assert!(uow.merge(&found).unwrap().ptr_eq(&found));
}

#[test]
fn merging_an_instance_from_an_ended_unit_of_work_reloads_it() {
    init_tracing();
    let registry = shop();
    let store = shop_store();
    let id = committed_member(&registry, &store, "Kim");

    let stale = {
        let mut uow = UnitOfWork::new(Arc::clone(&registry), store.clone()).unwrap();
        uow.find("Member", id.clone()).unwrap().unwrap()
    };
    assert_eq!(stale.state(), LifecycleState::Detached);
    stale.set("name", "Lee");

    let mut uow = UnitOfWork::new(registry, store).unwrap();
    let merged = uow.merge(&stale).unwrap();
    assert!(!merged.ptr_eq(&stale));
    assert_eq!(merged.get("name"), Value::from("Lee"));
    assert_eq!(uow.state_of(&stale), LifecycleState::Detached);
}

#[test]
fn merging_a_transient_instance_persists_a_copy() {
    init_tracing();
    let store = shop_store();
    let mut uow = UnitOfWork::new(shop(), store.clone()).unwrap();
    let fresh = member("Park");
    let merged = uow.merge(&fresh).unwrap();

    assert!(!merged.ptr_eq(&fresh));
    assert!(uow.contains(&merged));
    assert_eq!(uow.state_of(&fresh), LifecycleState::Transient);
    assert_eq!(uow.flush().unwrap().inserted, 1);
    assert_eq!(store.row_count("members"), 1);
}

#[test]
fn merging_a_detached_instance_whose_row_is_gone_fails() {
    init_tracing();
    let registry = shop();
    let store = shop_store();
    let id = committed_member(&registry, &store, "Kim");

    let mut first = UnitOfWork::new(Arc::clone(&registry), store.clone()).unwrap();
    let found = first.find("Member", id.clone()).unwrap().unwrap();
    first.detach(&found).unwrap();
    first.rollback().unwrap();

    let mut deleting = UnitOfWork::new(Arc::clone(&registry), store.clone()).unwrap();
    let doomed = deleting.find("Member", id).unwrap().unwrap();
    deleting.remove(&doomed).unwrap();
    deleting.commit().unwrap();

    let mut uow = UnitOfWork::new(registry, store).unwrap();
    let err = uow.merge(&found).unwrap_err();
    assert!(matches!(err, Error::EntityNotFound { ref entity, .. } if entity == "Member"));
}

#[test]
fn merging_a_copy_of_a_removed_instance_fails() {
    init_tracing();
    let registry = shop();
    let store = shop_store();
    let id = committed_member(&registry, &store, "Kim");

    let mut uow = UnitOfWork::new(registry, store.clone()).unwrap();
    let managed = uow.find("Member", id).unwrap().unwrap();
    let copy = EntityRef::new(managed.detached_copy());
    copy.set("name", "Kim Minji");
    uow.remove(&managed).unwrap();

    let err = uow.merge(&copy).unwrap_err();
    assert!(err.is_illegal_state());
    assert!(!uow.contains(&copy));
    assert_eq!(uow.state_of(&managed), LifecycleState::Removed);
    assert_eq!(uow.flush().unwrap().deleted, 1);
    assert_eq!(store.row_count("members"), 0);
}

#[test]
fn a_detached_pending_insert_is_still_written() {
    init_tracing();
    let store = shop_store();
    let mut uow = UnitOfWork::new(shop(), store.clone()).unwrap();
    let kim = member("Kim");
    uow.persist(&kim).unwrap();
    uow.detach(&kim).unwrap();
    assert!(!uow.contains(&kim));

    assert_eq!(uow.flush().unwrap().inserted, 1);
    assert_eq!(store.row_count("members"), 1);
    assert_eq!(uow.state_of(&kim), LifecycleState::Detached);
}

#[test]
fn persist_then_remove_in_one_unit_of_work_writes_nothing() {
    init_tracing();
    let store = shop_store();
    let mut uow = UnitOfWork::new(shop(), store.clone()).unwrap();
    let kim = member("Kim");
    uow.persist(&kim).unwrap();
    uow.remove(&kim).unwrap();
    uow.commit().unwrap();
    assert!(store.executed().is_empty());
}
