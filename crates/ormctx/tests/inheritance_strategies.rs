mod common;

use common::{catalog, init_tracing, media, school, summary};
use ormctx::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

#[test]
fn single_table_rows_come_back_as_their_concrete_types() {
    init_tracing();
    let registry = catalog();
    let store = MemoryStore::new();

    let mut uow = UnitOfWork::new(Arc::clone(&registry), store.clone()).unwrap();
    let book = EntityRef::new(
        EntityInstance::new("Book")
            .with("name", "Dune")
            .with("author", "Herbert"),
    );
    let movie = EntityRef::new(
        EntityInstance::new("Movie")
            .with("name", "Alien")
            .with("director", "Scott"),
    );
    uow.persist(&book).unwrap();
    uow.persist(&movie).unwrap();
    uow.commit().unwrap();

    assert_eq!(summary(&store), ["INSERT products", "INSERT products"]);
    let tags: Vec<Value> = store
        .rows("products")
        .iter()
        .map(|r| r.get_by_name("product_type").cloned().unwrap_or(Value::Null))
        .collect();
    assert_eq!(tags, [Value::from("B"), Value::from("M")]);

    let mut uow = UnitOfWork::new(Arc::clone(&registry), store).unwrap();
    let products = uow.query_all("Product").unwrap();
    let mut types: Vec<String> = products.iter().map(EntityRef::entity).collect();
    types.sort();
    assert_eq!(types, ["Book", "Movie"]);

    let books = uow.query_all("Book").unwrap();
    assert_eq!(books.len(), 1);
    assert_eq!(books[0].get("author"), Value::from("Herbert"));
    assert!(products.iter().any(|p| p.ptr_eq(&books[0])));

    let found = uow.find("Product", book.id().unwrap()).unwrap().unwrap();
    assert_eq!(found.entity(), "Book");
    assert!(uow.find("Movie", book.id().unwrap()).unwrap().is_none());
}

#[test]
fn an_abstract_type_cannot_be_persisted() {
    init_tracing();
    let mut uow = UnitOfWork::new(catalog(), MemoryStore::new()).unwrap();
    let product = EntityRef::new(EntityInstance::new("Product").with("name", "?"));
    assert!(uow.persist(&product).unwrap_err().is_illegal_state());
}

#[test]
fn joined_subtypes_write_one_row_per_table() {
    init_tracing();
    let registry = school();
    let store = MemoryStore::new().with_foreign_key("students", "person_id", "people");

    let mut uow = UnitOfWork::new(Arc::clone(&registry), store.clone()).unwrap();
    let student = EntityRef::new(
        EntityInstance::new("Student")
            .with("name", "Kim")
            .with("grade", "A"),
    );
    let staff = EntityRef::new(EntityInstance::new("Person").with("name", "Lee"));
    uow.persist(&student).unwrap();
    uow.persist(&staff).unwrap();
    uow.commit().unwrap();

    assert_eq!(store.row_count("people"), 2);
    assert_eq!(store.row_count("students"), 1);
    let id = student.id().unwrap();
    let child_key = store.rows("students")[0].get_by_name("person_id").cloned().unwrap();
    assert!(child_key.key_eq(&id));

    store.clear_log();
    let mut uow = UnitOfWork::new(Arc::clone(&registry), store.clone()).unwrap();
    let people = uow.query_all("Person").unwrap();
    let mut types: Vec<String> = people.iter().map(EntityRef::entity).collect();
    types.sort();
    assert_eq!(types, ["Person", "Student"]);

    let found = uow.find("Person", id).unwrap().unwrap();
    assert_eq!(found.entity(), "Student");
    assert_eq!(found.get("grade"), Value::from("A"));

    found.set("grade", "B");
    uow.flush().unwrap();
    assert_eq!(summary(&store), ["UPDATE students"]);

    store.clear_log();
    uow.remove(&found).unwrap();
    uow.flush().unwrap();
    assert_eq!(summary(&store), ["DELETE students", "DELETE people"]);
}

#[test]
fn table_per_class_keys_are_unique_across_tables() {
    init_tracing();
    let registry = media();
    let store = MemoryStore::new();

    let mut uow = UnitOfWork::new(Arc::clone(&registry), store.clone()).unwrap();
    let mut made = Vec::new();
    for i in 0..3 {
        let album = EntityRef::new(
            EntityInstance::new("Album")
                .with("name", format!("album {i}"))
                .with("artist", "IU"),
        );
        let film = EntityRef::new(
            EntityInstance::new("Film")
                .with("name", format!("film {i}"))
                .with("director", "Bong"),
        );
        uow.persist(&album).unwrap();
        uow.persist(&film).unwrap();
        made.push(album);
        made.push(film);
    }
    uow.commit().unwrap();

    let ids: HashSet<i64> = made
        .iter()
        .map(|m| m.id().and_then(|id| id.as_i64()).unwrap())
        .collect();
    assert_eq!(ids.len(), 6);
    assert_eq!(store.row_count("albums"), 3);
    assert_eq!(store.row_count("films"), 3);

    let plan = polymorphic_read_plan(&registry, "Item").unwrap();
    let query = plan.query();
    let tables = query.tables();
    assert!(tables.contains(&"albums"));
    assert!(tables.contains(&"films"));

    let mut uow = UnitOfWork::new(registry, store).unwrap();
    let items = uow.query_all("Item").unwrap();
    assert_eq!(items.len(), 6);
    let loaded: HashSet<i64> = items
        .iter()
        .map(|m| m.id().and_then(|id| id.as_i64()).unwrap())
        .collect();
    assert_eq!(loaded, ids);
    let film = items.iter().find(|i| i.entity() == "Film").unwrap();
    assert_eq!(film.get("director"), Value::from("Bong"));
    assert_eq!(film.get("artist"), Value::Null);
}
