//! Shared fixtures for the ormctx integration tests.

#![allow(dead_code)]

use ormctx::prelude::*;
use ormctx::{Statement, StatementKind};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Route `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Members, orders, order items and deliveries.
///
/// - `Order.items` cascades everything and removes orphans
/// - `Order.delivery` owns the foreign key, cascades everything and removes
///   the orphaned delivery
/// - `Order.member` owns the foreign key and cascades nothing
pub fn shop() -> Arc<SchemaRegistry> {
    Arc::new(shop_schema())
}

pub fn shop_schema() -> SchemaRegistry {
    SchemaRegistry::builder()
        .register(
            EntityDescriptor::new("Member")
                .table("members")
                .id(IdDescriptor::new("id", "member_id").identity())
                .field(FieldDescriptor::new("name", "name").not_null())
                .field(FieldDescriptor::embedded(
                    "address",
                    [("city", "city"), ("street", "street"), ("zipcode", "zipcode")],
                )),
        )
        .register(
            EntityDescriptor::new("Order")
                .table("orders")
                .id(IdDescriptor::new("id", "order_id").identity())
                .field(FieldDescriptor::new("status", "status"))
                .association(AssociationEdge::to_one("member", "Member", "member_id"))
                .association(
                    AssociationEdge::to_one("delivery", "Delivery", "delivery_id")
                        .cascade(CascadePolicy::ALL)
                        .orphan_removal(true),
                )
                .association(
                    AssociationEdge::to_many("items", "OrderItem", "order")
                        .cascade(CascadePolicy::ALL)
                        .orphan_removal(true),
                ),
        )
        .register(
            EntityDescriptor::new("OrderItem")
                .table("order_items")
                .id(IdDescriptor::new("id", "order_item_id").identity())
                .field(FieldDescriptor::new("quantity", "quantity"))
                .association(AssociationEdge::to_one("order", "Order", "order_id")),
        )
        .register(
            EntityDescriptor::new("Delivery")
                .table("deliveries")
                .id(IdDescriptor::new("id", "delivery_id").identity())
                .field(FieldDescriptor::new("city", "city"))
                .field(FieldDescriptor::new("status", "status"))
                .association(AssociationEdge::to_one_inverse("order", "Order", "delivery")),
        )
        .build()
        .unwrap()
}

/// A store enforcing the shop's foreign keys.
pub fn shop_store() -> MemoryStore {
    MemoryStore::new()
        .with_foreign_key("orders", "member_id", "members")
        .with_foreign_key("orders", "delivery_id", "deliveries")
        .with_foreign_key("order_items", "order_id", "orders")
}

/// Products in one table told apart by `product_type`.
pub fn catalog() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::builder()
        .register(
            EntityDescriptor::root(
                "Product",
                InheritanceStrategy::SingleTable {
                    discriminator_column: "product_type".to_string(),
                },
            )
            .table("products")
            .abstract_type()
            .id(IdDescriptor::new("id", "product_id").identity())
            .field(FieldDescriptor::new("name", "name"))
            .field(FieldDescriptor::new("price", "price")),
        )
        .register(
            EntityDescriptor::single_table_child("Book", "Product")
                .discriminator("B")
                .field(FieldDescriptor::new("author", "author")),
        )
        .register(
            EntityDescriptor::single_table_child("Movie", "Product")
                .discriminator("M")
                .field(FieldDescriptor::new("director", "director")),
        )
        .build()
        .unwrap();
    Arc::new(registry)
}

/// People with a joined `students` table for the subtype.
pub fn school() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::builder()
        .register(
            EntityDescriptor::root("Person", InheritanceStrategy::Joined)
                .table("people")
                .id(IdDescriptor::new("id", "person_id").identity())
                .field(FieldDescriptor::new("name", "name")),
        )
        .register(
            EntityDescriptor::joined_child("Student", "Person")
                .table("students")
                .field(FieldDescriptor::new("grade", "grade")),
        )
        .build()
        .unwrap();
    Arc::new(registry)
}

/// Media items with one complete table per concrete type and a shared
/// key sequence.
pub fn media() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::builder()
        .register(
            EntityDescriptor::root("Item", InheritanceStrategy::TablePerClass)
                .abstract_type()
                .id(IdDescriptor::new("id", "item_id").sequence("item_seq"))
                .field(FieldDescriptor::new("name", "name")),
        )
        .register(
            EntityDescriptor::concrete_table_child("Album", "Item")
                .table("albums")
                .field(FieldDescriptor::new("artist", "artist")),
        )
        .register(
            EntityDescriptor::concrete_table_child("Film", "Item")
                .table("films")
                .field(FieldDescriptor::new("director", "director")),
        )
        .build()
        .unwrap();
    Arc::new(registry)
}

pub fn member(name: &str) -> EntityRef {
    EntityRef::new(EntityInstance::new("Member").with("name", name))
}

pub fn address(city: &str, street: &str, zipcode: &str) -> Value {
    Value::embedded([
        ("city", Value::from(city)),
        ("street", Value::from(street)),
        ("zipcode", Value::from(zipcode)),
    ])
}

/// Persist an order with one item per quantity and commit. Returns the
/// order's generated id.
pub fn seed_order(registry: &Arc<SchemaRegistry>, store: &MemoryStore, quantities: &[i64]) -> Value {
    let mut uow = UnitOfWork::new(Arc::clone(registry), store.clone()).unwrap();
    let order = EntityRef::new(EntityInstance::new("Order").with("status", "ORDERED"));
    for &quantity in quantities {
        let item = EntityRef::new(EntityInstance::new("OrderItem").with("quantity", quantity));
        uow.associate(&order, "items", &item).unwrap();
    }
    uow.persist(&order).unwrap();
    uow.commit().unwrap();
    store.clear_log();
    order.id().unwrap()
}

/// Executed statements of one kind.
pub fn statements(store: &MemoryStore, kind: StatementKind) -> Vec<Statement> {
    store
        .executed()
        .into_iter()
        .filter(|s| s.kind() == kind)
        .collect()
}

/// `(kind, table)` pairs rendered as `"INSERT orders"`, for order checks.
pub fn summary(store: &MemoryStore) -> Vec<String> {
    store
        .executed_summary()
        .into_iter()
        .map(|(kind, table)| format!("{} {}", kind, table))
        .collect()
}
