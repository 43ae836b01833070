//! Propagation of operations along association edges.
//!
//! [`cascade`] walks the object graph reachable from a root instance through
//! edges whose cascade policy includes the operation, and hands every newly
//! reached instance to a [`CascadeTarget`]. Instances are identified by
//! allocation, so cyclic graphs terminate and transient instances (which have
//! no key yet) are still visited once.

use crate::instance::EntityRef;
use crate::state::Operation;
use ormctx_core::Result;
use ormctx_schema::SchemaRegistry;
use std::collections::HashSet;
use std::sync::Arc;

/// Instances already reached by one cascade.
#[derive(Debug, Default)]
pub struct Visited(HashSet<usize>);

impl Visited {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `instance` as reached. Returns false if it already was.
    pub fn insert(&mut self, instance: &EntityRef) -> bool {
        self.0.insert(instance.addr())
    }

    pub fn contains(&self, instance: &EntityRef) -> bool {
        self.0.contains(&instance.addr())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Receiver of cascaded operations.
pub trait CascadeTarget {
    fn registry(&self) -> Arc<SchemaRegistry>;

    /// Load `edge` of `instance` if it has not been fetched yet.
    fn ensure_fetched(&mut self, instance: &EntityRef, edge: &str) -> Result<()>;

    /// Apply `op` to one reached instance.
    ///
    /// Returns whether the walk continues through that instance's own edges.
    fn apply(&mut self, op: Operation, instance: &EntityRef) -> Result<bool>;
}

/// Re-apply `op` to everything reachable from `root` along cascading edges.
///
/// `root` itself is not passed to `apply`; the caller has already handled it.
/// Removal fetches unloaded collections first so that every owned instance
/// is found.
pub fn cascade<T: CascadeTarget + ?Sized>(
    target: &mut T,
    op: Operation,
    root: &EntityRef,
    visited: &mut Visited,
) -> Result<()> {
    let registry = target.registry();
    let kind = op.cascade_type();
    visited.insert(root);
    let mut stack = vec![root.clone()];
    let mut reached = 0usize;

    while let Some(current) = stack.pop() {
        let entity = current.entity();
        let meta = registry.entity(&entity)?;
        let edges: Vec<&str> = meta
            .edges()
            .iter()
            .filter(|member| member.edge.cascades(kind))
            .map(|member| member.edge.name.as_str())
            .collect();

        for edge in edges {
            if op == Operation::Remove {
                target.ensure_fetched(&current, edge)?;
            }
            for related in current.related(edge) {
                if !visited.insert(&related) {
                    continue;
                }
                reached += 1;
                if target.apply(op, &related)? {
                    stack.push(related);
                }
            }
        }
    }

    if reached > 0 {
        tracing::debug!(
            operation = op.as_str(),
            root = ?root,
            reached,
            "Cascaded"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{Association, EntityInstance};
    use ormctx_schema::{
        AssociationEdge, CascadePolicy, EntityDescriptor, FieldDescriptor, IdDescriptor,
    };

    struct Recorder {
        registry: Arc<SchemaRegistry>,
        applied: Vec<String>,
        fetched: Vec<String>,
    }

    impl CascadeTarget for Recorder {
        fn registry(&self) -> Arc<SchemaRegistry> {
            Arc::clone(&self.registry)
        }

        fn ensure_fetched(&mut self, instance: &EntityRef, edge: &str) -> Result<()> {
            self.fetched.push(format!("{}.{}", instance.entity(), edge));
            Ok(())
        }

        fn apply(&mut self, _op: Operation, instance: &EntityRef) -> Result<bool> {
            self.applied.push(instance.get("name").as_str().unwrap_or("?").to_string());
            Ok(true)
        }
    }

    fn registry() -> Arc<SchemaRegistry> {
        let registry = SchemaRegistry::builder()
            .register(
                EntityDescriptor::new("Category")
                    .table("categories")
                    .id(IdDescriptor::new("id", "category_id"))
                    .field(FieldDescriptor::new("name", "name"))
                    .association(AssociationEdge::to_one("parent", "Category", "parent_id"))
                    .association(
                        AssociationEdge::to_many("children", "Category", "parent")
                            .cascade(CascadePolicy::PERSIST),
                    ),
            )
            .build()
            .unwrap();
        Arc::new(registry)
    }

    fn category(name: &str) -> EntityRef {
        EntityRef::new(EntityInstance::new("Category").with("name", name))
    }

    #[test]
    fn test_cascade_reaches_descendants_once() {
        let root = category("root");
        let a = category("a");
        let b = category("b");
        let leaf = category("leaf");
        root.write()
            .set_association("children", Association::Many(vec![a.clone(), b.clone()]));
        a.write().add_to("children", leaf.clone());
        // Cycles back to the root and a shared child.
        leaf.write().add_to("children", root.clone());
        b.write().add_to("children", leaf.clone());

        let mut recorder = Recorder {
            registry: registry(),
            applied: Vec::new(),
            fetched: Vec::new(),
        };
        let mut visited = Visited::new();
        cascade(&mut recorder, Operation::Persist, &root, &mut visited).unwrap();

        assert_eq!(recorder.applied.len(), 3);
        assert_eq!(&recorder.applied[..2], ["a", "b"]);
        assert!(recorder.applied.contains(&"leaf".to_string()));
        assert_eq!(visited.len(), 4);
        assert!(recorder.fetched.is_empty());
    }

    #[test]
    fn test_non_cascading_edges_are_ignored() {
        let child = category("child");
        let parent = category("parent");
        child.write().set_one("parent", Some(parent));

        let mut recorder = Recorder {
            registry: registry(),
            applied: Vec::new(),
            fetched: Vec::new(),
        };
        cascade(&mut recorder, Operation::Persist, &child, &mut Visited::new()).unwrap();
        assert!(recorder.applied.is_empty());

        // Remove is not in the policy either, so nothing is fetched.
        cascade(&mut recorder, Operation::Remove, &child, &mut Visited::new()).unwrap();
        assert!(recorder.fetched.is_empty());
    }
}
