//! Lifecycle transitions.
//!
//! Every unit-of-work operation first asks [`transition`] what the instance's
//! current state allows. Illegal combinations are reported to the caller as
//! [`Error::IllegalState`](ormctx_core::Error::IllegalState) at the call site.
//!
//! | op \ state | Transient      | Managed        | Removed | Detached      |
//! |------------|----------------|----------------|---------|---------------|
//! | persist    | manage         | already        | error   | error         |
//! | remove     | error          | remove         | error   | error         |
//! | merge      | persist a copy | already        | error   | copy onto row |
//! | refresh    | error          | reload         | error   | error         |
//! | detach     | no-op          | detach         | error   | no-op         |

use crate::instance::LifecycleState;
use ormctx_schema::CascadeType;

/// A unit-of-work operation on one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Persist,
    Remove,
    Merge,
    Refresh,
    Detach,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Operation::Persist => "persist",
            Operation::Remove => "remove",
            Operation::Merge => "merge",
            Operation::Refresh => "refresh",
            Operation::Detach => "detach",
        }
    }

    /// Cascade type that propagates this operation along edges.
    pub const fn cascade_type(self) -> CascadeType {
        match self {
            Operation::Persist => CascadeType::Persist,
            Operation::Remove => CascadeType::Remove,
            Operation::Merge => CascadeType::Merge,
            Operation::Refresh => CascadeType::Refresh,
            Operation::Detach => CascadeType::Detach,
        }
    }
}

/// What an allowed operation does to the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Start tracking a transient instance.
    Manage,
    /// The instance is already managed; nothing changes.
    AlreadyManaged,
    /// Schedule deletion.
    Remove,
    /// Stop tracking.
    Detach,
    /// Persist a managed copy of a transient instance.
    PersistCopy,
    /// Copy a detached instance onto the managed instance for its row.
    CopyOntoManaged,
    /// Re-read from the store.
    Reload,
    /// Nothing to do.
    NoOp,
}

/// Decide what `op` does to an instance in `state`.
///
/// The error is the reason the transition is illegal.
pub fn transition(op: Operation, state: LifecycleState) -> Result<Transition, &'static str> {
    use LifecycleState::{Detached, Managed, Removed, Transient};

    match (op, state) {
        (_, Removed) => Err("the instance is scheduled for removal"),

        (Operation::Persist, Transient) => Ok(Transition::Manage),
        (Operation::Persist, Managed) => Ok(Transition::AlreadyManaged),
        (Operation::Persist, Detached) => Err("the instance is detached; merge it instead"),

        (Operation::Remove, Managed) => Ok(Transition::Remove),
        (Operation::Remove, Transient) => Err("the instance was never persisted"),
        (Operation::Remove, Detached) => Err("the instance is detached; merge it first"),

        (Operation::Merge, Managed) => Ok(Transition::AlreadyManaged),
        (Operation::Merge, Transient) => Ok(Transition::PersistCopy),
        (Operation::Merge, Detached) => Ok(Transition::CopyOntoManaged),

        (Operation::Refresh, Managed) => Ok(Transition::Reload),
        (Operation::Refresh, _) => Err("only managed instances can be refreshed"),

        (Operation::Detach, Managed) => Ok(Transition::Detach),
        (Operation::Detach, Transient | Detached) => Ok(Transition::NoOp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persist_transitions() {
        assert_eq!(
            transition(Operation::Persist, LifecycleState::Transient),
            Ok(Transition::Manage)
        );
        assert_eq!(
            transition(Operation::Persist, LifecycleState::Managed),
            Ok(Transition::AlreadyManaged)
        );
        assert!(transition(Operation::Persist, LifecycleState::Detached).is_err());
        assert!(transition(Operation::Persist, LifecycleState::Removed).is_err());
    }

    #[test]
    fn test_removed_rejects_everything() {
        for op in [
            Operation::Persist,
            Operation::Remove,
            Operation::Merge,
            Operation::Refresh,
            Operation::Detach,
        ] {
            assert!(transition(op, LifecycleState::Removed).is_err(), "{}", op.as_str());
        }
    }

    #[test]
    fn test_merge_and_detach() {
        assert_eq!(
            transition(Operation::Merge, LifecycleState::Detached),
            Ok(Transition::CopyOntoManaged)
        );
        assert_eq!(
            transition(Operation::Merge, LifecycleState::Transient),
            Ok(Transition::PersistCopy)
        );
        assert_eq!(
            transition(Operation::Detach, LifecycleState::Transient),
            Ok(Transition::NoOp)
        );
        assert_eq!(
            transition(Operation::Detach, LifecycleState::Managed),
            Ok(Transition::Detach)
        );
        assert!(transition(Operation::Remove, LifecycleState::Transient).is_err());
        assert!(transition(Operation::Refresh, LifecycleState::Detached).is_err());
    }

    #[test]
    fn test_cascade_type_mapping() {
        assert_eq!(Operation::Remove.cascade_type(), CascadeType::Remove);
        assert_eq!(Operation::Detach.cascade_type(), CascadeType::Detach);
    }
}
