//! Ordering of a batch of planned principal changes.
//!
//! Users mapped to a login can only be created once the login exists, and a
//! login cannot be dropped while users still map to it. A batch is therefore
//! applied as: user deletes, login deletes, login creates and updates, user
//! creates and updates. Relative order inside each group is preserved.

use super::{Operation, PrincipalKind};

/// One change the engine plans to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedChange<T> {
    pub kind: PrincipalKind,
    pub operation: Operation,
    pub payload: T,
}

impl<T> PlannedChange<T> {
    pub fn new(kind: PrincipalKind, operation: Operation, payload: T) -> Self {
        Self {
            kind,
            operation,
            payload,
        }
    }

    fn rank(&self) -> u8 {
        match (self.operation, self.kind) {
            (Operation::Delete, PrincipalKind::User) => 0,
            (Operation::Delete, PrincipalKind::Login) => 1,
            (Operation::Read, _) => 4,
            (_, PrincipalKind::Login) => 2,
            (_, PrincipalKind::User) => 3,
        }
    }
}

/// Sort `changes` into a dependency-safe order.
pub fn apply_order<T>(mut changes: Vec<PlannedChange<T>>) -> Vec<PlannedChange<T>> {
    changes.sort_by_key(PlannedChange::rank);
    changes
}
