//! The recursive outcome tree a scope hands back at its join boundary.

use std::rc::Rc;

use crate::scope::{ScopeError, Status};

/// One scope's outcome, with its children's outcomes nested the same way — a caller
/// at the root can walk all the way down to a grandchild's own `extra_errors` without
/// the tree being flattened first.
#[derive(Debug, Clone)]
pub struct ScopeReport {
    pub id: u64,
    pub status: Status,
    pub primary: Option<Rc<ScopeError>>,
    pub extra_errors: Vec<Rc<ScopeError>>,
    pub children: Vec<ScopeReport>,
}

impl ScopeReport {
    pub(crate) fn new(id: u64, status: Status, primary: Option<Rc<ScopeError>>) -> Self {
        ScopeReport {
            id,
            status,
            primary,
            extra_errors: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Whether this scope or any descendant reported anything other than `Ok`.
    pub fn any_aborted(&self) -> bool {
        self.status != Status::Ok || self.children.iter().any(ScopeReport::any_aborted)
    }
}
