//! A reusable, level-triggered condition: many fibers can wait for it, and it can be
//! signalled more than once across its lifetime, unlike the single-use [`crate::sync::latch::Latch`]
//! it's built from.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::op::Op;
use crate::sync::latch::Latch;

/// A broadcast condition variable. `signal` wakes every fiber currently waiting; a
/// fiber that starts waiting afterwards blocks again until the next `signal`.
///
/// Unlike [`crate::sync::oneshot::Oneshot`], a `Cond` can be signalled repeatedly —
/// each signal gets a fresh internal latch, so a waiter registered between two signals
/// only ever sees the one it waited on fire.
#[derive(Clone)]
pub struct Cond {
    inner: Rc<Inner>,
}

struct Inner {
    generation: Cell<u64>,
    current: RefCell<Rc<Latch>>,
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

impl Cond {
    pub fn new() -> Self {
        Cond {
            inner: Rc::new(Inner {
                generation: Cell::new(0),
                current: RefCell::new(Latch::new()),
            }),
        }
    }

    /// Wakes every fiber currently waiting on this condition.
    pub fn signal(&self) {
        let old = self.inner.current.replace(Latch::new());
        self.inner.generation.set(self.inner.generation.get() + 1);
        old.signal();
    }

    /// An operation that becomes ready the next time [`Cond::signal`] is called.
    /// Capturing "the next time" at the point `wait_op` is built, not at the point
    /// `perform` eventually commits, is what makes it safe to use inside `choice`.
    pub fn wait_op(&self) -> Op<()> {
        crate::sync::latch::wait_op(self.inner.current.borrow().clone())
    }

    /// Suspends the current fiber until the next [`Cond::signal`].
    pub async fn wait(&self) {
        crate::op::perform(self.wait_op()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::block_on;

    #[test]
    fn wait_returns_after_signal() {
        block_on(async {
            let cond = Cond::new();
            let waiter = cond.clone();
            crate::runtime::spawn(async move {
                waiter.wait().await;
            });
            cond.signal();
        });
    }

    #[test]
    fn is_not_send_or_sync() {
        impls::impls!(Cond: !Send & !Sync);
    }
}
