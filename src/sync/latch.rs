//! The one-shot idempotent latch shared by [`crate::sync::oneshot`], [`crate::sync::cond`],
//! and the operation algebra's nack conditions.
//!
//! A nack condition and a oneshot notification are the same primitive underneath, so
//! rather than keep two near-duplicate waiter state machines around, there's exactly
//! one here.

use std::cell::RefCell;
use std::rc::Rc;

use slab::Slab;

/// A single-use, idempotent condition with a waiter list and an optional abort hook.
///
/// `signal()` only has an effect the first time it's called; later calls are no-ops.
/// Waiters registered after signalling fire immediately — the "await after notify"
/// case.
pub(crate) struct Latch {
    triggered: RefCell<bool>,
    waiters: RefCell<Slab<Option<Box<dyn FnOnce()>>>>,
    abort_hook: RefCell<Option<Box<dyn Fn()>>>,
}

/// Cancellation handle for a registered waiter: dropping it nulls the slot so a
/// later `signal()` skips it.
pub(crate) struct WaiterHandle {
    latch: Rc<Latch>,
    key: usize,
}

impl Drop for WaiterHandle {
    fn drop(&mut self) {
        self.latch.waiters.borrow_mut().try_remove(self.key);
    }
}

impl Latch {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Latch {
            triggered: RefCell::new(false),
            waiters: RefCell::new(Slab::new()),
            abort_hook: RefCell::new(None),
        })
    }

    /// A latch whose `abort_hook` runs once, after the waiters, the first time it's signalled.
    /// Used by `Op::on_abort` — the hook is attached cleanup, not an observable waiter.
    pub(crate) fn with_abort_hook(hook: Box<dyn Fn()>) -> Rc<Self> {
        let latch = Latch::new();
        *latch.abort_hook.borrow_mut() = Some(hook);
        latch
    }

    pub(crate) fn is_triggered(&self) -> bool {
        *self.triggered.borrow()
    }

    /// Registers a waiter, returning a handle that cancels it on drop.
    /// Fires immediately, inline, if the latch was already triggered.
    pub(crate) fn add_waiter(self: &Rc<Self>, f: Box<dyn FnOnce()>) -> WaiterHandle {
        if self.is_triggered() {
            f();
            return WaiterHandle {
                latch: self.clone(),
                key: usize::MAX,
            };
        }

        let key = self.waiters.borrow_mut().insert(Some(f));
        WaiterHandle {
            latch: self.clone(),
            key,
        }
    }

    /// Flips `triggered` and fires every still-registered waiter in insertion order, then
    /// the abort hook if any. Idempotent: a second call is a no-op.
    pub(crate) fn signal(&self) {
        if std::mem::replace(&mut *self.triggered.borrow_mut(), true) {
            return;
        }

        let waiters: Vec<_> = self
            .waiters
            .borrow_mut()
            .drain()
            .filter_map(|slot| slot)
            .collect();
        for waiter in waiters {
            waiter();
        }

        if let Some(hook) = self.abort_hook.borrow().as_ref() {
            hook();
        }
    }
}

/// The operation that fires once `latch` is signalled: the shared building block behind
/// both [`crate::sync::cond::Cond::wait_op`] and the nack conditions `with_nack`/`on_abort`
/// hand back to their callers.
pub(crate) fn wait_op(latch: Rc<Latch>) -> crate::op::Op<()> {
    crate::op::Op::new_primitive(
        {
            let latch = latch.clone();
            move || latch.is_triggered().then_some(())
        },
        move |sink: Rc<dyn crate::op::Sink<()>>, leaf: usize| {
            let handle = latch.add_waiter(Box::new({
                let sink = sink.clone();
                move || sink.complete(leaf, ())
            }));
            // Dropping the handle unregisters the waiter, so wiring its drop to the
            // leaf's cleanup is what makes a losing arm stop listening on this latch.
            sink.add_cleanup(leaf, Box::new(move || drop(handle)));
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn fires_waiters_added_before_signal() {
        let latch = Latch::new();
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let _h = latch.add_waiter(Box::new(move || f.set(true)));

        assert!(!fired.get());
        latch.signal();
        assert!(fired.get());
    }

    #[test]
    fn fires_waiters_added_after_signal_immediately() {
        let latch = Latch::new();
        latch.signal();

        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let _h = latch.add_waiter(Box::new(move || f.set(true)));
        assert!(fired.get());
    }

    #[test]
    fn signal_is_idempotent() {
        let latch = Latch::new();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let _h = latch.add_waiter(Box::new(move || c.set(c.get() + 1)));

        latch.signal();
        latch.signal();
        latch.signal();

        assert_eq!(count.get(), 1);
    }

    #[test]
    fn dropped_waiter_handle_is_not_fired() {
        let latch = Latch::new();
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let handle = latch.add_waiter(Box::new(move || f.set(true)));
        drop(handle);

        latch.signal();
        assert!(!fired.get());
    }

    #[test]
    fn abort_hook_runs_once_after_waiters() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let latch = Latch::with_abort_hook(Box::new(move || o2.borrow_mut().push("hook")));
        let _h = latch.add_waiter(Box::new(move || o1.borrow_mut().push("waiter")));

        latch.signal();
        latch.signal();

        assert_eq!(*order.borrow(), vec!["waiter", "hook"]);
    }
}
