//! Compiling an [`Op<T>`] to leaves and driving the two-phase commit: a non-blocking
//! fast path first, then a suspended slow path.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::op::{Leaf, Op, Sink};
use crate::sync::latch::Latch;

/// Performs `op`: attempts every leaf's non-blocking probe in a randomly rotated order,
/// committing to the first that succeeds. If none do, suspends the current fiber and
/// arranges every leaf's blocking registration, resuming once exactly one of them
/// completes. Every other leaf's nack conditions then fire, innermost first — except
/// any that are also on the winning leaf's own nack path, which stay silent since that
/// subtree won.
///
/// Must be called from inside a running fiber (`Scope::spawn`'s future, or a future
/// driven by [`crate::runtime::block_on`]); `Op` itself has no such restriction, only
/// performing it does.
pub async fn perform<T: 'static>(op: Op<T>) -> T {
    let mut leaves = Vec::new();
    op.compile(&[], &mut leaves);
    assert!(
        !leaves.is_empty(),
        "perform on an operation with no leaves (never())"
    );

    let n = leaves.len();
    let start = fastrand::usize(0..n);

    // Fast path: scan once from a random offset, committing to the first leaf whose
    // try_fn succeeds — randomised enough to avoid starving any one leaf without the
    // bookkeeping a full shuffle would need.
    for i in 0..n {
        let idx = (start + i) % n;
        if let Some(value) = (leaves[idx].try_fn)() {
            let winner_nacks = leaves[idx].nacks.clone();
            for (j, leaf) in leaves.iter().enumerate() {
                if j != idx {
                    fire_losing_nacks(&winner_nacks, &leaf.nacks);
                }
            }
            return value;
        }
    }

    PerformFuture::new(leaves).await
}

struct Suspension<T> {
    result: RefCell<Option<(usize, T)>>,
    cleanups: RefCell<Vec<Option<Box<dyn FnOnce()>>>>,
    waker: RefCell<Option<std::task::Waker>>,
}

impl<T> Sink<T> for Suspension<T> {
    fn complete(&self, leaf: usize, value: T) {
        if self.result.borrow().is_some() {
            return;
        }
        *self.result.borrow_mut() = Some((leaf, value));
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }

    fn is_open(&self) -> bool {
        self.result.borrow().is_none()
    }

    fn add_cleanup(&self, leaf: usize, cleanup: Box<dyn FnOnce()>) {
        let mut cleanups = self.cleanups.borrow_mut();
        if leaf >= cleanups.len() {
            cleanups.resize_with(leaf + 1, || None);
        }
        cleanups[leaf] = Some(cleanup);
    }
}

struct PerformFuture<T> {
    // Taken on first poll; None afterwards.
    pending: Option<Vec<Leaf<T>>>,
    // Populated from `pending`'s leaves on first poll, since block_fn consumes the leaf.
    nacks: Vec<Vec<Rc<Latch>>>,
    suspension: Rc<Suspension<T>>,
}

impl<T: 'static> PerformFuture<T> {
    fn new(leaves: Vec<Leaf<T>>) -> Self {
        PerformFuture {
            pending: Some(leaves),
            nacks: Vec::new(),
            suspension: Rc::new(Suspension {
                result: RefCell::new(None),
                cleanups: RefCell::new(Vec::new()),
                waker: RefCell::new(None),
            }),
        }
    }
}

impl<T: 'static> Future for PerformFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();

        if let Some(leaves) = this.pending.take() {
            // First poll: record each leaf's nacks, then arrange its blocking
            // registration. A leaf may call back into `complete` synchronously (a
            // condition that flipped true between the fast-path scan and here);
            // `Suspension::complete` tolerates that, recording the result before
            // anyone is waiting on the waker yet — the check just below picks it up.
            this.nacks = leaves.iter().map(|leaf| leaf.nacks.clone()).collect();
            let sink: Rc<dyn Sink<T>> = this.suspension.clone();
            for (idx, leaf) in leaves.into_iter().enumerate() {
                (leaf.block_fn)(sink.clone(), idx);
            }
        }

        let winner = this.suspension.result.borrow().as_ref().map(|(w, _)| *w);
        let Some(winner) = winner else {
            *this.suspension.waker.borrow_mut() = Some(cx.waker().clone());
            return Poll::Pending;
        };

        let (_, value) = this.suspension.result.borrow_mut().take().unwrap();

        let winner_nacks = this.nacks[winner].clone();
        let mut cleanups = this.suspension.cleanups.borrow_mut();
        for (idx, nacks) in this.nacks.iter().enumerate() {
            if idx == winner {
                continue;
            }
            if let Some(Some(cleanup)) = cleanups.get_mut(idx).map(Option::take) {
                cleanup();
            }
            fire_losing_nacks(&winner_nacks, nacks);
        }

        Poll::Ready(value)
    }
}

pub(crate) fn fire_nacks(nacks: &[Rc<Latch>]) {
    for latch in nacks.iter().rev() {
        latch.signal();
    }
}

/// Fires every latch in `losing_nacks` except those also present in `winner_nacks` —
/// identity, not equality, since two distinct `with_nack`/`on_abort` calls never share
/// a latch even if otherwise indistinguishable. A latch on both paths means the
/// winning leaf is nested under the same nack/abort node as the losing one, so that
/// node's subtree collectively won and must not be told it lost.
pub(crate) fn fire_losing_nacks(winner_nacks: &[Rc<Latch>], losing_nacks: &[Rc<Latch>]) {
    for latch in losing_nacks.iter().rev() {
        if !winner_nacks.iter().any(|w| Rc::ptr_eq(w, latch)) {
            latch.signal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{always, choice, never, with_nack};
    use crate::runtime::block_on;
    use std::cell::RefCell;

    #[test]
    fn fast_path_commits_without_suspending() {
        // An always-ready op resolves on the very first poll, no scheduler wakeups
        // involved — exercised directly with the one-shot `poll` helper rather than a
        // full `block_on`.
        let mut fut = perform(always(7));
        assert_eq!(crate::utils::poll(&mut fut), Poll::Ready(7));
    }

    #[test]
    #[should_panic(expected = "no leaves")]
    fn perform_never_panics() {
        block_on(async {
            perform(crate::op::never::<()>()).await;
        });
    }

    #[test]
    fn shared_ancestor_nack_does_not_fire_when_that_subtree_wins() {
        // Both arms of the inner `choice` sit under the same `with_nack`, so when
        // `always(1)` wins, the losing `never()` arm carries the very latch the
        // winner also carries. That latch must stay silent: the subtree it guards
        // collectively won. Checked by holding onto the nack op and polling it once
        // (rather than spawning a watcher fiber) since a nack that correctly never
        // fires would otherwise leave a watcher parked forever.
        block_on(async {
            let nack_slot: Rc<RefCell<Option<crate::op::Op<()>>>> = Rc::new(RefCell::new(None));
            let slot = nack_slot.clone();
            let op = with_nack(move |nack| {
                *slot.borrow_mut() = Some(nack);
                choice(vec![always(1), never()])
            });

            let value = perform(op).await;
            assert_eq!(value, 1);

            let nack = nack_slot.borrow_mut().take().unwrap();
            let mut fut = perform(nack);
            assert_eq!(crate::utils::poll(&mut fut), Poll::Pending);
        });
    }

    #[test]
    fn unrelated_losing_nack_still_fires() {
        // Here the nack belongs only to the losing arm, so it must fire as normal.
        block_on(async {
            let nack_slot: Rc<RefCell<Option<crate::op::Op<()>>>> = Rc::new(RefCell::new(None));
            let slot = nack_slot.clone();
            let op = choice(vec![
                always(1),
                with_nack(move |nack| {
                    *slot.borrow_mut() = Some(nack);
                    never()
                }),
            ]);

            let value = perform(op).await;
            assert_eq!(value, 1);

            let nack = nack_slot.borrow_mut().take().unwrap();
            let mut fut = perform(nack);
            assert_eq!(crate::utils::poll(&mut fut), Poll::Ready(()));
        });
    }
}
