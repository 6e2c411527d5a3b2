//! A single-value, single-use channel: one [`Sender`] hands off exactly one `T` to one
//! [`Receiver`]. Built directly on [`crate::sync::latch::Latch`] — the "Oneshot" half of
//! the Latch/NackCond unification.

use std::cell::RefCell;
use std::rc::Rc;

use crate::op::Op;
use crate::sync::latch::Latch;

struct Inner<T> {
    value: RefCell<Option<T>>,
    latch: Rc<Latch>,
}

/// The sending half of a [`oneshot`] pair.
pub struct Sender<T> {
    inner: Rc<Inner<T>>,
}

/// The receiving half of a [`oneshot`] pair.
pub struct Receiver<T> {
    inner: Rc<Inner<T>>,
}

/// Creates a linked sender/receiver pair for handing off a single `T`.
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let inner = Rc::new(Inner {
        value: RefCell::new(None),
        latch: Latch::new(),
    });
    (
        Sender {
            inner: inner.clone(),
        },
        Receiver { inner },
    )
}

impl<T> Sender<T> {
    /// Hands off `value`. A no-op, silently dropping `value`, if the receiver already
    /// gave up (dropped) or a value was already sent — sending is at most once.
    pub fn send(self, value: T) {
        if self.inner.latch.is_triggered() {
            return;
        }
        *self.inner.value.borrow_mut() = Some(value);
        self.inner.latch.signal();
    }
}

impl<T: 'static> Receiver<T> {
    /// An operation that becomes ready once the sender sends (or is dropped without
    /// sending, yielding `None`).
    pub fn recv_op(&self) -> Op<Option<T>> {
        let inner = self.inner.clone();
        crate::sync::latch::wait_op(self.inner.latch.clone()).wrap(move |()| inner.value.borrow_mut().take())
    }

    /// Suspends until the sender sends or is dropped.
    pub async fn recv(&self) -> Option<T> {
        crate::op::perform(self.recv_op()).await
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        // Dropping without sending still has to unblock a waiting receiver, just with
        // no value to hand over — `recv_op`'s `wrap` turns the missing value into `None`.
        self.inner.latch.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::block_on;

    #[test]
    fn receiver_gets_sent_value() {
        block_on(async {
            let (tx, rx) = channel::<u32>();
            tx.send(7);
            assert_eq!(rx.recv().await, Some(7));
        });
    }

    #[test]
    fn receiver_gets_none_if_sender_dropped() {
        block_on(async {
            let (tx, rx) = channel::<u32>();
            drop(tx);
            assert_eq!(rx.recv().await, None);
        });
    }

    #[test]
    fn is_not_send_or_sync() {
        impls::impls!(Sender<u32>: !Send & !Sync);
        impls::impls!(Receiver<u32>: !Send & !Sync);
    }
}
