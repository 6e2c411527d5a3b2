//! A closeable MPSC inbox: many senders, one receiver, `send` never blocks. Built from
//! the same parked-getter queue [`crate::sync::channel::Channel`] uses, plus the close
//! state machine a channel alone doesn't need — `close`, a live sender count, and a
//! `recv` that drains what's buffered before finally yielding `None`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::op::{Op, Sink};

struct Getter<T> {
    sink: Rc<dyn Sink<Option<T>>>,
    leaf: usize,
}

struct State<T> {
    buffer: VecDeque<T>,
    parked_getters: VecDeque<Getter<T>>,
    closed: bool,
    reason: Option<String>,
    senders: u32,
}

/// An unbounded, closeable inbox. Cloning shares the same underlying queue and counts
/// as one more live sender; there is deliberately no separate receiver type, since only
/// one fiber is expected to call [`Mailbox::recv`] at a time (calling it from two
/// fibers concurrently is legal but the value only goes to whichever wins the race).
///
/// Dropping the last clone closes the mailbox automatically, the same way dropping the
/// last `std::sync::mpsc::Sender` does — a mailbox left with no live handle has no way
/// to ever deliver anything further, so there's nothing for a parked receiver to
/// usefully keep waiting on.
pub struct Mailbox<T> {
    state: Rc<RefCell<State<T>>>,
}

impl<T: 'static> Mailbox<T> {
    pub fn new() -> Self {
        Mailbox {
            state: Rc::new(RefCell::new(State {
                buffer: VecDeque::new(),
                parked_getters: VecDeque::new(),
                closed: false,
                reason: None,
                senders: 1,
            })),
        }
    }

    /// Enqueues `value`, returning `false` instead if the mailbox is already closed.
    /// Never blocks: an unbounded mailbox's buffer never fills, so there's no `send_op`
    /// — nothing would ever wait.
    ///
    /// A nil payload (the untyped world's reason `send` on a closed mailbox is a
    /// contract violation rather than an ordinary close signal) doesn't need separate
    /// runtime rejection here: `T` is a concrete value, never "nothing," so the type
    /// system already rules it out for any `T` that isn't itself an `Option`. A caller
    /// who chooses `Mailbox<Option<U>>` and sends `None` is responsible for not
    /// confusing that with the `None` `recv` yields after close.
    pub fn send(&self, value: T) -> bool {
        let mut s = self.state.borrow_mut();
        if s.closed {
            return false;
        }
        if let Some(getter) = pop_active_getter(&mut s) {
            drop(s);
            getter.sink.complete(getter.leaf, Some(value));
            return true;
        }
        s.buffer.push_back(value);
        true
    }

    /// An operation that becomes ready once a message is available, or once the
    /// mailbox is closed and drained (yielding `None`).
    pub fn recv_op(&self) -> Op<Option<T>> {
        let state = self.state.clone();

        let try_state = state.clone();
        let try_fn = move || {
            let mut s = try_state.borrow_mut();
            if let Some(value) = s.buffer.pop_front() {
                return Some(Some(value));
            }
            if s.closed {
                return Some(None);
            }
            None
        };

        let block_state = state;
        let block_fn = move |sink: Rc<dyn Sink<Option<T>>>, leaf: usize| {
            block_state
                .borrow_mut()
                .parked_getters
                .push_back(Getter { sink, leaf });
        };

        Op::new_primitive(try_fn, block_fn)
    }

    /// Suspends until a message is available or the mailbox is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        crate::op::perform(self.recv_op()).await
    }

    /// Closes the mailbox, recording `reason` if this is the first call to close it.
    /// Idempotent: a later call with a different reason is ignored. Wakes every parked
    /// receiver with `None` — any getter still parked at this point has no buffered
    /// value coming, since a `send` would have already woken it directly.
    pub fn close(&self, reason: impl Into<String>) {
        let mut s = self.state.borrow_mut();
        if s.closed {
            return;
        }
        s.closed = true;
        s.reason = Some(reason.into());
        let getters: Vec<_> = s.parked_getters.drain(..).collect();
        drop(s);
        wake_getters_with_none(getters);
    }

    /// Whether the mailbox has been closed, either explicitly or by its last sender
    /// dropping.
    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// The reason the mailbox was closed, if it has been.
    pub fn reason(&self) -> Option<String> {
        self.state.borrow().reason.clone()
    }
}

impl<T: 'static> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        self.state.borrow_mut().senders += 1;
        Mailbox {
            state: self.state.clone(),
        }
    }
}

impl<T: 'static> Drop for Mailbox<T> {
    fn drop(&mut self) {
        let getters = {
            let mut s = self.state.borrow_mut();
            s.senders -= 1;
            if s.senders == 0 && !s.closed {
                s.closed = true;
                s.reason.get_or_insert_with(|| "all senders dropped".into());
                s.parked_getters.drain(..).collect()
            } else {
                Vec::new()
            }
        };
        wake_getters_with_none(getters);
    }
}

impl<T: 'static> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn wake_getters_with_none<T>(getters: Vec<Getter<T>>) {
    for getter in getters {
        if getter.sink.is_open() {
            getter.sink.complete(getter.leaf, None);
        }
    }
}

/// Pops parked getters off the front until one whose suspension hasn't already
/// synchronized some other way (it lost a race to a different `choice` arm, but its
/// cleanup hasn't run yet since that's driven by `perform`, not by this queue).
fn pop_active_getter<T>(s: &mut State<T>) -> Option<Getter<T>> {
    while let Some(getter) = s.parked_getters.pop_front() {
        if getter.sink.is_open() {
            return Some(getter);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::block_on;

    #[test]
    fn send_then_recv() {
        block_on(async {
            let mbox = Mailbox::new();
            mbox.send(1);
            mbox.send(2);
            assert_eq!(mbox.recv().await, Some(1));
            assert_eq!(mbox.recv().await, Some(2));
        });
    }

    #[test]
    fn send_after_close_is_rejected() {
        let mbox = Mailbox::new();
        mbox.close("shutting down");
        assert!(!mbox.send(1));
    }

    #[test]
    fn close_is_idempotent_and_keeps_the_first_reason() {
        let mbox = Mailbox::<()>::new();
        mbox.close("first");
        mbox.close("second");
        assert_eq!(mbox.reason().as_deref(), Some("first"));
    }

    #[test]
    fn recv_drains_buffered_values_before_yielding_none() {
        block_on(async {
            let mbox = Mailbox::new();
            mbox.send(1);
            mbox.close("done");
            assert_eq!(mbox.recv().await, Some(1));
            assert_eq!(mbox.recv().await, None);
            assert_eq!(mbox.recv().await, None);
        });
    }

    #[test]
    fn dropping_the_last_sender_closes_the_mailbox() {
        block_on(async {
            let mbox = Mailbox::<u32>::new();
            let extra = mbox.clone();

            // `recv_op` only clones the shared state, not a `Mailbox` handle, so
            // building it here doesn't itself count as a sender keeping the mailbox
            // alive once `mbox` and `extra` are gone.
            let recv_fut = crate::op::perform(mbox.recv_op());
            drop(mbox);
            drop(extra);

            assert_eq!(recv_fut.await, None);
        });
    }

    #[test]
    fn close_wakes_a_parked_receiver_with_none() {
        block_on(async {
            let mbox: Mailbox<u32> = Mailbox::new();
            let closer = mbox.clone();
            crate::runtime::spawn(async move {
                closer.close("shutdown");
            });
            assert_eq!(mbox.recv().await, None);
        });
    }

    #[test]
    fn is_not_send_or_sync() {
        impls::impls!(Mailbox<u32>: !Send & !Sync);
    }
}
