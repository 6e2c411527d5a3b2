//! A CML-style channel: `get`/`put` are first-class [`Op`]s rather than blocking
//! calls, so they compose with [`crate::op::choice`] like everything else in this
//! crate. Capacity zero is a rendezvous channel (a put and a get must meet); capacity
//! above zero buffers that many values before a put has to wait.
//!
//! Built on `Rc<RefCell<State>>` holding an unbounded queue of parked operations on
//! each side, with both ends exposed as operations rather than async fns directly so
//! either can take part in an arbitrary `choice`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::op::{Op, Sink};

struct State<T> {
    capacity: usize,
    buffer: VecDeque<T>,
    // Fibers parked on `put`, in arrival order, each carrying the value they want to
    // hand off and the sink/leaf to notify once it's accepted.
    parked_putters: VecDeque<Putter<T>>,
    // Fibers parked on `get`, in arrival order.
    parked_getters: VecDeque<Getter<T>>,
}

struct Putter<T> {
    value: Option<T>,
    sink: Rc<dyn Sink<()>>,
    leaf: usize,
}

struct Getter<T> {
    sink: Rc<dyn Sink<T>>,
    leaf: usize,
}

/// A channel endpoint. Both [`Channel::put`] and [`Channel::get`] are available off
/// the same handle — unlike a split `Sender`/`Receiver` pair, since a single-threaded
/// CML channel has no use for enforcing direction at the type level.
#[derive(Clone)]
pub struct Channel<T> {
    state: Rc<RefCell<State<T>>>,
}

impl<T: 'static> Channel<T> {
    /// `capacity == 0` is a rendezvous channel: `put` only succeeds once a `get` is
    /// ready to receive the value (or vice versa).
    pub fn new(capacity: usize) -> Self {
        Channel {
            state: Rc::new(RefCell::new(State {
                capacity,
                buffer: VecDeque::new(),
                parked_putters: VecDeque::new(),
                parked_getters: VecDeque::new(),
            })),
        }
    }

    /// An operation that sends `value`, ready immediately if the buffer has room or a
    /// getter is already waiting, otherwise blocking until one arrives.
    pub fn put_op(&self, value: T) -> Op<()> {
        let state = self.state.clone();
        let value = Rc::new(RefCell::new(Some(value)));

        let try_state = state.clone();
        let try_value = value.clone();
        let try_fn = move || {
            let mut s = try_state.borrow_mut();
            if let Some(getter) = pop_active_getter(&mut s) {
                let v = try_value.borrow_mut().take().expect("put_op tried twice");
                drop(s);
                getter.sink.complete(getter.leaf, v);
                return Some(());
            }
            if s.buffer.len() < s.capacity {
                let v = try_value.borrow_mut().take().expect("put_op tried twice");
                s.buffer.push_back(v);
                return Some(());
            }
            None
        };

        let block_state = state;
        let block_value = value;
        let block_fn = move |sink: Rc<dyn Sink<()>>, leaf: usize| {
            let v = block_value.borrow_mut().take().expect("put_op tried twice");
            block_state.borrow_mut().parked_putters.push_back(Putter {
                value: Some(v),
                sink,
                leaf,
            });
        };

        Op::new_primitive(try_fn, block_fn)
    }

    /// Suspends the current fiber until `value` is accepted.
    pub async fn put(&self, value: T) {
        crate::op::perform(self.put_op(value)).await
    }

    /// Enqueues `value` without suspending, for callers that already know the put
    /// can't block (an unbounded channel's capacity never fills). Used by
    /// [`crate::sync::mailbox::Mailbox::send`] to avoid round-tripping through the
    /// operation algebra for something that's never actually an operation.
    pub(crate) fn put_now(&self, value: T) {
        let mut s = self.state.borrow_mut();
        if let Some(getter) = pop_active_getter(&mut s) {
            drop(s);
            getter.sink.complete(getter.leaf, value);
            return;
        }
        s.buffer.push_back(value);
    }

    /// An operation that receives a value, ready immediately if the buffer is
    /// non-empty or a putter is already waiting, otherwise blocking until one arrives.
    pub fn get_op(&self) -> Op<T> {
        let state = self.state.clone();

        let try_state = state.clone();
        let try_fn = move || {
            let mut s = try_state.borrow_mut();
            if let Some(value) = s.buffer.pop_front() {
                // A buffered value was accepted, which frees a slot: wake the oldest
                // still-active parked putter, if any, to refill it.
                if let Some(putter) = pop_active_putter(&mut s) {
                    let v = putter.value.expect("parked putter without a value");
                    s.buffer.push_back(v);
                    drop(s);
                    putter.sink.complete(putter.leaf, ());
                }
                return Some(value);
            }
            if let Some(putter) = pop_active_putter(&mut s) {
                let v = putter.value.expect("parked putter without a value");
                drop(s);
                putter.sink.complete(putter.leaf, ());
                return Some(v);
            }
            None
        };

        let block_state = state;
        let block_fn = move |sink: Rc<dyn Sink<T>>, leaf: usize| {
            block_state
                .borrow_mut()
                .parked_getters
                .push_back(Getter { sink, leaf });
        };

        Op::new_primitive(try_fn, block_fn)
    }

    /// Suspends the current fiber until a value is available.
    pub async fn get(&self) -> T {
        crate::op::perform(self.get_op()).await
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

fn pop_active_putter<T>(s: &mut State<T>) -> Option<Putter<T>> {
    while let Some(putter) = s.parked_putters.pop_front() {
        if putter.sink.is_open() {
            return Some(putter);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::block_on;

    #[test]
    fn buffered_put_then_get() {
        block_on(async {
            let ch = Channel::new(1);
            ch.put(1).await;
            assert_eq!(ch.get().await, 1);
        });
    }

    #[test]
    fn rendezvous_wakes_waiting_getter() {
        block_on(async {
            let ch = Channel::new(0);
            let putter = ch.clone();
            crate::runtime::spawn(async move {
                putter.put(42).await;
            });
            assert_eq!(ch.get().await, 42);
        });
    }

    #[test]
    fn is_not_send_or_sync() {
        impls::impls!(Channel<u32>: !Send & !Sync);
    }
}
