//! A counter-based rendezvous: wait for N outstanding units of work to all finish,
//! used by [`crate::scope`] to join spawned fibers.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::op::Op;
use crate::sync::latch::Latch;

struct Inner {
    count: Cell<usize>,
    done: RefCell<Rc<Latch>>,
}

/// A reusable countdown latch. Cloning shares the same counter; every clone's [`WaitGroup::add`]
/// and [`WaitGroup::done`] act on one underlying count.
///
/// Each 0→positive transition starts a new generation with its own latch, so a
/// `WaitGroup` that has already resolved once can be `add`ed to and waited on again —
/// a `wait`/`wait_op` performed against one generation only ever resumes for that
/// generation's zero-crossing, never a later one's.
#[derive(Clone)]
pub struct WaitGroup {
    inner: Rc<Inner>,
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroup {
    pub fn new() -> Self {
        WaitGroup {
            inner: Rc::new(Inner {
                count: Cell::new(0),
                done: RefCell::new(Latch::new()),
            }),
        }
    }

    /// Registers `n` additional outstanding units of work. If the count was zero,
    /// starts a new generation: a fresh latch, independent of whatever the previous
    /// generation's `wait_op`s were holding onto.
    pub fn add(&self, n: usize) {
        if n == 0 {
            return;
        }
        if self.inner.count.get() == 0 {
            *self.inner.done.borrow_mut() = Latch::new();
        }
        self.inner.count.set(self.inner.count.get() + n);
    }

    /// Marks one unit of work as finished. Signals the current generation once the
    /// count reaches zero.
    ///
    /// # Panics
    /// If called more times than [`WaitGroup::add`] registered.
    pub fn done(&self) {
        let remaining = self
            .inner
            .count
            .get()
            .checked_sub(1)
            .expect("WaitGroup::done called more times than add");
        self.inner.count.set(remaining);
        if remaining == 0 {
            self.inner.done.borrow().signal();
        }
    }

    /// An operation that becomes ready once the current generation's count reaches
    /// zero. Immediately ready if nothing has been added in this generation yet.
    pub fn wait_op(&self) -> Op<()> {
        if self.inner.count.get() == 0 {
            self.inner.done.borrow().signal();
        }
        crate::sync::latch::wait_op(self.inner.done.borrow().clone())
    }

    /// Suspends until the current generation's count reaches zero.
    pub async fn wait(&self) {
        crate::op::perform(self.wait_op()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::block_on;

    #[test]
    fn wait_returns_immediately_with_nothing_added() {
        block_on(async {
            WaitGroup::new().wait().await;
        });
    }

    #[test]
    fn wait_returns_after_all_done() {
        block_on(async {
            let wg = WaitGroup::new();
            wg.add(2);
            wg.done();
            wg.done();
            wg.wait().await;
        });
    }

    #[test]
    #[should_panic(expected = "more times than add")]
    fn done_without_add_panics() {
        WaitGroup::new().done();
    }

    #[test]
    fn wait_blocks_again_after_a_later_generation_is_added() {
        use std::task::Poll;

        let wg = WaitGroup::new();
        wg.add(1);
        wg.done();

        // First generation already resolved; a fresh `add` must start a new one rather
        // than reuse the already-signalled latch.
        wg.add(1);
        let mut fut = crate::op::perform(wg.wait_op());
        assert_eq!(crate::utils::poll(&mut fut), Poll::Pending);

        wg.done();
        assert_eq!(crate::utils::poll(&mut fut), Poll::Ready(()));
    }

    #[test]
    fn is_not_send_or_sync() {
        impls::impls!(WaitGroup: !Send & !Sync);
    }
}
