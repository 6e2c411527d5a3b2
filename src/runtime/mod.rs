//! The single-threaded cooperative scheduler: a run-queue of fibers and a timer wheel,
//! plus an extension point for embedding other event sources.
//!
//! A fiber here is `Pin<Box<dyn Future<Output = ()>>>` polled by a manually constructed
//! [`Waker`], rather than a separately allocated machine stack switched to with inline
//! assembly — a portable shape with no dependency on a particular I/O backend, since
//! the only suspension points a fiber ever has are CML `perform` calls.

mod waker;

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::Context;
use std::time::Duration;

use slab::Slab;

use crate::op::Op;
use crate::time::Instant;

pub(crate) type FiberId = usize;

/// An externally driven event source the scheduler consults when its run-queue is
/// empty and no timer is due yet — the extension point FD pollers, subprocess
/// watchers, and the like are expected to implement outside this crate (see the
/// Non-goals: none of those live in here).
pub trait TaskSource {
    /// Waits for at most `timeout` for an external event, taking whatever action
    /// (spawning fibers, completing operations) that event implies. Returns whether
    /// anything happened — `false` tells the scheduler it can keep sleeping.
    fn wait(&mut self, timeout: Duration) -> bool;
}

struct Fiber {
    future: RefCell<Option<Pin<Box<dyn Future<Output = ()>>>>>,
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    fire: Box<dyn FnOnce()>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

/// The scheduler singleton for the thread it's running on. Not constructed directly —
/// use [`builder`] or [`block_on`].
pub struct Scheduler {
    fibers: RefCell<Slab<Rc<Fiber>>>,
    cur: RefCell<VecDeque<FiberId>>,
    next: RefCell<VecDeque<FiberId>>,
    timers: RefCell<BinaryHeap<Reverse<TimerEntry>>>,
    timer_seq: Cell<u64>,
    source: RefCell<Option<Box<dyn TaskSource>>>,
    max_sleep: Duration,
    unscoped_panic_handler: Option<Box<dyn Fn(String)>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Scheduler>>> = const { RefCell::new(None) };
}

/// Configures and starts a [`Scheduler`] via explicit parameters rather than reading
/// any file or environment config — this crate has no configuration file surface.
#[derive(Default)]
pub struct Builder {
    max_sleep: Duration,
    source: Option<Box<dyn TaskSource>>,
    unscoped_panic_handler: Option<Box<dyn Fn(String)>>,
}

impl Builder {
    /// The longest the scheduler will block the thread waiting for the next timer or
    /// external event when its run-queue is otherwise empty. Defaults to one second.
    pub fn max_sleep(mut self, duration: Duration) -> Self {
        self.max_sleep = duration;
        self
    }

    /// Registers the event source consulted when idle. A later call replaces the
    /// earlier one rather than adding a second source — only one is ever active.
    pub fn event_waiter(mut self, source: impl TaskSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Registers a handler for a panic from a fiber spawned with the free [`spawn`]
    /// function rather than through a [`crate::scope::Scope`] — one with no scope to
    /// record the fault on. Defaults to re-raising the panic on the scheduler thread
    /// (the old behaviour, and a reasonable one: an unscoped fiber has no supervisor).
    pub fn on_unscoped_panic(mut self, handler: impl Fn(String) + 'static) -> Self {
        self.unscoped_panic_handler = Some(Box::new(handler));
        self
    }

    /// Runs `future` to completion on a fresh scheduler installed on this thread, then
    /// tears the scheduler down.
    ///
    /// # Panics
    /// If a scheduler is already running on this thread — runtimes don't nest.
    pub fn block_on<F>(self, future: F) -> F::Output
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        CURRENT.with(|cell| {
            assert!(
                cell.borrow().is_none(),
                "a runtime is already running on this thread"
            )
        });

        let max_sleep = if self.max_sleep == Duration::ZERO {
            Duration::from_secs(1)
        } else {
            self.max_sleep
        };

        let sched = Rc::new(Scheduler {
            fibers: RefCell::new(Slab::new()),
            cur: RefCell::new(VecDeque::new()),
            next: RefCell::new(VecDeque::new()),
            timers: RefCell::new(BinaryHeap::new()),
            timer_seq: Cell::new(0),
            source: RefCell::new(self.source),
            max_sleep,
            unscoped_panic_handler: self.unscoped_panic_handler,
        });
        CURRENT.with(|cell| *cell.borrow_mut() = Some(sched.clone()));

        let result = Rc::new(RefCell::new(None));
        let slot = result.clone();
        let root = async move {
            slot.borrow_mut().replace(future.await);
        };
        sched.spawn_pinned(Box::pin(root));
        sched.drive_to_quiescence();

        CURRENT.with(|cell| *cell.borrow_mut() = None);
        Rc::try_unwrap(result)
            .unwrap_or_else(|_| unreachable!("root fiber still has outstanding references"))
            .into_inner()
            .expect("root future did not run to completion")
    }
}

/// Shorthand for `builder().block_on(future)`.
pub fn block_on<F>(future: F) -> F::Output
where
    F: Future + 'static,
    F::Output: 'static,
{
    Builder::default().block_on(future)
}

pub fn builder() -> Builder {
    Builder::default()
}

/// Spawns `future` as a new fiber on the running scheduler, detached: nothing joins it
/// directly (use [`crate::scope`] for structured spawns that do).
///
/// # Panics
/// If called outside a running scheduler.
pub fn spawn<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    with(|sched| sched.spawn_pinned(Box::pin(future)))
}

/// Runs `f` against the scheduler active on this thread.
///
/// # Panics
/// If called outside a running scheduler (e.g. `perform` from plain, non-fiber code).
pub(crate) fn with<R>(f: impl FnOnce(&Scheduler) -> R) -> R {
    CURRENT.with(|cell| {
        let sched = cell.borrow();
        let sched = sched
            .as_ref()
            .expect("called outside of a running skein scheduler");
        f(sched)
    })
}

impl Scheduler {
    fn spawn_pinned(&self, future: Pin<Box<dyn Future<Output = ()>>>) -> FiberId {
        let id = self.fibers.borrow_mut().insert(Rc::new(Fiber {
            future: RefCell::new(Some(future)),
        }));
        self.next.borrow_mut().push_back(id);
        id
    }

    /// The scheduler's current time. A thin pass-through today, but routed through
    /// here rather than `Instant::now()` directly so a future deterministic/simulated
    /// clock only has to change this one method.
    pub(crate) fn now(&self) -> Instant {
        Instant::now()
    }

    /// Builds the operation behind [`crate::time::sleep`]/[`crate::time::sleep_op`]:
    /// ready immediately for a zero duration, otherwise arranges a timer-wheel entry
    /// on the slow path.
    pub(crate) fn timer_op(&self, duration: Duration) -> Op<()> {
        let deadline = self.now().add(duration);
        let immediate = duration == Duration::ZERO;

        Op::new_primitive(
            move || immediate.then_some(()),
            move |sink, leaf| {
                with(|sched| {
                    let cancelled = Rc::new(Cell::new(false));
                    let seq = sched.timer_seq.get();
                    sched.timer_seq.set(seq + 1);

                    let fire_cancelled = cancelled.clone();
                    let cleanup_sink = sink.clone();
                    sched.timers.borrow_mut().push(Reverse(TimerEntry {
                        at: deadline,
                        seq,
                        fire: Box::new(move || {
                            if !fire_cancelled.get() {
                                sink.complete(leaf, ());
                            }
                        }),
                    }));
                    let sink = cleanup_sink;

                    // No removal from the heap itself (that would need an O(n)
                    // search); a losing timer just becomes a no-op when its turn
                    // comes, via the flag its `fire` closure checks above.
                    sink.add_cleanup(leaf, Box::new(move || cancelled.set(true)));
                });
            },
        )
    }

    fn wake(self: &Rc<Self>, fiber: FiberId) {
        if self.fibers.borrow().contains(fiber) {
            self.next.borrow_mut().push_back(fiber);
        }
    }

    /// Runs fibers until none remain runnable and no timer or source can ever make
    /// progress again.
    fn drive_to_quiescence(self: &Rc<Self>) {
        loop {
            self.run_ready_fibers();

            if self.fibers.borrow().is_empty() {
                return;
            }

            if !self.cur.borrow().is_empty() || !self.next.borrow().is_empty() {
                continue;
            }

            if !self.fire_due_timers() {
                let waited = self.wait_for_external_event();
                if !waited && self.cur.borrow().is_empty() && self.next.borrow().is_empty() {
                    // Nothing runnable, nothing due, no source reported progress:
                    // every remaining fiber is permanently parked.
                    return;
                }
            }
        }
    }

    fn run_ready_fibers(self: &Rc<Self>) {
        {
            let mut cur = self.cur.borrow_mut();
            let mut next = self.next.borrow_mut();
            if cur.is_empty() {
                std::mem::swap(&mut *cur, &mut *next);
            }
        }

        while let Some(id) = self.cur.borrow_mut().pop_front() {
            self.poll_fiber(id);
        }
    }

    fn poll_fiber(self: &Rc<Self>, id: FiberId) {
        let fiber = match self.fibers.borrow().get(id) {
            Some(f) => f.clone(),
            None => return,
        };

        let mut slot = fiber.future.borrow_mut();
        let Some(mut future) = slot.take() else {
            return;
        };

        let waker = waker::make(self.clone(), id);
        let mut cx = Context::from_waker(&waker);

        let poll_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            future.as_mut().poll(&mut cx)
        }));

        match poll_result {
            Ok(std::task::Poll::Ready(())) => {
                drop(slot);
                self.fibers.borrow_mut().remove(id);
            }
            Ok(std::task::Poll::Pending) => {
                *slot = Some(future);
            }
            Err(panic) => {
                drop(slot);
                self.fibers.borrow_mut().remove(id);
                // A scoped fiber never panics past its own `SpawnBody` wrapper — it
                // converts any panic into a recorded fault before returning `Ready`.
                // Reaching this arm means the fiber had no scope to report to at all.
                match &self.unscoped_panic_handler {
                    Some(handler) => handler(crate::scope::panic_message(&panic)),
                    None => std::panic::resume_unwind(panic),
                }
            }
        }
    }

    fn fire_due_timers(&self) -> bool {
        let now = self.now();
        let mut fired = false;
        loop {
            let due = matches!(self.timers.borrow().peek(), Some(Reverse(t)) if t.at <= now);
            if !due {
                break;
            }
            let Reverse(entry) = self.timers.borrow_mut().pop().unwrap();
            (entry.fire)();
            fired = true;
        }
        fired
    }

    fn wait_for_external_event(&self) -> bool {
        let budget = self
            .timers
            .borrow()
            .peek()
            .map(|Reverse(t)| t.at.saturating_duration_since(self.now()))
            .unwrap_or(self.max_sleep)
            .min(self.max_sleep);

        if let Some(source) = self.source.borrow_mut().as_mut() {
            return source.wait(budget);
        }

        if budget > Duration::ZERO {
            std::thread::sleep(budget);
        }
        !self.timers.borrow().is_empty()
    }

    /// Best-effort shutdown: gives every remaining fiber a few more turns to observe
    /// cancellation and finish, then returns regardless of what's left. Used by
    /// [`crate::scope`]'s root teardown, not by a normal `block_on` return (which only
    /// happens once nothing is left to run).
    pub(crate) fn shutdown(self: &Rc<Self>, max_turns: usize) {
        for _ in 0..max_turns {
            if self.fibers.borrow().is_empty() {
                return;
            }
            self.run_ready_fibers();
            self.fire_due_timers();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_on_returns_value() {
        assert_eq!(block_on(async { 1 + 1 }), 2);
    }

    #[test]
    fn spawn_runs_concurrently_with_root() {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        block_on(async move {
            spawn(async move { flag.set(true) });
            crate::time::sleep(Duration::from_millis(0)).await;
        });
        assert!(ran.get());
    }

    #[test]
    #[should_panic(expected = "already running")]
    fn nested_block_on_panics() {
        block_on(async {
            block_on(async {});
        });
    }

    #[test]
    #[should_panic(expected = "outside of a running")]
    fn with_outside_runtime_panics() {
        with(|_| ());
    }
}
