//! Structured concurrency: a tree of supervision scopes with admission gating,
//! cooperative cancellation, fail-fast fault recording, and recursive join reporting.
//!
//! Every spawn happens under some scope; a scope's failure cancels its own children
//! (not its siblings or parent), and a join walks the whole subtree rather than
//! reporting one fiber's error at a time.

pub mod report;
pub use report::ScopeReport;

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use crate::op::{choice, guard, Op};
use crate::sync::latch::Latch;
use crate::sync::waitgroup::WaitGroup;
use crate::{BoxError, Cancelled};

/// A scope's terminal outcome. Transitions are monotone: `Running` moves to exactly
/// one of the other three and never moves again. Failure takes precedence over
/// cancellation when a scope observes both (a fault always cancels its own scope too).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Ok,
    Failed,
    Cancelled,
}

/// The reportable primitive a scope's fault pipeline normalises every spawned body's
/// failure into, whether it came back as `Err` or as a caught panic.
#[derive(thiserror::Error, Debug)]
pub enum ScopeError {
    #[error(transparent)]
    Application(#[from] BoxError),
    #[error("fiber panicked: {0}")]
    Panic(String),
}

thread_local! {
    static NEXT_ID: Cell<u64> = const { Cell::new(0) };
    static CURRENT: RefCell<Vec<Scope>> = const { RefCell::new(Vec::new()) };
}

fn next_id() -> u64 {
    NEXT_ID.with(|c| {
        let id = c.get();
        c.set(id + 1);
        id
    })
}

/// The scope a newly spawned fiber should register with: the innermost one installed
/// by an ancestor fiber's `poll`, or `None` outside of any (the root bootstrap installs
/// one before running anything, so ordinary user code always sees `Some`).
pub(crate) fn current() -> Option<Scope> {
    CURRENT.with(|c| c.borrow().last().cloned())
}

struct JoinOutcome {
    status: Status,
    primary: Option<Rc<ScopeError>>,
    report: ScopeReport,
}

struct Inner {
    id: u64,
    // A back reference only — owning the parent strongly here would create a
    // reference cycle with `children` (the parent already owns the child's lifetime,
    // via attachment, not the other way around).
    parent: Option<Weak<Inner>>,
    children: RefCell<Vec<Scope>>,
    wg: WaitGroup,
    status: Cell<Status>,
    failed: RefCell<Option<Rc<ScopeError>>>,
    cancel_reason: RefCell<Option<String>>,
    closed: Cell<bool>,
    close_reason: RefCell<Option<String>>,
    extra_errors: RefCell<Vec<Rc<ScopeError>>>,
    finalisers: RefCell<Vec<Box<dyn FnOnce(bool, Status, Option<Rc<ScopeError>>)>>>,
    close_latch: Rc<Latch>,
    cancel_latch: Rc<Latch>,
    fault_latch: Rc<Latch>,
    join_latch: Rc<Latch>,
    join_started: Cell<bool>,
    join_outcome: RefCell<Option<JoinOutcome>>,
}

/// A node in the supervision tree. Cheap to clone (an `Rc` handle); every clone refers
/// to the same scope.
#[derive(Clone)]
pub struct Scope(Rc<Inner>);

impl Scope {
    fn new(parent: Option<&Scope>) -> Self {
        Scope(Rc::new(Inner {
            id: next_id(),
            parent: parent.map(|p| Rc::downgrade(&p.0)),
            children: RefCell::new(Vec::new()),
            wg: WaitGroup::new(),
            status: Cell::new(Status::Running),
            failed: RefCell::new(None),
            cancel_reason: RefCell::new(None),
            closed: Cell::new(false),
            close_reason: RefCell::new(None),
            extra_errors: RefCell::new(Vec::new()),
            finalisers: RefCell::new(Vec::new()),
            close_latch: Latch::new(),
            cancel_latch: Latch::new(),
            fault_latch: Latch::new(),
            join_latch: Latch::new(),
            join_started: Cell::new(false),
            join_outcome: RefCell::new(None),
        }))
    }

    /// A fresh root scope — the caller is responsible for running it as the current
    /// scope of whatever it spawns (see [`crate::run`]); nothing installs one
    /// automatically just by constructing it.
    pub fn root() -> Self {
        Scope::new(None)
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn status(&self) -> Status {
        self.0.status.get()
    }

    /// The scope this one was attached under, if its parent hasn't been dropped.
    pub fn parent(&self) -> Option<Scope> {
        self.0.parent.as_ref()?.upgrade().map(Scope)
    }

    /// Creates a child scope attached to `self` in attachment order. Does not install
    /// it as current or spawn anything on it — see [`Scope::run`]/[`Scope::spawn`].
    fn child(&self) -> Self {
        let child = Scope::new(Some(self));
        self.0.children.borrow_mut().push(child.clone());
        child
    }

    /// Registers a finaliser to run, LIFO, once this scope's children have all joined.
    /// Receives whether the scope aborted, its final status, and the primary error if
    /// it failed.
    pub fn on_finally<F>(&self, f: F)
    where
        F: FnOnce(bool, Status, Option<Rc<ScopeError>>) + 'static,
    {
        self.0.finalisers.borrow_mut().push(Box::new(f));
    }

    /// Flips the admission gate. Idempotent: only the first call's `reason` sticks.
    /// A scope that's `closed` still rejects `spawn`/`child`, but closing by itself
    /// doesn't move `status` off `Running` — only [`Scope::cancel`]/a recorded fault do.
    pub fn close(&self, reason: impl Into<String>) {
        if self.0.closed.replace(true) {
            return;
        }
        *self.0.close_reason.borrow_mut() = Some(reason.into());
        self.0.close_latch.signal();
    }

    /// Closes admission, records the cancellation reason (first one wins), and
    /// cascades to every current child. A no-op once this scope has already reached a
    /// terminal status other than a plain cancellation in progress.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self.0.status.get() != Status::Running {
            return;
        }
        self.cascade_cancel(reason.into());
        self.0.status.set(Status::Cancelled);
    }

    /// The closing/cascading side-effects of cancellation, shared with
    /// [`Scope::record_fault`] — unlike [`Scope::cancel`] itself this always runs
    /// regardless of current status, since a fault must cascade to children even
    /// though `status` is about to become `Failed` rather than `Cancelled`.
    fn cascade_cancel(&self, reason: String) {
        self.close(reason.clone());
        if self.0.cancel_reason.borrow().is_none() {
            *self.0.cancel_reason.borrow_mut() = Some(reason);
        }
        self.0.cancel_latch.signal();

        let children: Vec<_> = self.0.children.borrow().clone();
        for child in children {
            child.cancel("parent cancelled");
        }
    }

    /// Normalises `err` into a fault: anything else becomes the primary failure if
    /// none is recorded yet, or an extra error otherwise. The first failure always
    /// cancels this scope's children too, and wins over a concurrent plain
    /// cancellation — `status` ends up `Failed`, not `Cancelled`.
    fn record_fault(&self, fault: ScopeError) {
        if self.0.failed.borrow().is_some() {
            self.0.extra_errors.borrow_mut().push(Rc::new(fault));
            return;
        }
        let fault = Rc::new(fault);
        *self.0.failed.borrow_mut() = Some(fault.clone());
        self.0.fault_latch.signal();
        self.cascade_cancel(format!("sibling fault: {fault}"));
        self.0.status.set(Status::Failed);
    }

    /// An operation ready once this scope is cancelled, tagged with the reason.
    fn cancel_op(&self) -> Op<String> {
        let scope = self.clone();
        crate::sync::latch::wait_op(self.0.cancel_latch.clone())
            .wrap(move |()| scope.0.cancel_reason.borrow().clone().unwrap_or_default())
    }

    /// An operation ready once this scope has recorded its primary fault.
    fn fault_op(&self) -> Op<Rc<ScopeError>> {
        let scope = self.clone();
        crate::sync::latch::wait_op(self.0.fault_latch.clone()).wrap(move |()| {
            scope
                .0
                .failed
                .borrow()
                .clone()
                .expect("fault_op fired without a fault")
        })
    }

    /// `choice(fault_op, cancel_op)`, tagged so callers can tell which one fired.
    fn not_ok_op(&self) -> Op<NotOk> {
        choice(vec![
            self.fault_op().wrap(NotOk::Failed),
            self.cancel_op().wrap(NotOk::Cancelled),
        ])
    }

    /// Spawns `body` as a new fiber attached to this scope. Rejected if the scope
    /// isn't currently admitting (closed, cancelling, failed, or joining).
    pub fn spawn<Fut>(&self, body: Fut) -> bool
    where
        Fut: Future<Output = Result<(), BoxError>> + 'static,
    {
        if self.0.closed.get() {
            return false;
        }
        self.0.wg.add(1);
        crate::runtime::spawn(SpawnBody {
            scope: self.clone(),
            inner: body,
        });
        true
    }

    /// Runs `body` under a fresh child of this scope in its own fiber, and resolves
    /// once that child (and everything it spawned) has fully joined.
    pub async fn run<Fut>(&self, body: impl FnOnce(Scope) -> Fut + 'static) -> ScopeReport
    where
        Fut: Future<Output = Result<(), BoxError>> + 'static,
    {
        let child = self.child();
        let body_scope = child.clone();
        child.spawn(async move { body(body_scope).await });
        self.join_child(&child).await
    }

    /// Lifts `build_op` into an operation that runs it under a fresh child scope. If
    /// the resulting operation loses an enclosing choice, the child is cancelled with
    /// reason `"aborted"` and joined deterministically before the loss is final.
    pub fn with_op<T, F>(&self, build_op: F) -> Op<T>
    where
        T: 'static,
        F: FnOnce(Scope) -> Op<T> + 'static,
    {
        let parent = self.clone();
        guard(move || {
            let child = parent.child();
            let op = build_op(child.clone());
            op.on_abort(move || {
                child.cancel("aborted");
            })
        })
    }

    /// Runs `build_op` under a fresh child scope as a racable operation: if it loses a
    /// surrounding choice, the child is cancelled with reason `"aborted"`.
    pub fn run_op<T, F>(&self, build_op: F) -> Op<T>
    where
        T: 'static,
        F: FnOnce(Scope) -> Op<T> + 'static,
    {
        self.with_op(build_op)
    }

    /// Joins `child`, detaching it from this scope's child list once its outcome is
    /// stored so a long-lived parent doesn't retain completed children forever.
    async fn join_child(&self, child: &Scope) -> ScopeReport {
        let report = child.join().await;
        self.0.children.borrow_mut().retain(|c| c.id() != child.id());
        report
    }

    /// An operation ready once this scope's join outcome has been computed, starting
    /// the join worker the first time any leaf blocks on it.
    fn join_op(&self) -> Op<ScopeReport> {
        let probe_scope = self.clone();
        let block_scope = self.clone();
        Op::new_primitive(
            move || probe_scope.0.join_outcome.borrow().as_ref().map(|o| o.report.clone()),
            move |sink, leaf| {
                block_scope.start_join_worker();
                let waiter_scope = block_scope.clone();
                let handle = block_scope.0.join_latch.add_waiter(Box::new(move || {
                    let report = waiter_scope
                        .0
                        .join_outcome
                        .borrow()
                        .as_ref()
                        .expect("join latch fired without an outcome")
                        .report
                        .clone();
                    sink.complete(leaf, report);
                }));
                std::mem::forget(handle);
            },
        )
    }

    fn start_join_worker(&self) {
        if self.0.join_started.replace(true) {
            return;
        }
        let scope = self.clone();
        crate::runtime::spawn(async move {
            scope.close("joining");

            let children: Vec<_> = scope.0.children.borrow().clone();
            // The waitgroup wait and each child's join are performed raw — outside
            // any choice against this scope's own cancellation — because a join must
            // not be interruptible by the very cancellation it may itself be part of.
            crate::op::perform(scope.0.wg.wait_op()).await;

            let mut child_reports = Vec::with_capacity(children.len());
            for child in &children {
                child_reports.push(crate::op::perform(child.join_op()).await);
            }
            scope.0.children.borrow_mut().clear();

            let mut status = scope.0.status.get();
            if status == Status::Running {
                status = Status::Ok;
            }
            let mut aborted = status != Status::Ok;
            let mut primary = scope.0.failed.borrow().clone();

            let finalisers: Vec<_> = scope.0.finalisers.borrow_mut().drain(..).rev().collect();
            for finaliser in finalisers {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    finaliser(aborted, status, primary.clone())
                }));
                if let Err(panic) = result {
                    scope.record_fault(ScopeError::Panic(panic_message(&panic)));
                    status = scope.0.status.get();
                    aborted = status != Status::Ok;
                    primary = scope.0.failed.borrow().clone();
                }
            }

            scope.0.status.set(status);
            let mut report = ScopeReport::new(scope.0.id, status, primary.clone());
            report.extra_errors = scope.0.extra_errors.borrow().clone();
            report.children = child_reports;

            *scope.0.join_outcome.borrow_mut() = Some(JoinOutcome {
                status,
                primary,
                report,
            });
            scope.0.join_latch.signal();
        });
    }

    /// Suspends until this scope and all its children have joined, returning the
    /// recursive report.
    pub async fn join(&self) -> ScopeReport {
        crate::op::perform(self.join_op()).await
    }

    /// Performs `op` scoped: races it against this scope's own not-ok condition and
    /// re-tags the outcome. Already-not-ok scopes short-circuit without even compiling
    /// `op`'s leaves.
    fn try_op<T: 'static>(&self, op: Op<T>) -> Op<Outcome<T>> {
        let scope = self.clone();
        guard(move || {
            if matches!(scope.0.status.get(), Status::Failed | Status::Cancelled) {
                return ready_outcome(current_outcome(&scope));
            }
            choice(vec![
                op.wrap(Outcome::Ok),
                scope.not_ok_op().wrap(Outcome::from_not_ok),
            ])
        })
    }

    /// Performs `op`, returning its status-tagged outcome rather than raising on
    /// cancellation.
    pub async fn try_perform<T: 'static>(&self, op: Op<T>) -> Outcome<T> {
        crate::op::perform(self.try_op(op)).await
    }

    /// Performs `op`, raising [`Cancelled`] if this scope is cancelled (or fails, which
    /// cancels it) before `op` commits.
    pub async fn perform<T: 'static>(&self, op: Op<T>) -> Result<T, Cancelled> {
        match self.try_perform(op).await {
            Outcome::Ok(v) => Ok(v),
            Outcome::Cancelled(reason) => Err(Cancelled::new(reason)),
            Outcome::Failed(_) => Err(Cancelled::new("scope failed")),
        }
    }
}

fn ready_outcome<T: 'static>(outcome: Outcome<T>) -> Op<Outcome<T>> {
    crate::op::always(outcome)
}

fn current_outcome<T>(scope: &Scope) -> Outcome<T> {
    match scope.0.status.get() {
        Status::Failed => Outcome::Failed(
            scope
                .0
                .failed
                .borrow()
                .clone()
                .expect("Failed status without a recorded fault"),
        ),
        Status::Cancelled => Outcome::Cancelled(
            scope
                .0
                .cancel_reason
                .borrow()
                .clone()
                .unwrap_or_default(),
        ),
        Status::Running | Status::Ok => {
            unreachable!("try_op only short-circuits on Failed/Cancelled")
        }
    }
}

enum NotOk {
    Failed(Rc<ScopeError>),
    Cancelled(String),
}

/// The status-first result of [`Scope::try_perform`].
pub enum Outcome<T> {
    Ok(T),
    Failed(Rc<ScopeError>),
    Cancelled(String),
}

impl<T> Outcome<T> {
    fn from_not_ok(not_ok: NotOk) -> Self {
        match not_ok {
            NotOk::Failed(e) => Outcome::Failed(e),
            NotOk::Cancelled(r) => Outcome::Cancelled(r),
        }
    }
}

struct SpawnBody<Fut> {
    scope: Scope,
    inner: Fut,
}

impl<Fut> Future for SpawnBody<Fut>
where
    Fut: Future<Output = Result<(), BoxError>>,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = unsafe { self.get_unchecked_mut() };

        CURRENT.with(|c| c.borrow_mut().push(this.scope.clone()));
        let polled = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let inner = unsafe { Pin::new_unchecked(&mut this.inner) };
            inner.poll(cx)
        }));
        CURRENT.with(|c| {
            c.borrow_mut().pop();
        });

        match polled {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(Ok(()))) => {
                this.scope.0.wg.done();
                Poll::Ready(())
            }
            Ok(Poll::Ready(Err(e))) => {
                this.scope.record_fault(ScopeError::Application(e));
                this.scope.0.wg.done();
                Poll::Ready(())
            }
            Err(panic) => {
                this.scope
                    .record_fault(ScopeError::Panic(panic_message(&panic)));
                this.scope.0.wg.done();
                Poll::Ready(())
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::block_on;

    #[test]
    fn successful_child_reports_ok() {
        block_on(async {
            let root = Scope::root();
            let report = root.run(|_scope| async { Ok::<(), BoxError>(()) }).await;
            assert_eq!(report.status, Status::Ok);
            assert!(report.primary.is_none());
        });
    }

    #[test]
    fn failing_child_reports_failed_with_primary() {
        block_on(async {
            let root = Scope::root();
            let report = root
                .run(|_scope| async { Err::<(), BoxError>("boom".into()) })
                .await;
            assert_eq!(report.status, Status::Failed);
            assert!(report.primary.is_some());
        });
    }

    #[test]
    fn panicking_child_is_caught_and_reported() {
        block_on(async {
            let root = Scope::root();
            let report = root
                .run(|_scope| async {
                    panic!("oh no");
                    #[allow(unreachable_code)]
                    Ok::<(), BoxError>(())
                })
                .await;
            assert_eq!(report.status, Status::Failed);
        });
    }

    #[test]
    fn cancelling_a_scope_cancels_its_children() {
        block_on(async {
            let root = Scope::root();
            let child = root.child();
            let grandchild = child.child();
            child.cancel("stop");
            assert_eq!(grandchild.status(), Status::Cancelled);
        });
    }

    #[test]
    fn close_reason_is_first_writer_wins() {
        let scope = Scope::root();
        scope.close("first");
        scope.close("second");
        assert_eq!(scope.0.close_reason.borrow().as_deref(), Some("first"));
    }

    #[test]
    fn is_not_send_or_sync() {
        impls::impls!(Scope: !Send & !Sync);
    }

    #[test]
    fn parent_back_reference_does_not_keep_a_dropped_parent_alive() {
        let root = Scope::root();
        let child = root.child();
        drop(root);
        assert!(child.parent().is_none());
    }

    #[test]
    fn recording_a_fault_still_cancels_children() {
        let root = Scope::root();
        let child = root.child();
        root.record_fault(ScopeError::Panic("boom".to_string()));
        assert_eq!(root.status(), Status::Failed);
        assert_eq!(child.status(), Status::Cancelled);
    }
}
