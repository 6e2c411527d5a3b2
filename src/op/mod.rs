//! The operation algebra: composable, first-class descriptions of a potentially
//! blocking action (Concurrent ML style).
//!
//! An [`Op<T>`] is a pure, immutable AST. [`perform`] compiles it to a flat list of
//! leaves, attempts a non-blocking commit across all of them (the "fast path"), and
//! otherwise suspends the calling fiber until exactly one leaf's external event fires
//! (the "slow path"). Composition is via [`choice`], [`guard`], [`with_nack`], and
//! `Op::wrap`/`Op::on_abort`; see [`crate::op::combinators`] for the full vocabulary.
//!
//! `Op<U>::wrap(f: U -> T)` needs to turn a `Leaf<U>` into a `Leaf<T>` — a type erasure
//! problem, solved here with a safe trait object (`Sink<T>`) rather than a hand-rolled
//! vtable, since nothing here needs to cross a thread.

mod combinators;
mod perform;

pub use combinators::{
    always, boolean_choice, bracket, choice, finally, first_ready, guard, named_choice, never,
    race, with_nack,
};
pub use perform::perform;

use std::rc::Rc;

use crate::sync::latch::Latch;

/// A pure, immutable description of a potentially blocking action that yields a `T`.
pub struct Op<T>(Box<dyn OpNode<T>>);

impl<T: 'static> Op<T> {
    /// Builds a leaf operation from a non-blocking probe and a suspend-and-arrange callback.
    ///
    /// `try_fn` is called at most once per leaf per `perform`, on the fast path; it must
    /// not block or yield. `block_fn` is called at most once, on the slow path, and is
    /// responsible for eventually calling `sink.complete(leaf, value)` exactly once —
    /// typically by registering with some other primitive (a [`Latch`], a channel queue,
    /// the timer wheel).
    pub fn new_primitive<Try, Block>(try_fn: Try, block_fn: Block) -> Self
    where
        Try: FnMut() -> Option<T> + 'static,
        Block: FnOnce(Rc<dyn Sink<T>>, usize) + 'static,
    {
        Op(Box::new(PrimNode {
            try_fn,
            block_fn: Some(block_fn),
            _t: std::marker::PhantomData,
        }))
    }

    /// Maps the committed value through `f`. Composes in declaration order:
    /// `op.wrap(f).wrap(g)` applies `f` then `g`.
    pub fn wrap<U: 'static, F>(self, f: F) -> Op<U>
    where
        F: Fn(T) -> U + 'static,
    {
        Op(Box::new(WrapNode {
            inner: self,
            f: Rc::new(f),
        }))
    }

    /// Attaches a cleanup hook that runs exactly once if this subtree loses an
    /// enclosing [`choice`]. Implemented as a nack whose condition has no observable
    /// waiter of its own — see [`with_nack`] for the observable variant.
    pub fn on_abort<F>(self, hook: F) -> Op<T>
    where
        F: Fn() + 'static,
    {
        Op(Box::new(AbortNode {
            inner: self,
            hook: Rc::new(hook),
        }))
    }

    pub(crate) fn compile(self, nacks: &[Rc<Latch>], leaves: &mut Vec<Leaf<T>>) {
        self.0.compile(nacks, leaves)
    }
}

/// Type-erased acceptor for a leaf's committed value, bridging the native type of a
/// primitive through however many `wrap` layers sit above it in the tree down to the
/// `T` the enclosing [`Op<T>`] was declared with.
pub trait Sink<T> {
    /// Commits `value` for `leaf` if this suspension hasn't already synchronized.
    /// A no-op on every call after the first across the whole suspension.
    fn complete(&self, leaf: usize, value: T);

    /// Whether the suspension this leaf belongs to hasn't synchronized yet. Used by
    /// queue-based primitives (channels, mailboxes) to discard entries that already won
    /// a different arm of the same choice — see `Channel`'s `pop_active` helper.
    fn is_open(&self) -> bool;

    /// Registers a cleanup to run if this particular leaf turns out to lose. Exposed to
    /// external backends per the suspension API (`suspension.add_cleanup`); channels and
    /// the timer wheel don't need it since losing entries are pruned lazily instead.
    fn add_cleanup(&self, leaf: usize, cleanup: Box<dyn FnOnce()>);
}

trait OpNode<T> {
    fn compile(self: Box<Self>, nacks: &[Rc<Latch>], leaves: &mut Vec<Leaf<T>>);
}

struct PrimNode<T, Try, Block> {
    try_fn: Try,
    block_fn: Option<Block>,
    #[allow(dead_code)]
    _t: std::marker::PhantomData<T>,
}

impl<T: 'static, Try, Block> OpNode<T> for PrimNode<T, Try, Block>
where
    Try: FnMut() -> Option<T> + 'static,
    Block: FnOnce(Rc<dyn Sink<T>>, usize) + 'static,
{
    fn compile(mut self: Box<Self>, nacks: &[Rc<Latch>], leaves: &mut Vec<Leaf<T>>) {
        let block_fn = self.block_fn.take().expect("PrimNode compiled twice");
        leaves.push(Leaf {
            try_fn: Box::new(self.try_fn),
            block_fn: Box::new(block_fn),
            nacks: nacks.to_vec(),
        });
    }
}

struct ChoiceNode<T> {
    arms: Vec<Op<T>>,
}

impl<T: 'static> OpNode<T> for ChoiceNode<T> {
    fn compile(self: Box<Self>, nacks: &[Rc<Latch>], leaves: &mut Vec<Leaf<T>>) {
        // Nested choices flatten automatically: each arm is compiled with the same
        // outer nack set, so a `choice` arm that's itself a `choice` just contributes
        // more leaves to the same flat list.
        for arm in self.arms {
            arm.0.compile(nacks, leaves);
        }
    }
}

struct GuardNode<T, F> {
    builder: F,
    _t: std::marker::PhantomData<T>,
}

impl<T: 'static, F> OpNode<T> for GuardNode<T, F>
where
    F: FnOnce() -> Op<T> + 'static,
{
    fn compile(self: Box<Self>, nacks: &[Rc<Latch>], leaves: &mut Vec<Leaf<T>>) {
        (self.builder)().0.compile(nacks, leaves)
    }
}

struct WithNackNode<T, F> {
    builder: F,
    _t: std::marker::PhantomData<T>,
}

impl<T: 'static, F> OpNode<T> for WithNackNode<T, F>
where
    F: FnOnce(Op<()>) -> Op<T> + 'static,
{
    fn compile(self: Box<Self>, nacks: &[Rc<Latch>], leaves: &mut Vec<Leaf<T>>) {
        let latch = Latch::new();
        let nack_op = crate::sync::latch::wait_op(latch.clone());
        let inner = (self.builder)(nack_op);

        let mut child_nacks = nacks.to_vec();
        child_nacks.push(latch);
        inner.0.compile(&child_nacks, leaves);
    }
}

struct AbortNode<T> {
    inner: Op<T>,
    hook: Rc<dyn Fn()>,
}

impl<T: 'static> OpNode<T> for AbortNode<T> {
    fn compile(self: Box<Self>, nacks: &[Rc<Latch>], leaves: &mut Vec<Leaf<T>>) {
        let hook = self.hook;
        let latch = Latch::with_abort_hook(Box::new(move || hook()));

        let mut child_nacks = nacks.to_vec();
        child_nacks.push(latch);
        self.inner.0.compile(&child_nacks, leaves);
    }
}

struct WrapNode<U, T, F> {
    inner: Op<U>,
    f: Rc<F>,
}

impl<U: 'static, T: 'static, F> OpNode<T> for WrapNode<U, T, F>
where
    F: Fn(U) -> T + 'static,
{
    fn compile(self: Box<Self>, nacks: &[Rc<Latch>], leaves: &mut Vec<Leaf<T>>) {
        let mut inner_leaves = Vec::new();
        self.inner.0.compile(nacks, &mut inner_leaves);

        for leaf in inner_leaves {
            let Leaf {
                mut try_fn,
                block_fn,
                nacks,
            } = leaf;
            let f_try = self.f.clone();
            let f_block = self.f.clone();

            leaves.push(Leaf {
                try_fn: Box::new(move || try_fn().map(|v| f_try(v))),
                block_fn: Box::new(move |sink: Rc<dyn Sink<T>>, idx: usize| {
                    let adapted: Rc<dyn Sink<U>> = Rc::new(MappedSink {
                        inner: sink,
                        f: f_block,
                    });
                    block_fn(adapted, idx);
                }),
                nacks,
            });
        }
    }
}

struct MappedSink<T, U, F> {
    inner: Rc<dyn Sink<T>>,
    f: Rc<F>,
}

impl<T, U, F> Sink<U> for MappedSink<T, U, F>
where
    F: Fn(U) -> T,
{
    fn complete(&self, leaf: usize, value: U) {
        self.inner.complete(leaf, (self.f)(value))
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn add_cleanup(&self, leaf: usize, cleanup: Box<dyn FnOnce()>) {
        self.inner.add_cleanup(leaf, cleanup)
    }
}

pub(crate) fn choice_node<T: 'static>(arms: Vec<Op<T>>) -> Op<T> {
    Op(Box::new(ChoiceNode { arms }))
}

pub(crate) fn guard_node<T: 'static, F>(builder: F) -> Op<T>
where
    F: FnOnce() -> Op<T> + 'static,
{
    Op(Box::new(GuardNode {
        builder,
        _t: std::marker::PhantomData,
    }))
}

pub(crate) fn with_nack_node<T: 'static, F>(builder: F) -> Op<T>
where
    F: FnOnce(Op<()>) -> Op<T> + 'static,
{
    Op(Box::new(WithNackNode {
        builder,
        _t: std::marker::PhantomData,
    }))
}

/// A compiled leaf: a single-shot probe plus a one-time blocking arrangement, with the
/// full stack of nack conditions (innermost last) that must fire if this leaf loses.
pub(crate) struct Leaf<T> {
    pub(crate) try_fn: Box<dyn FnMut() -> Option<T>>,
    pub(crate) block_fn: Box<dyn FnOnce(Rc<dyn Sink<T>>, usize)>,
    pub(crate) nacks: Vec<Rc<Latch>>,
}
