//! The combinator vocabulary built on top of [`Op::new_primitive`]/[`Op::wrap`]/
//! [`Op::on_abort`]: `choice`, `guard`, `with_nack`, and the syntactic-sugar-over-choice
//! forms (`or_else`, `bracket`, `finally`, `race`, `first_ready`, `named_choice`,
//! `boolean_choice`).

use std::cell::RefCell;
use std::rc::Rc;

use crate::op::perform::{fire_losing_nacks, fire_nacks};
use crate::op::{choice_node, guard_node, with_nack_node, Op};

/// An operation that is always immediately ready with `value`.
pub fn always<T: 'static>(value: T) -> Op<T> {
    let value = Rc::new(RefCell::new(Some(value)));
    Op::new_primitive(
        move || value.borrow_mut().take(),
        |_sink, _leaf| {
            // No external event to arrange: the fast path above always commits, so
            // `block_fn` is unreachable for this leaf in practice, but `choice` can
            // still end up suspending on account of other arms, so this has to exist.
        },
    )
}

/// An operation that is never ready. Useful as a `choice` arm placeholder, or alone
/// to park a fiber forever (e.g. the idle slot of a worker loop).
pub fn never<T: 'static>() -> Op<T> {
    Op::new_primitive(|| None, |_sink, _leaf| {})
}

/// Defers building the operation until `perform` actually evaluates this arm, so its
/// construction can read fresh state — the equivalent of re-reading `Instant::now()`
/// inside a retry loop rather than once before the loop starts.
pub fn guard<T: 'static, F>(builder: F) -> Op<T>
where
    F: FnOnce() -> Op<T> + 'static,
{
    guard_node(builder)
}

/// Composes operations into one: the first arm whose leaves commit wins, and every
/// other arm's nack conditions fire. Flattens nested choices automatically.
pub fn choice<T: 'static>(arms: Vec<Op<T>>) -> Op<T> {
    choice_node(arms)
}

/// Builds an operation from a closure that receives its own nack condition — an
/// `Op<()>` that becomes ready precisely when this arm loses an enclosing `choice` (or
/// is never selected because some other arm of the *same* `perform` call committed
/// first). The closure runs once, at compile time, before any leaf is tried.
pub fn with_nack<T: 'static, F>(builder: F) -> Op<T>
where
    F: FnOnce(Op<()>) -> Op<T> + 'static,
{
    with_nack_node(builder)
}

/// Tries `op`'s own leaves first, biased: if any is immediately ready, commits to it
/// (firing every other leaf's nacks, except those shared with the winner's own nack
/// path) exactly as `perform`'s fast path would. If none is ready, fires every leaf's
/// nacks (there is no winner) and falls back to `default()` without ever blocking on
/// `op`.
///
/// This is deliberately not `choice(vec![op, always(default())])` — that would let the
/// random rotation pick the fallback over a ready `op` leaf half the time, whereas
/// `or_else` always prefers `op` when it can commit.
pub fn or_else<T: 'static, F>(op: Op<T>, default: F) -> Op<T>
where
    F: FnOnce() -> T + 'static,
{
    guard(move || {
        let mut leaves = Vec::new();
        op.compile(&[], &mut leaves);

        for idx in 0..leaves.len() {
            if let Some(value) = (leaves[idx].try_fn)() {
                let winner_nacks = leaves[idx].nacks.clone();
                for (j, leaf) in leaves.iter().enumerate() {
                    if j != idx {
                        fire_losing_nacks(&winner_nacks, &leaf.nacks);
                    }
                }
                return always(value);
            }
        }

        for leaf in &leaves {
            fire_nacks(&leaf.nacks);
        }
        always(default())
    })
}

/// Acquires a resource, runs `use_fn` with it, and releases it exactly once — on
/// normal return, on an early return out of `use_fn`'s future (a cancellation unwind),
/// or on panic. `acquire` and `use_fn`'s own internals may each suspend on their own
/// operations via [`crate::op::perform`]; bracket only guarantees the release, not
/// that it runs without ever yielding.
///
/// Sequencing an acquire against a use against a release isn't something a single
/// [`Op`] can express — each step is its own commit — so this is a plain async
/// function built on two separate `perform` points, with an RAII guard standing in for
/// `defer`/`finally` in a language with unwinding.
pub async fn bracket<R, T, U, Fut, F>(acquire: Op<R>, use_fn: U, release: F) -> T
where
    R: 'static,
    U: FnOnce(&R) -> Fut,
    Fut: std::future::Future<Output = T>,
    F: FnOnce(R),
{
    struct Guard<R, F: FnOnce(R)> {
        resource: Option<R>,
        release: Option<F>,
    }
    impl<R, F: FnOnce(R)> Drop for Guard<R, F> {
        fn drop(&mut self) {
            if let (Some(resource), Some(release)) = (self.resource.take(), self.release.take()) {
                release(resource);
            }
        }
    }

    let resource = crate::op::perform(acquire).await;
    let guard = Guard {
        resource: Some(resource),
        release: Some(release),
    };
    use_fn(guard.resource.as_ref().expect("bracket resource")).await
}

/// Runs `hook` unconditionally once `body` finishes — on normal return, early return,
/// or panic — the async analogue of [`Op::on_abort`] for a whole future rather than a
/// single losing leaf.
pub async fn finally<T, Fut, F>(body: Fut, hook: F) -> T
where
    Fut: std::future::Future<Output = T>,
    F: FnOnce(),
{
    struct Guard<F: FnOnce()> {
        hook: Option<F>,
    }
    impl<F: FnOnce()> Drop for Guard<F> {
        fn drop(&mut self) {
            if let Some(hook) = self.hook.take() {
                hook();
            }
        }
    }

    let _guard = Guard { hook: Some(hook) };
    body.await
}

/// The first of two operations to become ready, discarding the other's value.
pub fn race<T: 'static>(a: Op<T>, b: Op<T>) -> Op<T> {
    choice(vec![a, b])
}

/// Like [`choice`] but tags the winning value with which arm (by index) committed.
pub fn first_ready<T: 'static>(arms: Vec<Op<T>>) -> Op<(usize, T)> {
    let tagged = arms
        .into_iter()
        .enumerate()
        .map(|(idx, op)| op.wrap(move |value| (idx, value)))
        .collect();
    choice(tagged)
}

/// Like [`first_ready`] but tags with a caller-supplied name instead of a position.
pub fn named_choice<T: 'static>(arms: Vec<(&'static str, Op<T>)>) -> Op<(&'static str, T)> {
    let tagged = arms
        .into_iter()
        .map(|(name, op)| op.wrap(move |value| (name, value)))
        .collect();
    choice(tagged)
}

/// `choice` specialised to two boolean-tagged arms — `true` if `on_true` won.
pub fn boolean_choice(on_true: Op<()>, on_false: Op<()>) -> Op<bool> {
    choice(vec![on_true.wrap(|_| true), on_false.wrap(|_| false)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::perform;
    use crate::runtime::block_on;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn or_else_prefers_a_ready_op_over_the_fallback() {
        block_on(async {
            let value = perform(or_else(always(1), || 2)).await;
            assert_eq!(value, 1);
        });
    }

    #[test]
    fn or_else_falls_back_when_op_would_block() {
        block_on(async {
            let value: u32 = perform(or_else(never(), || 2)).await;
            assert_eq!(value, 2);
        });
    }

    #[test]
    fn bracket_releases_on_normal_completion() {
        block_on(async {
            let released = Rc::new(Cell::new(false));
            let r = released.clone();
            let result = bracket(
                always(7),
                |value| {
                    let value = *value;
                    async move { value * 2 }
                },
                move |_| r.set(true),
            )
            .await;
            assert_eq!(result, 14);
            assert!(released.get());
        });
    }

    #[test]
    fn bracket_releases_even_if_use_fn_panics() {
        let released = Rc::new(Cell::new(false));
        let r = released.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            block_on(async {
                bracket::<(), (), _, _, _>(
                    always(()),
                    |_| async { panic!("boom") },
                    move |_| r.set(true),
                )
                .await
            })
        }));
        assert!(result.is_err());
        assert!(released.get());
    }

    #[test]
    fn finally_runs_hook_after_body() {
        block_on(async {
            let order = Rc::new(RefCell::new(Vec::new()));
            let o = order.clone();
            let value = finally(
                async {
                    o.borrow_mut().push("body");
                    1
                },
                {
                    let order = order.clone();
                    move || order.borrow_mut().push("hook")
                },
            )
            .await;
            assert_eq!(value, 1);
            assert_eq!(*order.borrow(), vec!["body", "hook"]);
        });
    }

    #[test]
    fn race_returns_the_first_ready_value() {
        block_on(async {
            let value = perform(race(always(1), never())).await;
            assert_eq!(value, 1);
        });
    }

    #[test]
    fn first_ready_tags_the_winning_index() {
        block_on(async {
            let (idx, value) = perform(first_ready(vec![never(), always(9)])).await;
            assert_eq!((idx, value), (1, 9));
        });
    }

    #[test]
    fn named_choice_tags_the_winning_name() {
        block_on(async {
            let (name, value) = perform(named_choice(vec![("a", never()), ("b", always(9))])).await;
            assert_eq!((name, value), ("b", 9));
        });
    }

    #[test]
    fn boolean_choice_reports_which_side_won() {
        block_on(async {
            assert!(perform(boolean_choice(always(()), never())).await);
            assert!(!perform(boolean_choice(never(), always(()))).await);
        });
    }

    #[test]
    fn with_nack_fires_when_its_arm_loses() {
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        block_on(async move {
            let op = choice(vec![
                always(1),
                with_nack(move |nack| {
                    let f = f.clone();
                    crate::runtime::spawn(async move {
                        perform(nack).await;
                        f.set(true);
                    });
                    never()
                }),
            ]);
            let value = perform(op).await;
            assert_eq!(value, 1);
        });
        assert!(fired.get());
    }
}
