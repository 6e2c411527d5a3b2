//! Monotonic time, and the `sleep` operation built on the timer wheel.

use std::cmp::Ordering;
use std::time::{Duration, Instant as StdInstant};

use crate::op::Op;
use crate::runtime;

/// A point in monotonic time: seconds since an arbitrary epoch fixed at process start.
///
/// Wraps [`std::time::Instant`] rather than re-deriving a clock — there's no reason to
/// diverge from `std::time` for a value that's only ever compared, added to, and
/// subtracted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Instant(StdInstant);

impl Instant {
    /// The current time.
    pub fn now() -> Self {
        Instant(StdInstant::now())
    }

    /// `self + dt`.
    pub fn add(self, dt: Duration) -> Self {
        Instant(self.0 + dt)
    }

    /// Saturating duration since an earlier instant; zero if `self` is not later than `earlier`.
    pub fn saturating_duration_since(self, earlier: Instant) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }
}

impl PartialOrd for Instant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Instant {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

/// The scheduler's current time.
///
/// Only meaningful from inside a running [`crate::run`].
pub fn now() -> Instant {
    runtime::with(|rt| rt.now())
}

/// An operation that becomes ready once `duration` has elapsed.
///
/// Typical use is racing it in a [`crate::op::choice`] to build a timeout:
/// ```no_run
/// use skein::op::choice;
/// use skein::time::sleep_op;
/// use std::time::Duration;
///
/// # async fn example<T: 'static>(ev: skein::op::Op<T>) {
/// let timed_out = choice(vec![ev.wrap(Some), sleep_op(Duration::from_millis(50)).wrap(|_| None)]);
/// # }
/// ```
pub fn sleep_op(duration: Duration) -> Op<()> {
    runtime::with(|rt| rt.timer_op(duration))
}

/// Suspends the current fiber until `duration` has elapsed.
pub async fn sleep(duration: Duration) {
    crate::op::perform(sleep_op(duration)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::block_on;

    #[test]
    fn add_moves_forward() {
        let t = Instant::now();
        assert!(t.add(Duration::from_secs(1)) > t);
    }

    #[test]
    fn saturates_instead_of_underflowing() {
        let t = Instant::now();
        let earlier = t.add(Duration::from_secs(1));
        assert_eq!(t.saturating_duration_since(earlier), Duration::ZERO);
    }

    mod sleep {
        use super::*;

        #[test]
        fn returns_immediately_with_zero() {
            block_on(async {
                let before = StdInstant::now();
                sleep(Duration::from_millis(0)).await;
                assert!(before.elapsed() <= Duration::from_millis(20));
            });
        }

        #[test]
        fn passes_time() {
            block_on(async {
                let before = StdInstant::now();
                sleep(Duration::from_millis(5)).await;
                assert!(before.elapsed() >= Duration::from_millis(5));
            });
        }
    }
}
