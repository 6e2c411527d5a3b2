//! `skein` — first-class synchronous operations (Concurrent ML style) over a
//! single-threaded cooperative scheduler, plus a structured-concurrency layer on top.
//!
//! The three layers, bottom to top:
//! - [`runtime`]: the fiber scheduler and timer wheel.
//! - [`op`]/[`sync`]: the operation algebra (`choice`/`guard`/`with_nack`/`wrap`) and the
//!   synchronisation primitives built on it (channels, mailboxes, wait groups, ...).
//! - [`scope`]: supervision trees — admission gating, fail-fast cancellation, and
//!   recursive join reporting for everything spawned under a [`scope::Scope`].
//!
//! [`run`] is the usual entry point: it starts a scheduler on the calling thread, runs
//! `body` under a fresh root scope, and returns once the whole tree has joined.

pub mod op;
pub mod runtime;
pub mod scope;
pub mod sync;
pub mod time;
pub(crate) mod utils;

use std::future::Future;

pub use scope::{Outcome, Scope, ScopeError, ScopeReport, Status};

/// The application error type every [`scope::Scope`] fault pipeline normalises panics
/// and `Err`s into. A type alias rather than a generic parameter threaded through the
/// whole `Scope` API — see `DESIGN.md` for why.
pub type BoxError = Box<dyn std::error::Error + 'static>;

/// Raised by [`scope::Scope::perform`] when the performing scope is cancelled (or has
/// failed, which cancels it) before the operation commits. Kept as its own type, not a
/// variant of [`ScopeError`], so callers can always tell cancellation-as-control-flow
/// apart from an application fault rather than pattern-matching into one enum that
/// mixes the two.
#[derive(thiserror::Error, Debug, Clone)]
#[error("cancelled: {reason}")]
pub struct Cancelled {
    reason: String,
}

impl Cancelled {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Cancelled {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Starts a scheduler on the calling thread, runs `body` under a fresh root scope, and
/// blocks until the whole tree spawned from it has joined.
///
/// A panic in `body` itself (as opposed to something it spawns) still propagates out
/// of `run`, since nothing has caught it yet at that point.
///
/// # Panics
/// If a scheduler is already running on this thread.
pub fn run<F, Fut>(body: F) -> ScopeReport
where
    F: FnOnce(Scope) -> Fut + 'static,
    Fut: Future<Output = Result<(), BoxError>> + 'static,
{
    runtime::block_on(async move {
        let root = Scope::root();
        let body_scope = root.clone();
        tracing::debug!(scope = root.id(), "root scope starting");
        root.spawn(async move { body(body_scope).await });
        let report = root.join().await;
        if report.status == scope::Status::Ok {
            tracing::debug!(scope = root.id(), "root scope joined ok");
        } else {
            tracing::error!(scope = root.id(), status = ?report.status, "root scope did not join ok");
        }
        report
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Installs a subscriber writing to the test harness's captured output, so the
    /// `tracing::debug!`/`error!` calls in `run` are visible with `--nocapture` instead
    /// of going nowhere. Safe to call from multiple tests: only the first wins.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    #[test]
    fn run_returns_ok_report_on_success() {
        init_tracing();
        let report = run(|_scope| async { Ok(()) });
        assert_eq!(report.status, Status::Ok);
    }

    #[test]
    fn run_reports_a_failing_body() {
        init_tracing();
        let report = run(|_scope| async { Err("boom".into()) });
        assert_eq!(report.status, Status::Failed);
        assert!(report.primary.is_some());
    }

    #[test]
    fn run_reports_children_spawned_under_the_root() {
        let report = run(|scope| async move {
            scope.spawn(async { Ok(()) });
            scope.spawn(async { Err("child failed".into()) });
            Ok(())
        });
        assert_eq!(report.status, Status::Failed);
        assert!(report.primary.is_some());
    }
}
