//! Asynchronous synchronization primitives, all built on [`latch::Latch`] and composed
//! through the operation algebra in [`crate::op`] rather than exposing bespoke
//! blocking methods.
//!
//! Every type here is `Rc`-based and deliberately `!Send + !Sync`: nothing in this
//! crate crosses a thread, so there's no reason to pay for atomics or unsafe `Send`
//! impls the way a multi-threaded runtime's channel would need to.

pub mod channel;
pub mod cond;
pub(crate) mod latch;
pub mod mailbox;
pub mod oneshot;
pub mod waitgroup;
