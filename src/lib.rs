//! Promise/A+ deferred values.
//!
//! A [`Promise`] settles exactly once, either fulfilled with a value or
//! rejected with a reason. Chaining with [`Promise::then`] yields a fresh
//! promise driven by whatever the callback returns, adopting nested promises
//! and foreign [`Thenable`]s along the way.
//!
//! Callbacks never run inside `then`, `resolve` or `reject`. They are handed
//! to a [`Schedule`] host and run on a later turn.
//!
//! # Examples
//!
//! ```
//! use promise_aplus::{EventLoop, Promise, Resolution};
//!
//! let event_loop = EventLoop::new();
//! let promise = Promise::<i32>::new(event_loop.handle(), |resolve, _reject| {
//!     resolve.resolve(20);
//!     Ok(())
//! });
//! let doubled = promise.and_then(|v| Ok(Resolution::Value(v * 2)));
//! assert!(doubled.is_pending());
//!
//! event_loop.run_until_idle();
//! assert_eq!(doubled.value(), Some(40));
//! ```
pub mod combinators;
pub mod promise;
pub mod resolution;
pub mod scheduler;
pub mod settled;

pub use combinators::all;
pub use promise::{Deferred, Promise, PromiseState, Reject, Resolve};
pub use resolution::{resolve_promise, Probe, Resolution, ThenReject, ThenResolve, Thenable};
pub use scheduler::{Config, EventLoop, Host, Schedule, Task};
pub use settled::Settled;

/// Failures the crate itself reports as rejection reasons.
///
/// Promises with a custom reason type only need `From<Error>`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("chaining cycle detected: a promise cannot be resolved with itself")]
    SelfResolution,
    #[error("callback panicked: {0}")]
    Panicked(String),
    #[error("promise abandoned: every settle capability was dropped while pending")]
    Abandoned,
    #[error("{0}")]
    Message(String),
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::Message(message.to_owned())
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::Message(message)
    }
}
