//! Q-style promises for Rust.
//!
//! A [`Promise`] is a one-shot, cross-thread handle on a value that is not
//! there yet. Chained callbacks never run inline: each link fires as a task
//! on the [`dispatch::Dispatcher`] of the thread that registered it. That
//! keeps ordering deterministic and callers never observe re-entrancy.
//! Besides chaining, the crate has progress notifications, the parallel
//! combinators [`all`], [`any`], [`race`], [`all_settled`] and [`join`],
//! time operators, blocking waits, and adapters for foreign blocking
//! handles.
//!
//! Fulfillment payloads are `Option<V>`; `None` is the absent value, the
//! natural fulfillment of a promise for an effect rather than a datum.
//!
//! # Examples
//!
//! ```
//! use promiseq::{dispatch::{self, EventLoop}, Async, Deferred};
//! use std::thread;
//!
//! let el = EventLoop::spawn("example").unwrap();
//! let _guard = dispatch::register_current(el.dispatcher());
//!
//! let (deferred, promise) = Deferred::<String>::new();
//! let greeting = promise.then(|name| {
//!     Ok(Async::value(format!("hello {}", name.unwrap_or_default())))
//! });
//! thread::spawn(move || deferred.resolve("world".into()));
//! assert_eq!(greeting.wait().unwrap().as_deref(), Some("hello world"));
//! el.shutdown().unwrap();
//! ```

use std::sync::Arc;

pub mod adapter;
pub mod combine;
pub mod deferred;
pub mod dispatch;
pub mod error;
pub mod promise;

pub use adapter::{adapt, Async, Outcome, Waitable};
pub use combine::{all, all_settled, any, join, race};
pub use deferred::{defer, Deferred};
pub use error::{
    AllRejected, HandleError, Interrupted, JoinMismatch, TaskPanicked, TimedOut,
    UnhandledRejection, WaitError,
};
pub use promise::{Promise, State, StateSnapshot};

/// A rejection reason: any error, shared so every observer of a rejected
/// promise sees the same one.
pub type Reason = Arc<dyn std::error::Error + Send + Sync>;

/// Wrap a concrete error as a [`Reason`].
pub fn reason<E>(err: E) -> Reason
where
    E: std::error::Error + Send + Sync + 'static,
{
    Arc::new(err)
}
