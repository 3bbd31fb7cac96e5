//! The producing side of a promise.

use std::thread;

use crate::adapter::{adapt, Async};
use crate::promise::{Promise, Settlement};
use crate::Reason;

/// The write capability paired 1:1 with a pending [`Promise`].
///
/// Hand the promise to consumers and keep the deferred; all commits are
/// one-shot, a second resolve or reject is a warned no-op.
///
/// # Examples
///
/// ```
/// use promiseq::Deferred;
///
/// let (deferred, promise) = Deferred::new();
/// deferred.resolve(5);
/// assert_eq!(promise.wait().unwrap(), Some(5));
/// ```
pub struct Deferred<V> {
    promise: Promise<V>,
}

impl<V> Clone for Deferred<V> {
    fn clone(&self) -> Self {
        Deferred {
            promise: self.promise.clone(),
        }
    }
}

impl<V> Deferred<V>
where
    V: Clone + Send + 'static,
{
    /// Create a pending promise together with its deferred.
    pub fn new() -> (Deferred<V>, Promise<V>) {
        let promise = Promise::pending();
        (
            Deferred {
                promise: promise.clone(),
            },
            promise,
        )
    }

    /// Another handle on the promise this deferred settles.
    pub fn promise(&self) -> Promise<V> {
        self.promise.clone()
    }

    /// Fulfill with `value`.
    pub fn resolve(&self, value: V) {
        self.promise.commit(Settlement::Fulfilled(Some(value)));
    }

    /// Fulfill with the absent value.
    pub fn resolve_empty(&self) {
        self.promise.commit(Settlement::Fulfilled(None));
    }

    /// Settle from an [`Async`] handle: the promise tracks whatever the
    /// handle eventually produces, including its progress when the handle
    /// is itself a promise.
    pub fn resolve_async(&self, handle: Async<V>) {
        adapt(handle).pipe_into(self.promise.clone());
    }

    /// Reject with `cause`.
    pub fn reject(&self, cause: Reason) {
        self.promise.commit(Settlement::Rejected(cause));
    }

    /// Emit a progress notification; only meaningful while pending.
    pub fn notify(&self, progress: f32) {
        self.promise.commit_notify(progress);
    }
}

/// Run `task` on a fresh background thread and return the promise for its
/// result. `Ok(None)` fulfills with the absent value.
pub fn defer<V, F>(task: F) -> Promise<V>
where
    V: Clone + Send + 'static,
    F: FnOnce() -> Result<Option<V>, Reason> + Send + 'static,
{
    let (deferred, promise) = Deferred::new();
    thread::spawn(move || match task() {
        Ok(Some(value)) => deferred.resolve(value),
        Ok(None) => deferred.resolve_empty(),
        Err(cause) => deferred.reject(cause),
    });
    promise
}
