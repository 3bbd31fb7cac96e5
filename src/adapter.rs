//! Adapting callback results and foreign handles into promises.

use std::sync::mpsc;
use std::thread;

use crate::deferred::Deferred;
use crate::error::{HandleError, Interrupted, TaskPanicked};
use crate::promise::Promise;
use crate::{reason, Reason};

/// What a chaining callback returns: either an [`Async`] describing the next
/// value, or an error rejecting the child promise.
pub type Outcome<V> = Result<Async<V>, Reason>;

/// An asynchronous (or immediate) source of a value.
pub enum Async<V> {
    /// An already-known value; `None` is the absent value.
    Value(Option<V>),
    /// A promise to track.
    Promise(Promise<V>),
    /// A foreign blocking handle, adapted on a background thread.
    Handle(Box<dyn Waitable<V>>),
}

impl<V> Async<V> {
    /// An immediate value.
    pub fn value(value: V) -> Async<V> {
        Async::Value(Some(value))
    }

    /// The immediate absent value.
    pub fn empty() -> Async<V> {
        Async::Value(None)
    }

    /// A foreign blocking handle.
    pub fn handle<W>(handle: W) -> Async<V>
    where
        W: Waitable<V> + 'static,
    {
        Async::Handle(Box::new(handle))
    }
}

impl<V> From<Promise<V>> for Async<V> {
    fn from(promise: Promise<V>) -> Async<V> {
        Async::Promise(promise)
    }
}

/// A foreign handle whose result can only be obtained by blocking.
///
/// Implemented out of the box for [`mpsc::Receiver`] and
/// [`thread::JoinHandle`]; implement it to bridge any other blocking source
/// into a promise chain via [`Async::handle`].
pub trait Waitable<V>: Send {
    /// Block until the handle completes, consuming it. `Ok(None)` is the
    /// absent value.
    fn block_on(self: Box<Self>) -> Result<Option<V>, HandleError>;
}

/// Turn any [`Async`] into a promise. Identity for promises, an immediately
/// settled promise for values, and a dedicated blocking thread for foreign
/// handles.
pub fn adapt<V>(handle: Async<V>) -> Promise<V>
where
    V: Clone + Send + 'static,
{
    match handle {
        Async::Value(Some(value)) => Promise::resolved(value),
        Async::Value(None) => Promise::resolved_empty(),
        Async::Promise(promise) => promise,
        Async::Handle(waitable) => {
            let (deferred, promise) = Deferred::new();
            thread::spawn(move || match waitable.block_on() {
                Ok(Some(value)) => deferred.resolve(value),
                Ok(None) => deferred.resolve_empty(),
                Err(HandleError::Interrupted) => deferred.reject(reason(Interrupted)),
                Err(HandleError::Failed(cause)) => deferred.reject(cause),
            });
            promise
        }
    }
}

impl<T> Waitable<T> for mpsc::Receiver<T>
where
    T: Send + 'static,
{
    fn block_on(self: Box<Self>) -> Result<Option<T>, HandleError> {
        // A dropped sender means nobody will ever complete the handle.
        self.recv().map(Some).map_err(|_| HandleError::Interrupted)
    }
}

impl<T> Waitable<T> for thread::JoinHandle<T>
where
    T: Send + 'static,
{
    fn block_on(self: Box<Self>) -> Result<Option<T>, HandleError> {
        match self.join() {
            Ok(value) => Ok(Some(value)),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&'static str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_owned());
                Err(HandleError::Failed(reason(TaskPanicked(message))))
            }
        }
    }
}
