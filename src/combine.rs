//! Combinators over collections of promises, and the spread family.
//!
//! Every combinator registers plain settlement observers on its inputs and
//! keeps a shared tally behind a lock; races between inputs are decided
//! under that lock, and the result promise's own one-shot commit makes any
//! late attempt a silent loser.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::adapter::{Async, Outcome};
use crate::deferred::Deferred;
use crate::error::{AllRejected, JoinMismatch};
use crate::promise::{Promise, Settlement, StateSnapshot};
use crate::reason;

struct Tally<T> {
    slots: Vec<Option<T>>,
    fulfilled: usize,
    rejected: usize,
}

impl<T> Tally<T> {
    fn new(count: usize) -> Arc<Mutex<Tally<T>>> {
        let mut slots = Vec::with_capacity(count);
        slots.resize_with(count, || None);
        Arc::new(Mutex::new(Tally {
            slots,
            fulfilled: 0,
            rejected: 0,
        }))
    }
}

/// Fulfills with every input's value, in input order, once all inputs
/// fulfill; rejects with the first rejection's reason. `all(vec![])`
/// fulfills immediately with an empty vector.
pub fn all<V>(promises: Vec<Promise<V>>) -> Promise<Vec<Option<V>>>
where
    V: Clone + Send + 'static,
{
    if promises.is_empty() {
        return Promise::resolved(Vec::new());
    }
    let count = promises.len();
    let (deferred, out) = Deferred::new();
    let tally = Tally::<Option<V>>::new(count);
    for (index, promise) in promises.iter().enumerate() {
        let tally = Arc::clone(&tally);
        let deferred = deferred.clone();
        promise.watch(move |settlement| {
            let mut tally = tally.lock();
            match settlement {
                Settlement::Fulfilled(value) => {
                    tally.slots[index] = Some(value);
                    tally.fulfilled += 1;
                    if tally.fulfilled == count {
                        let values = tally
                            .slots
                            .drain(..)
                            .map(|slot| slot.unwrap_or(None))
                            .collect();
                        deferred.resolve(values);
                    }
                }
                Settlement::Rejected(cause) => {
                    tally.rejected += 1;
                    if tally.rejected == 1 {
                        deferred.reject(cause);
                    }
                }
            }
        });
    }
    out
}

/// Fulfills with the first fulfillment among the inputs; rejects with
/// [`AllRejected`] only once every input has rejected. `any(vec![])`
/// fulfills immediately with the absent value.
pub fn any<V>(promises: Vec<Promise<V>>) -> Promise<V>
where
    V: Clone + Send + 'static,
{
    if promises.is_empty() {
        return Promise::resolved_empty();
    }
    let count = promises.len();
    let (deferred, out) = Deferred::new();
    let tally = Tally::<()>::new(0);
    for promise in &promises {
        let tally = Arc::clone(&tally);
        let deferred = deferred.clone();
        promise.watch(move |settlement| {
            let mut tally = tally.lock();
            match settlement {
                Settlement::Fulfilled(value) => {
                    tally.fulfilled += 1;
                    if tally.fulfilled == 1 {
                        match value {
                            Some(v) => deferred.resolve(v),
                            None => deferred.resolve_empty(),
                        }
                    }
                }
                Settlement::Rejected(_) => {
                    tally.rejected += 1;
                    if tally.rejected == count {
                        deferred.reject(reason(AllRejected));
                    }
                }
            }
        });
    }
    out
}

/// Settles exactly as the first input to settle does, fulfillment or
/// rejection alike. `race(vec![])` stays pending forever; there is nothing
/// that could ever settle it.
pub fn race<V>(promises: Vec<Promise<V>>) -> Promise<V>
where
    V: Clone + Send + 'static,
{
    let (deferred, out) = Deferred::new();
    let won = Arc::new(Mutex::new(false));
    for promise in &promises {
        let won = Arc::clone(&won);
        let deferred = deferred.clone();
        promise.watch(move |settlement| {
            let mut won = won.lock();
            if *won {
                return;
            }
            *won = true;
            match settlement {
                Settlement::Fulfilled(Some(value)) => deferred.resolve(value),
                Settlement::Fulfilled(None) => deferred.resolve_empty(),
                Settlement::Rejected(cause) => deferred.reject(cause),
            }
        });
    }
    out
}

/// Waits for every input to settle either way and fulfills with their
/// snapshots, in input order. Never rejects.
pub fn all_settled<V>(promises: Vec<Promise<V>>) -> Promise<Vec<StateSnapshot<V>>>
where
    V: Clone + Send + 'static,
{
    if promises.is_empty() {
        return Promise::resolved(Vec::new());
    }
    let count = promises.len();
    let (deferred, out) = Deferred::new();
    let tally = Tally::<StateSnapshot<V>>::new(count);
    for (index, promise) in promises.iter().enumerate() {
        let tally = Arc::clone(&tally);
        let deferred = deferred.clone();
        promise.watch(move |settlement| {
            let mut tally = tally.lock();
            tally.slots[index] = Some(settlement.to_snapshot());
            tally.fulfilled += 1;
            if tally.fulfilled == count {
                let snapshots = tally
                    .slots
                    .drain(..)
                    .map(|slot| slot.unwrap_or_else(StateSnapshot::pending))
                    .collect();
                deferred.resolve(snapshots);
            }
        });
    }
    out
}

/// Fulfills with the common value once both inputs fulfill equal values
/// (two absent values are equal); rejects with [`JoinMismatch`] on unequal
/// values, and with the first rejection otherwise.
pub fn join<V>(a: &Promise<V>, b: &Promise<V>) -> Promise<V>
where
    V: Clone + Send + PartialEq + 'static,
{
    all(vec![a.clone(), b.clone()]).then(|values| {
        let mut values = values.unwrap_or_default();
        let second = values.pop().unwrap_or(None);
        let first = values.pop().unwrap_or(None);
        match (first, second) {
            (None, None) => Ok(Async::Value(None)),
            (Some(x), Some(y)) if x == y => Ok(Async::Value(Some(x))),
            _ => Err(reason(JoinMismatch)),
        }
    })
}

/// Method form of [`timeout`](Promise::timeout) for free-function call sites.
pub fn timeout<V>(promise: &Promise<V>, after: Duration) -> Promise<V>
where
    V: Clone + Send + 'static,
{
    promise.timeout(after)
}

/// Method form of [`delay`](Promise::delay) for free-function call sites.
pub fn delay<V>(promise: &Promise<V>, by: Duration) -> Promise<V>
where
    V: Clone + Send + 'static,
{
    promise.delay(by)
}

/// Destructure a fulfilled list across a fixed-arity callback instead of
/// handing it over as one vector. Missing positions arrive as `None`;
/// surplus elements are ignored. A rejection bypasses the callback as with
/// [`then`](Promise::then).
impl<E> Promise<Vec<E>>
where
    E: Clone + Send + 'static,
{
    pub fn spread1<NV, F>(&self, on_fulfilled: F) -> Promise<NV>
    where
        NV: Clone + Send + 'static,
        F: FnOnce(Option<E>) -> Outcome<NV> + Send + 'static,
    {
        self.then(move |list| {
            let mut items = list.unwrap_or_default().into_iter();
            on_fulfilled(items.next())
        })
    }

    pub fn spread2<NV, F>(&self, on_fulfilled: F) -> Promise<NV>
    where
        NV: Clone + Send + 'static,
        F: FnOnce(Option<E>, Option<E>) -> Outcome<NV> + Send + 'static,
    {
        self.then(move |list| {
            let mut items = list.unwrap_or_default().into_iter();
            on_fulfilled(items.next(), items.next())
        })
    }

    pub fn spread3<NV, F>(&self, on_fulfilled: F) -> Promise<NV>
    where
        NV: Clone + Send + 'static,
        F: FnOnce(Option<E>, Option<E>, Option<E>) -> Outcome<NV> + Send + 'static,
    {
        self.then(move |list| {
            let mut items = list.unwrap_or_default().into_iter();
            on_fulfilled(items.next(), items.next(), items.next())
        })
    }

    pub fn spread4<NV, F>(&self, on_fulfilled: F) -> Promise<NV>
    where
        NV: Clone + Send + 'static,
        F: FnOnce(Option<E>, Option<E>, Option<E>, Option<E>) -> Outcome<NV> + Send + 'static,
    {
        self.then(move |list| {
            let mut items = list.unwrap_or_default().into_iter();
            on_fulfilled(items.next(), items.next(), items.next(), items.next())
        })
    }

    pub fn spread5<NV, F>(&self, on_fulfilled: F) -> Promise<NV>
    where
        NV: Clone + Send + 'static,
        F: FnOnce(Option<E>, Option<E>, Option<E>, Option<E>, Option<E>) -> Outcome<NV>
            + Send
            + 'static,
    {
        self.then(move |list| {
            let mut items = list.unwrap_or_default().into_iter();
            on_fulfilled(
                items.next(),
                items.next(),
                items.next(),
                items.next(),
                items.next(),
            )
        })
    }
}
