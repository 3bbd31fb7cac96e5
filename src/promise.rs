//! The promise state machine and its link engine.
//!
//! A [`Promise`] starts `Pending` and transitions exactly once to
//! `Fulfilled` or `Rejected`; the transition is decided under a single
//! per-promise lock, so concurrent committers race for one winner and the
//! losers are warned no-ops. Registering a continuation fabricates a new
//! child promise immediately and records a link carrying the callbacks, the
//! dispatcher current on the registering thread, and the child. Settling the
//! promise drains the links, firing each continuation as a task on its own
//! captured dispatcher. A continuation never runs inline in the committing
//! call, nor in the registering call even when the promise is already
//! settled.

use std::future::Future;
use std::mem;
use std::panic;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::adapter::{adapt, Async, Outcome};
use crate::deferred::Deferred;
use crate::dispatch::{self, Dispatcher, Task};
use crate::error::{TimedOut, UnhandledRejection, WaitError};
use crate::{reason, Reason};

/// How long a settled, unobserved promise may sit before the monitor warns.
const UNOBSERVED_WARN_DELAY: Duration = Duration::from_secs(10);

/// State of a promise. Every promise starts `Pending` and moves to one of
/// the terminal states at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not settled yet; the producing task is still ongoing.
    Pending,
    /// Settled with a value (possibly the absent value).
    Fulfilled,
    /// Settled with a rejection reason.
    Rejected,
}

/// The terminal outcome of a promise.
#[derive(Clone)]
pub(crate) enum Settlement<V> {
    Fulfilled(Option<V>),
    Rejected(Reason),
}

impl<V: Clone> Settlement<V> {
    pub(crate) fn to_snapshot(&self) -> StateSnapshot<V> {
        match self {
            Settlement::Fulfilled(value) => StateSnapshot {
                state: State::Fulfilled,
                value: value.clone(),
                reason: None,
            },
            Settlement::Rejected(cause) => StateSnapshot {
                state: State::Rejected,
                value: None,
                reason: Some(cause.clone()),
            },
        }
    }
}

/// A point-in-time view of a promise, as returned by [`Promise::inspect`]
/// and collected by [`all_settled`](crate::combine::all_settled).
#[derive(Debug, Clone)]
pub struct StateSnapshot<V> {
    /// State at the time of the snapshot.
    pub state: State,
    /// The fulfillment value; meaningful only when `state` is `Fulfilled`,
    /// and `None` there means the absent value.
    pub value: Option<V>,
    /// The rejection reason; present iff `state` is `Rejected`.
    pub reason: Option<Reason>,
}

impl<V> StateSnapshot<V> {
    pub(crate) fn pending() -> Self {
        StateSnapshot {
            state: State::Pending,
            value: None,
            reason: None,
        }
    }
}

pub(crate) type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

type SettledFn<V> = Box<dyn FnOnce(Settlement<V>) + Send>;
type FulfilledFn<V, NV> = Box<dyn FnOnce(Option<V>) -> Outcome<NV> + Send>;
type RejectedFn<NV> = Box<dyn FnOnce(Reason) -> Outcome<NV> + Send>;

/// A registered continuation: the settle handler (which owns the callbacks
/// and the child promise), the progress callback, and the dispatcher
/// captured on the registering thread.
struct Link<V> {
    on_settled: SettledFn<V>,
    on_progress: Option<ProgressFn>,
    has_rejected: bool,
    dispatcher: Dispatcher,
}

impl<V: Send + 'static> Link<V> {
    fn fire(self, settlement: Settlement<V>) {
        let on_settled = self.on_settled;
        let task: Task = Box::new(move || on_settled(settlement));
        self.dispatcher.dispatch(task);
    }
}

struct Cell<V> {
    settled: Option<Settlement<V>>,
    progress: Option<f32>,
    links: Vec<Link<V>>,
    wakers: Vec<Waker>,
    observed: bool,
}

struct Inner<V> {
    cell: Mutex<Cell<V>>,
    cond: Condvar,
    terminating: bool,
}

/// A single-assignment asynchronous result handle.
///
/// Cheaply cloneable; all clones observe the same underlying state. The
/// producing side is a [`Deferred`], paired 1:1 at construction.
///
/// # Examples
///
/// ```
/// use promiseq::Promise;
///
/// let p = Promise::resolved(7);
/// assert!(p.is_fulfilled());
/// assert_eq!(p.wait().unwrap(), Some(7));
/// ```
pub struct Promise<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for Promise<V> {
    fn clone(&self) -> Self {
        Promise {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Promise<V>
where
    V: Clone + Send + 'static,
{
    pub(crate) fn with_terminating(terminating: bool) -> Promise<V> {
        Promise {
            inner: Arc::new(Inner {
                cell: Mutex::new(Cell {
                    settled: None,
                    progress: None,
                    links: Vec::new(),
                    wakers: Vec::new(),
                    observed: false,
                }),
                cond: Condvar::new(),
                terminating,
            }),
        }
    }

    pub(crate) fn pending() -> Promise<V> {
        Promise::with_terminating(false)
    }

    /// A promise already fulfilled with `value`.
    pub fn resolved(value: V) -> Promise<V> {
        let promise = Promise::pending();
        promise.commit(Settlement::Fulfilled(Some(value)));
        promise
    }

    /// A promise already fulfilled with the absent value. Useful for
    /// starting a chain whose callbacks decide what to produce.
    pub fn resolved_empty() -> Promise<V> {
        let promise = Promise::pending();
        promise.commit(Settlement::Fulfilled(None));
        promise
    }

    /// A promise already rejected with `cause`.
    pub fn rejected(cause: Reason) -> Promise<V> {
        let promise = Promise::pending();
        promise.commit(Settlement::Rejected(cause));
        promise
    }

    /// Adapt any [`Async`] handle into a promise; see
    /// [`adapt`](crate::adapter::adapt).
    pub fn from_async(handle: Async<V>) -> Promise<V> {
        adapt(handle)
    }

    /// Current state and payload.
    pub fn inspect(&self) -> StateSnapshot<V> {
        let cell = self.inner.cell.lock();
        match &cell.settled {
            None => StateSnapshot::pending(),
            Some(settlement) => settlement.to_snapshot(),
        }
    }

    /// True while no terminal commit has happened.
    pub fn is_pending(&self) -> bool {
        self.inner.cell.lock().settled.is_none()
    }

    /// True once fulfilled.
    pub fn is_fulfilled(&self) -> bool {
        matches!(
            self.inner.cell.lock().settled,
            Some(Settlement::Fulfilled(_))
        )
    }

    /// True once rejected.
    pub fn is_rejected(&self) -> bool {
        matches!(
            self.inner.cell.lock().settled,
            Some(Settlement::Rejected(_))
        )
    }

    /// True once settled either way.
    pub fn is_done(&self) -> bool {
        !self.is_pending()
    }

    /// Completion can never be aborted; this always returns `false`.
    pub fn cancel(&self) -> bool {
        false
    }

    /// Cancellation does not exist; this always returns `false`.
    pub fn is_cancelled(&self) -> bool {
        false
    }

    /// Chain a fulfillment callback, returning the promise for its outcome.
    ///
    /// The callback runs on the dispatcher of the registering thread once
    /// this promise fulfills, receiving the value (`None` is the absent
    /// value). Its [`Outcome`] settles the returned child, whether it is an
    /// immediate value, another promise, a foreign handle, or an error. A
    /// rejection of this promise bypasses the callback and rejects the
    /// child with the same reason.
    ///
    /// # Examples
    ///
    /// ```
    /// use promiseq::{dispatch::{self, EventLoop}, Async, Promise};
    ///
    /// let el = EventLoop::spawn("doc").unwrap();
    /// let _guard = dispatch::register_current(el.dispatcher());
    ///
    /// let doubled = Promise::resolved(21).then(|v| Ok(Async::value(v.unwrap_or(0) * 2)));
    /// assert_eq!(doubled.wait().unwrap(), Some(42));
    /// el.shutdown().unwrap();
    /// ```
    pub fn then<NV, F>(&self, on_fulfilled: F) -> Promise<NV>
    where
        NV: Clone + Send + 'static,
        F: FnOnce(Option<V>) -> Outcome<NV> + Send + 'static,
    {
        self.register_then(Box::new(on_fulfilled), None, None, false)
    }

    /// Like [`then`](Promise::then), with a rejection callback that can
    /// recover (or rethrow) instead of forwarding.
    pub fn then_or<NV, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<NV>
    where
        NV: Clone + Send + 'static,
        F: FnOnce(Option<V>) -> Outcome<NV> + Send + 'static,
        R: FnOnce(Reason) -> Outcome<NV> + Send + 'static,
    {
        self.register_then(Box::new(on_fulfilled), Some(Box::new(on_rejected)), None, false)
    }

    /// Like [`then_or`](Promise::then_or), additionally observing progress
    /// notifications made while this promise is pending.
    pub fn then_progress<NV, F, R, P>(
        &self,
        on_fulfilled: F,
        on_rejected: R,
        on_progress: P,
    ) -> Promise<NV>
    where
        NV: Clone + Send + 'static,
        F: FnOnce(Option<V>) -> Outcome<NV> + Send + 'static,
        R: FnOnce(Reason) -> Outcome<NV> + Send + 'static,
        P: Fn(f32) + Send + Sync + 'static,
    {
        self.register_then(
            Box::new(on_fulfilled),
            Some(Box::new(on_rejected)),
            Some(Arc::new(on_progress)),
            false,
        )
    }

    /// Chain a rejection callback; fulfillment passes through unchanged.
    /// Analogous to a catch clause.
    pub fn fail<R>(&self, on_rejected: R) -> Promise<V>
    where
        R: FnOnce(Reason) -> Outcome<V> + Send + 'static,
    {
        self.register_fail(Some(Box::new(on_rejected)), None, false)
    }

    /// Chain a rejection callback for one concrete reason type; any other
    /// reason forwards untouched.
    pub fn fail_on<E, R>(&self, on_rejected: R) -> Promise<V>
    where
        E: std::error::Error + Send + Sync + 'static,
        R: FnOnce(&E) -> Outcome<V> + Send + 'static,
    {
        self.fail(move |cause| {
            if let Some(err) = cause.downcast_ref::<E>() {
                on_rejected(err)
            } else {
                Err(cause)
            }
        })
    }

    /// Observe progress notifications; both terminal outcomes forward
    /// unchanged to the returned promise.
    pub fn progress<P>(&self, on_progress: P) -> Promise<V>
    where
        P: Fn(f32) + Send + Sync + 'static,
    {
        self.register_fail(None, Some(Arc::new(on_progress)), false)
    }

    /// Observe the fulfillment value without affecting the chain. The
    /// callback's own error is swallowed; a tap only reads and is the one
    /// deliberate exception to propagate-on-error.
    pub fn tap<F>(&self, on_tap: F) -> Promise<V>
    where
        F: FnOnce(Option<V>) -> Result<(), Reason> + Send + 'static,
    {
        self.then(move |value| {
            if let Err(ignored) = on_tap(value.clone()) {
                tracing::debug!("tap callback failed, swallowing: {}", ignored);
            }
            Ok(Async::Value(value))
        })
    }

    /// Sugar: on fulfillment, replace the value with `next_value`.
    pub fn then_resolve<NV>(&self, next_value: Option<NV>) -> Promise<NV>
    where
        NV: Clone + Send + 'static,
    {
        self.then(move |_| Ok(Async::Value(next_value)))
    }

    /// Sugar: on fulfillment, reject with `cause` instead.
    pub fn then_reject<NV>(&self, cause: Reason) -> Promise<NV>
    where
        NV: Clone + Send + 'static,
    {
        self.then(move |_| Err(cause))
    }

    /// Run `on_finally` once this promise settles either way, like a
    /// finally clause. On its success the original outcome passes through
    /// unchanged; on its failure (including a rejected asynchronous
    /// result) the chain is rejected with the finally callback's error,
    /// discarding the original outcome.
    pub fn fin<F>(&self, on_finally: F) -> Promise<V>
    where
        F: FnOnce() -> Outcome<()> + Send + 'static,
    {
        // One callback, two registration slots; exactly one branch runs.
        let callback = Arc::new(Mutex::new(Some(on_finally)));
        let for_reject = Arc::clone(&callback);
        self.then_or(
            move |value| match callback.lock().take() {
                Some(cb) => match cb() {
                    Ok(next) => Ok(Async::Promise(
                        adapt(next).then(move |_| Ok(Async::Value(value))),
                    )),
                    Err(cause) => Err(cause),
                },
                None => Ok(Async::Value(value)),
            },
            move |cause| match for_reject.lock().take() {
                Some(cb) => match cb() {
                    Ok(next) => Ok(Async::Promise(adapt(next).then(move |_| Err(cause)))),
                    Err(fin_cause) => Err(fin_cause),
                },
                None => Err(cause),
            },
        )
    }

    /// Terminate the chain: if this promise rejects with no rejection
    /// handler attached, the rejection is promoted to a fatal
    /// [`UnhandledRejection`] fault on the dispatcher thread instead of
    /// vanishing. Always end abandoned chains with either a `fail` handler
    /// or `done`.
    pub fn done(&self) {
        let _terminated = self.register_fail(None, None, true);
    }

    /// A promise that settles like this one, unless `after` elapses first,
    /// in which case it rejects with [`TimedOut`]. Whichever happens first
    /// wins; the loser is a guarded no-op.
    pub fn timeout(&self, after: Duration) -> Promise<V> {
        let (timer, out) = Deferred::new();
        let on_timer = timer.clone();
        dispatch::current().dispatch_after(
            Box::new(move || {
                if on_timer.promise().is_pending() {
                    on_timer.reject(reason(TimedOut));
                }
            }),
            after,
        );
        self.watch(move |settlement| {
            let target = timer.promise();
            if target.is_pending() {
                target.commit(settlement);
            }
        });
        out
    }

    /// Re-deliver this promise's fulfillment after an extra `by` delay; a
    /// rejection propagates immediately. The timer runs on the dispatcher
    /// of the registering thread.
    pub fn delay(&self, by: Duration) -> Promise<V> {
        let dispatcher = dispatch::current();
        self.then(move |value| {
            let (deferred, delayed) = Deferred::new();
            dispatcher.dispatch_after(
                Box::new(move || match value {
                    Some(v) => deferred.resolve(v),
                    None => deferred.resolve_empty(),
                }),
                by,
            );
            Ok(Async::Promise(delayed))
        })
    }

    /// Method form of [`join`](crate::combine::join).
    pub fn join(&self, other: &Promise<V>) -> Promise<V>
    where
        V: PartialEq,
    {
        crate::combine::join(self, other)
    }

    /// Block until this promise settles, returning the value or the
    /// wrapped rejection reason.
    ///
    /// Warns when called from a thread with a registered dispatcher, since
    /// that risks deadlocking against the thread's own queued
    /// continuations.
    pub fn wait(&self) -> Result<Option<V>, WaitError> {
        warn_blocking();
        let mut cell = self.inner.cell.lock();
        while cell.settled.is_none() {
            self.inner.cond.wait(&mut cell);
        }
        settled_result(&cell)
    }

    /// Like [`wait`](Promise::wait), giving up with
    /// [`WaitError::TimedOut`] once `timeout` has elapsed. Elapsed time is
    /// re-checked on every wakeup, so spurious wakeups are harmless.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<V>, WaitError> {
        warn_blocking();
        let deadline = Instant::now() + timeout;
        let mut cell = self.inner.cell.lock();
        while cell.settled.is_none() {
            if Instant::now() >= deadline {
                return Err(WaitError::TimedOut);
            }
            self.inner.cond.wait_until(&mut cell, deadline);
        }
        settled_result(&cell)
    }

    fn register_then<NV>(
        &self,
        on_fulfilled: FulfilledFn<V, NV>,
        on_rejected: Option<RejectedFn<NV>>,
        on_progress: Option<ProgressFn>,
        terminating: bool,
    ) -> Promise<NV>
    where
        NV: Clone + Send + 'static,
    {
        let child = Promise::with_terminating(terminating);
        let into = child.clone();
        let has_rejected = on_rejected.is_some();
        self.add_raw_link(
            Box::new(move |settlement| match settlement {
                Settlement::Fulfilled(value) => settle_child(on_fulfilled(value), &into),
                Settlement::Rejected(cause) => match on_rejected {
                    Some(cb) => settle_child(cb(cause), &into),
                    None => into.commit(Settlement::Rejected(cause)),
                },
            }),
            has_rejected,
            on_progress,
        );
        child
    }

    fn register_fail(
        &self,
        on_rejected: Option<RejectedFn<V>>,
        on_progress: Option<ProgressFn>,
        terminating: bool,
    ) -> Promise<V> {
        let child = Promise::with_terminating(terminating);
        let into = child.clone();
        let has_rejected = on_rejected.is_some();
        self.add_raw_link(
            Box::new(move |settlement| match settlement {
                Settlement::Fulfilled(value) => into.commit(Settlement::Fulfilled(value)),
                Settlement::Rejected(cause) => match on_rejected {
                    Some(cb) => settle_child(cb(cause), &into),
                    None => into.commit(Settlement::Rejected(cause)),
                },
            }),
            has_rejected,
            on_progress,
        );
        child
    }

    /// Subscribe to the settlement alone; combinator plumbing.
    pub(crate) fn watch<F>(&self, on_settled: F)
    where
        F: FnOnce(Settlement<V>) + Send + 'static,
    {
        self.add_raw_link(Box::new(on_settled), true, None);
    }

    /// Forward this promise's settlement and progress into `target`.
    pub(crate) fn pipe_into(&self, target: Promise<V>) {
        let for_progress = target.clone();
        self.add_raw_link(
            Box::new(move |settlement| target.commit(settlement)),
            true,
            Some(Arc::new(move |p| for_progress.commit_notify(p))),
        );
    }

    fn add_raw_link(
        &self,
        on_settled: SettledFn<V>,
        has_rejected: bool,
        on_progress: Option<ProgressFn>,
    ) {
        let link = Link {
            on_settled,
            on_progress,
            has_rejected,
            dispatcher: dispatch::current(),
        };
        let mut cell = self.inner.cell.lock();
        cell.observed = true;
        let settled = cell.settled.clone();
        match settled {
            None => {
                // A link created after a notification but before settlement
                // still receives the latched progress, asynchronously.
                if let (Some(latched), Some(cb)) = (cell.progress, &link.on_progress) {
                    let cb = Arc::clone(cb);
                    link.dispatcher.dispatch(Box::new(move || cb(latched)));
                }
                cell.links.push(link);
                tracing::trace!("link queued");
            }
            Some(settlement) => {
                drop(cell);
                tracing::trace!("promise already settled, dispatching link");
                link.fire(settlement);
            }
        }
    }

    /// Terminal commit. Callable from any thread; exactly one caller wins,
    /// the rest are warned no-ops.
    pub(crate) fn commit(&self, settlement: Settlement<V>) {
        let mut cell = self.inner.cell.lock();
        if cell.settled.is_some() {
            drop(cell);
            tracing::warn!("committing a non-pending promise is a no-op, ignoring");
            return;
        }
        cell.settled = Some(settlement.clone());
        let links = mem::take(&mut cell.links);
        let wakers = mem::take(&mut cell.wakers);
        drop(cell);
        self.inner.cond.notify_all();
        for waker in wakers {
            waker.wake();
        }
        match &settlement {
            Settlement::Fulfilled(_) => tracing::info!("promise fulfilled"),
            Settlement::Rejected(cause) => {
                tracing::info!("promise rejected: {}", cause);
                if self.inner.terminating && !links.iter().any(|link| link.has_rejected) {
                    panic::panic_any(UnhandledRejection(cause.clone()));
                }
            }
        }
        if links.is_empty() {
            self.monitor_unobserved_later();
        }
        for link in links {
            link.fire(settlement.clone());
        }
    }

    /// Progress notification; valid only while pending. Latches the value
    /// and dispatches every queued link's progress callback.
    pub(crate) fn commit_notify(&self, progress: f32) {
        let mut cell = self.inner.cell.lock();
        if cell.settled.is_some() {
            drop(cell);
            tracing::warn!("progress on a non-pending promise is a no-op, ignoring");
            return;
        }
        cell.progress = Some(progress);
        let callbacks: Vec<(Dispatcher, ProgressFn)> = cell
            .links
            .iter()
            .filter_map(|link| {
                link.on_progress
                    .as_ref()
                    .map(|cb| (link.dispatcher.clone(), Arc::clone(cb)))
            })
            .collect();
        drop(cell);
        for (dispatcher, cb) in callbacks {
            dispatcher.dispatch(Box::new(move || cb(progress)));
        }
    }

    fn monitor_unobserved_later(&self) {
        if self.inner.terminating || !dispatch::monitor_unobserved() {
            return;
        }
        let Some(dispatcher) = dispatch::try_current() else {
            return;
        };
        let inner = Arc::downgrade(&self.inner);
        dispatcher.dispatch_after(
            Box::new(move || {
                if let Some(inner) = inner.upgrade() {
                    if !inner.cell.lock().observed {
                        tracing::warn!(
                            "promise settled {}s ago and still has no observer",
                            UNOBSERVED_WARN_DELAY.as_secs()
                        );
                    }
                }
            }),
            UNOBSERVED_WARN_DELAY,
        );
    }
}

impl<V> Future for Promise<V>
where
    V: Clone + Send + 'static,
{
    type Output = Result<Option<V>, Reason>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut cell = self.inner.cell.lock();
        if let Some(settlement) = &cell.settled {
            match settlement {
                Settlement::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
                Settlement::Rejected(cause) => Poll::Ready(Err(cause.clone())),
            }
        } else {
            cell.wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

fn settle_child<NV>(outcome: Outcome<NV>, child: &Promise<NV>)
where
    NV: Clone + Send + 'static,
{
    match outcome {
        Ok(next) => adapt(next).pipe_into(child.clone()),
        Err(cause) => child.commit(Settlement::Rejected(cause)),
    }
}

fn settled_result<V: Clone>(cell: &Cell<V>) -> Result<Option<V>, WaitError> {
    match &cell.settled {
        Some(Settlement::Fulfilled(value)) => Ok(value.clone()),
        Some(Settlement::Rejected(cause)) => Err(WaitError::Rejected(cause.clone())),
        // Callers only reach this with a settled cell.
        None => Err(WaitError::TimedOut),
    }
}

fn warn_blocking() {
    if dispatch::is_dispatcher_thread() {
        tracing::warn!("blocking wait on a dispatcher thread may deadlock against its own queue");
    }
}
