//! Cross-thread dispatch.
//!
//! The engine never runs a continuation inline: every link fires as a task
//! posted to the [`Dispatcher`] that was current on the thread which
//! registered it. A dispatcher guarantees in-order, eventual, asynchronous
//! execution of its tasks; delays are best-effort and never early.
//!
//! Resolution is scoped rather than global: each thread may install its own
//! dispatcher with [`register_current`] (a guard restores the previous one
//! on drop), and a process-wide fallback may be set with [`set_default`].
//! [`current`] panics when neither is present. Registering a continuation
//! from a thread with no way to run it is a programming error, not a
//! rejection.
//!
//! [`EventLoop`] is a ready-made dispatcher backend: a dedicated thread
//! draining a timer-ordered task queue, for hosts (and tests) that do not
//! bring their own loop.

use std::cell::RefCell;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{self, AtomicBool};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A unit of work posted to a dispatcher.
pub type Task = Box<dyn FnOnce() + Send>;

/// Posts tasks for later, in-order execution on one specific thread or loop.
pub trait Dispatch: Send + Sync {
    /// Run `task` asynchronously, after previously posted tasks.
    fn dispatch(&self, task: Task);

    /// Run `task` asynchronously once at least `delay` has passed.
    fn dispatch_after(&self, task: Task, delay: Duration);
}

/// Shared handle to a dispatcher.
pub type Dispatcher = Arc<dyn Dispatch>;

thread_local! {
    static CURRENT: RefCell<Option<Dispatcher>> = const { RefCell::new(None) };
}

static DEFAULT: Mutex<Option<Dispatcher>> = Mutex::new(None);
static MONITOR_UNOBSERVED: AtomicBool = AtomicBool::new(false);

/// Restores the previously registered dispatcher when dropped.
///
/// Deliberately not `Send`: the guard must be dropped on the thread it was
/// created on.
#[must_use = "dropping the guard immediately unregisters the dispatcher"]
pub struct CurrentGuard {
    prev: Option<Dispatcher>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|c| *c.borrow_mut() = prev);
    }
}

/// Install `dispatcher` as the calling thread's dispatcher for the lifetime
/// of the returned guard.
pub fn register_current(dispatcher: Dispatcher) -> CurrentGuard {
    let prev = CURRENT.with(|c| c.borrow_mut().replace(dispatcher));
    CurrentGuard {
        prev,
        _not_send: PhantomData,
    }
}

/// Set the process-wide fallback dispatcher used by threads that have not
/// registered one of their own.
pub fn set_default(dispatcher: Dispatcher) {
    *DEFAULT.lock() = Some(dispatcher);
}

/// The dispatcher that will run continuations registered from this thread,
/// if any: the thread's own registration first, then the default.
pub fn try_current() -> Option<Dispatcher> {
    CURRENT
        .with(|c| c.borrow().clone())
        .or_else(|| DEFAULT.lock().clone())
}

/// Like [`try_current`], but panics when no dispatcher is resolvable.
///
/// # Panics
///
/// When the calling thread has no registered dispatcher and no default has
/// been configured. This is a usage fault, never carried as a rejection.
pub fn current() -> Dispatcher {
    match try_current() {
        Some(d) => d,
        None => panic!("no dispatcher registered for this thread and no default configured"),
    }
}

/// True if the calling thread itself registered a dispatcher. Used to warn
/// about blocking waits that may deadlock against the thread's own queue.
pub fn is_dispatcher_thread() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}

/// Enable or disable the unobserved-settlement monitor: when on, a promise
/// that settles with no links queued schedules a delayed warning, emitted if
/// it still has had no observer by then.
pub fn set_monitor_unobserved(enabled: bool) {
    MONITOR_UNOBSERVED.store(enabled, atomic::Ordering::Relaxed);
}

pub(crate) fn monitor_unobserved() -> bool {
    MONITOR_UNOBSERVED.load(atomic::Ordering::Relaxed)
}

struct Entry {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Due time first, then posting order, so same-deadline tasks run FIFO.
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

struct Queue {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
    stopped: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    cond: Condvar,
}

struct LoopDispatcher {
    shared: Arc<Shared>,
}

impl Dispatch for LoopDispatcher {
    fn dispatch(&self, task: Task) {
        self.dispatch_after(task, Duration::ZERO);
    }

    fn dispatch_after(&self, task: Task, delay: Duration) {
        let mut queue = self.shared.queue.lock();
        let seq = queue.seq;
        queue.seq += 1;
        queue.heap.push(Reverse(Entry {
            due: Instant::now() + delay,
            seq,
            task,
        }));
        drop(queue);
        self.shared.cond.notify_all();
    }
}

/// A dispatcher backend owning one thread which drains a timer-ordered task
/// queue, in the spirit of a UI event loop.
///
/// The loop thread registers its own dispatcher for its whole lifetime, so
/// continuations running on it may register further links without any other
/// setup.
///
/// # Examples
///
/// ```
/// use promiseq::dispatch::{self, EventLoop};
///
/// let el = EventLoop::spawn("callbacks").unwrap();
/// let _guard = dispatch::register_current(el.dispatcher());
/// // ... register promise continuations from this thread ...
/// el.shutdown().unwrap();
/// ```
pub struct EventLoop {
    shared: Arc<Shared>,
    thread: thread::JoinHandle<()>,
}

impl EventLoop {
    /// Spawn a new loop thread with the given name.
    pub fn spawn(name: &str) -> io::Result<EventLoop> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                heap: BinaryHeap::new(),
                seq: 0,
                stopped: false,
            }),
            cond: Condvar::new(),
        });
        let for_loop = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run(for_loop))?;
        Ok(EventLoop { shared, thread })
    }

    /// A dispatcher posting to this loop. May be cloned and shared freely.
    pub fn dispatcher(&self) -> Dispatcher {
        Arc::new(LoopDispatcher {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Stop the loop and join its thread. Tasks already due are drained
    /// first; timer tasks still in the future are dropped.
    ///
    /// An `Err` means the loop thread died unwinding, which is how an
    /// unhandled-rejection fault surfaces.
    pub fn shutdown(self) -> thread::Result<()> {
        {
            let mut queue = self.shared.queue.lock();
            queue.stopped = true;
        }
        self.shared.cond.notify_all();
        self.thread.join()
    }
}

fn run(shared: Arc<Shared>) {
    // Continuations running on this loop register further links from here,
    // so the loop thread resolves to its own dispatcher.
    let _registration = register_current(Arc::new(LoopDispatcher {
        shared: Arc::clone(&shared),
    }));
    tracing::debug!("event loop starting");
    loop {
        let mut queue = shared.queue.lock();
        let task = loop {
            let now = Instant::now();
            let next_due = queue.heap.peek().map(|Reverse(entry)| entry.due);
            match next_due {
                Some(due) if due <= now => {
                    break queue.heap.pop().map(|Reverse(entry)| entry.task);
                }
                _ if queue.stopped => {
                    tracing::debug!("event loop exiting");
                    return;
                }
                Some(due) => {
                    shared.cond.wait_until(&mut queue, due);
                }
                None => {
                    shared.cond.wait(&mut queue);
                }
            }
        };
        drop(queue);
        if let Some(task) = task {
            task();
        }
    }
}
