use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use promiseq::dispatch::{self, EventLoop};
use promiseq::{
    defer, reason, Async, Deferred, Interrupted, Promise, State, TaskPanicked, WaitError,
};

#[derive(Debug, thiserror::Error)]
#[error("boom")]
struct Boom;

#[derive(Debug, thiserror::Error)]
#[error("other failure")]
struct OtherFailure;

#[test]
fn resolve_settles_once_and_later_commits_are_noops() {
    let (deferred, promise) = Deferred::new();
    assert!(promise.is_pending());
    deferred.resolve(1);
    deferred.resolve(2);
    deferred.reject(reason(Boom));
    assert!(promise.is_fulfilled());
    assert_eq!(promise.wait().unwrap(), Some(1));
}

#[test]
fn inspect_reports_state_and_payload() {
    let (deferred, promise) = Deferred::<u32>::new();
    assert_eq!(promise.inspect().state, State::Pending);

    deferred.resolve(4);
    let snapshot = promise.inspect();
    assert_eq!(snapshot.state, State::Fulfilled);
    assert_eq!(snapshot.value, Some(4));
    assert!(snapshot.reason.is_none());

    let rejected = Promise::<u32>::rejected(reason(Boom));
    let snapshot = rejected.inspect();
    assert_eq!(snapshot.state, State::Rejected);
    assert!(snapshot.reason.unwrap().downcast_ref::<Boom>().is_some());
}

#[test]
fn then_chains_to_a_new_value_type() {
    let el = EventLoop::spawn("then").unwrap();
    let _guard = dispatch::register_current(el.dispatcher());

    let (deferred, promise) = Deferred::<u32>::new();
    let described = promise.then(|v| Ok(Async::value(format!("got {}", v.unwrap_or(0)))));
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        deferred.resolve(41);
    });
    assert_eq!(described.wait().unwrap().as_deref(), Some("got 41"));
    el.shutdown().unwrap();
}

#[test]
fn callbacks_never_run_inline() {
    let el = EventLoop::spawn("inline").unwrap();
    let _guard = dispatch::register_current(el.dispatcher());

    let registering = thread::current().id();
    let (tx, rx) = mpsc::channel();
    // Already settled, so a naive engine would be tempted to call inline.
    let chained = Promise::resolved(1).then(move |v| {
        tx.send(thread::current().id()).unwrap();
        Ok(Async::Value(v))
    });
    assert_eq!(chained.wait().unwrap(), Some(1));
    assert_ne!(rx.recv().unwrap(), registering);
    el.shutdown().unwrap();
}

#[test]
fn rejection_bypasses_fulfillment_callbacks() {
    let el = EventLoop::spawn("bypass").unwrap();
    let _guard = dispatch::register_current(el.dispatcher());

    let (deferred, promise) = Deferred::<u32>::new();
    let child: Promise<u32> = promise.then(|_| panic!("must not run"));
    deferred.reject(reason(Boom));
    match child.wait() {
        Err(WaitError::Rejected(cause)) => assert!(cause.downcast_ref::<Boom>().is_some()),
        other => panic!("expected rejection, got {:?}", other),
    }
    el.shutdown().unwrap();
}

#[test]
fn fail_recovers_from_a_rejection() {
    let el = EventLoop::spawn("fail").unwrap();
    let _guard = dispatch::register_current(el.dispatcher());

    let recovered = Promise::<u32>::rejected(reason(Boom)).fail(|_| Ok(Async::value(7)));
    assert_eq!(recovered.wait().unwrap(), Some(7));
    el.shutdown().unwrap();
}

#[test]
fn fail_on_only_handles_the_named_reason_type() {
    let el = EventLoop::spawn("fail-on").unwrap();
    let _guard = dispatch::register_current(el.dispatcher());

    let unmatched = Promise::<u32>::rejected(reason(Boom))
        .fail_on::<OtherFailure, _>(|_| Ok(Async::value(0)));
    match unmatched.wait() {
        Err(WaitError::Rejected(cause)) => assert!(cause.downcast_ref::<Boom>().is_some()),
        other => panic!("expected forwarded rejection, got {:?}", other),
    }

    let matched =
        Promise::<u32>::rejected(reason(Boom)).fail_on::<Boom, _>(|_| Ok(Async::value(9)));
    assert_eq!(matched.wait().unwrap(), Some(9));
    el.shutdown().unwrap();
}

#[test]
fn progress_is_latched_for_late_subscribers() {
    let el = EventLoop::spawn("progress").unwrap();
    let _guard = dispatch::register_current(el.dispatcher());

    let (deferred, promise) = Deferred::<u32>::new();
    let (tx, rx) = mpsc::channel();
    let _early = promise.progress(move |p| tx.send(p).unwrap());

    deferred.notify(0.5);
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 0.5);

    // Subscribed after the notification, still sees the latched value.
    let (tx, rx) = mpsc::channel();
    let _late = promise.progress(move |p| tx.send(p).unwrap());
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 0.5);

    deferred.resolve(1);
    el.shutdown().unwrap();
}

#[test]
fn progress_after_settlement_is_a_noop() {
    let el = EventLoop::spawn("progress-noop").unwrap();
    let _guard = dispatch::register_current(el.dispatcher());

    let (deferred, promise) = Deferred::<u32>::new();
    let (tx, rx) = mpsc::channel();
    let _sub = promise.progress(move |p| tx.send(p).unwrap());
    deferred.resolve(1);
    deferred.notify(0.9);
    thread::sleep(Duration::from_millis(100));
    assert!(rx.try_recv().is_err());
    el.shutdown().unwrap();
}

#[test]
fn tap_observes_without_affecting_the_chain() {
    let el = EventLoop::spawn("tap").unwrap();
    let _guard = dispatch::register_current(el.dispatcher());

    let (tx, rx) = mpsc::channel();
    let seen = Promise::resolved(3).tap(move |v| {
        tx.send(v).unwrap();
        Ok(())
    });
    assert_eq!(seen.wait().unwrap(), Some(3));
    assert_eq!(rx.recv().unwrap(), Some(3));

    // A failing tap is swallowed.
    let tapped = Promise::resolved(3).tap(|_| Err(reason(Boom)));
    assert_eq!(tapped.wait().unwrap(), Some(3));
    el.shutdown().unwrap();
}

#[test]
fn then_resolve_and_then_reject_replace_the_outcome() {
    let el = EventLoop::spawn("sugar").unwrap();
    let _guard = dispatch::register_current(el.dispatcher());

    let replaced = Promise::resolved(1).then_resolve(Some("done"));
    assert_eq!(replaced.wait().unwrap(), Some("done"));

    let rejected: Promise<u32> = Promise::resolved(1).then_reject(reason(Boom));
    match rejected.wait() {
        Err(WaitError::Rejected(cause)) => assert!(cause.downcast_ref::<Boom>().is_some()),
        other => panic!("expected rejection, got {:?}", other),
    }
    el.shutdown().unwrap();
}

#[test]
fn fin_passes_through_and_its_failure_overrides() {
    let el = EventLoop::spawn("fin").unwrap();
    let _guard = dispatch::register_current(el.dispatcher());

    let (tx, rx) = mpsc::channel();
    let cleaned = Promise::resolved(2).fin(move || {
        tx.send(()).unwrap();
        Ok(Async::empty())
    });
    assert_eq!(cleaned.wait().unwrap(), Some(2));
    rx.recv().unwrap();

    let still_rejected = Promise::<u32>::rejected(reason(Boom)).fin(|| Ok(Async::empty()));
    match still_rejected.wait() {
        Err(WaitError::Rejected(cause)) => assert!(cause.downcast_ref::<Boom>().is_some()),
        other => panic!("expected original rejection, got {:?}", other),
    }

    let overridden = Promise::resolved(2).fin(|| Err(reason(OtherFailure)));
    match overridden.wait() {
        Err(WaitError::Rejected(cause)) => {
            assert!(cause.downcast_ref::<OtherFailure>().is_some())
        }
        other => panic!("expected finally failure, got {:?}", other),
    }

    // An asynchronous cleanup delays the pass-through.
    let after_cleanup = Promise::resolved(2).fin(|| {
        Ok(Async::Promise(defer(|| {
            thread::sleep(Duration::from_millis(30));
            Ok(None)
        })))
    });
    assert_eq!(after_cleanup.wait().unwrap(), Some(2));
    el.shutdown().unwrap();
}

#[test]
fn wait_timeout_gives_up_on_a_pending_promise() {
    let (_deferred, promise) = Deferred::<u32>::new();
    match promise.wait_timeout(Duration::from_millis(50)) {
        Err(WaitError::TimedOut) => {}
        other => panic!("expected wait timeout, got {:?}", other),
    }
}

#[test]
fn promise_is_a_future() {
    let (deferred, promise) = Deferred::new();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        deferred.resolve(9);
    });
    assert_eq!(futures::executor::block_on(promise).unwrap(), Some(9));

    let rejected = Promise::<u32>::rejected(reason(Boom));
    let cause = futures::executor::block_on(rejected).unwrap_err();
    assert!(cause.downcast_ref::<Boom>().is_some());
}

#[test]
fn channel_receiver_adapts_to_a_promise() {
    let (tx, rx) = mpsc::channel();
    let promise = Promise::from_async(Async::handle(rx));
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        tx.send(11).unwrap();
    });
    assert_eq!(promise.wait().unwrap(), Some(11));
}

#[test]
fn abandoned_channel_rejects_as_interrupted() {
    let (tx, rx) = mpsc::channel::<u32>();
    drop(tx);
    let promise = Promise::from_async(Async::handle(rx));
    match promise.wait() {
        Err(WaitError::Rejected(cause)) => {
            assert!(cause.downcast_ref::<Interrupted>().is_some())
        }
        other => panic!("expected interruption, got {:?}", other),
    }
}

#[test]
fn panicking_join_handle_rejects_with_the_panic_message() {
    let handle = thread::spawn(|| -> u32 { panic!("kaput") });
    let promise = Promise::from_async(Async::handle(handle));
    match promise.wait() {
        Err(WaitError::Rejected(cause)) => {
            let panicked = cause.downcast_ref::<TaskPanicked>().unwrap();
            assert!(panicked.0.contains("kaput"));
        }
        other => panic!("expected task panic, got {:?}", other),
    }
}

#[test]
fn defer_runs_the_task_on_a_background_thread() {
    let caller = thread::current().id();
    let promise = defer(move || {
        assert_ne!(thread::current().id(), caller);
        Ok(Some(6))
    });
    assert_eq!(promise.wait().unwrap(), Some(6));

    let failed: Promise<u32> = defer(|| Err(reason(Boom)));
    assert!(failed.wait().is_err());
}

#[test]
fn cancellation_does_not_exist() {
    let (deferred, promise) = Deferred::new();
    assert!(!promise.cancel());
    assert!(!promise.is_cancelled());
    assert!(promise.is_pending());
    deferred.resolve(1);
    assert!(!promise.cancel());
    assert_eq!(promise.wait().unwrap(), Some(1));
}

#[test]
fn unhandled_rejection_on_a_terminated_chain_kills_the_loop() {
    let el = EventLoop::spawn("unhandled").unwrap();
    let _guard = dispatch::register_current(el.dispatcher());

    let (deferred, promise) = Deferred::<u32>::new();
    promise.then(|v| Ok(Async::Value(v))).done();
    deferred.reject(reason(Boom));
    thread::sleep(Duration::from_millis(200));
    assert!(el.shutdown().is_err());
}

#[test]
fn done_after_a_rejection_handler_is_harmless() {
    let el = EventLoop::spawn("handled").unwrap();
    let _guard = dispatch::register_current(el.dispatcher());

    let (deferred, promise) = Deferred::<u32>::new();
    let (tx, rx) = mpsc::channel();
    promise
        .fail(move |cause| {
            tx.send(cause.to_string()).unwrap();
            Ok(Async::empty())
        })
        .done();
    deferred.reject(reason(Boom));
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "boom");
    el.shutdown().unwrap();
}
