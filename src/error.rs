//! Error taxonomy.
//!
//! Rejection reasons are opaque to the engine ([`Reason`](crate::Reason) is
//! any `Error + Send + Sync` behind an `Arc`); the types here are the
//! concrete reasons and faults the engine itself produces.

use std::fmt;

use thiserror::Error;

use crate::Reason;

/// Rejection reason produced by [`Promise::timeout`](crate::Promise::timeout)
/// when the deadline elapses before the source promise settles.
#[derive(Debug, Error)]
#[error("promise timed out")]
pub struct TimedOut;

/// Returned by the blocking waits [`Promise::wait`](crate::Promise::wait) and
/// [`Promise::wait_timeout`](crate::Promise::wait_timeout).
#[derive(Debug, Error)]
pub enum WaitError {
    /// The promise settled rejected; the reason is carried verbatim.
    #[error("promise was rejected: {0}")]
    Rejected(#[source] Reason),
    /// The wait deadline elapsed while the promise was still pending.
    #[error("timed out waiting for promise to settle")]
    TimedOut,
}

/// Rejection reason produced by [`any`](crate::combine::any) once every
/// input promise has rejected.
#[derive(Debug, Error)]
#[error("all promises were rejected")]
pub struct AllRejected;

/// Rejection reason produced by [`join`](crate::combine::join) when both
/// sides fulfill but with unequal values.
#[derive(Debug, Error)]
#[error("promises fulfilled with different values")]
pub struct JoinMismatch;

/// Rejection reason used when a foreign handle is abandoned mid-wait, e.g.
/// an `mpsc` sender dropped before sending.
#[derive(Debug, Error)]
#[error("interrupted while waiting on foreign handle")]
pub struct Interrupted;

/// Rejection reason used when a background task backing a promise panicked.
#[derive(Debug, Error)]
#[error("background task panicked: {0}")]
pub struct TaskPanicked(pub String);

/// Failure modes of a [`Waitable`](crate::adapter::Waitable) blocking-get.
#[derive(Debug, Error)]
pub enum HandleError {
    /// The wait was cut short; maps to an [`Interrupted`] rejection.
    #[error("interrupted while waiting on foreign handle")]
    Interrupted,
    /// The handle completed with a failure; the cause rejects the promise
    /// directly (it is already error-shaped, no extra wrapping layer).
    #[error("foreign handle failed: {0}")]
    Failed(#[source] Reason),
}

/// Panic payload raised when a terminating promise settles rejected with no
/// rejection handler attached anywhere on it.
///
/// This is deliberately not an [`std::error::Error`]: it is a fault, not a
/// rejection reason, and it is raised with [`std::panic::panic_any`] so that
/// a dispatcher loop lets it crash the thread instead of absorbing it. The
/// only defense is terminating chains with an explicit rejection handler.
pub struct UnhandledRejection(pub Reason);

impl fmt::Debug for UnhandledRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnhandledRejection({})", self.0)
    }
}

impl fmt::Display for UnhandledRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unhandled rejection: {}", self.0)
    }
}
