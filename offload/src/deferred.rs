//! Single-settlement task futures.
//!
//! Every submitted task is represented by a [`Resolver`] (held by the engine
//! in the in-flight table) and a [`TaskFuture`] (held by the caller). The
//! pair settles exactly once. The future additionally supports the two
//! caller-originated rejection kinds: [`TaskFuture::cancel`] and
//! [`TaskFuture::with_timeout`], both of which notify the engine so the
//! owning worker can be force-terminated.

use crate::error::ExecError;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Sleep;

/// Outcome delivered to the caller when a task settles.
pub type TaskOutcome = Result<Value, ExecError>;

/// Engine-side notification that the caller aborted its future.
///
/// The argument is the rejection the caller observed (`Cancelled` or
/// `TimedOut`); implementations remove the in-flight record and
/// force-terminate the owning worker.
pub(crate) type AbortFn = dyn Fn(ExecError) + Send + Sync;

/// Creates a linked resolver/future pair.
///
/// `abort` is invoked when the caller cancels the future or its deadline
/// expires; pass `None` for futures that cannot reach back into the engine.
pub(crate) fn deferred(abort: Option<Arc<AbortFn>>) -> (Resolver, TaskFuture) {
    let (tx, rx) = oneshot::channel();
    (
        Resolver { tx: Some(tx) },
        TaskFuture {
            rx,
            abort,
            deadline: None,
        },
    )
}

// =============================================================================
// Resolver
// =============================================================================

/// The settling half of a task. Settles at most once; later calls are no-ops.
#[derive(Debug)]
pub struct Resolver {
    tx: Option<oneshot::Sender<TaskOutcome>>,
}

impl Resolver {
    /// Settles with a success value.
    pub fn resolve(&mut self, value: Value) {
        self.settle(Ok(value));
    }

    /// Settles with an error.
    pub fn reject(&mut self, error: ExecError) {
        self.settle(Err(error));
    }

    /// Settles with the given outcome. Dropped silently if the caller no
    /// longer holds the future.
    pub fn settle(&mut self, outcome: TaskOutcome) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
    }

    /// True once this resolver has settled.
    pub fn is_settled(&self) -> bool {
        self.tx.is_none()
    }
}

// =============================================================================
// Task future
// =============================================================================

/// The caller's handle on a submitted task.
///
/// Resolves to the worker's result, or rejects with the task's error, a
/// transport failure, or a caller-originated `Cancelled`/`TimedOut`.
pub struct TaskFuture {
    rx: oneshot::Receiver<TaskOutcome>,
    abort: Option<Arc<AbortFn>>,
    deadline: Option<(Duration, Pin<Box<Sleep>>)>,
}

impl std::fmt::Debug for TaskFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFuture")
            .field("has_abort", &self.abort.is_some())
            .field("deadline", &self.deadline.as_ref().map(|(d, _)| *d))
            .finish()
    }
}

impl TaskFuture {
    /// Bounds this future with a deadline.
    ///
    /// On expiry the future rejects with [`ExecError::TimedOut`] and the
    /// owning worker is force-terminated.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some((timeout, Box::pin(tokio::time::sleep(timeout))));
        self
    }

    /// Cancels the task.
    ///
    /// The future rejects with [`ExecError::Cancelled`] once the engine has
    /// removed the task; the owning worker is force-terminated (tasks are
    /// not individually cancellable on the worker side).
    pub fn cancel(&self) {
        if let Some(abort) = &self.abort {
            abort(ExecError::Cancelled);
        }
    }
}

impl Future for TaskFuture {
    type Output = TaskOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => return Poll::Ready(outcome),
            // Resolver dropped without settling: the engine went away.
            Poll::Ready(Err(_)) => return Poll::Ready(Err(ExecError::WorkerTerminated)),
            Poll::Pending => {}
        }

        if let Some((timeout, sleep)) = &mut this.deadline {
            if sleep.as_mut().poll(cx).is_ready() {
                let timeout = *timeout;
                if let Some(abort) = &this.abort {
                    abort(ExecError::TimedOut(timeout));
                }
                return Poll::Ready(Err(ExecError::TimedOut(timeout)));
            }
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_resolve_settles_future() {
        let (mut resolver, future) = deferred(None);
        resolver.resolve(json!(42));
        assert!(resolver.is_settled());
        assert_eq!(future.await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_reject_settles_future() {
        let (mut resolver, future) = deferred(None);
        resolver.reject(ExecError::WorkerTerminated);
        assert!(matches!(future.await, Err(ExecError::WorkerTerminated)));
    }

    #[tokio::test]
    async fn test_settles_at_most_once() {
        let (mut resolver, future) = deferred(None);
        resolver.resolve(json!(1));
        resolver.resolve(json!(2));
        resolver.reject(ExecError::Cancelled);
        assert_eq!(future.await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_dropped_resolver_rejects_with_terminated() {
        let (resolver, future) = deferred(None);
        drop(resolver);
        assert!(matches!(future.await, Err(ExecError::WorkerTerminated)));
    }

    #[tokio::test]
    async fn test_cancel_invokes_abort_hook() {
        let aborts: Arc<Mutex<Vec<ExecError>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&aborts);
        let (_resolver, future) = deferred(Some(Arc::new(move |err| {
            sink.lock().unwrap().push(err);
        })));

        future.cancel();

        let recorded = aborts.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert!(matches!(recorded[0], ExecError::Cancelled));
    }

    #[tokio::test]
    async fn test_timeout_rejects_and_notifies_engine() {
        let abort_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&abort_count);
        let (_resolver, future) = deferred(Some(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        let outcome = future.with_timeout(Duration::from_millis(20)).await;
        assert!(matches!(outcome, Err(ExecError::TimedOut(_))));
        assert_eq!(abort_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_settlement_beats_deadline() {
        let (mut resolver, future) = deferred(None);
        resolver.resolve(json!("done"));
        let outcome = future.with_timeout(Duration::from_millis(5)).await;
        assert_eq!(outcome.unwrap(), json!("done"));
    }
}
