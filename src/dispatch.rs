//! Cross-context execution bridge.
//!
//! The chat client's connection state must only ever be touched from the
//! chat run-loop; HTTP handlers run on arbitrary worker tasks. [`Dispatcher`]
//! is the one channel between the two contexts: callers hand over an async
//! action, the run-loop drains the queue and executes each action exactly
//! once, in submission order, reporting the result back through a
//! [`DispatchHandle`] that the caller may await or drop.

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

/// Default queue depth for dispatched jobs.
pub const DISPATCH_QUEUE_DEPTH: usize = 64;

/// A type-erased action ready to run on the target loop.
pub type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Receiving end of the job queue, drained by the target run-loop.
pub type JobReceiver = mpsc::Receiver<Job>;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The target run-loop is gone or its queue is not accepting work.
    #[error("target run-loop is not accepting work")]
    LoopUnavailable,

    /// The action ran and failed; the error is its own.
    #[error("scheduled action failed: {0}")]
    Action(#[source] anyhow::Error),
}

/// Scheduling half of the bridge. Cheap to clone; every clone feeds the
/// same run-loop.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Job>,
}

/// A scheduled action's result, owned by the scheduling context.
///
/// Dropping the handle does not cancel the action; it still runs exactly
/// once on the target loop (fire-and-forget).
pub struct DispatchHandle<T> {
    rx: oneshot::Receiver<anyhow::Result<T>>,
}

impl Dispatcher {
    /// Create the bridge: the [`Dispatcher`] goes to scheduling contexts,
    /// the [`JobReceiver`] to the run-loop that will execute the work.
    pub fn channel(capacity: usize) -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue `action` for execution on the target run-loop.
    ///
    /// Returns immediately. If the loop is gone or the queue is full, the
    /// action is never invoked and `LoopUnavailable` is returned.
    pub fn schedule<T, Fut>(
        &self,
        action: impl FnOnce() -> Fut + Send + 'static,
    ) -> Result<DispatchHandle<T>, DispatchError>
    where
        Fut: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();

        let job: Job = Box::new(move || {
            Box::pin(async move {
                let result = action().await;
                // The caller may have dropped the handle; the action has
                // already run either way.
                let _ = result_tx.send(result);
            })
        });

        self.tx
            .try_send(job)
            .map_err(|_| DispatchError::LoopUnavailable)?;

        Ok(DispatchHandle { rx: result_rx })
    }
}

impl<T> DispatchHandle<T> {
    /// Wait for the action's result. If the run-loop died before executing
    /// the action, this reports `LoopUnavailable`.
    pub async fn join(self) -> Result<T, DispatchError> {
        match self.rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(DispatchError::Action(e)),
            Err(_) => Err(DispatchError::LoopUnavailable),
        }
    }
}
