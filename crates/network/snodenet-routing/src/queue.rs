//! Serialized execution context.
//!
//! A single worker task owns the state and runs submitted jobs one at a time,
//! so jobs can mutate it without locks. Jobs are synchronous: anything that
//! awaits runs outside the queue and submits a new job to apply its result.

use crate::error::{Result, RoutingError};
use futures::future::{BoxFuture, Shared};
use tokio::sync::{mpsc, oneshot};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

/// A cloneable result future that several callers can await.
pub type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Handle for submitting jobs to the worker that owns `S`.
pub struct WorkQueue<S> {
    sender: mpsc::UnboundedSender<Job<S>>,
}

impl<S> Clone for WorkQueue<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S: Send + 'static> WorkQueue<S> {
    /// Moves `state` into a new worker task. Requires a tokio runtime.
    pub fn spawn(state: S) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job<S>>();
        tokio::spawn(async move {
            let mut state = state;
            while let Some(job) = receiver.recv().await {
                job(&mut state);
            }
        });
        Self { sender }
    }

    /// Runs `f` on the worker and returns its result.
    pub async fn run<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Box::new(move |state: &mut S| {
                let _ = tx.send(f(state));
            }))
            .map_err(|_| RoutingError::QueueClosed)?;
        rx.await.map_err(|_| RoutingError::QueueClosed)
    }

    /// Queues `f` without waiting for it.
    pub fn submit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.sender
            .send(Box::new(f))
            .map_err(|_| RoutingError::QueueClosed)
    }
}
