use std::future::Future;
use std::pin::Pin;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::trace;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The result of a unit of work, available once the queue got around to running it. Dropping
///  it does not cancel the work.
pub type Completion<T> = oneshot::Receiver<T>;

/// A bounded queue of units of work that are executed one at a time, in the order they were
///  enqueued, by a single worker task.
///
/// Dropping the queue aborts the worker, discarding work that did not run yet.
pub struct SerialQueue {
    name: &'static str,
    jobs: mpsc::Sender<Job>,
    worker: JoinHandle<()>,
}

impl SerialQueue {
    /// This spawns the worker, so it must be called from within a tokio runtime
    pub fn new(name: &'static str, capacity: usize) -> SerialQueue {
        let (jobs, mut receiver) = mpsc::channel::<Job>(capacity.max(1));

        let worker = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job.await;
            }
            trace!("serial queue '{}' terminated", name);
        });

        SerialQueue {
            name,
            jobs,
            worker,
        }
    }

    /// Appends work to the queue, waiting for a free slot if it is full
    pub async fn enqueue<F, T>(&self, work: F) -> anyhow::Result<Completion<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_sender, result_receiver) = oneshot::channel();
        let job = Box::pin(async move {
            // the receiver may be gone if nobody is interested in the result
            let _ = result_sender.send(work.await);
        });

        self.jobs.send(job).await
            .map_err(|_| anyhow!("serial queue '{}' is shut down", self.name))?;
        Ok(result_receiver)
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
