//! A single serialized worker thread.
//!
//! `Worker<S>` owns some state `S` on a dedicated thread and runs submitted
//! closures against it one at a time, in submission order.  Each
//! submission hands back a oneshot receiver: `.await` it from async code or
//! use `Worker::run` to block.

use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::errors::{HomeVaultError, Result};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

pub struct Worker<S> {
    sender: Option<mpsc::UnboundedSender<Job<S>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl<S: Send + 'static> Worker<S> {
    /// Move `state` onto a new thread called `name`.
    pub fn spawn(name: &str, state: S) -> Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job<S>>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut state = state;
                while let Some(job) = receiver.blocking_recv() {
                    job(&mut state);
                }
                debug!("worker drained, exiting");
            })?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Queue `work`; the receiver resolves with its result.
    pub fn submit<R, F>(&self, work: F) -> Result<oneshot::Receiver<R>>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let job: Job<S> = Box::new(move |state| {
            // The submitter may have stopped waiting.
            let _ = reply.send(work(state));
        });
        self.sender
            .as_ref()
            .ok_or(HomeVaultError::WorkerStopped)?
            .send(job)
            .map_err(|_| HomeVaultError::WorkerStopped)?;
        Ok(receiver)
    }

    /// Queue `work` and block until it has run.
    ///
    /// Must not be called from inside an async runtime.
    pub fn run<R, F>(&self, work: F) -> Result<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.submit(work)?
            .blocking_recv()
            .map_err(|_| HomeVaultError::WorkerStopped)
    }
}

impl<S> Drop for Worker<S> {
    fn drop(&mut self) {
        // Closing the channel lets the thread finish queued work and exit.
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
