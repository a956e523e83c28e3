//! Fixed worker pool for replication and fetch work
//!
//! Replication futures and master re-registration run here so put paths can
//! overlap network work with local placement and then wait on the handle.

use std::thread::JoinHandle;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use tidal_common::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Maximum threads regardless of configuration
const MAX_WORKERS: usize = 128;

/// Handle to a submitted task; `wait` blocks until the worker finishes it
pub struct TaskHandle<T> {
    receiver: Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Block until the task completes. Errors if the pool was shut down or
    /// the task panicked before producing a result.
    pub fn wait(self) -> Result<T> {
        self.receiver
            .recv()
            .map_err(|_| Error::Internal("Worker pool dropped the task".into()))
    }
}

/// A bounded pool of worker threads consuming submitted closures
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool with `threads` workers; 0 sizes it from the host's
    /// core count, capped at 128.
    #[must_use]
    pub fn new(name: impl Into<String>, threads: usize) -> Self {
        let name = name.into();
        let threads = if threads == 0 {
            (num_cpus::get() * 4).min(MAX_WORKERS)
        } else {
            threads.min(MAX_WORKERS)
        };

        let (sender, receiver) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver: Receiver<Job> = receiver.clone();
            let worker_name = format!("{name}-worker-{i}");
            let handle = std::thread::Builder::new()
                .name(worker_name.clone())
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        let outcome =
                            std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
                        if outcome.is_err() {
                            error!("Worker {} caught a panicking task", worker_name);
                        }
                    }
                })
                .expect("worker thread spawn");
            workers.push(handle);
        }
        debug!("Worker pool {} started with {} threads", name, threads);

        Self {
            name,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Submit a task. After shutdown the task is discarded and its handle's
    /// `wait` errors.
    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let job: Job = Box::new(move || {
            let _ = tx.send(task());
        });

        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(job);
        }
        TaskHandle { receiver: rx }
    }

    /// Stop accepting work and join every worker
    pub fn shutdown(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
        debug!("Worker pool {} stopped", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
