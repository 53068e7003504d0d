//! Background executors
//!
//! Two small thread-backed executors the pool relies on:
//!
//! - [`SerialExecutor`] runs one job function on one dedicated thread,
//!   triggered by [`SerialExecutor::signal`]. The trigger channel has
//!   capacity 1, so signals arriving while a run is pending or in progress
//!   coalesce into at most one further run.
//! - [`CloseExecutor`] is a fixed pool of worker threads that performs
//!   blocking connection closes off the release path.

use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::error::{Error, Result};

/// Single-threaded executor with coalescing triggers
pub struct SerialExecutor {
    signal: RwLock<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SerialExecutor {
    /// Spawn the worker thread; `job` runs once per delivered signal
    pub fn new(thread_name: impl Into<String>, job: impl Fn() + Send + 'static) -> Result<Self> {
        let (tx, rx) = bounded::<()>(1);
        let worker = std::thread::Builder::new()
            .name(thread_name.into())
            .spawn(move || {
                while rx.recv().is_ok() {
                    job();
                }
            })
            .map_err(|e| Error::internal(format!("failed to spawn worker thread: {e}")))?;

        Ok(Self {
            signal: RwLock::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Request a run; coalesced if one is already pending
    pub fn signal(&self) {
        if let Some(tx) = self.signal.read().as_ref() {
            // a full channel means a run is already queued
            let _ = tx.try_send(());
        }
    }

    /// Stop the worker after any in-flight run completes
    pub fn shutdown(&self) {
        self.signal.write().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("serial executor thread panicked during shutdown");
            }
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

type CloseJob = Box<dyn FnOnce() + Send>;

/// Fixed-size thread pool for blocking connection closes
pub struct CloseExecutor {
    jobs: RwLock<Option<Sender<CloseJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CloseExecutor {
    /// Spawn `threads` workers draining the close queue
    pub fn new(thread_name_prefix: &str, threads: usize) -> Result<Self> {
        let (tx, rx) = unbounded::<CloseJob>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = rx.clone();
            let worker = std::thread::Builder::new()
                .name(format!("{thread_name_prefix}-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .map_err(|e| Error::internal(format!("failed to spawn closer thread: {e}")))?;
            workers.push(worker);
        }

        Ok(Self {
            jobs: RwLock::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Enqueue a close job; runs inline once the executor is shut down
    pub fn execute(&self, job: CloseJob) {
        let job = {
            let guard = self.jobs.read();
            match guard.as_ref() {
                Some(tx) => match tx.send(job) {
                    Ok(()) => return,
                    Err(e) => e.into_inner(),
                },
                None => job,
            }
        };
        job();
    }

    /// Drain remaining jobs and join the workers
    pub fn shutdown(&self) {
        self.jobs.write().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                warn!("close executor thread panicked during shutdown");
            }
        }
    }
}

impl Drop for CloseExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
