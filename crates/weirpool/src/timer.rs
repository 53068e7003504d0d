//! Shared delay scheduler
//!
//! A single timer thread drains a min-heap of deadlines and runs callbacks
//! inline. Both the per-entry lifetime one-shots and the periodic
//! housekeeping sweep ride on the same thread, so callbacks must be short
//! and non-blocking.
//!
//! Cancellation never races a firing callback: [`TimerHandle::cancel`] only
//! sets a flag, and the flag is re-checked immediately before the callback
//! runs.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{Error, Result};

enum TaskKind {
    Once(Box<dyn FnOnce() + Send>),
    Repeating {
        period: Duration,
        run: Arc<dyn Fn() + Send + Sync>,
    },
}

struct TimerTask {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    kind: TaskKind,
}

impl PartialEq for TimerTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerTask {}

impl PartialOrd for TimerTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

struct TimerQueue {
    tasks: BinaryHeap<Reverse<TimerTask>>,
    seq: u64,
    shutdown: bool,
}

struct TimerShared {
    queue: Mutex<TimerQueue>,
    condvar: Condvar,
}

/// Cancel handle for a scheduled task
///
/// Cancelling an already-fired one-shot is a no-op; cancelling a repeating
/// task stops all future firings.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Prevent the task from firing again
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether the task has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Min-heap timer driven by one dedicated thread
pub struct TimerWheel {
    shared: Arc<TimerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimerWheel {
    /// Start the timer thread
    pub fn new(thread_name: impl Into<String>) -> Result<Self> {
        let shared = Arc::new(TimerShared {
            queue: Mutex::new(TimerQueue {
                tasks: BinaryHeap::new(),
                seq: 0,
                shutdown: false,
            }),
            condvar: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name(thread_name.into())
            .spawn(move || run_timer(worker_shared))
            .map_err(|e| Error::internal(format!("failed to spawn timer thread: {e}")))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Schedule a one-shot `delay` from now
    pub fn schedule(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> TimerHandle {
        self.push(delay, TaskKind::Once(Box::new(f)))
    }

    /// Schedule a repeating task; first firing after one full period
    pub fn schedule_repeating(
        &self,
        period: Duration,
        f: impl Fn() + Send + Sync + 'static,
    ) -> TimerHandle {
        self.push(
            period,
            TaskKind::Repeating {
                period,
                run: Arc::new(f),
            },
        )
    }

    fn push(&self, delay: Duration, kind: TaskKind) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut queue = self.shared.queue.lock();
            queue.seq += 1;
            let seq = queue.seq;
            queue.tasks.push(Reverse(TimerTask {
                deadline: Instant::now() + delay,
                seq,
                cancelled: cancelled.clone(),
                kind,
            }));
        }
        self.shared.condvar.notify_one();
        TimerHandle { cancelled }
    }

    /// Stop the timer thread; pending tasks are dropped unfired
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            queue.tasks.clear();
        }
        self.shared.condvar.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("timer thread panicked during shutdown");
            }
        }
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timer(shared: Arc<TimerShared>) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            return;
        }

        let now = Instant::now();
        let next_deadline = queue.tasks.peek().map(|Reverse(task)| task.deadline);
        match next_deadline {
            None => {
                shared.condvar.wait(&mut queue);
                continue;
            }
            Some(deadline) if deadline > now => {
                shared.condvar.wait_for(&mut queue, deadline - now);
                continue;
            }
            Some(_) => {}
        }

        let Some(Reverse(task)) = queue.tasks.pop() else {
            continue;
        };

        // run outside the lock so callbacks may schedule new tasks
        drop(queue);
        if !task.cancelled.load(Ordering::Acquire) {
            match task.kind {
                TaskKind::Once(f) => f(),
                TaskKind::Repeating { period, run } => {
                    run();
                    let mut requeue = shared.queue.lock();
                    if !requeue.shutdown && !task.cancelled.load(Ordering::Acquire) {
                        requeue.seq += 1;
                        let seq = requeue.seq;
                        requeue.tasks.push(Reverse(TimerTask {
                            deadline: Instant::now() + period,
                            seq,
                            cancelled: task.cancelled,
                            kind: TaskKind::Repeating { period, run },
                        }));
                    }
                    queue = requeue;
                    continue;
                }
            }
        }
        queue = shared.queue.lock();
    }
}
