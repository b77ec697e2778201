//! Notification delivery queue.
//!
//! A FIFO task queue served by an elastic pool of worker threads. Every task
//! runs under `catch_unwind`, so one panicking observer never takes down a
//! worker.
//!
//! A fixed number of core workers live as long as the queue. When a task is
//! queued and no worker is waiting for work, an overflow worker is spawned
//! for it, so a delivery never waits behind an observer that blocks. Overflow
//! workers exit after sitting idle for the configured timeout.
//!
//! Tasks run on the submitting thread only when the queue was built without
//! core workers. Tasks submitted after shutdown each get a short-lived thread.

use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error};

/// How a submitted task was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    /// Handed to a notification thread
    Queued,
    /// Already ran on the submitting thread
    Inline,
}

/// Queue metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Number of tasks waiting in the queue.
    pub queue_depth: usize,
    /// Number of tasks currently being executed.
    pub active_tasks: usize,
    /// Total number of tasks completed, inline ones included.
    pub tasks_completed: u64,
    /// Tasks that panicked.
    pub tasks_panicked: u64,
    /// Tasks that ran on the submitting thread.
    pub inline_runs: u64,
    /// Overflow workers spawned because every worker was busy.
    pub overflow_spawned: u64,
    /// Number of live worker threads, core and overflow.
    pub worker_count: usize,
}

type Task = Box<dyn FnOnce() + Send>;

/// Queue contents and worker bookkeeping, guarded by one lock
#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Task>,
    /// Workers parked waiting for work
    idle: usize,
    /// Workers spawned but not yet looking for work
    starting: usize,
    /// Workers that have not exited
    live: usize,
}

struct QueueInner {
    state: Mutex<QueueState>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    queue_depth: AtomicUsize,
    active_tasks: AtomicUsize,
    idle_timeout: Duration,
    next_worker: AtomicUsize,
    tasks_completed: AtomicU64,
    tasks_panicked: AtomicU64,
    inline_runs: AtomicU64,
    overflow_spawned: AtomicU64,
}

impl QueueInner {
    fn run_isolated(&self, task: Task) {
        if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
            self.tasks_panicked.fetch_add(1, Ordering::Relaxed);
            error!(
                target: "livedoc::dispatch",
                "observer panicked: {}",
                panic_message(&*panic)
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("(non-string panic)")
}

/// FIFO delivery queue backed by an elastic worker pool.
pub struct NotificationQueue {
    inner: Arc<QueueInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    core_workers: usize,
}

impl NotificationQueue {
    /// Create a queue with `core_workers` long-lived worker threads.
    ///
    /// Workers are named `livedoc-notify-0`, `livedoc-notify-1`, etc. A worker
    /// that fails to spawn is logged and skipped; with no core workers at all
    /// every task runs inline. Overflow workers exit after `idle_timeout`
    /// without work.
    pub fn new(core_workers: usize, idle_timeout: Duration) -> Self {
        let inner = Arc::new(QueueInner {
            state: Mutex::new(QueueState::default()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            queue_depth: AtomicUsize::new(0),
            active_tasks: AtomicUsize::new(0),
            idle_timeout,
            next_worker: AtomicUsize::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_panicked: AtomicU64::new(0),
            inline_runs: AtomicU64::new(0),
            overflow_spawned: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(core_workers);
        for _ in 0..core_workers {
            if let Some(handle) = spawn_worker(&inner, WorkerKind::Core) {
                workers.push(handle);
            }
        }

        Self {
            core_workers: workers.len(),
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Submit a task.
    ///
    /// Never blocks and never drops the task. If no worker is free to take
    /// it, a new worker is started for it.
    pub fn submit(&self, work: impl FnOnce() + Send + 'static) -> Scheduled {
        if self.core_workers == 0 {
            return self.run_inline(Box::new(work));
        }

        let needs_worker = {
            // Shutdown is checked under the lock so a queued task is always
            // seen by a worker before it exits
            let mut state = self.inner.state.lock();
            if self.inner.shutdown.load(Ordering::Acquire) {
                drop(state);
                return self.run_detached(Box::new(work));
            }
            state.tasks.push_back(Box::new(work));
            self.inner.queue_depth.fetch_add(1, Ordering::Release);
            // Every queued task needs a free worker of its own
            state.tasks.len() > state.idle + state.starting
        };

        if needs_worker {
            self.spawn_overflow();
        } else {
            self.inner.work_ready.notify_one();
        }
        Scheduled::Queued
    }

    fn spawn_overflow(&self) {
        let Some(handle) = spawn_worker(&self.inner, WorkerKind::Overflow) else {
            // The task stays queued for the next free worker
            self.inner.work_ready.notify_one();
            return;
        };
        self.inner.overflow_spawned.fetch_add(1, Ordering::Relaxed);
        let mut workers = self.workers.lock();
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
    }

    fn run_inline(&self, task: Task) -> Scheduled {
        self.inner.inline_runs.fetch_add(1, Ordering::Relaxed);
        self.inner.run_isolated(task);
        self.inner.tasks_completed.fetch_add(1, Ordering::Relaxed);
        Scheduled::Inline
    }

    /// Run a late task on its own thread, tracked by `drain`
    fn run_detached(&self, task: Task) -> Scheduled {
        self.inner.active_tasks.fetch_add(1, Ordering::AcqRel);
        let slot = Arc::new(Mutex::new(Some(task)));
        let theirs = Arc::clone(&slot);
        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name("livedoc-notify-late".to_string())
            .spawn(move || {
                let _guard = ActiveTaskGuard { inner: &*inner };
                let task = theirs.lock().take();
                if let Some(task) = task {
                    inner.run_isolated(task);
                }
            });
        if let Err(e) = spawned {
            // Last resort: the thread limit is exhausted
            error!(
                target: "livedoc::dispatch",
                "failed to spawn late notification thread, delivering inline: {}", e
            );
            let _guard = ActiveTaskGuard {
                inner: &*self.inner,
            };
            let task = slot.lock().take();
            if let Some(task) = task {
                self.inner.inline_runs.fetch_add(1, Ordering::Relaxed);
                self.inner.run_isolated(task);
            }
            return Scheduled::Inline;
        }
        Scheduled::Queued
    }

    /// Block until all queued and in-flight tasks have completed.
    ///
    /// Workers remain running after drain completes.
    pub fn drain(&self) {
        let mut state = self.inner.state.lock();
        while self.inner.queue_depth.load(Ordering::Acquire) > 0
            || self.inner.active_tasks.load(Ordering::Acquire) > 0
        {
            self.inner.drain_cond.wait(&mut state);
        }
    }

    /// Signal workers to exit and join all threads.
    ///
    /// Workers finish every queued task before exiting. Tasks submitted
    /// afterwards each run on a short-lived thread of their own.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);

        // Notify under the lock so a worker between its shutdown check and
        // wait() cannot miss the wakeup.
        {
            let _state = self.inner.state.lock();
            self.inner.work_ready.notify_all();
        }

        let current = std::thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            // A task dropping the last queue handle runs on a worker
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }

    /// Return a snapshot of queue metrics.
    pub fn stats(&self) -> QueueStats {
        let worker_count = self.inner.state.lock().live;
        QueueStats {
            queue_depth: self.inner.queue_depth.load(Ordering::Relaxed),
            active_tasks: self.inner.active_tasks.load(Ordering::Relaxed),
            tasks_completed: self.inner.tasks_completed.load(Ordering::Relaxed),
            tasks_panicked: self.inner.tasks_panicked.load(Ordering::Relaxed),
            inline_runs: self.inner.inline_runs.load(Ordering::Relaxed),
            overflow_spawned: self.inner.overflow_spawned.load(Ordering::Relaxed),
            worker_count,
        }
    }
}

impl Drop for NotificationQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decrements `active_tasks` and wakes drain waiters, even if the task panicked.
struct ActiveTaskGuard<'a> {
    inner: &'a QueueInner,
}

impl<'a> Drop for ActiveTaskGuard<'a> {
    fn drop(&mut self) {
        self.inner.tasks_completed.fetch_add(1, Ordering::Relaxed);
        let prev_active = self.inner.active_tasks.fetch_sub(1, Ordering::Release);

        if prev_active == 1 && self.inner.queue_depth.load(Ordering::Acquire) == 0 {
            let _state = self.inner.state.lock();
            self.inner.drain_cond.notify_all();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerKind {
    Core,
    Overflow,
}

fn spawn_worker(inner: &Arc<QueueInner>, kind: WorkerKind) -> Option<JoinHandle<()>> {
    let id = inner.next_worker.fetch_add(1, Ordering::Relaxed);
    // Counted before the thread starts so concurrent submits see it
    {
        let mut state = inner.state.lock();
        state.live += 1;
        state.starting += 1;
    }
    let inner_clone = Arc::clone(inner);
    match std::thread::Builder::new()
        .name(format!("livedoc-notify-{}", id))
        .spawn(move || worker_loop(&inner_clone, kind))
    {
        Ok(handle) => Some(handle),
        Err(e) => {
            {
                let mut state = inner.state.lock();
                state.live -= 1;
                state.starting -= 1;
            }
            error!(
                target: "livedoc::dispatch",
                "failed to spawn notification worker {}: {}", id, e
            );
            None
        }
    }
}

fn worker_loop(inner: &QueueInner, kind: WorkerKind) {
    let mut started = false;
    loop {
        let task = {
            let mut state = inner.state.lock();
            if !started {
                state.starting -= 1;
                started = true;
            }
            loop {
                if let Some(task) = state.tasks.pop_front() {
                    inner.queue_depth.fetch_sub(1, Ordering::Release);
                    inner.active_tasks.fetch_add(1, Ordering::Release);
                    break task;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    state.live -= 1;
                    return;
                }
                state.idle += 1;
                let timed_out = match kind {
                    WorkerKind::Core => {
                        inner.work_ready.wait(&mut state);
                        false
                    }
                    WorkerKind::Overflow => inner
                        .work_ready
                        .wait_for(&mut state, inner.idle_timeout)
                        .timed_out(),
                };
                state.idle -= 1;
                if timed_out && state.tasks.is_empty() {
                    state.live -= 1;
                    debug!(target: "livedoc::dispatch", "overflow worker retired");
                    return;
                }
            }
        };

        let _guard = ActiveTaskGuard { inner };
        inner.run_isolated(task);
    }
}
