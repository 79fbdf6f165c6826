//! Ordered, Bounded Worker Pool
//!
//! The synchronous half of the server. Connection tasks submit [`Task`]s;
//! a fixed set of OS threads runs them through the [`Handler`], which is free
//! to block.
//!
//! ## Ordering
//!
//! Every connection owns a FIFO lane inside the shared pool state. A lane is
//! scheduled at most once at a time: it either waits in the global ready
//! queue or is being worked on by exactly one worker. After running the
//! lane's front task the worker puts the lane back at the end of the ready
//! queue if more tasks are waiting. Tasks of one connection therefore run in
//! submission order, one at a time, while different connections spread over
//! all workers.
//!
//! ```text
//!  submit(A1) submit(B1) submit(A2)
//!        │         │         │
//!        ▼         ▼         ▼
//!  lanes:  A: [A1, A2]   B: [B1]
//!  ready:  [A, B]
//!
//!  worker 0: A1 ──► (A back to ready) ──► A2
//!  worker 1: B1
//! ```
//!
//! ## Admission
//!
//! A task is outstanding from `submit` until it finishes running (or is
//! cancelled). `submit` refuses a task with [`SubmitError::QueueFull`] when
//! accepting it would exceed the outstanding task count, the outstanding
//! byte estimate, or the connection's own byte estimate. All three counters
//! live under the same mutex as the queues, so the bounds are exact.
//!
//! A refused caller waits on [`OrderedExecutor::wait_for_capacity`]; workers
//! wake those waiters whenever a task finishes while the pool is saturated.

use crate::commands::Handler;
use crate::config::{ConfigError, ExecutorConfig};
use crate::connection::ConnectionId;
use crate::executor::task::{execute, Completion, Task};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

/// Errors from starting a pool.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("invalid executor configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A task the pool refused. The task is handed back, never dropped.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Accepting the task would exceed an admission bound
    #[error("task queue is full")]
    QueueFull(Task),

    /// The pool no longer accepts tasks
    #[error("executor is shut down")]
    ShutDown(Task),
}

impl SubmitError {
    /// Takes back the refused task.
    pub fn into_task(self) -> Task {
        match self {
            SubmitError::QueueFull(task) | SubmitError::ShutDown(task) => task,
        }
    }
}

/// Pool counters.
#[derive(Debug, Default)]
pub struct ExecutorStats {
    /// Tasks accepted by `submit`
    pub submitted: AtomicU64,
    /// Tasks whose handler returned a reply
    pub completed: AtomicU64,
    /// Tasks whose handler failed or panicked
    pub failed: AtomicU64,
    /// Submissions refused with `QueueFull`
    pub rejected: AtomicU64,
    /// Queued tasks dropped by `cancel`
    pub cancelled: AtomicU64,
}

#[derive(Debug, Default)]
struct Lane {
    tasks: VecDeque<Task>,
    /// Estimated bytes of this connection's outstanding tasks
    bytes: usize,
    /// In the ready queue or on a worker
    scheduled: bool,
}

#[derive(Debug, Default)]
struct PoolState {
    lanes: HashMap<ConnectionId, Lane>,
    ready: VecDeque<ConnectionId>,
    queued_tasks: usize,
    queued_bytes: usize,
    saturated: bool,
    shutdown: bool,
}

impl PoolState {
    fn admits(&self, config: &ExecutorConfig, connection: ConnectionId, size: usize) -> bool {
        let lane_bytes = self.lanes.get(&connection).map_or(0, |lane| lane.bytes);

        self.queued_tasks < config.max_queued_tasks
            && self.queued_bytes + size <= config.max_queued_bytes
            && lane_bytes + size <= config.max_connection_bytes
    }

    /// Pops the front task of the next ready lane.
    fn next_task(&mut self) -> Option<Task> {
        while let Some(connection) = self.ready.pop_front() {
            let Some(lane) = self.lanes.get_mut(&connection) else {
                continue;
            };

            if let Some(task) = lane.tasks.pop_front() {
                return Some(task);
            }

            // Emptied by cancel while waiting in the ready queue
            lane.scheduled = false;
            if lane.bytes == 0 {
                self.lanes.remove(&connection);
            }
        }
        None
    }

    /// Releases a finished task. Returns true if its lane was rescheduled.
    fn finish(&mut self, connection: ConnectionId, size: usize) -> bool {
        self.queued_tasks -= 1;
        self.queued_bytes -= size;

        let Some(lane) = self.lanes.get_mut(&connection) else {
            return false;
        };
        lane.bytes -= size;

        if lane.tasks.is_empty() {
            lane.scheduled = false;
            if lane.bytes == 0 {
                self.lanes.remove(&connection);
            }
            false
        } else {
            self.ready.push_back(connection);
            true
        }
    }
}

struct Shared {
    state: Mutex<PoolState>,
    work_available: Condvar,
    capacity: Notify,
    handler: Arc<dyn Handler>,
    config: ExecutorConfig,
    stats: ExecutorStats,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Handlers run outside the lock, so a poisoned state is still consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self, task: Task) {
        let connection = task.connection();
        trace!(
            connection = %connection,
            waited_us = task.age().as_micros() as u64,
            "Running task"
        );

        let completion = execute(self.handler.as_ref(), task.line());
        match &completion {
            Completion::Done(_) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            Completion::Failed(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(connection = %connection, error = %e, "Task failed, nothing will be written");
            }
        }

        if !task.complete(completion) {
            trace!(connection = %connection, "Connection gone, completion dropped");
        }
    }
}

/// Fixed-size worker pool preserving per-connection order.
///
/// Shared between connection tasks behind an `Arc`. Dropping the pool shuts
/// it down and waits for queued tasks to drain.
pub struct OrderedExecutor {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl OrderedExecutor {
    /// Validates `config` and spawns the worker threads.
    pub fn start(config: ExecutorConfig, handler: Arc<dyn Handler>) -> Result<Self, ExecutorError> {
        config.validate()?;

        let worker_count = config.workers;
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState::default()),
            work_available: Condvar::new(),
            capacity: Notify::new(),
            handler,
            config,
            stats: ExecutorStats::default(),
        });

        let executor = Self {
            shared,
            workers: Mutex::new(Vec::with_capacity(worker_count)),
        };

        for index in 0..worker_count {
            let shared = Arc::clone(&executor.shared);
            let spawned = thread::Builder::new()
                .name(format!("hsha-worker-{index}"))
                .spawn(move || worker_loop(index, shared));

            match spawned {
                Ok(handle) => executor.lock_workers().push(handle),
                Err(e) => {
                    // Dropping the executor stops the workers already running
                    return Err(ExecutorError::Spawn(e));
                }
            }
        }

        let config = &executor.shared.config;
        info!(
            workers = config.workers,
            max_queued_tasks = config.max_queued_tasks,
            max_queued_bytes = config.max_queued_bytes,
            max_connection_bytes = config.max_connection_bytes,
            "Worker pool started"
        );

        Ok(executor)
    }

    /// Queues a task behind any earlier tasks of the same connection.
    ///
    /// # Errors
    ///
    /// - [`SubmitError::QueueFull`] if a task, byte, or per-connection byte
    ///   bound would be exceeded. The caller should stop reading from the
    ///   connection and retry after [`wait_for_capacity`](Self::wait_for_capacity).
    /// - [`SubmitError::ShutDown`] once [`shutdown`](Self::shutdown) started.
    pub fn submit(&self, task: Task) -> Result<(), SubmitError> {
        let connection = task.connection();
        let size = task.size();

        let mut guard = self.shared.lock();
        let state = &mut *guard;

        if state.shutdown {
            return Err(SubmitError::ShutDown(task));
        }

        if !state.admits(&self.shared.config, connection, size) {
            state.saturated = true;
            self.shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(
                connection = %connection,
                queued_tasks = state.queued_tasks,
                queued_bytes = state.queued_bytes,
                "Task refused, pool saturated"
            );
            return Err(SubmitError::QueueFull(task));
        }

        state.queued_tasks += 1;
        state.queued_bytes += size;

        let lane = state.lanes.entry(connection).or_default();
        lane.bytes += size;
        lane.tasks.push_back(task);

        let newly_scheduled = !lane.scheduled;
        if newly_scheduled {
            lane.scheduled = true;
            state.ready.push_back(connection);
        }
        drop(guard);

        self.shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
        if newly_scheduled {
            self.shared.work_available.notify_one();
        }
        Ok(())
    }

    /// Resolves once a task of `size` bytes for `connection` would be
    /// admitted, or once the pool is shutting down.
    pub async fn wait_for_capacity(&self, connection: ConnectionId, size: usize) {
        loop {
            let notified = self.shared.capacity.notified();
            tokio::pin!(notified);
            // Register before checking so a completion in between is not missed
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if state.shutdown || state.admits(&self.shared.config, connection, size) {
                    return;
                }
                state.saturated = true;
            }

            notified.await;
        }
    }

    /// Drops the connection's queued tasks that have not started yet.
    ///
    /// Returns the number of tasks dropped. A task already running still
    /// delivers its completion.
    pub fn cancel(&self, connection: ConnectionId) -> usize {
        let mut guard = self.shared.lock();
        let state = &mut *guard;

        let Some(lane) = state.lanes.get_mut(&connection) else {
            return 0;
        };

        let dropped: Vec<Task> = lane.tasks.drain(..).collect();
        let bytes: usize = dropped.iter().map(Task::size).sum();
        lane.bytes -= bytes;
        if !lane.scheduled && lane.bytes == 0 {
            state.lanes.remove(&connection);
        }

        state.queued_tasks -= dropped.len();
        state.queued_bytes -= bytes;
        let wake = !dropped.is_empty() && std::mem::take(&mut state.saturated);
        drop(guard);

        if !dropped.is_empty() {
            self.shared
                .stats
                .cancelled
                .fetch_add(dropped.len() as u64, Ordering::Relaxed);
            debug!(connection = %connection, dropped = dropped.len(), "Cancelled queued tasks");
        }
        if wake {
            self.shared.capacity.notify_waiters();
        }
        dropped.len()
    }

    /// Stops accepting tasks, lets the workers drain everything already
    /// queued, and joins them.
    ///
    /// Blocks the calling thread; from async code run it on
    /// `tokio::task::spawn_blocking`. Calling it again is a no-op.
    pub fn shutdown(&self) {
        let first = {
            let mut state = self.shared.lock();
            let first = !state.shutdown;
            state.shutdown = true;
            if first {
                info!(
                    queued_tasks = state.queued_tasks,
                    "Worker pool shutting down, draining queued tasks"
                );
            }
            first
        };

        self.shared.work_available.notify_all();
        self.shared.capacity.notify_waiters();

        let workers = std::mem::take(&mut *self.lock_workers());
        for handle in workers {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }

        if first {
            info!("Worker pool stopped");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.lock().shutdown
    }

    /// Outstanding (queued or running) tasks.
    pub fn queued_tasks(&self) -> usize {
        self.shared.lock().queued_tasks
    }

    /// Estimated bytes held by outstanding tasks.
    pub fn queued_bytes(&self) -> usize {
        self.shared.lock().queued_bytes
    }

    pub fn workers_len(&self) -> usize {
        self.shared.config.workers
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> &ExecutorStats {
        &self.shared.stats
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for OrderedExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(index: usize, shared: Arc<Shared>) {
    debug!(worker = index, "Worker started");

    loop {
        let task = {
            let mut state = shared.lock();
            loop {
                if let Some(task) = state.next_task() {
                    break task;
                }
                if state.shutdown {
                    debug!(worker = index, "Worker stopped");
                    return;
                }
                state = shared
                    .work_available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let connection = task.connection();
        let size = task.size();
        shared.run(task);

        let (rescheduled, wake) = {
            let mut state = shared.lock();
            let rescheduled = state.finish(connection, size);
            (rescheduled, std::mem::take(&mut state.saturated))
        };

        if rescheduled {
            shared.work_available.notify_one();
        }
        if wake {
            shared.capacity.notify_waiters();
        }
    }
}
