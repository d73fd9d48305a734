//! Bounded work queue shared by every transport and the dispatcher.
//!
//! Each queue is driven by one scheduler thread running [`WorkQueue::run`]:
//! - an optional poll callback runs once per iteration, work or not
//! - at most one item is dequeued per iteration, FIFO
//! - the work callback runs inline (single-task) or on a spawned task
//!   bounded by `max_tasks` (multitask, 0 = unbounded)
//! - shutdown is cooperative: in-flight callbacks finish, no new dequeues
//!
//! Enqueue/dequeue share one lock; the running-task count has its own lock so
//! producers never wait on task bookkeeping.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Work queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name, used for thread names and logs
    pub name: String,
    /// Run each item on its own task instead of inline
    pub multitask: bool,
    /// Maximum concurrently running tasks in multitask mode (0 = unlimited)
    pub max_tasks: usize,
    /// Maximum queued items (0 = unbounded)
    pub capacity: usize,
    /// Upper bound on lock acquisition
    pub lock_timeout: Duration,
    /// Scheduler wait when there is nothing to do; also the poll cadence
    pub idle_wait: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "sdp-queue".to_string(),
            multitask: false,
            max_tasks: 0,
            capacity: 0,
            lock_timeout: Duration::from_secs(5),
            idle_wait: Duration::from_millis(10),
        }
    }
}

/// Queue statistics
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Items whose work callback completed
    pub processed: AtomicU64,
    /// Poll callback invocations
    pub polls: AtomicU64,
    /// Enqueues rejected (full, shut down or lock timeout)
    pub rejected: AtomicU64,
    /// Highest running-task count observed
    pub peak_running: AtomicUsize,
}

impl QueueStats {
    /// Items processed so far
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Poll invocations so far
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    /// Rejected enqueues so far
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Highest concurrent task count seen
    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::Relaxed)
    }
}

type WorkFn<T> = Arc<dyn Fn(T) + Send + Sync>;
type PollFn<T> = Box<dyn Fn(&WorkQueue<T>) + Send + Sync>;

/// Builder wiring callbacks into a [`WorkQueue`].
pub struct WorkQueueBuilder<T> {
    config: QueueConfig,
    on_work: Option<WorkFn<T>>,
    on_poll: Option<PollFn<T>>,
}

impl<T: Send + 'static> WorkQueueBuilder<T> {
    /// Start a builder with the given configuration
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            on_work: None,
            on_poll: None,
        }
    }

    /// Callback consuming each dequeued item. Mandatory.
    pub fn on_work<F>(mut self, f: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.on_work = Some(Arc::new(f));
        self
    }

    /// Callback run once per scheduler iteration. It receives the queue so a
    /// driver can enqueue whatever it drained.
    pub fn on_poll<F>(mut self, f: F) -> Self
    where
        F: Fn(&WorkQueue<T>) + Send + Sync + 'static,
    {
        self.on_poll = Some(Box::new(f));
        self
    }

    /// Build the queue.
    ///
    /// # Errors
    /// Returns [`QueueError::InitFail`] when no work callback was configured.
    pub fn build(self) -> Result<Arc<WorkQueue<T>>, QueueError> {
        let on_work = self.on_work.ok_or_else(|| {
            QueueError::InitFail(format!("queue '{}' has no work callback", self.config.name))
        })?;
        if self.config.lock_timeout.is_zero() {
            return Err(QueueError::InitFail(format!(
                "queue '{}' lock timeout must be non-zero",
                self.config.name
            )));
        }

        debug!(
            queue = %self.config.name,
            multitask = self.config.multitask,
            max_tasks = self.config.max_tasks,
            capacity = self.config.capacity,
            "Work queue created"
        );

        Ok(Arc::new(WorkQueue {
            config: self.config,
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            running: Mutex::new(0),
            in_flight: AtomicUsize::new(0),
            task_done: Condvar::new(),
            blocked: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            on_work,
            on_poll: self.on_poll,
            stats: QueueStats::default(),
        }))
    }
}

/// Bounded FIFO work queue with a cooperative scheduler loop
pub struct WorkQueue<T> {
    config: QueueConfig,
    items: Mutex<VecDeque<T>>,
    available: Condvar,
    running: Mutex<usize>,
    // dequeued but not yet finished; bumped under the items lock
    in_flight: AtomicUsize,
    task_done: Condvar,
    blocked: AtomicBool,
    shutdown: AtomicBool,
    on_work: WorkFn<T>,
    on_poll: Option<PollFn<T>>,
    stats: QueueStats,
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Shorthand for [`WorkQueueBuilder::new`]
    pub fn builder(config: QueueConfig) -> WorkQueueBuilder<T> {
        WorkQueueBuilder::new(config)
    }

    /// Append an item at the tail.
    ///
    /// # Errors
    /// - [`QueueError::ShutDown`] once shutdown was requested
    /// - [`QueueError::LockTimeout`] if the queue lock could not be taken;
    ///   the item was not queued
    /// - [`QueueError::Busy`] when the queue is at capacity
    pub fn enqueue(&self, item: T) -> Result<(), QueueError> {
        if self.is_shutdown() {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(QueueError::ShutDown);
        }

        let Some(mut items) = self.items.try_lock_for(self.config.lock_timeout) else {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            error!(queue = %self.config.name, "Enqueue failed: lock timeout");
            return Err(QueueError::LockTimeout);
        };

        if self.config.capacity > 0 && items.len() >= self.config.capacity {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(QueueError::Busy);
        }

        items.push_back(item);
        trace!(queue = %self.config.name, depth = items.len(), "Item enqueued");
        drop(items);
        self.available.notify_one();
        Ok(())
    }

    /// Drive the queue on the calling thread until shutdown.
    ///
    /// Returns after shutdown once every running task has completed.
    pub fn run(self: &Arc<Self>) {
        info!(queue = %self.config.name, "Work queue running");

        while !self.is_shutdown() {
            if let Some(poll) = &self.on_poll {
                poll(self);
                self.stats.polls.fetch_add(1, Ordering::Relaxed);
            }

            if self.is_blocked() {
                self.idle(false);
                continue;
            }

            if self.config.multitask && !self.wait_for_slot() {
                continue;
            }

            match self.pop() {
                Ok(Some(item)) => self.dispatch(item),
                Ok(None) => self.idle(true),
                Err(e) => error!(queue = %self.config.name, "Dequeue failed: {}", e),
            }
        }

        self.wait_drained();

        let dropped = self.items.lock().drain(..).count();
        if dropped > 0 {
            warn!(
                queue = %self.config.name,
                "Dropped {} queued items at teardown", dropped
            );
        }

        info!(
            queue = %self.config.name,
            "Work queue stopped (processed {} items, {} polls)",
            self.stats.processed(),
            self.stats.polls()
        );
    }

    /// Run the scheduler on a dedicated named thread.
    ///
    /// # Errors
    /// Returns an error if the OS refuses to create the thread.
    pub fn spawn(self: &Arc<Self>) -> io::Result<JoinHandle<()>> {
        let queue = Arc::clone(self);
        thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || queue.run())
    }

    /// Request cooperative shutdown. In-flight callbacks are not interrupted.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            debug!(queue = %self.config.name, "Shutdown requested");
        }
        self.available.notify_all();
        self.task_done.notify_all();
    }

    /// Stop dequeuing without refusing new items
    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::Release);
        if !blocked {
            self.available.notify_one();
        }
    }

    /// Whether dequeuing is suspended
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    /// Whether shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tasks currently running
    pub fn running_tasks(&self) -> usize {
        *self.running.lock()
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Queue statistics
    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Block until the queue is empty with no running task, or `timeout` passes.
    /// Returns true if the queue went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_empty() && self.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn pop(&self) -> Result<Option<T>, QueueError> {
        let mut items = self
            .items
            .try_lock_for(self.config.lock_timeout)
            .ok_or(QueueError::LockTimeout)?;
        let item = items.pop_front();
        if item.is_some() {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
        }
        Ok(item)
    }

    fn idle(&self, only_if_empty: bool) {
        let mut items = self.items.lock();
        if only_if_empty && !items.is_empty() {
            return;
        }
        if !self.is_shutdown() {
            self.available.wait_for(&mut items, self.config.idle_wait);
        }
    }

    /// Wait for a free task slot. Returns false if none opened within one idle period.
    fn wait_for_slot(&self) -> bool {
        if self.config.max_tasks == 0 {
            return true;
        }
        let Some(mut running) = self.running.try_lock_for(self.config.lock_timeout) else {
            error!(queue = %self.config.name, "Task count lock timeout");
            return false;
        };
        if *running >= self.config.max_tasks {
            self.task_done.wait_for(&mut running, self.config.idle_wait);
        }
        *running < self.config.max_tasks
    }

    fn dispatch(self: &Arc<Self>, item: T) {
        if !self.config.multitask {
            (self.on_work)(item);
            self.stats.processed.fetch_add(1, Ordering::Relaxed);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        {
            let mut running = self.running.lock();
            *running += 1;
            self.stats.peak_running.fetch_max(*running, Ordering::Relaxed);
        }

        let queue = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-task", self.config.name))
            .spawn(move || {
                let _guard = TaskGuard { queue: &queue };
                (queue.on_work)(item);
            });

        if let Err(e) = spawned {
            error!(queue = %self.config.name, "Failed to spawn task: {}", e);
            self.finish_task();
        }
    }

    fn finish_task(&self) {
        let mut running = self.running.lock();
        *running = running.saturating_sub(1);
        drop(running);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.task_done.notify_all();
    }

    fn wait_drained(&self) {
        let mut running = self.running.lock();
        while *running > 0 {
            debug!(
                queue = %self.config.name,
                "Waiting for {} running tasks", *running
            );
            self.task_done.wait_for(&mut running, self.config.idle_wait);
        }
    }
}

/// Decrements the running count when a task ends, even by panic.
struct TaskGuard<'a, T: Send + 'static> {
    queue: &'a WorkQueue<T>,
}

impl<T: Send + 'static> Drop for TaskGuard<'_, T> {
    fn drop(&mut self) {
        self.queue.stats.processed.fetch_add(1, Ordering::Relaxed);
        self.queue.finish_task();
    }
}

/// Work queue errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Queue is at capacity
    #[error("Work queue is full")]
    Busy,

    /// Queue is shutting down
    #[error("Work queue is shut down")]
    ShutDown,

    /// Lock could not be acquired in time
    #[error("Work queue lock timeout")]
    LockTimeout,

    /// Queue misconfigured
    #[error("Work queue init failed: {0}")]
    InitFail(String),
}
