//! Task scheduler: priority queue plus admission control.
//!
//! Ready tasks wait in a binary heap keyed by `(priority, enqueue seq)`.
//! A single dispatcher loop pops tasks in priority order and admits each
//! cooperatively: rate-limit tokens first (holding no concurrency slot),
//! then every concurrency slot all-or-nothing. A task that cannot acquire
//! waits on the first blocking resource without reserving anything, so
//! waiters cannot deadlock each other. Slots are released atomically when
//! the task's future finishes.

pub mod limits;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::WorkflowError;

pub use limits::{
    RateLimitConfig, RateLimiter, RateLimiterRegistry, ResourceLimits, ResourceManager,
    TaskClaims, UsageStats,
};

/// A unit of work handed to the scheduler. The future owns everything it
/// needs, including reporting its outcome back to whoever submitted it.
pub struct ScheduledTask {
    pub execution_id: Uuid,
    pub node_id: String,
    pub priority: i32,
    pub claims: TaskClaims,
    pub cancellation: CancellationToken,
    pub run: BoxFuture<'static, ()>,
}

struct QueueEntry {
    priority: i32,
    seq: u64,
    task: ScheduledTask,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins, earlier submission breaks ties.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Point-in-time scheduler counters.
#[derive(Clone, Debug, Default)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    pub usage: UsageStats,
}

pub struct TaskScheduler {
    queue: Mutex<BinaryHeap<QueueEntry>>,
    queued: Notify,
    resources: ResourceManager,
    rate_limits: RateLimiterRegistry,
    running: AtomicUsize,
    seq: AtomicU64,
    max_queue_len: usize,
    shutdown: CancellationToken,
}

impl TaskScheduler {
    pub fn new(limits: ResourceLimits, rate_limits: RateLimiterRegistry) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(BinaryHeap::new()),
            queued: Notify::new(),
            resources: ResourceManager::new(limits),
            rate_limits,
            running: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            max_queue_len: 100_000,
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the dispatcher loop. Idempotent shutdown via [`stop`].
    ///
    /// [`stop`]: TaskScheduler::stop
    pub fn start(self: &Arc<Self>) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!("task scheduler started");
            loop {
                let entry = {
                    let mut queue = scheduler.queue.lock().expect("scheduler queue lock");
                    queue.pop()
                };
                match entry {
                    Some(entry) => {
                        if scheduler.admit_and_launch(entry.task).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = scheduler.shutdown.cancelled() => break,
                            _ = scheduler.queued.notified() => {}
                        }
                    }
                }
            }
            info!("task scheduler stopped");
        });
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
        self.queued.notify_waiters();
    }

    /// Enqueue a ready task.
    pub fn submit(&self, task: ScheduledTask) -> Result<(), WorkflowError> {
        let mut queue = self.queue.lock().expect("scheduler queue lock");
        if queue.len() >= self.max_queue_len {
            return Err(WorkflowError::ResourceExhausted(format!(
                "scheduler queue is full ({} tasks)",
                queue.len()
            )));
        }
        let seq = self.seq.fetch_add(1, AtomicOrdering::SeqCst);
        debug!(
            node_id = %task.node_id,
            execution_id = %task.execution_id,
            priority = task.priority,
            "task queued"
        );
        queue.push(QueueEntry {
            priority: task.priority,
            seq,
            task,
        });
        drop(queue);
        self.queued.notify_one();
        Ok(())
    }

    /// Admit one task in priority order, then launch it. Admission is
    /// cooperative: rate-limit tokens are taken first while holding no
    /// slots, then every concurrency slot all-or-nothing. A cancelled
    /// task still launches (so its owner can record the cancellation) but
    /// takes no tokens or slots. Returns `Err` only on shutdown.
    async fn admit_and_launch(self: &Arc<Self>, task: ScheduledTask) -> Result<(), ()> {
        let claims = task.claims.clone();
        let cancellation = task.cancellation.clone();

        let mut admitted = false;
        if !cancellation.is_cancelled() {
            if let Some(key) = &claims.resource_key {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(()),
                    _ = cancellation.cancelled() => {}
                    _ = self.rate_limits.acquire(key) => {}
                }
            }
            if !cancellation.is_cancelled() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(()),
                    _ = cancellation.cancelled() => {}
                    _ = self.resources.acquire(&claims) => admitted = true,
                }
            }
        }

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.running.fetch_add(1, AtomicOrdering::SeqCst);
            task.run.await;
            scheduler.running.fetch_sub(1, AtomicOrdering::SeqCst);
            if admitted {
                scheduler.resources.release(&claims);
            }
        });
        Ok(())
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queued: self.queue.lock().expect("scheduler queue lock").len(),
            running: self.running.load(AtomicOrdering::SeqCst),
            usage: self.resources.stats(),
        }
    }
}
