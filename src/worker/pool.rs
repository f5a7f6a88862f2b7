// =============================================================================
// Worker Dispatch Pool
// =============================================================================
//
// Fixed set of OS threads, each with its own crossbeam inbox. Responses flow
// back over one shared channel to a collector thread that correlates them by
// task id, returns the worker to the idle queue and completes the caller's
// oneshot.
//
// Acquisition is cooperative polling: `execute` sleeps `poll_interval` while
// no worker is idle, so a saturated pool slows callers down instead of
// queuing unbounded work in memory.
//
// A handler error rejects only that task. A handler panic kills the worker
// thread: the task is rejected, a `PoolEvent::WorkerCrashed` is broadcast and
// the worker is NOT respawned. The pool keeps running on the survivors.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use super::task::{run_task, TaskKind, TaskOutput, WorkerTask};
use crate::error::{PipelineError, Result};

pub type TaskHandler = Arc<dyn Fn(WorkerTask) -> Result<TaskOutput> + Send + Sync>;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Pool-level notifications, for anything that is not a task's own result.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    WorkerCrashed {
        worker: usize,
        task_id: u64,
        message: String,
    },
    UnknownResponse {
        id: u64,
    },
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Available hardware concurrency, or 1 when it cannot be determined.
pub fn default_pool_size() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

// ---------------------------------------------------------------------------
// Messages between the pool, workers and the collector
// ---------------------------------------------------------------------------

enum Envelope {
    Task { id: u64, task: WorkerTask },
    Shutdown,
}

enum Reply {
    Done {
        worker: usize,
        id: u64,
        outcome: Result<TaskOutput>,
    },
    Crashed {
        worker: usize,
        id: u64,
        message: String,
    },
}

struct Shared {
    idle: Mutex<VecDeque<usize>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<TaskOutput>>>>,
    alive: AtomicUsize,
    events: broadcast::Sender<PoolEvent>,
}

impl Shared {
    /// Route one reply to its caller. Unknown ids are dropped.
    fn deliver(&self, reply: Reply) {
        match reply {
            Reply::Done {
                worker,
                id,
                outcome,
            } => {
                let waiter = self.pending.lock().remove(&id);
                // Release the slot before waking the caller.
                self.idle.lock().push_back(worker);
                match waiter {
                    Some(tx) => {
                        // Receiver gone means the caller stopped waiting.
                        let _ = tx.send(outcome);
                    }
                    None => {
                        debug!(id, worker, "response for unknown task id, dropping");
                        let _ = self.events.send(PoolEvent::UnknownResponse { id });
                    }
                }
            }
            Reply::Crashed {
                worker,
                id,
                message,
            } => {
                self.alive.fetch_sub(1, Ordering::AcqRel);
                error!(worker, task_id = id, error = %message, "worker crashed, not respawning");
                if let Some(tx) = self.pending.lock().remove(&id) {
                    let _ = tx.send(Err(PipelineError::worker(format!(
                        "worker {worker} crashed: {message}"
                    ))));
                }
                let _ = self.events.send(PoolEvent::WorkerCrashed {
                    worker,
                    task_id: id,
                    message,
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

pub struct WorkerPool {
    shared: Arc<Shared>,
    inboxes: Vec<Sender<Envelope>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    poll_interval: Duration,
}

impl WorkerPool {
    /// Pool running the built-in task handler.
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::with_handler(config, Arc::new(run_task))
    }

    pub fn with_handler(config: PoolConfig, handler: TaskHandler) -> Result<Self> {
        let size = config.size.max(1);
        let (events, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            idle: Mutex::new((0..size).collect()),
            pending: Mutex::new(HashMap::new()),
            alive: AtomicUsize::new(size),
            events,
        });

        let (reply_tx, reply_rx) = unbounded::<Reply>();
        let mut inboxes = Vec::with_capacity(size);
        let mut threads = Vec::with_capacity(size + 1);

        for worker in 0..size {
            let (tx, rx) = unbounded::<Envelope>();
            let handler = handler.clone();
            let replies = reply_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("tickflow-worker-{worker}"))
                .spawn(move || worker_loop(worker, rx, replies, handler))
                .map_err(|e| PipelineError::worker(format!("failed to spawn worker: {e}")))?;
            inboxes.push(tx);
            threads.push(handle);
        }
        // The collector exits once every worker has dropped its reply sender.
        drop(reply_tx);

        let collector_shared = shared.clone();
        let collector = thread::Builder::new()
            .name("tickflow-collector".into())
            .spawn(move || collector_loop(reply_rx, collector_shared))
            .map_err(|e| PipelineError::worker(format!("failed to spawn collector: {e}")))?;
        threads.push(collector);

        info!(workers = size, poll_ms = config.poll_interval.as_millis() as u64, "worker pool started");

        Ok(Self {
            shared,
            inboxes,
            threads: Mutex::new(threads),
            next_id: AtomicU64::new(1),
            poll_interval: config.poll_interval,
        })
    }

    pub fn size(&self) -> usize {
        self.inboxes.len()
    }

    pub fn available_workers(&self) -> usize {
        self.shared.idle.lock().len()
    }

    pub fn alive_workers(&self) -> usize {
        self.shared.alive.load(Ordering::Acquire)
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until a worker is idle and claim it.
    async fn get_worker(&self) -> Result<usize> {
        loop {
            if let Some(worker) = self.shared.idle.lock().pop_front() {
                return Ok(worker);
            }
            if self.alive_workers() == 0 {
                return Err(PipelineError::worker("no live workers left in pool"));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Run `task` on the next idle worker.
    ///
    /// Dropping the returned future does not cancel the task; it runs to
    /// completion and its result is discarded.
    pub async fn execute(&self, task: WorkerTask) -> Result<TaskOutput> {
        let kind: TaskKind = task.kind();
        let worker = self.get_worker().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        if self.inboxes[worker].send(Envelope::Task { id, task }).is_err() {
            self.shared.pending.lock().remove(&id);
            return Err(PipelineError::worker(format!("worker {worker} is not accepting tasks")));
        }
        debug!(id, worker, kind = %kind, "task dispatched");

        rx.await
            .map_err(|_| PipelineError::worker("pool shut down before task completed"))?
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for inbox in &self.inboxes {
            let _ = inbox.send(Envelope::Shutdown);
        }
        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                warn!("pool thread panicked during shutdown");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

fn worker_loop(worker: usize, inbox: Receiver<Envelope>, replies: Sender<Reply>, handler: TaskHandler) {
    while let Ok(Envelope::Task { id, task }) = inbox.recv() {
        let kind = task.kind();
        match panic::catch_unwind(AssertUnwindSafe(|| handler(task))) {
            Ok(outcome) => {
                let outcome = outcome.map_err(|e| match e {
                    PipelineError::WorkerFailure(_) => e,
                    other => PipelineError::worker(format!("{kind} task failed: {other}")),
                });
                if replies.send(Reply::Done { worker, id, outcome }).is_err() {
                    break;
                }
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let _ = replies.send(Reply::Crashed { worker, id, message });
                // The worker is dead from here on.
                break;
            }
        }
    }
}

fn collector_loop(replies: Receiver<Reply>, shared: Arc<Shared>) {
    for reply in replies.iter() {
        shared.deliver(reply);
    }
    debug!("collector stopped");
}
