mod worker;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::PoolConfig;
use crate::error::{Result, SluiceError};
use crate::hash::ContentHash;
use crate::source::ChunkSource;

/// Number of workers started eagerly; the rest are created on demand.
const INITIAL_WORKERS: usize = 2;

/// Process-unique id for a submitted pool task.
///
/// Ids are allocated from a monotonic counter and never reused while the
/// task is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// A hashing request: stream one source's chunk ranges, in index order,
/// through the fingerprint accumulator.
pub struct HashRequest {
    pub source: Arc<dyn ChunkSource>,
    pub chunk_size: u64,
    pub cancel: CancelToken,
}

pub(crate) enum WorkerEvent {
    Progress { percent: u8 },
    Complete { hash: ContentHash },
    Failed { error: SluiceError },
}

pub(crate) struct PoolTask {
    pub(crate) id: TaskId,
    pub(crate) request: HashRequest,
    pub(crate) events: Sender<WorkerEvent>,
}

struct WorkerSlot {
    mailbox: Sender<PoolTask>,
    /// Tasks dispatched to this worker and not yet finished. Never
    /// exceeds `max_tasks_per_worker`.
    outstanding: usize,
}

struct PoolState {
    workers: Vec<WorkerSlot>,
    queue: VecDeque<PoolTask>,
    shutdown: bool,
}

pub(crate) struct PoolShared {
    max_workers: usize,
    max_tasks_per_worker: usize,
    shutting_down: AtomicBool,
    state: Mutex<PoolState>,
}

impl PoolShared {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Bookkeeping after a worker finished one task: free its slot and
    /// hand queued work to any worker with spare capacity.
    pub(crate) fn task_finished(&self, index: usize) {
        let mut st = self.state.lock().unwrap();
        if let Some(slot) = st.workers.get_mut(index) {
            slot.outstanding = slot.outstanding.saturating_sub(1);
        }
        drain_queue(&mut st, self.max_tasks_per_worker);
    }

    /// A worker's execution context crashed: `rejected` outstanding tasks
    /// were failed, its count drops back accordingly, and queued work is
    /// redistributed. Other workers are unaffected.
    pub(crate) fn worker_crashed(&self, index: usize, rejected: usize) {
        let mut st = self.state.lock().unwrap();
        if let Some(slot) = st.workers.get_mut(index) {
            slot.outstanding = slot.outstanding.saturating_sub(rejected);
        }
        drain_queue(&mut st, self.max_tasks_per_worker);
    }
}

fn drain_queue(st: &mut PoolState, max_tasks_per_worker: usize) {
    while !st.queue.is_empty() {
        let Some(idx) = find_spare_worker(st, max_tasks_per_worker) else {
            break;
        };
        let Some(task) = st.queue.pop_front() else {
            break;
        };
        dispatch_to(st, idx, task);
    }
}

fn find_spare_worker(st: &PoolState, max_tasks_per_worker: usize) -> Option<usize> {
    st.workers
        .iter()
        .position(|w| w.outstanding < max_tasks_per_worker)
}

fn dispatch_to(st: &mut PoolState, index: usize, task: PoolTask) {
    let slot = &mut st.workers[index];
    slot.outstanding += 1;
    if let Err(send_err) = slot.mailbox.send(task) {
        slot.outstanding -= 1;
        let task = send_err.into_inner();
        let _ = task.events.send(WorkerEvent::Failed {
            error: SluiceError::WorkerFatal("worker mailbox closed".into()),
        });
    }
}

/// Awaitable handle for one submitted hashing task.
pub struct TaskHandle {
    id: TaskId,
    events: Receiver<WorkerEvent>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Block until the task completes, forwarding progress percentages to
    /// `on_progress` on the calling thread.
    pub fn wait(self, mut on_progress: Option<&mut dyn FnMut(u8)>) -> Result<ContentHash> {
        for event in self.events.iter() {
            match event {
                WorkerEvent::Progress { percent } => {
                    if let Some(callback) = on_progress.as_deref_mut() {
                        callback(percent);
                    }
                }
                WorkerEvent::Complete { hash } => return Ok(hash),
                WorkerEvent::Failed { error } => return Err(error),
            }
        }
        Err(SluiceError::WorkerFatal(
            "hash worker disconnected without a result".into(),
        ))
    }
}

/// Point-in-time pool counters, for logs and status displays.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    pub workers: usize,
    pub max_workers: usize,
    pub active_tasks: usize,
    pub queued_tasks: usize,
}

/// Bounded pool of hash worker threads.
///
/// Placement policy: prefer an existing worker with spare capacity; grow
/// up to `max_workers` when none has; otherwise queue FIFO. Every task
/// completion re-drains the queue, so capacity is never left idle while
/// work waits. Constructed explicitly and shared by reference — there is
/// no process-wide instance.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    next_task_id: AtomicU64,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(config: &PoolConfig) -> Self {
        let max_workers = config.effective_max_workers().max(1);
        let pool = Self {
            shared: Arc::new(PoolShared {
                max_workers,
                max_tasks_per_worker: config.max_tasks_per_worker.max(1),
                shutting_down: AtomicBool::new(false),
                state: Mutex::new(PoolState {
                    workers: Vec::new(),
                    queue: VecDeque::new(),
                    shutdown: false,
                }),
            }),
            next_task_id: AtomicU64::new(1),
            threads: Mutex::new(Vec::new()),
        };

        {
            let mut st = pool.shared.state.lock().unwrap();
            for _ in 0..INITIAL_WORKERS.min(max_workers) {
                pool.spawn_worker(&mut st);
            }
        }
        pool
    }

    /// Submit a hashing task. Returns immediately with a handle; the
    /// result is delivered through [`TaskHandle::wait`].
    pub fn execute(&self, request: HashRequest) -> Result<TaskHandle> {
        let id = TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed));
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let task = PoolTask {
            id,
            request,
            events: events_tx,
        };

        let mut st = self.shared.state.lock().unwrap();
        if st.shutdown {
            return Err(SluiceError::PoolShutdown);
        }

        if let Some(idx) = find_spare_worker(&st, self.shared.max_tasks_per_worker) {
            dispatch_to(&mut st, idx, task);
        } else if st.workers.len() < self.shared.max_workers {
            let idx = self.spawn_worker(&mut st);
            dispatch_to(&mut st, idx, task);
        } else {
            debug!(%id, queued = st.queue.len() + 1, "pool at capacity, queueing task");
            st.queue.push_back(task);
        }
        drop(st);

        Ok(TaskHandle {
            id,
            events: events_rx,
        })
    }

    /// Hash several sources concurrently through this pool, preserving
    /// input order in the results.
    pub fn hash_files(
        &self,
        sources: &[Arc<dyn ChunkSource>],
        chunk_size: u64,
        cancel: &CancelToken,
    ) -> Vec<Result<ContentHash>> {
        let handles: Vec<Result<TaskHandle>> = sources
            .iter()
            .map(|source| {
                self.execute(HashRequest {
                    source: Arc::clone(source),
                    chunk_size,
                    cancel: cancel.clone(),
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.and_then(|h| h.wait(None)))
            .collect()
    }

    pub fn status(&self) -> PoolStatus {
        let st = self.shared.state.lock().unwrap();
        PoolStatus {
            workers: st.workers.len(),
            max_workers: self.shared.max_workers,
            active_tasks: st.workers.iter().map(|w| w.outstanding).sum(),
            queued_tasks: st.queue.len(),
        }
    }

    /// Tear the pool down: reject queued tasks, stop accepting new ones,
    /// and join all worker threads. Tasks already being processed run to
    /// completion; tasks waiting in worker mailboxes are rejected.
    pub fn shutdown(&self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.shutdown {
                return;
            }
            st.shutdown = true;
            self.shared.shutting_down.store(true, Ordering::SeqCst);
            for task in st.queue.drain(..) {
                let _ = task.events.send(WorkerEvent::Failed {
                    error: SluiceError::PoolShutdown,
                });
            }
            // Dropping the senders closes every mailbox.
            st.workers.clear();
        }
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }

    /// Spawn a worker thread and register its slot. Caller holds the
    /// state lock.
    fn spawn_worker(&self, st: &mut PoolState) -> usize {
        let index = st.workers.len();
        let (mailbox_tx, mailbox_rx) = crossbeam_channel::unbounded::<PoolTask>();
        st.workers.push(WorkerSlot {
            mailbox: mailbox_tx,
            outstanding: 0,
        });

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::spawn(move || worker::run_worker(index, mailbox_rx, shared));
        self.threads.lock().unwrap().push(handle);
        debug!(worker = index, "spawned hash worker");
        index
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
