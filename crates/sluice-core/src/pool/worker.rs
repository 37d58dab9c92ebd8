use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use crate::chunk::split_chunks;
use crate::error::SluiceError;
use crate::hash::ContentHasher;

use super::{PoolShared, PoolTask, WorkerEvent};

/// Body of one hash worker thread.
///
/// Tasks in the mailbox run strictly sequentially; concurrency comes from
/// the pool running several workers. A panic while processing one task is
/// contained: the current task and everything still waiting in this
/// worker's mailbox fail with [`SluiceError::WorkerFatal`], the pool's
/// outstanding count for this worker resets, and the thread keeps serving
/// subsequent dispatches.
pub(crate) fn run_worker(index: usize, mailbox: Receiver<PoolTask>, shared: Arc<PoolShared>) {
    for task in mailbox.iter() {
        if shared.is_shutdown() {
            let _ = task.events.send(WorkerEvent::Failed {
                error: SluiceError::PoolShutdown,
            });
            shared.task_finished(index);
            continue;
        }

        let events = task.events.clone();
        match catch_unwind(AssertUnwindSafe(|| hash_task(&task))) {
            Ok(()) => shared.task_finished(index),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                warn!(worker = index, "hash worker crashed: {msg}");
                let _ = events.send(WorkerEvent::Failed {
                    error: SluiceError::WorkerFatal(msg.clone()),
                });

                let mut rejected = 1usize;
                while let Ok(queued) = mailbox.try_recv() {
                    let _ = queued.events.send(WorkerEvent::Failed {
                        error: SluiceError::WorkerFatal(msg.clone()),
                    });
                    rejected += 1;
                }
                shared.worker_crashed(index, rejected);
            }
        }
    }
    debug!(worker = index, "hash worker exiting");
}

/// Stream one source through the fingerprint accumulator, chunk by chunk
/// in index order, reporting progress after each chunk.
fn hash_task(task: &PoolTask) {
    let request = &task.request;
    let chunks = split_chunks(request.source.len(), request.chunk_size);
    let total = chunks.len();
    let mut hasher = ContentHasher::new();

    for chunk in &chunks {
        if request.cancel.is_cancelled() {
            let _ = task.events.send(WorkerEvent::Failed {
                error: SluiceError::Cancelled,
            });
            return;
        }

        let data = match request.source.read_range(chunk.start, chunk.end) {
            Ok(data) => data,
            Err(e) => {
                let _ = task.events.send(WorkerEvent::Failed {
                    error: SluiceError::HashRead(format!("chunk {}: {e}", chunk.index)),
                });
                return;
            }
        };
        hasher.update(&data);

        let percent = (((chunk.index + 1) as f64 / total as f64) * 100.0).round() as u8;
        let _ = task.events.send(WorkerEvent::Progress { percent });
    }

    let _ = task.events.send(WorkerEvent::Complete {
        hash: hasher.finalize(),
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
