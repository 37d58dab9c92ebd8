use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::debug;

use crate::api::{ChunkMeta, UploadEndpoint};
use crate::config::TransferConfig;
use crate::error::{Result, SluiceError};
use crate::progress::{emit, ProgressFn, UploadProgressEvent};
use crate::resume::CACHE_WRITE_INTERVAL;
use crate::source::ChunkSource;

use super::{TaskControl, UploadFile};

/// Why a scheduling round ended.
pub(crate) enum ScheduleOutcome {
    /// Every chunk is confirmed uploaded.
    Completed,
    /// A pause request stopped dispatching; in-flight chunks finished.
    Paused,
    Cancelled,
    /// One chunk exhausted its retry budget (or hit a permanent error).
    Failed { index: usize, error: SluiceError },
}

/// One chunk's dispatch descriptor, detached from the file record so
/// upload threads can work while the consumer mutates chunk state.
struct ChunkJob {
    index: usize,
    start: u64,
    end: u64,
}

enum UploadEvent {
    Progress { index: usize, sent: u64, total: u64 },
    Done { index: usize },
    Failed { index: usize, error: SluiceError },
}

/// Upload every not-yet-uploaded chunk with bounded concurrency.
///
/// Work channel -> N upload threads -> event channel -> this thread as
/// the sequential consumer updating chunk and aggregate progress.
/// Dispatch follows chunk order; completion order is unspecified. Workers
/// stop pulling new jobs on pause, cancellation, or after any chunk
/// exhausts its retries; chunks already in flight run to completion
/// either way.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_scheduler(
    file: &mut UploadFile,
    file_hash: &str,
    source: &Arc<dyn ChunkSource>,
    endpoint: &Arc<dyn UploadEndpoint>,
    transfer: &TransferConfig,
    control: &TaskControl,
    progress: &mut ProgressFn<'_>,
    persist: &mut dyn FnMut(&UploadFile),
) -> ScheduleOutcome {
    let jobs: Vec<ChunkJob> = file
        .chunks
        .iter()
        .filter(|c| !c.uploaded)
        .map(|c| ChunkJob {
            index: c.index,
            start: c.start,
            end: c.end,
        })
        .collect();
    if jobs.is_empty() {
        return ScheduleOutcome::Completed;
    }

    let file_name = file.name.clone();
    let file_size = file.size;
    let total_chunks = file.chunks.len();
    let concurrency = transfer.max_concurrent_uploads.clamp(1, jobs.len());
    debug!(
        file = %file_name,
        pending = jobs.len(),
        concurrency,
        "dispatching chunk uploads"
    );

    let abort = AtomicBool::new(false);
    let mut first_failure: Option<(usize, SluiceError)> = None;
    let mut completions = 0usize;

    std::thread::scope(|s| {
        let (work_tx, work_rx) = crossbeam_channel::unbounded::<ChunkJob>();
        for job in jobs {
            let _ = work_tx.send(job);
        }
        drop(work_tx);

        let (event_tx, event_rx) = crossbeam_channel::unbounded::<UploadEvent>();

        for _ in 0..concurrency {
            let work_rx = work_rx.clone();
            let event_tx = event_tx.clone();
            let abort = &abort;
            let file_name = file_name.as_str();
            s.spawn(move || {
                for job in work_rx.iter() {
                    if control.cancel.is_cancelled()
                        || control.is_pause_requested()
                        || abort.load(Ordering::Relaxed)
                    {
                        break;
                    }
                    match upload_one(
                        &job, file_hash, file_name, file_size, total_chunks, source, endpoint,
                        transfer, control, &event_tx,
                    ) {
                        Ok(()) => {
                            let _ = event_tx.send(UploadEvent::Done { index: job.index });
                        }
                        Err(e) if e.is_cancelled() => break,
                        Err(e) => {
                            let _ = event_tx.send(UploadEvent::Failed {
                                index: job.index,
                                error: e,
                            });
                            abort.store(true, Ordering::Relaxed);
                            break;
                        }
                    }
                }
            });
        }
        drop(work_rx);
        drop(event_tx);

        // Sequential consumer: the only writer of chunk state.
        for event in event_rx.iter() {
            match event {
                UploadEvent::Progress { index, sent, total } => {
                    let percent = if total == 0 {
                        100
                    } else {
                        (((sent as f64 / total as f64) * 100.0).round() as u8).min(100)
                    };
                    file.chunks[index].progress = percent;
                    file.recompute_progress();
                    emit(
                        progress,
                        UploadProgressEvent::StatsUpdated {
                            file: file.name.clone(),
                            bytes_uploaded: file.bytes_uploaded,
                            total_bytes: file.size,
                            percent: file.progress,
                        },
                    );
                }
                UploadEvent::Done { index } => {
                    file.chunks[index].uploaded = true;
                    file.chunks[index].progress = 100;
                    file.recompute_progress();
                    completions += 1;
                    if completions % CACHE_WRITE_INTERVAL == 0 {
                        persist(file);
                    }
                    emit(
                        progress,
                        UploadProgressEvent::ChunkUploaded {
                            file: file.name.clone(),
                            index,
                            uploaded_chunks: file.uploaded_chunk_count(),
                            total_chunks,
                        },
                    );
                    emit(
                        progress,
                        UploadProgressEvent::StatsUpdated {
                            file: file.name.clone(),
                            bytes_uploaded: file.bytes_uploaded,
                            total_bytes: file.size,
                            percent: file.progress,
                        },
                    );
                }
                UploadEvent::Failed { index, error } => {
                    if first_failure.is_none() {
                        first_failure = Some((index, error));
                    }
                }
            }
        }
    });

    if control.cancel.is_cancelled() {
        return ScheduleOutcome::Cancelled;
    }
    if let Some((index, error)) = first_failure {
        return ScheduleOutcome::Failed { index, error };
    }
    let remaining = file.chunks.iter().filter(|c| !c.uploaded).count();
    if remaining == 0 {
        ScheduleOutcome::Completed
    } else if control.is_pause_requested() {
        ScheduleOutcome::Paused
    } else {
        // Workers only stop early on cancel, pause, or failure; reaching
        // here with work left means an upload thread died.
        ScheduleOutcome::Failed {
            index: 0,
            error: SluiceError::Other("upload workers stopped unexpectedly".into()),
        }
    }
}

/// Upload a single chunk, retrying transient failures per the configured
/// backoff budget.
#[allow(clippy::too_many_arguments)]
fn upload_one(
    job: &ChunkJob,
    file_hash: &str,
    file_name: &str,
    file_size: u64,
    total_chunks: usize,
    source: &Arc<dyn ChunkSource>,
    endpoint: &Arc<dyn UploadEndpoint>,
    transfer: &TransferConfig,
    control: &TaskControl,
    event_tx: &Sender<UploadEvent>,
) -> Result<()> {
    control.cancel.check()?;

    let data = source
        .read_range(job.start, job.end)
        .map_err(|e| SluiceError::HashRead(format!("chunk {}: {e}", job.index)))?;

    let op_name = format!("chunk {} of {file_name}", job.index);
    crate::api::retry::retry_transient(&transfer.retry, &op_name, &control.cancel, || {
        let meta = ChunkMeta {
            file_hash,
            file_name,
            chunk_index: job.index,
            total_chunks,
            chunk_size: transfer.chunk_size,
            file_size,
        };
        let mut on_progress = |sent: u64, total: u64| {
            let _ = event_tx.send(UploadEvent::Progress {
                index: job.index,
                sent,
                total,
            });
        };
        endpoint.upload_chunk(&meta, &data, &mut on_progress, &control.cancel)
    })
}
