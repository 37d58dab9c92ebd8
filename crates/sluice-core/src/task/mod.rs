mod scheduler;

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::{MergeRequest, UploadEndpoint, ValidateRequest, VerifyResumeResponse};
use crate::cancel::CancelToken;
use crate::chunk::{split_chunks, Chunk};
use crate::config::TransferConfig;
use crate::error::{Result, SluiceError};
use crate::hash::ContentHash;
use crate::pool::{HashRequest, WorkerPool};
use crate::progress::{emit, ProgressFn, UploadProgressEvent};
use crate::resume::{ResumeEntry, ResumeStore};
use crate::source::ChunkSource;

pub(crate) use scheduler::ScheduleOutcome;

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of one upload.
///
/// A closed set with explicit transitions; anything not listed in
/// [`UploadStatus::can_transition`] is rejected rather than silently
/// applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Waiting,
    Hashing,
    Uploading,
    Paused,
    Success,
    Error,
    Cancelled,
}

impl UploadStatus {
    /// Terminal states never transition again (except `Error`, which a
    /// caller may send back to `Waiting` for a retry).
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Success | UploadStatus::Cancelled)
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            UploadStatus::Hashing | UploadStatus::Uploading | UploadStatus::Paused
        )
    }

    pub fn can_transition(self, to: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (self, to),
            (Waiting, Hashing)
                | (Hashing, Uploading)
                | (Hashing, Success)
                | (Hashing, Error)
                | (Hashing, Cancelled)
                | (Uploading, Paused)
                | (Uploading, Success)
                | (Uploading, Error)
                | (Uploading, Cancelled)
                | (Paused, Uploading)
                | (Paused, Error)
                | (Paused, Cancelled)
                | (Error, Waiting)
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadStatus::Waiting => "waiting",
            UploadStatus::Hashing => "hashing",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Paused => "paused",
            UploadStatus::Success => "success",
            UploadStatus::Error => "error",
            UploadStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Identity and lifecycle record for one file being uploaded.
///
/// Owned by the [`UploadTask`]; callers observe cloned snapshots.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub id: u64,
    pub name: String,
    pub size: u64,
    pub status: UploadStatus,
    /// Content fingerprint; `None` until hashing finishes.
    pub hash: Option<ContentHash>,
    pub chunks: Vec<Chunk>,
    /// Aggregate upload progress, 0-100.
    pub progress: u8,
    /// Hash computation progress, 0-100.
    pub hash_progress: u8,
    pub bytes_uploaded: u64,
    /// Final location, set on success.
    pub file_url: Option<String>,
    /// Human-readable failure message; the caller's window into errors.
    pub error: Option<String>,
}

impl UploadFile {
    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn uploaded_chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.uploaded).count()
    }

    /// Recompute aggregate byte and percent progress from chunk state.
    pub(crate) fn recompute_progress(&mut self) {
        let mut bytes = 0u64;
        for chunk in &self.chunks {
            if chunk.uploaded {
                bytes += chunk.len();
            } else if chunk.progress > 0 {
                bytes += chunk.len() * chunk.progress as u64 / 100;
            }
        }
        self.bytes_uploaded = bytes.min(self.size);
        self.progress = if self.size == 0 {
            if self.chunks.iter().all(|c| c.uploaded) {
                100
            } else {
                0
            }
        } else {
            (((self.bytes_uploaded as f64 / self.size as f64) * 100.0).round() as u8).min(100)
        };
    }
}

/// Shared control surface between a running task and its caller.
pub(crate) struct TaskControl {
    pub(crate) cancel: CancelToken,
    pause_requested: AtomicBool,
    park: Mutex<()>,
    unparked: Condvar,
}

impl TaskControl {
    fn new() -> Self {
        Self {
            cancel: CancelToken::new(),
            pause_requested: AtomicBool::new(false),
            park: Mutex::new(()),
            unparked: Condvar::new(),
        }
    }

    pub(crate) fn is_pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    /// Block until the pause request is withdrawn or the task is
    /// cancelled.
    fn park_until_resumed(&self) {
        let mut guard = self.park.lock().unwrap();
        while self.is_pause_requested() && !self.cancel.is_cancelled() {
            guard = self.unparked.wait(guard).unwrap();
        }
        drop(guard);
    }
}

/// Cloneable handle for pausing, resuming, and cancelling a task from
/// another thread. Affects only the task it was taken from.
#[derive(Clone)]
pub struct TaskController {
    control: Arc<TaskControl>,
}

impl TaskController {
    /// Request a pause: in-flight chunk requests finish, no new ones are
    /// dispatched.
    pub fn pause(&self) {
        self.control.pause_requested.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.control.pause_requested.store(false, Ordering::SeqCst);
        // Notify under the park lock so a task between its flag check
        // and `wait` cannot miss the wakeup.
        let _guard = self.control.park.lock().unwrap();
        self.control.unparked.notify_all();
    }

    /// Cancel the task, aborting its in-flight requests. Terminal.
    pub fn cancel(&self) {
        self.control.cancel.cancel();
        let _guard = self.control.park.lock().unwrap();
        self.control.unparked.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_pause_requested()
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.cancel.is_cancelled()
    }
}

/// Result of a completed upload run.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub file_url: String,
    /// The remote already stored the content; nothing was transferred.
    pub deduplicated: bool,
    /// Chunks transferred during this run (excludes ones the server
    /// already had).
    pub chunks_sent: usize,
}

/// Per-file upload orchestrator.
///
/// Drives hash computation through the worker pool, the existence check,
/// chunk scheduling, pause/resume/cancel, and the final merge. `run`
/// blocks the calling thread; control arrives through the
/// [`TaskController`] from elsewhere.
pub struct UploadTask {
    file: UploadFile,
    source: Arc<dyn ChunkSource>,
    endpoint: Arc<dyn UploadEndpoint>,
    transfer: TransferConfig,
    control: Arc<TaskControl>,
    resume_store: Option<ResumeStore>,
    mime_type: Option<String>,
}

impl UploadTask {
    pub fn new(
        name: &str,
        source: Arc<dyn ChunkSource>,
        endpoint: Arc<dyn UploadEndpoint>,
        transfer: TransferConfig,
        resume_store: Option<ResumeStore>,
    ) -> Self {
        let size = source.len();
        let chunks = split_chunks(size, transfer.chunk_size);
        let file = UploadFile {
            id: NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            size,
            status: UploadStatus::Waiting,
            hash: None,
            chunks,
            progress: 0,
            hash_progress: 0,
            bytes_uploaded: 0,
            file_url: None,
            error: None,
        };
        Self {
            file,
            source,
            endpoint,
            transfer,
            control: Arc::new(TaskControl::new()),
            resume_store,
            mime_type: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: &str) -> Self {
        self.mime_type = Some(mime_type.to_string());
        self
    }

    pub fn controller(&self) -> TaskController {
        TaskController {
            control: Arc::clone(&self.control),
        }
    }

    pub fn status(&self) -> UploadStatus {
        self.file.status
    }

    pub fn snapshot(&self) -> UploadFile {
        self.file.clone()
    }

    /// Send a failed task back to `waiting` for another [`run`], keeping
    /// the chunk plan, hash, and uploaded marks so nothing is redone.
    pub fn reset_for_retry(&mut self) -> Result<()> {
        self.transition(UploadStatus::Waiting)?;
        self.file.error = None;
        Ok(())
    }

    /// Drive the upload to a terminal state.
    ///
    /// Blocks until success, error, or cancellation. Progress events are
    /// delivered on this thread.
    pub fn run(
        &mut self,
        pool: &WorkerPool,
        mut progress: Option<&mut dyn FnMut(UploadProgressEvent)>,
    ) -> Result<UploadOutcome> {
        match self.run_inner(pool, &mut progress) {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_cancelled() => {
                self.finish_cancelled();
                Err(e)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn run_inner(
        &mut self,
        pool: &WorkerPool,
        progress: &mut ProgressFn<'_>,
    ) -> Result<UploadOutcome> {
        self.transition(UploadStatus::Hashing)?;
        emit(
            progress,
            UploadProgressEvent::HashStarted {
                file: self.file.name.clone(),
            },
        );

        let hash = self.compute_hash(pool, progress)?;
        self.file.hash = Some(hash);
        self.file.hash_progress = 100;
        emit(
            progress,
            UploadProgressEvent::HashFinished {
                file: self.file.name.clone(),
                hash,
            },
        );

        self.control.cancel.check()?;

        let hash_hex = hash.to_hex();
        let check = self
            .endpoint
            .check_exist(&hash_hex, &self.file.name, self.file.size)?;

        if check.exist {
            // Instant upload: the store already has this content.
            let file_url = check.file_url.unwrap_or_default();
            for chunk in &mut self.file.chunks {
                chunk.uploaded = true;
                chunk.progress = 100;
            }
            self.file.recompute_progress();
            self.transition(UploadStatus::Success)?;
            self.file.file_url = Some(file_url.clone());
            self.remove_resume(&hash_hex);
            info!(file = %self.file.name, "instant upload: content already stored");
            emit(
                progress,
                UploadProgressEvent::InstantComplete {
                    file: self.file.name.clone(),
                    file_url: file_url.clone(),
                },
            );
            return Ok(UploadOutcome {
                file_url,
                deduplicated: true,
                chunks_sent: 0,
            });
        }

        self.apply_uploaded_set(&check.uploaded_chunks);
        if let Some(store) = &self.resume_store {
            if let Some(prior) = store.load(&hash_hex, &self.file.name) {
                // The cache is only a hint; the server's answer above is
                // what we trust.
                debug!(
                    cached = prior.uploaded_chunks.len(),
                    confirmed = self.file.uploaded_chunk_count(),
                    "found local resume entry"
                );
            }
        }
        let already_uploaded = self.file.uploaded_chunk_count();
        self.transition(UploadStatus::Uploading)?;

        let started_at = Utc::now();
        let store = self.resume_store.clone();
        let persist_hash = hash_hex.clone();
        let chunk_size = self.transfer.chunk_size;
        let mut persist = move |file: &UploadFile| {
            if let Some(store) = &store {
                store.save_best_effort(&ResumeEntry {
                    file_hash: persist_hash.clone(),
                    file_name: file.name.clone(),
                    file_size: file.size,
                    chunk_size,
                    total_chunks: file.chunks.len(),
                    uploaded_chunks: file
                        .chunks
                        .iter()
                        .filter(|c| c.uploaded)
                        .map(|c| c.index)
                        .collect(),
                    started_at,
                    updated_at: Utc::now(),
                });
            }
        };

        loop {
            self.control.cancel.check()?;

            let outcome = scheduler::run_scheduler(
                &mut self.file,
                &hash_hex,
                &self.source,
                &self.endpoint,
                &self.transfer,
                &self.control,
                progress,
                &mut persist,
            );

            match outcome {
                ScheduleOutcome::Completed => break,
                ScheduleOutcome::Cancelled => return Err(SluiceError::Cancelled),
                ScheduleOutcome::Failed { index, error } => {
                    warn!(file = %self.file.name, chunk = index, "chunk upload failed: {error}");
                    // Keep partial progress on disk so a later retry can
                    // skip the chunks that made it.
                    persist(&self.file);
                    return Err(error);
                }
                ScheduleOutcome::Paused => {
                    self.transition(UploadStatus::Paused)?;
                    persist(&self.file);
                    if let Err(e) = self.endpoint.pause_upload(&hash_hex, &self.file.name) {
                        warn!("pause notification failed: {e}");
                    }
                    emit(
                        progress,
                        UploadProgressEvent::Paused {
                            file: self.file.name.clone(),
                        },
                    );

                    self.control.park_until_resumed();
                    self.control.cancel.check()?;

                    // The server may have garbage-collected chunks while
                    // we were parked; its verify answer wins.
                    let verify = self.endpoint.verify_resume(&hash_hex, &self.file.name)?;
                    let verified = self.reconcile_verified(&verify);
                    self.transition(UploadStatus::Uploading)?;
                    emit(
                        progress,
                        UploadProgressEvent::Resumed {
                            file: self.file.name.clone(),
                            verified_chunks: verified,
                        },
                    );
                }
            }
        }

        let merge = self.endpoint.merge_chunks(&MergeRequest {
            file_hash: hash_hex.clone(),
            file_name: self.file.name.clone(),
            total_chunks: self.file.chunks.len(),
            file_size: self.file.size,
            mime_type: self.mime_type.clone(),
        })?;

        if self.transfer.validate_after_merge {
            match self.endpoint.validate_chunks(&ValidateRequest {
                file_hash: hash_hex.clone(),
                file_name: self.file.name.clone(),
                total_chunks: self.file.chunks.len(),
            }) {
                Ok(v) if !v.valid => {
                    let message = if v.message.is_empty() {
                        "server reported inconsistent chunks after merge".to_string()
                    } else {
                        v.message
                    };
                    return Err(SluiceError::Validation(message));
                }
                Ok(_) => {}
                Err(e) => warn!("post-merge validation call failed: {e}"),
            }
        }

        self.transition(UploadStatus::Success)?;
        self.file.file_url = Some(merge.file_url.clone());
        self.file.recompute_progress();
        self.remove_resume(&hash_hex);
        info!(
            file = %self.file.name,
            url = %merge.file_url,
            chunks = self.file.chunks.len(),
            "upload complete"
        );
        emit(
            progress,
            UploadProgressEvent::Completed {
                file: self.file.name.clone(),
                file_url: merge.file_url.clone(),
            },
        );

        Ok(UploadOutcome {
            file_url: merge.file_url,
            deduplicated: false,
            chunks_sent: self.file.chunks.len() - already_uploaded,
        })
    }

    fn compute_hash(
        &mut self,
        pool: &WorkerPool,
        progress: &mut ProgressFn<'_>,
    ) -> Result<ContentHash> {
        let handle = pool.execute(HashRequest {
            source: Arc::clone(&self.source),
            chunk_size: self.transfer.chunk_size,
            cancel: self.control.cancel.clone(),
        })?;

        let name = self.file.name.clone();
        let mut latest = 0u8;
        let result = handle.wait(Some(&mut |percent| {
            latest = percent;
            emit(
                progress,
                UploadProgressEvent::HashProgress {
                    file: name.clone(),
                    percent,
                },
            );
        }));
        self.file.hash_progress = latest;
        result
    }

    /// Mark the chunks the server already holds, per the existence check.
    fn apply_uploaded_set(&mut self, uploaded: &[usize]) {
        let set: HashSet<usize> = uploaded.iter().copied().collect();
        for chunk in &mut self.file.chunks {
            if set.contains(&chunk.index) {
                chunk.uploaded = true;
                chunk.progress = 100;
            }
        }
        self.file.recompute_progress();
    }

    /// Reconcile chunk state with a verify answer after a pause. Chunks
    /// the server no longer has are re-marked for upload.
    fn reconcile_verified(&mut self, verify: &VerifyResumeResponse) -> usize {
        let server: HashSet<usize> = if verify.can_resume {
            verify.uploaded_chunks.iter().copied().collect()
        } else {
            HashSet::new()
        };
        for chunk in &mut self.file.chunks {
            let held = server.contains(&chunk.index);
            if chunk.uploaded && !held {
                debug!(chunk = chunk.index, "server dropped chunk during pause");
            }
            chunk.uploaded = held;
            chunk.progress = if held { 100 } else { 0 };
        }
        self.file.recompute_progress();
        server.len()
    }

    fn transition(&mut self, to: UploadStatus) -> Result<()> {
        let from = self.file.status;
        if !from.can_transition(to) {
            return Err(SluiceError::InvalidTransition { from, to });
        }
        debug!(file = %self.file.name, %from, %to, "status transition");
        self.file.status = to;
        Ok(())
    }

    /// Move to `error`, recording the message and keeping partial state
    /// (chunk plan, hash, uploaded marks) for a caller-triggered retry.
    fn fail(&mut self, error: SluiceError) -> SluiceError {
        if self.file.status.can_transition(UploadStatus::Error) {
            self.file.status = UploadStatus::Error;
        }
        self.file.error = Some(error.to_string());
        error
    }

    fn finish_cancelled(&mut self) {
        if let Some(hash) = self.file.hash {
            let hash_hex = hash.to_hex();
            // Best-effort: let the server clean up partial chunks.
            if let Err(e) = self.endpoint.cancel_upload(&hash_hex, &self.file.name) {
                warn!("cancel notification failed: {e}");
            }
            self.remove_resume(&hash_hex);
        }
        if self.file.status.can_transition(UploadStatus::Cancelled) {
            self.file.status = UploadStatus::Cancelled;
        }
        info!(file = %self.file.name, "upload cancelled");
    }

    fn remove_resume(&self, hash_hex: &str) {
        if let Some(store) = &self.resume_store {
            store.remove(hash_hex, &self.file.name);
        }
    }
}
