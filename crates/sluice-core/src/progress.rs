use crate::hash::ContentHash;

/// Progress callback events emitted by an upload task.
///
/// Callers observe these instead of polling the task; the CLI renders
/// them into a status line.
#[derive(Debug, Clone)]
pub enum UploadProgressEvent {
    HashStarted {
        file: String,
    },
    HashProgress {
        file: String,
        percent: u8,
    },
    HashFinished {
        file: String,
        hash: ContentHash,
    },
    /// The remote already stores this content; no chunks were sent.
    InstantComplete {
        file: String,
        file_url: String,
    },
    ChunkUploaded {
        file: String,
        index: usize,
        uploaded_chunks: usize,
        total_chunks: usize,
    },
    StatsUpdated {
        file: String,
        bytes_uploaded: u64,
        total_bytes: u64,
        percent: u8,
    },
    Paused {
        file: String,
    },
    Resumed {
        file: String,
        /// Chunks the server still had when the task resumed.
        verified_chunks: usize,
    },
    Completed {
        file: String,
        file_url: String,
    },
}

pub(crate) type ProgressFn<'a> = Option<&'a mut dyn FnMut(UploadProgressEvent)>;

pub(crate) fn emit(progress: &mut ProgressFn<'_>, event: UploadProgressEvent) {
    if let Some(callback) = progress.as_deref_mut() {
        callback(event);
    }
}
