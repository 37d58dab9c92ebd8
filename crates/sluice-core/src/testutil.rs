use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::api::{
    CheckExistResponse, ChunkMeta, ChunkProgressFn, MergeRequest, MergeResponse, RemoteTask,
    UploadEndpoint, UploadServerConfig, UploadStats, ValidateRequest, ValidateResponse,
    VerifyResumeResponse,
};
use crate::cancel::CancelToken;
use crate::error::{Result, SluiceError};
use crate::source::ChunkSource;

/// Poll `predicate` until it holds or the timeout elapses.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

// ---------------------------------------------------------------------------
// Chunk sources
// ---------------------------------------------------------------------------

/// In-memory chunk source.
pub struct MemSource {
    data: Vec<u8>,
}

impl MemSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl ChunkSource for MemSource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        if end > self.data.len() as u64 || start > end {
            return Err(SluiceError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "range past end of source",
            )));
        }
        Ok(self.data[start as usize..end as usize].to_vec())
    }
}

struct GateState {
    open: bool,
    waiting: usize,
}

/// Source whose reads block until the gate is opened; used to hold tasks
/// in a known in-flight state.
pub struct GateSource {
    len: u64,
    state: Mutex<GateState>,
    cv: Condvar,
}

impl GateSource {
    pub fn new(len: u64) -> Arc<Self> {
        Arc::new(Self {
            len,
            state: Mutex::new(GateState {
                open: false,
                waiting: 0,
            }),
            cv: Condvar::new(),
        })
    }

    pub fn open(&self) {
        let mut st = self.state.lock().unwrap();
        st.open = true;
        self.cv.notify_all();
    }

    /// Block until at least `n` readers are parked at the gate.
    pub fn wait_for_waiters(&self, n: usize) {
        let mut st = self.state.lock().unwrap();
        while st.waiting < n {
            st = self.cv.wait(st).unwrap();
        }
    }

    fn block_until_open(&self) {
        let mut st = self.state.lock().unwrap();
        st.waiting += 1;
        self.cv.notify_all();
        while !st.open {
            st = self.cv.wait(st).unwrap();
        }
        st.waiting -= 1;
    }
}

impl ChunkSource for GateSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        self.block_until_open();
        Ok(vec![0u8; (end - start) as usize])
    }
}

/// Source whose reads always fail.
pub struct FailingSource {
    len: u64,
}

impl FailingSource {
    pub fn new(len: u64) -> Self {
        Self { len }
    }
}

impl ChunkSource for FailingSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_range(&self, _start: u64, _end: u64) -> Result<Vec<u8>> {
        Err(SluiceError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "injected read failure",
        )))
    }
}

/// Source that waits for its gate, then panics — simulates a crashed
/// worker execution context.
pub struct PanicSource {
    gate: Arc<GateSource>,
}

impl PanicSource {
    pub fn new(gate: Arc<GateSource>) -> Self {
        Self { gate }
    }
}

impl ChunkSource for PanicSource {
    fn len(&self) -> u64 {
        self.gate.len
    }

    fn read_range(&self, _start: u64, _end: u64) -> Result<Vec<u8>> {
        self.gate.block_until_open();
        panic!("injected worker crash");
    }
}

// ---------------------------------------------------------------------------
// In-memory upload endpoint
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EndpointState {
    /// Content the store already holds in full: hash -> url.
    existing: HashMap<String, String>,
    /// Uploaded chunk indices per `hash:name`.
    chunks: HashMap<String, BTreeSet<usize>>,
    merged: HashMap<String, String>,
    cancelled: Vec<String>,
    paused: Vec<String>,
    /// Remaining injected transient failures per chunk index.
    transient_failures: HashMap<usize, usize>,
    /// Chunk index rejected with a permanent 400, if any.
    rejected_chunk: Option<usize>,
    /// Chunk indices whose uploads block until released.
    blocked_chunks: BTreeSet<usize>,
    fail_merge: bool,
    invalid_message: Option<String>,
    calls: Vec<String>,
}

/// Scriptable in-memory fake of the remote upload service. Thread-safe
/// via Mutex, like the store it stands in for.
#[derive(Default)]
pub struct MemoryEndpoint {
    state: Mutex<EndpointState>,
    released: Condvar,
}

impl MemoryEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(file_hash: &str, file_name: &str) -> String {
        format!("{file_hash}:{file_name}")
    }

    /// Pretend the store already holds this content (instant upload).
    pub fn seed_existing(&self, file_hash: &str, url: &str) {
        let mut st = self.state.lock().unwrap();
        st.existing.insert(file_hash.to_string(), url.to_string());
    }

    /// Pretend earlier chunks survive from a previous attempt.
    pub fn seed_chunks(&self, file_hash: &str, file_name: &str, indices: &[usize]) {
        let mut st = self.state.lock().unwrap();
        st.chunks
            .entry(Self::key(file_hash, file_name))
            .or_default()
            .extend(indices.iter().copied());
    }

    /// The next `count` uploads of chunk `index` fail transiently.
    pub fn inject_transient_failures(&self, index: usize, count: usize) {
        let mut st = self.state.lock().unwrap();
        st.transient_failures.insert(index, count);
    }

    /// Uploads of chunk `index` always fail with a permanent 400.
    pub fn reject_chunk(&self, index: usize) {
        self.state.lock().unwrap().rejected_chunk = Some(index);
    }

    pub fn clear_rejected_chunk(&self) {
        self.state.lock().unwrap().rejected_chunk = None;
    }

    /// Hold uploads of chunk `index` in flight until released.
    pub fn block_chunk(&self, index: usize) {
        self.state.lock().unwrap().blocked_chunks.insert(index);
    }

    pub fn release_chunk(&self, index: usize) {
        self.state.lock().unwrap().blocked_chunks.remove(&index);
        self.released.notify_all();
    }

    pub fn fail_merge(&self, fail: bool) {
        self.state.lock().unwrap().fail_merge = fail;
    }

    pub fn set_invalid(&self, message: &str) {
        self.state.lock().unwrap().invalid_message = Some(message.to_string());
    }

    /// Simulate server-side garbage collection of one chunk.
    pub fn drop_chunk(&self, file_hash: &str, file_name: &str, index: usize) {
        let mut st = self.state.lock().unwrap();
        if let Some(set) = st.chunks.get_mut(&Self::key(file_hash, file_name)) {
            set.remove(&index);
        }
    }

    pub fn uploaded(&self, file_hash: &str, file_name: &str) -> Vec<usize> {
        let st = self.state.lock().unwrap();
        st.chunks
            .get(&Self::key(file_hash, file_name))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, needle: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() == needle)
            .count()
    }

    pub fn was_cancelled(&self, file_hash: &str, file_name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .cancelled
            .contains(&Self::key(file_hash, file_name))
    }

    pub fn was_paused(&self, file_hash: &str, file_name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .paused
            .contains(&Self::key(file_hash, file_name))
    }
}

impl UploadEndpoint for MemoryEndpoint {
    fn fetch_config(&self) -> Result<UploadServerConfig> {
        self.state.lock().unwrap().calls.push("config".into());
        Ok(UploadServerConfig::default())
    }

    fn check_exist(
        &self,
        file_hash: &str,
        file_name: &str,
        _file_size: u64,
    ) -> Result<CheckExistResponse> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("check".into());
        if let Some(url) = st.existing.get(file_hash) {
            return Ok(CheckExistResponse {
                exist: true,
                uploaded_chunks: Vec::new(),
                file_url: Some(url.clone()),
            });
        }
        let uploaded = st
            .chunks
            .get(&Self::key(file_hash, file_name))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        Ok(CheckExistResponse {
            exist: false,
            uploaded_chunks: uploaded,
            file_url: None,
        })
    }

    fn upload_chunk(
        &self,
        meta: &ChunkMeta<'_>,
        data: &[u8],
        on_progress: ChunkProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let index = meta.chunk_index;
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("chunk:{index}"));

        // Hold the request in flight while the chunk is blocked,
        // honouring cancellation like a real transfer would.
        while st.blocked_chunks.contains(&index) {
            if cancel.is_cancelled() {
                return Err(SluiceError::Cancelled);
            }
            let (guard, _) = self
                .released
                .wait_timeout(st, Duration::from_millis(10))
                .unwrap();
            st = guard;
        }

        cancel.check()?;

        if let Some(left) = st.transient_failures.get_mut(&index) {
            if *left > 0 {
                *left -= 1;
                return Err(SluiceError::Network(format!(
                    "injected transient failure on chunk {index}"
                )));
            }
        }
        if st.rejected_chunk == Some(index) {
            return Err(SluiceError::Server {
                status: 400,
                message: format!("chunk {index} rejected"),
            });
        }

        st.chunks
            .entry(Self::key(meta.file_hash, meta.file_name))
            .or_default()
            .insert(index);
        drop(st);

        let total = data.len() as u64;
        on_progress(total / 2, total.max(1));
        on_progress(total.max(1), total.max(1));
        Ok(())
    }

    fn uploaded_chunks(&self, file_hash: &str, file_name: &str) -> Result<Vec<usize>> {
        self.state.lock().unwrap().calls.push("chunks".into());
        Ok(self.uploaded(file_hash, file_name))
    }

    fn merge_chunks(&self, request: &MergeRequest) -> Result<MergeResponse> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("merge".into());
        if st.fail_merge {
            return Err(SluiceError::Server {
                status: 500,
                message: "merge failed".into(),
            });
        }
        let key = Self::key(&request.file_hash, &request.file_name);
        if let Some(url) = st.merged.get(&key) {
            // Idempotent: a second merge returns the same location.
            return Ok(MergeResponse {
                file_url: url.clone(),
            });
        }
        let have = st.chunks.get(&key).map(|s| s.len()).unwrap_or(0);
        if have != request.total_chunks {
            return Err(SluiceError::Server {
                status: 409,
                message: format!("missing chunks: {have}/{}", request.total_chunks),
            });
        }
        let url = format!(
            "https://files.example/{}/{}",
            request.file_hash, request.file_name
        );
        st.merged.insert(key, url.clone());
        Ok(MergeResponse { file_url: url })
    }

    fn validate_chunks(&self, _request: &ValidateRequest) -> Result<ValidateResponse> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("validate".into());
        match &st.invalid_message {
            Some(message) => Ok(ValidateResponse {
                success: true,
                valid: false,
                message: message.clone(),
            }),
            None => Ok(ValidateResponse {
                success: true,
                valid: true,
                message: String::new(),
            }),
        }
    }

    fn cancel_upload(&self, file_hash: &str, file_name: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("cancel".into());
        let key = Self::key(file_hash, file_name);
        st.chunks.remove(&key);
        st.cancelled.push(key);
        Ok(())
    }

    fn verify_resume(&self, file_hash: &str, file_name: &str) -> Result<VerifyResumeResponse> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("verify".into());
        let uploaded: Vec<usize> = st
            .chunks
            .get(&Self::key(file_hash, file_name))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        Ok(VerifyResumeResponse {
            can_resume: true,
            total_chunks: uploaded.len(),
            uploaded_chunks: uploaded,
        })
    }

    fn pause_upload(&self, file_hash: &str, file_name: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("pause".into());
        let key = Self::key(file_hash, file_name);
        st.paused.push(key);
        Ok(())
    }

    fn list_tasks(&self) -> Result<Vec<RemoteTask>> {
        Ok(Vec::new())
    }

    fn delete_task(&self, _file_hash: &str, _file_name: &str) -> Result<()> {
        Ok(())
    }

    fn delete_tasks(&self, _file_hashes: &[String]) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> Result<UploadStats> {
        Ok(UploadStats::default())
    }
}
