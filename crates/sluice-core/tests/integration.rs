use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use sluice_core::api::{
    CheckExistResponse, ChunkMeta, ChunkProgressFn, MergeRequest, MergeResponse, RemoteTask,
    UploadEndpoint, UploadServerConfig, UploadStats, ValidateRequest, ValidateResponse,
    VerifyResumeResponse,
};
use sluice_core::cancel::CancelToken;
use sluice_core::config::{PoolConfig, RetryConfig, TransferConfig};
use sluice_core::error::{Result, SluiceError};
use sluice_core::hash::hash_bytes;
use sluice_core::pool::WorkerPool;
use sluice_core::progress::UploadProgressEvent;
use sluice_core::resume::ResumeStore;
use sluice_core::source::FsSource;
use sluice_core::task::{UploadStatus, UploadTask};

const MIB: u64 = 1024 * 1024;

// ---------------------------------------------------------------------------
// Mock upload service
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ServerState {
    /// Fully stored content: hash -> url.
    existing: HashMap<String, String>,
    /// Uploaded chunks per `hash:name`.
    chunks: HashMap<String, BTreeSet<usize>>,
    merged: HashMap<String, String>,
    /// `(file_name, chunk_index)` pairs held in flight until released.
    blocked: HashSet<(String, usize)>,
    /// `(file_name, chunk_index)` pairs rejected with HTTP 400.
    rejected: HashSet<(String, usize)>,
    cancelled: Vec<String>,
    paused: Vec<String>,
    calls: Vec<String>,
}

/// In-memory stand-in for the remote store, faithful to the protocol:
/// chunks accumulate per (hash, name), merge requires the full set and is
/// idempotent, cancel discards partial state.
#[derive(Default)]
struct MockServer {
    state: Mutex<ServerState>,
    released: Condvar,
}

impl MockServer {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn key(file_hash: &str, file_name: &str) -> String {
        format!("{file_hash}:{file_name}")
    }

    fn seed_existing(&self, file_hash: &str, url: &str) {
        let mut st = self.state.lock().unwrap();
        st.existing.insert(file_hash.into(), url.into());
    }

    fn seed_chunks(&self, file_hash: &str, file_name: &str, indices: &[usize]) {
        let mut st = self.state.lock().unwrap();
        st.chunks
            .entry(Self::key(file_hash, file_name))
            .or_default()
            .extend(indices.iter().copied());
    }

    fn block_chunk(&self, file_name: &str, index: usize) {
        let mut st = self.state.lock().unwrap();
        st.blocked.insert((file_name.into(), index));
    }

    fn release_chunk(&self, file_name: &str, index: usize) {
        let mut st = self.state.lock().unwrap();
        st.blocked.remove(&(file_name.into(), index));
        drop(st);
        self.released.notify_all();
    }

    fn reject_chunk(&self, file_name: &str, index: usize) {
        let mut st = self.state.lock().unwrap();
        st.rejected.insert((file_name.into(), index));
    }

    fn clear_rejections(&self) {
        self.state.lock().unwrap().rejected.clear();
    }

    fn drop_chunk(&self, file_hash: &str, file_name: &str, index: usize) {
        let mut st = self.state.lock().unwrap();
        if let Some(set) = st.chunks.get_mut(&Self::key(file_hash, file_name)) {
            set.remove(&index);
        }
    }

    fn uploaded(&self, file_hash: &str, file_name: &str) -> Vec<usize> {
        let st = self.state.lock().unwrap();
        st.chunks
            .get(&Self::key(file_hash, file_name))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    fn call_count(&self, needle: &str) -> usize {
        let st = self.state.lock().unwrap();
        st.calls.iter().filter(|c| c.as_str() == needle).count()
    }

    fn was_cancelled(&self, file_hash: &str, file_name: &str) -> bool {
        let st = self.state.lock().unwrap();
        st.cancelled.contains(&Self::key(file_hash, file_name))
    }

    fn was_paused(&self, file_hash: &str, file_name: &str) -> bool {
        let st = self.state.lock().unwrap();
        st.paused.contains(&Self::key(file_hash, file_name))
    }
}

impl UploadEndpoint for MockServer {
    fn fetch_config(&self) -> Result<UploadServerConfig> {
        Ok(UploadServerConfig {
            chunk_size: Some(4 * MIB),
            max_concurrent_uploads: Some(3),
            max_file_size: None,
        })
    }

    fn check_exist(
        &self,
        file_hash: &str,
        file_name: &str,
        _file_size: u64,
    ) -> Result<CheckExistResponse> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("check:{file_name}"));
        if let Some(url) = st.existing.get(file_hash) {
            return Ok(CheckExistResponse {
                exist: true,
                uploaded_chunks: Vec::new(),
                file_url: Some(url.clone()),
            });
        }
        Ok(CheckExistResponse {
            exist: false,
            uploaded_chunks: st
                .chunks
                .get(&Self::key(file_hash, file_name))
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default(),
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
        let blocked_key = (meta.file_name.to_string(), meta.chunk_index);
        let mut st = self.state.lock().unwrap();
        st.calls
            .push(format!("chunk:{}:{}", meta.file_name, meta.chunk_index));

        while st.blocked.contains(&blocked_key) {
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

        if st.rejected.contains(&blocked_key) {
            return Err(SluiceError::Server {
                status: 400,
                message: format!("chunk {} rejected", meta.chunk_index),
            });
        }

        st.chunks
            .entry(Self::key(meta.file_hash, meta.file_name))
            .or_default()
            .insert(meta.chunk_index);
        drop(st);

        let total = data.len().max(1) as u64;
        on_progress(total, total);
        Ok(())
    }

    fn uploaded_chunks(&self, file_hash: &str, file_name: &str) -> Result<Vec<usize>> {
        Ok(self.uploaded(file_hash, file_name))
    }

    fn merge_chunks(&self, request: &MergeRequest) -> Result<MergeResponse> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("merge:{}", request.file_name));
        let key = Self::key(&request.file_hash, &request.file_name);
        if let Some(url) = st.merged.get(&key) {
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
        Ok(ValidateResponse {
            success: true,
            valid: true,
            message: String::new(),
        })
    }

    fn cancel_upload(&self, file_hash: &str, file_name: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("cancel:{file_name}"));
        let key = Self::key(file_hash, file_name);
        st.chunks.remove(&key);
        st.cancelled.push(key);
        Ok(())
    }

    fn verify_resume(&self, file_hash: &str, file_name: &str) -> Result<VerifyResumeResponse> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("verify:{file_name}"));
        let uploaded: Vec<usize> = st
            .chunks
            .get(&Self::key(file_hash, file_name))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        Ok(VerifyResumeResponse {
            can_resume: true,
            total_chunks: uploaded.len(),
            uploaded_chunks: uploaded,
        })
    }

    fn pause_upload(&self, file_hash: &str, file_name: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("pause:{file_name}"));
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
        let st = self.state.lock().unwrap();
        Ok(UploadStats {
            total_files: st.merged.len() as u64,
            success_files: st.merged.len() as u64,
            ..UploadStats::default()
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn write_file(dir: &std::path::Path, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| (i % 239) as u8).collect();
    let path = dir.join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(&data).unwrap();
    (path, data)
}

fn transfer_config(chunk_size: u64, concurrency: usize) -> TransferConfig {
    TransferConfig {
        chunk_size,
        max_concurrent_uploads: concurrency,
        honor_server_chunk_size: true,
        validate_after_merge: true,
        retry: RetryConfig {
            max_retries: 2,
            retry_delay_ms: 1,
            retry_max_delay_ms: 4,
        },
    }
}

fn small_pool() -> WorkerPool {
    WorkerPool::new(&PoolConfig {
        max_workers: 2,
        max_tasks_per_worker: 5,
    })
}

fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
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
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn ten_megabyte_file_with_one_known_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let (path, data) = write_file(dir.path(), "big.bin", (10 * MIB) as usize);
    let hash_hex = hash_bytes(&data).to_hex();

    let server = MockServer::new();
    // Chunk 0 survives from an earlier interrupted attempt.
    server.seed_chunks(&hash_hex, "big.bin", &[0]);

    let pool = small_pool();
    let source = Arc::new(FsSource::open(&path).unwrap());
    let mut task = UploadTask::new(
        "big.bin",
        source,
        server.clone() as Arc<dyn UploadEndpoint>,
        transfer_config(4 * MIB, 3),
        None,
    );

    let mut events = Vec::new();
    let outcome = {
        let mut on_event = |event: UploadProgressEvent| events.push(event);
        task.run(&pool, Some(&mut on_event)).unwrap()
    };

    // 10 MiB / 4 MiB = 3 chunks; hashing reports 33/67/100.
    let hash_percents: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            UploadProgressEvent::HashProgress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert_eq!(hash_percents, vec![33, 67, 100]);

    assert!(!outcome.deduplicated);
    assert_eq!(outcome.chunks_sent, 2, "only the missing chunks travel");
    assert_eq!(server.call_count("chunk:big.bin:0"), 0);
    assert_eq!(server.call_count("chunk:big.bin:1"), 1);
    assert_eq!(server.call_count("chunk:big.bin:2"), 1);
    assert_eq!(server.call_count("merge:big.bin"), 1);
    assert_eq!(server.uploaded(&hash_hex, "big.bin"), vec![0, 1, 2]);
    assert_eq!(task.status(), UploadStatus::Success);
    assert_eq!(
        outcome.file_url,
        format!("https://files.example/{hash_hex}/big.bin")
    );
}

#[test]
fn instant_upload_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let (path, data) = write_file(dir.path(), "dup.bin", 512 * 1024);
    let hash_hex = hash_bytes(&data).to_hex();

    let server = MockServer::new();
    server.seed_existing(&hash_hex, "https://files.example/already-there");

    let pool = small_pool();
    let mut task = UploadTask::new(
        "dup.bin",
        Arc::new(FsSource::open(&path).unwrap()),
        server.clone() as Arc<dyn UploadEndpoint>,
        transfer_config(256 * 1024, 3),
        None,
    );
    let outcome = task.run(&pool, None).unwrap();

    assert!(outcome.deduplicated);
    assert_eq!(outcome.file_url, "https://files.example/already-there");
    assert_eq!(task.status(), UploadStatus::Success);
    let st_calls = server.call_count("check:dup.bin");
    assert_eq!(st_calls, 1);
    assert!(server.uploaded(&hash_hex, "dup.bin").is_empty());
    assert_eq!(server.call_count("merge:dup.bin"), 0);
}

#[test]
fn pause_resume_reuploads_garbage_collected_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let (path, data) = write_file(dir.path(), "paused.bin", 24 * 1024);
    let hash_hex = hash_bytes(&data).to_hex();

    let server = MockServer::new();
    server.block_chunk("paused.bin", 1);

    let pool = small_pool();
    let mut task = UploadTask::new(
        "paused.bin",
        Arc::new(FsSource::open(&path).unwrap()),
        server.clone() as Arc<dyn UploadEndpoint>,
        // Single in-flight upload keeps the dispatch order deterministic.
        transfer_config(4 * 1024, 1),
        None,
    );
    let controller = task.controller();

    let (event_tx, event_rx) = crossbeam_channel::unbounded::<UploadProgressEvent>();
    let server2 = server.clone();
    let hash2 = hash_hex.clone();
    let runner = std::thread::spawn(move || {
        let mut on_event = |event: UploadProgressEvent| {
            let _ = event_tx.send(event);
        };
        let result = task.run(&pool, Some(&mut on_event));
        result.map(|outcome| (outcome, task))
    });

    // Chunk 0 done, chunk 1 held in flight: request the pause.
    assert!(wait_until(Duration::from_secs(5), || {
        server2.call_count("chunk:paused.bin:1") == 1
    }));
    controller.pause();

    // The in-flight chunk is allowed to finish; the task then parks.
    server.release_chunk("paused.bin", 1);
    let paused_seen = wait_until(Duration::from_secs(5), || {
        event_rx
            .try_iter()
            .any(|e| matches!(e, UploadProgressEvent::Paused { .. }))
    });
    assert!(paused_seen, "task must report the paused state");
    assert!(server.was_paused(&hash_hex, "paused.bin"));

    // While parked, the server garbage-collects chunk 0.
    server.drop_chunk(&hash2, "paused.bin", 0);

    controller.resume();
    let (outcome, task) = runner.join().unwrap().unwrap();

    assert_eq!(task.status(), UploadStatus::Success);
    assert!(!outcome.deduplicated);
    assert_eq!(server.call_count("verify:paused.bin"), 1);
    assert_eq!(
        server.call_count("chunk:paused.bin:0"),
        2,
        "the collected chunk is re-uploaded after resume"
    );
    assert_eq!(server.uploaded(&hash_hex, "paused.bin"), vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn cancelling_one_task_leaves_the_other_running() {
    let dir = tempfile::tempdir().unwrap();
    let (path_a, data_a) = write_file(dir.path(), "doomed.bin", 12 * 1024);
    let (path_b, data_b) = write_file(dir.path(), "survivor.bin", 12 * 1024);
    let hash_a = hash_bytes(&data_a).to_hex();
    let hash_b = hash_bytes(&data_b).to_hex();

    let server = MockServer::new();
    server.block_chunk("doomed.bin", 1);
    server.block_chunk("survivor.bin", 2);

    let pool = small_pool();
    let mut task_a = UploadTask::new(
        "doomed.bin",
        Arc::new(FsSource::open(&path_a).unwrap()),
        server.clone() as Arc<dyn UploadEndpoint>,
        transfer_config(4 * 1024, 2),
        None,
    );
    let mut task_b = UploadTask::new(
        "survivor.bin",
        Arc::new(FsSource::open(&path_b).unwrap()),
        server.clone() as Arc<dyn UploadEndpoint>,
        transfer_config(4 * 1024, 2),
        None,
    );
    let controller_a = task_a.controller();

    let server2 = server.clone();
    std::thread::scope(|s| {
        let pool_ref = &pool;
        let a = s.spawn(move || {
            let result = task_a.run(pool_ref, None);
            (result, task_a.status())
        });
        let b = s.spawn(move || {
            let result = task_b.run(pool_ref, None);
            (result, task_b.status())
        });

        // Cancel A while its chunk 1 is held in flight.
        assert!(wait_until(Duration::from_secs(5), || {
            server2.call_count("chunk:doomed.bin:1") == 1
        }));
        controller_a.cancel();
        let (result_a, status_a) = a.join().unwrap();
        assert!(matches!(result_a, Err(SluiceError::Cancelled)));
        assert_eq!(status_a, UploadStatus::Cancelled);

        // B is untouched: release its gate and let it finish.
        server2.release_chunk("survivor.bin", 2);
        let (result_b, status_b) = b.join().unwrap();
        assert!(result_b.is_ok());
        assert_eq!(status_b, UploadStatus::Success);
    });

    assert!(server.was_cancelled(&hash_a, "doomed.bin"));
    assert!(!server.was_cancelled(&hash_b, "survivor.bin"));
    assert_eq!(server.uploaded(&hash_b, "survivor.bin"), vec![0, 1, 2]);
    assert!(server.uploaded(&hash_a, "doomed.bin").is_empty());
}

#[test]
fn resume_after_restart_skips_stored_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let (path, data) = write_file(dir.path(), "restart.bin", 20 * 1024);
    let hash_hex = hash_bytes(&data).to_hex();

    let server = MockServer::new();
    server.reject_chunk("restart.bin", 3);
    let pool = small_pool();

    // First run dies on chunk 3 after the earlier chunks are stored.
    {
        let store = ResumeStore::new(cache_dir.path()).unwrap();
        let mut task = UploadTask::new(
            "restart.bin",
            Arc::new(FsSource::open(&path).unwrap()),
            server.clone() as Arc<dyn UploadEndpoint>,
            transfer_config(4 * 1024, 1),
            Some(store),
        );
        let err = task.run(&pool, None).unwrap_err();
        assert!(matches!(err, SluiceError::Server { status: 400, .. }));
        assert_eq!(task.status(), UploadStatus::Error);
    }
    assert_eq!(server.uploaded(&hash_hex, "restart.bin"), vec![0, 1, 2]);

    // "Process restart": a fresh task over the same file and cache. The
    // existence check reports the stored chunks, so only the rest travel.
    server.clear_rejections();
    {
        let store = ResumeStore::new(cache_dir.path()).unwrap();
        let entry = store
            .load(&hash_hex, "restart.bin")
            .expect("first run must leave a resume entry behind");
        assert!(entry.uploaded_chunks.contains(&0));

        let mut task = UploadTask::new(
            "restart.bin",
            Arc::new(FsSource::open(&path).unwrap()),
            server.clone() as Arc<dyn UploadEndpoint>,
            transfer_config(4 * 1024, 1),
            Some(store.clone()),
        );
        let outcome = task.run(&pool, None).unwrap();
        assert_eq!(task.status(), UploadStatus::Success);
        assert_eq!(outcome.chunks_sent, 2, "chunks 3 and 4 only");
        assert_eq!(server.call_count("chunk:restart.bin:0"), 1);
        assert_eq!(server.call_count("chunk:restart.bin:1"), 1);
        assert_eq!(server.call_count("chunk:restart.bin:2"), 1);
        assert!(store.load(&hash_hex, "restart.bin").is_none());
    }
}

#[test]
fn merge_is_idempotent_for_manual_retries() {
    let dir = tempfile::tempdir().unwrap();
    let (path, data) = write_file(dir.path(), "twice.bin", 8 * 1024);
    let hash_hex = hash_bytes(&data).to_hex();

    let server = MockServer::new();
    let pool = small_pool();
    let mut task = UploadTask::new(
        "twice.bin",
        Arc::new(FsSource::open(&path).unwrap()),
        server.clone() as Arc<dyn UploadEndpoint>,
        transfer_config(4 * 1024, 2),
        None,
    );
    let outcome = task.run(&pool, None).unwrap();

    // A second merge for the same upload returns the same URL.
    let again = server
        .merge_chunks(&MergeRequest {
            file_hash: hash_hex.clone(),
            file_name: "twice.bin".into(),
            total_chunks: 2,
            file_size: data.len() as u64,
            mime_type: None,
        })
        .unwrap();
    assert_eq!(again.file_url, outcome.file_url);
}
