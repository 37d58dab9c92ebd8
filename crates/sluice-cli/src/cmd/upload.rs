use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use sluice_core::api::rest::RestEndpoint;
use sluice_core::api::UploadEndpoint;
use sluice_core::config::{expand_tilde, SluiceConfig};
use sluice_core::error::{Result, SluiceError};
use sluice_core::pool::WorkerPool;
use sluice_core::resume::ResumeStore;
use sluice_core::source::FsSource;
use sluice_core::task::{TaskController, UploadOutcome, UploadTask};

use crate::progress::UploadStatusTracker;
use crate::signal;

pub(crate) fn run(
    mut config: SluiceConfig,
    paths: &[String],
    chunk_size_mib: Option<u64>,
    concurrency: Option<usize>,
    no_resume_cache: bool,
) -> Result<()> {
    if let Some(mib) = chunk_size_mib {
        config.transfer.chunk_size = mib * 1024 * 1024;
    }
    if let Some(n) = concurrency {
        config.transfer.max_concurrent_uploads = n;
    }
    config.validate()?;

    let endpoint: Arc<dyn UploadEndpoint> = Arc::new(RestEndpoint::new(&config.server)?);

    // Adopt the server's chunk-size hint unless the caller pinned one.
    if config.transfer.honor_server_chunk_size && chunk_size_mib.is_none() {
        match endpoint.fetch_config() {
            Ok(remote) => {
                if let Some(hint) = remote.chunk_size {
                    if hint != config.transfer.chunk_size {
                        let mut candidate = config.clone();
                        candidate.transfer.chunk_size = hint;
                        if candidate.validate().is_ok() {
                            info!(chunk_size = hint, "using server chunk-size hint");
                            config = candidate;
                        } else {
                            warn!(chunk_size = hint, "ignoring out-of-range server hint");
                        }
                    }
                }
            }
            Err(e) => warn!("could not fetch server upload config: {e}"),
        }
    }

    let resume_store = if no_resume_cache {
        None
    } else {
        let dir = config
            .cache_dir
            .clone()
            .map(|d| expand_tilde(&d))
            .unwrap_or_else(default_cache_dir);
        match ResumeStore::new(&dir) {
            Ok(store) => Some(store),
            Err(e) => {
                warn!("resume cache disabled: {e}");
                None
            }
        }
    };

    signal::install_signal_handlers();
    let pool = WorkerPool::new(&config.pool);

    let mut failures = 0usize;
    for path in paths {
        match upload_one(&pool, &endpoint, &config, resume_store.clone(), path) {
            Ok(outcome) => {
                if outcome.deduplicated {
                    println!("{path}: instant upload -> {}", outcome.file_url);
                } else {
                    println!("{path}: uploaded -> {}", outcome.file_url);
                }
            }
            Err(e) if e.is_cancelled() => {
                pool.shutdown();
                return Err(e);
            }
            Err(e) => {
                eprintln!("{path}: failed: {e}");
                failures += 1;
            }
        }
    }
    pool.shutdown();

    if failures > 0 {
        Err(SluiceError::Other(format!("{failures} upload(s) failed")))
    } else {
        Ok(())
    }
}

fn upload_one(
    pool: &WorkerPool,
    endpoint: &Arc<dyn UploadEndpoint>,
    config: &SluiceConfig,
    resume_store: Option<ResumeStore>,
    path: &str,
) -> Result<UploadOutcome> {
    let path = Path::new(path);
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| SluiceError::Config(format!("not a file path: {}", path.display())))?;

    let source = Arc::new(FsSource::open(path)?);
    let mut task = UploadTask::new(
        &name,
        source,
        Arc::clone(endpoint),
        config.transfer.clone(),
        resume_store,
    );

    let watcher = spawn_signal_watcher(task.controller());

    let mut tracker = UploadStatusTracker::new();
    let result = task.run(
        pool,
        Some(&mut |event| {
            if let Some(line) = tracker.format(&event) {
                eprint!("\r\x1b[2K{line}");
                let _ = std::io::stderr().flush();
            }
        }),
    );
    eprintln!();

    watcher.stop();
    result
}

/// Watches the process-wide shutdown flag and cancels the task when it
/// trips.
struct SignalWatcher {
    done: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl SignalWatcher {
    fn stop(mut self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_signal_watcher(controller: TaskController) -> SignalWatcher {
    let done = Arc::new(AtomicBool::new(false));
    let done2 = Arc::clone(&done);
    let handle = std::thread::spawn(move || {
        while !done2.load(Ordering::SeqCst) {
            if signal::shutdown_requested() {
                controller.cancel();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    });
    SignalWatcher {
        done,
        handle: Some(handle),
    }
}

fn default_cache_dir() -> String {
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        return format!("{xdg}/sluice");
    }
    if let Ok(home) = std::env::var("HOME") {
        return format!("{home}/.cache/sluice");
    }
    ".sluice-cache".to_string()
}
