use std::path::Path;
use std::sync::Arc;

use sluice_core::cancel::CancelToken;
use sluice_core::config::{PoolConfig, DEFAULT_CHUNK_SIZE};
use sluice_core::error::{Result, SluiceError};
use sluice_core::pool::WorkerPool;
use sluice_core::source::{ChunkSource, FsSource};

use crate::signal;

/// Fingerprint files without uploading, all through one worker pool.
pub(crate) fn run(paths: &[String], chunk_size_mib: Option<u64>) -> Result<()> {
    let chunk_size = chunk_size_mib
        .map(|mib| mib * 1024 * 1024)
        .unwrap_or(DEFAULT_CHUNK_SIZE);

    let sources: Vec<Arc<dyn ChunkSource>> = paths
        .iter()
        .map(|p| {
            FsSource::open(Path::new(p)).map(|s| Arc::new(s) as Arc<dyn ChunkSource>)
        })
        .collect::<Result<_>>()?;

    signal::install_signal_handlers();
    let cancel = CancelToken::new();
    let pool = WorkerPool::new(&PoolConfig::default());

    let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let watcher = {
        let cancel = cancel.clone();
        let done = std::sync::Arc::clone(&done);
        std::thread::spawn(move || {
            while !done.load(std::sync::atomic::Ordering::SeqCst) {
                if signal::shutdown_requested() {
                    cancel.cancel();
                    return;
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
        })
    };

    let results = pool.hash_files(&sources, chunk_size, &cancel);
    done.store(true, std::sync::atomic::Ordering::SeqCst);
    let _ = watcher.join();
    pool.shutdown();

    let mut failures = 0usize;
    for (path, result) in paths.iter().zip(results) {
        match result {
            Ok(hash) => println!("{}  {path}", hash.to_hex()),
            Err(e) => {
                eprintln!("{path}: {e}");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        Err(SluiceError::Other(format!("{failures} file(s) failed")))
    } else {
        Ok(())
    }
}
