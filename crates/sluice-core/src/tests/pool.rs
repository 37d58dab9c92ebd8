use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::config::PoolConfig;
use crate::error::SluiceError;
use crate::hash::hash_bytes;
use crate::pool::{HashRequest, WorkerPool};
use crate::source::ChunkSource;
use crate::testutil::{wait_until, GateSource, MemSource, PanicSource};

fn pool_config(max_workers: usize, max_tasks_per_worker: usize) -> PoolConfig {
    PoolConfig {
        max_workers,
        max_tasks_per_worker,
    }
}

fn request(source: Arc<dyn ChunkSource>, chunk_size: u64) -> HashRequest {
    HashRequest {
        source,
        chunk_size,
        cancel: CancelToken::new(),
    }
}

#[test]
fn hashes_match_direct_computation() {
    let pool = WorkerPool::new(&pool_config(2, 5));
    let data: Vec<u8> = (0..50_000u32).map(|i| (i % 241) as u8).collect();

    let handle = pool
        .execute(request(Arc::new(MemSource::new(data.clone())), 4096))
        .unwrap();
    let hash = handle.wait(None).unwrap();
    assert_eq!(hash, hash_bytes(&data));
}

#[test]
fn digest_is_chunk_size_invariant() {
    // Hashing the same content with different chunk sizes must agree.
    let pool = WorkerPool::new(&pool_config(2, 5));
    let data: Vec<u8> = (0..5 * 1024 * 1024u32).map(|i| (i % 199) as u8).collect();

    let one_mib = pool
        .execute(request(Arc::new(MemSource::new(data.clone())), 1024 * 1024))
        .unwrap()
        .wait(None)
        .unwrap();
    let two_mib = pool
        .execute(request(Arc::new(MemSource::new(data.clone())), 2 * 1024 * 1024))
        .unwrap()
        .wait(None)
        .unwrap();
    assert_eq!(one_mib, two_mib);
    assert_eq!(one_mib, hash_bytes(&data));
}

#[test]
fn progress_is_reported_per_chunk() {
    let pool = WorkerPool::new(&pool_config(1, 5));
    let data = vec![7u8; 4096];

    let handle = pool
        .execute(request(Arc::new(MemSource::new(data)), 1024))
        .unwrap();
    let mut seen = Vec::new();
    let hash = handle.wait(Some(&mut |p| seen.push(p))).unwrap();
    assert_eq!(seen, vec![25, 50, 75, 100]);
    assert_eq!(hash.to_hex().len(), 64);
}

#[test]
fn empty_source_hashes_and_completes() {
    let pool = WorkerPool::new(&pool_config(1, 5));
    let handle = pool
        .execute(request(Arc::new(MemSource::new(Vec::new())), 1024))
        .unwrap();
    let mut seen = Vec::new();
    let hash = handle.wait(Some(&mut |p| seen.push(p))).unwrap();
    assert_eq!(seen, vec![100]);
    assert_eq!(hash, hash_bytes(b""));
}

#[test]
fn capacity_is_bounded_and_overflow_queues() {
    // 2 workers x 3 tasks: the 7th submission must queue until an
    // earlier task completes.
    let pool = WorkerPool::new(&pool_config(2, 3));
    let gate = GateSource::new(4);

    let handles: Vec<_> = (0..7)
        .map(|_| {
            pool.execute(request(Arc::clone(&gate) as Arc<dyn ChunkSource>, 4))
                .unwrap()
        })
        .collect();

    // Both workers must be parked inside a read before we inspect.
    gate.wait_for_waiters(2);
    let status = pool.status();
    assert_eq!(status.workers, 2);
    assert_eq!(status.active_tasks, 6, "outstanding capped at 2x3");
    assert_eq!(status.queued_tasks, 1, "seventh task waits in the queue");

    gate.open();
    for handle in handles {
        handle.wait(None).unwrap();
    }

    // Completion bookkeeping runs just after the result is delivered.
    assert!(wait_until(Duration::from_secs(2), || {
        let status = pool.status();
        status.active_tasks == 0 && status.queued_tasks == 0
    }));
}

#[test]
fn worker_crash_rejects_only_that_workers_tasks() {
    // Worker 0 gets a crashing task plus one queued behind it; worker 1
    // gets two healthy gated tasks. Only worker 0's tasks may fail.
    let pool = WorkerPool::new(&pool_config(2, 2));
    let crash_gate = GateSource::new(4);
    let ok_gate = GateSource::new(4);

    let t1 = pool
        .execute(request(
            Arc::new(PanicSource::new(Arc::clone(&crash_gate))),
            4,
        ))
        .unwrap();
    let t2 = pool
        .execute(request(Arc::new(MemSource::new(vec![1, 2, 3])), 4))
        .unwrap();
    let t3 = pool
        .execute(request(Arc::clone(&ok_gate) as Arc<dyn ChunkSource>, 4))
        .unwrap();
    let t4 = pool
        .execute(request(Arc::clone(&ok_gate) as Arc<dyn ChunkSource>, 4))
        .unwrap();

    // Both workers parked: worker 0 in the crashing task, worker 1 in a
    // gated healthy one.
    crash_gate.wait_for_waiters(1);
    ok_gate.wait_for_waiters(1);

    crash_gate.open();
    assert!(matches!(t1.wait(None), Err(SluiceError::WorkerFatal(_))));
    assert!(matches!(t2.wait(None), Err(SluiceError::WorkerFatal(_))));

    ok_gate.open();
    assert!(t3.wait(None).is_ok());
    assert!(t4.wait(None).is_ok());

    // The crashed worker's capacity is restored and the pool keeps serving.
    assert!(wait_until(Duration::from_secs(2), || {
        pool.status().active_tasks == 0
    }));
    let t5 = pool
        .execute(request(Arc::new(MemSource::new(vec![9; 64])), 16))
        .unwrap();
    assert!(t5.wait(None).is_ok());
}

#[test]
fn cancellation_stops_hashing_between_chunks() {
    let pool = WorkerPool::new(&pool_config(1, 5));
    let gate = GateSource::new(8);
    let cancel = CancelToken::new();

    let handle = pool
        .execute(HashRequest {
            source: Arc::clone(&gate) as Arc<dyn ChunkSource>,
            chunk_size: 4,
            cancel: cancel.clone(),
        })
        .unwrap();

    gate.wait_for_waiters(1);
    cancel.cancel();
    gate.open();

    assert!(matches!(handle.wait(None), Err(SluiceError::Cancelled)));
}

#[test]
fn shutdown_rejects_queued_tasks_and_refuses_new_ones() {
    let pool = WorkerPool::new(&pool_config(1, 1));
    let gate = GateSource::new(4);

    let running = pool
        .execute(request(Arc::clone(&gate) as Arc<dyn ChunkSource>, 4))
        .unwrap();
    let queued = pool
        .execute(request(Arc::new(MemSource::new(vec![1])), 4))
        .unwrap();

    gate.wait_for_waiters(1);

    // Shutdown blocks until the in-flight task finishes, so release the
    // gate from another thread. The queued task is rejected immediately.
    let gate2 = Arc::clone(&gate);
    let opener = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        gate2.open();
    });
    pool.shutdown();
    opener.join().unwrap();

    assert!(running.wait(None).is_ok());
    assert!(matches!(queued.wait(None), Err(SluiceError::PoolShutdown)));
    assert!(matches!(
        pool.execute(request(Arc::new(MemSource::new(vec![1])), 4)),
        Err(SluiceError::PoolShutdown)
    ));
}

#[test]
fn hash_files_preserves_input_order() {
    let pool = WorkerPool::new(&pool_config(2, 5));
    let sources: Vec<Arc<dyn ChunkSource>> = vec![
        Arc::new(MemSource::new(b"first".to_vec())),
        Arc::new(MemSource::new(b"second".to_vec())),
        Arc::new(MemSource::new(b"third".to_vec())),
    ];

    let results = pool.hash_files(&sources, 2, &CancelToken::new());
    assert_eq!(results.len(), 3);
    assert_eq!(*results[0].as_ref().unwrap(), hash_bytes(b"first"));
    assert_eq!(*results[1].as_ref().unwrap(), hash_bytes(b"second"));
    assert_eq!(*results[2].as_ref().unwrap(), hash_bytes(b"third"));
}
