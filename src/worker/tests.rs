use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use super::*;

#[test]
fn executes_jobs_on_pool_threads() {
    let pool = WorkerPool::start(2, None, None);
    let (tx, rx) = mpsc::channel();

    for i in 0..10 {
        let tx = tx.clone();
        pool.execute(Box::new(move || {
            tx.send(i).unwrap();
        }));
    }

    let mut results: Vec<i32> = (0..10).map(|_| rx.recv().unwrap()).collect();
    results.sort_unstable();
    assert_eq!(results, (0..10).collect::<Vec<_>>());

    pool.stop();
}

#[test]
fn delayed_jobs_wait_for_their_deadline() {
    let pool = WorkerPool::start(1, None, None);
    let (tx, rx) = mpsc::channel();

    let started = Instant::now();
    pool.execute_delayed(
        Box::new(move || {
            tx.send(()).unwrap();
        }),
        Duration::from_millis(80),
    );

    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(80));

    pool.stop();
}

#[test]
fn delayed_job_does_not_block_immediate_jobs() {
    let pool = WorkerPool::start(1, None, None);
    let (tx, rx) = mpsc::channel();

    let tx_delayed = tx.clone();
    pool.execute_delayed(
        Box::new(move || {
            tx_delayed.send("delayed").unwrap();
        }),
        Duration::from_millis(200),
    );
    pool.execute(Box::new(move || {
        tx.send("immediate").unwrap();
    }));

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "immediate");
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "delayed");

    pool.stop();
}

#[test]
fn init_and_exit_hooks_run_once_per_thread() {
    let inits = Arc::new(AtomicUsize::new(0));
    let exits = Arc::new(AtomicUsize::new(0));

    let init_count = inits.clone();
    let exit_count = exits.clone();
    let pool = WorkerPool::start(
        2,
        Some(Arc::new(move || {
            init_count.fetch_add(1, Ordering::SeqCst);
        })),
        Some(Arc::new(move || {
            exit_count.fetch_add(1, Ordering::SeqCst);
        })),
    );

    pool.stop();
    assert_eq!(inits.load(Ordering::SeqCst), 2);
    assert_eq!(exits.load(Ordering::SeqCst), 2);
}

#[test]
fn dispatch_prefers_idle_threads() {
    let pool = WorkerPool::start(2, None, None);
    let (block_tx, block_rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel();

    // Occupy one thread
    pool.execute(Box::new(move || {
        let _ = block_rx.recv_timeout(Duration::from_secs(5));
    }));

    // These should all land on the other thread and complete
    for i in 0..3 {
        let done = done_tx.clone();
        pool.execute(Box::new(move || {
            done.send(i).unwrap();
        }));
    }

    for _ in 0..3 {
        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }

    block_tx.send(()).unwrap();
    pool.stop();
}
