//! A small fixed pool of OS threads for blocking work: ALAC header
//! preparation, gzipping, metadata prep. The async side must never block,
//! so anything that touches the disk or a database goes through here (or
//! through the cache thread, which owns the databases).
//!
//! Each thread has its own command channel; `execute` picks the thread with
//! the shortest backlog. Delayed jobs wait on the owning thread's timer
//! queue. Threads run optional init/exit hooks, which the surrounding
//! daemon uses to open a per-thread database handle.

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// A job for the pool
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Thread lifecycle hook
pub type Hook = Arc<dyn Fn() + Send + Sync + 'static>;

/// Default pool size
pub const DEFAULT_THREADS: usize = 2;

enum Command {
    Run(Job),
    RunDelayed(Job, Duration),
    Exit,
}

struct WorkerThread {
    sender: mpsc::Sender<Command>,
    backlog: Arc<AtomicUsize>,
    handle: Option<std::thread::JoinHandle<()>>,
}

/// The worker pool
pub struct WorkerPool {
    threads: Vec<WorkerThread>,
}

impl WorkerPool {
    /// Spawn `nthreads` workers. `init`/`exit` run once on each thread.
    #[must_use]
    pub fn start(nthreads: usize, init: Option<Hook>, exit: Option<Hook>) -> Self {
        let threads = (0..nthreads.max(1))
            .map(|i| {
                let (sender, receiver) = mpsc::channel();
                let backlog = Arc::new(AtomicUsize::new(0));
                let thread_backlog = backlog.clone();
                let init = init.clone();
                let exit = exit.clone();

                let handle = std::thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || thread_main(&receiver, &thread_backlog, init, exit))
                    .ok();

                WorkerThread {
                    sender,
                    backlog,
                    handle,
                }
            })
            .collect();

        Self { threads }
    }

    /// Run a job on the least-loaded thread
    pub fn execute(&self, job: Job) {
        self.dispatch(Command::Run(job));
    }

    /// Run a job after `delay`, on whichever thread takes it
    pub fn execute_delayed(&self, job: Job, delay: Duration) {
        self.dispatch(Command::RunDelayed(job, delay));
    }

    fn dispatch(&self, command: Command) {
        // Round-robin by current backlog
        let target = self
            .threads
            .iter()
            .min_by_key(|t| t.backlog.load(Ordering::Relaxed));
        let Some(target) = target else {
            return;
        };

        target.backlog.fetch_add(1, Ordering::Relaxed);
        if target.sender.send(command).is_err() {
            target.backlog.fetch_sub(1, Ordering::Relaxed);
            tracing::error!("worker thread is gone, job dropped");
        }
    }

    /// Stop the pool, waiting for queued jobs to finish
    pub fn stop(mut self) {
        for thread in &self.threads {
            let _ = thread.sender.send(Command::Exit);
        }
        for thread in &mut self.threads {
            if let Some(handle) = thread.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn thread_main(
    receiver: &mpsc::Receiver<Command>,
    backlog: &AtomicUsize,
    init: Option<Hook>,
    exit: Option<Hook>,
) {
    if let Some(init) = init {
        init();
    }

    // Delayed jobs wait here, soonest first
    let mut timers: Vec<(Instant, Job)> = Vec::new();

    loop {
        let timeout = timers
            .first()
            .map(|(due, _)| due.saturating_duration_since(Instant::now()));

        let command = match timeout {
            None => receiver.recv().ok(),
            Some(timeout) => match receiver.recv_timeout(timeout) {
                Ok(command) => Some(command),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let (_, job) = timers.remove(0);
                    backlog.fetch_sub(1, Ordering::Relaxed);
                    job();
                    continue;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => None,
            },
        };

        match command {
            Some(Command::Run(job)) => {
                job();
                backlog.fetch_sub(1, Ordering::Relaxed);
            }
            Some(Command::RunDelayed(job, delay)) => {
                let due = Instant::now() + delay;
                let pos = timers.partition_point(|(t, _)| *t <= due);
                timers.insert(pos, (due, job));
            }
            Some(Command::Exit) | None => break,
        }
    }

    // Drain remaining timers before exiting so shutdown does not lose work
    for (_, job) in timers {
        job();
    }

    if let Some(exit) = exit {
        exit();
    }
}
