//! Single-thread background job executor: a FIFO job queue drained by one
//! worker thread, with suspend/resume and duplicate-job suppression.
//!
//! Three independent executors are run per queue (dump, load, unlink), each
//! an instance of the same [`Executor`] type. A job stays at the head of the
//! queue while it runs — not removed until its runnable returns — so that
//! `distinct_job` checks made by the producer thread while a job is in
//! flight still see the correct tail.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Jobs a background executor can run. Each variant names the contiguous
/// half-open range of blocks or suffixes it covers, which is also what
/// `is_duplicate_of_tail` compares for adjacency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// Dump push-ring blocks `[start_block, end_block)` to the file chain.
    Dump { start_block: usize, end_block: usize },
    /// Load file-chain blocks whose suffixes cover
    /// `[file_start_block, file_end_block)` into the pop ring.
    Load { file_start_block: i64, file_end_block: i64 },
    /// Unlink the file chain entry at `suffix` in the named chain
    /// (`"file_block"` or `"pop_block"`).
    Unlink { prefix: &'static str, suffix: i64 },
}

impl Job {
    /// Answers "is `self` a duplicate of the current tail job `last`?" —
    /// true precisely when the two are NOT contiguous. A dump/load of
    /// `[a,b)` following a queued `[b,c)` extends it in place instead of
    /// scheduling a second job; anything else (including overlaps and
    /// gaps) is treated as a duplicate and dropped. Unlink jobs are never
    /// deduplicated, matching the original, which has no checker for them.
    #[must_use]
    pub fn is_duplicate_of_tail(&self, last: &Self) -> bool {
        match (self, last) {
            (Self::Dump { start_block, .. }, Self::Dump { end_block: last_end, .. }) => start_block != last_end,
            (Self::Load { file_start_block, .. }, Self::Load { file_end_block: last_end, .. }) => {
                file_start_block != last_end
            }
            (Self::Unlink { .. }, Self::Unlink { .. }) => false,
            _ => true,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Dump { start_block, end_block } => format!("dump[{start_block},{end_block})"),
            Self::Load { file_start_block, file_end_block } => format!("load[{file_start_block},{file_end_block})"),
            Self::Unlink { prefix, suffix } => format!("unlink {prefix}_{suffix}"),
        }
    }
}

/// Jobs slower than this are logged at `info` on completion; matches the
/// original's 10ms `INFQ_LOG_THRESHOLD`.
const LOG_THRESHOLD: Duration = Duration::from_millis(10);

struct State {
    jobs: VecDeque<Job>,
    stopped: bool,
    suspended: bool,
}

struct Shared {
    mu: Mutex<State>,
    cv: Condvar,
}

fn lock<'a>(mu: &'a Mutex<State>) -> MutexGuard<'a, State> {
    mu.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A single-thread worker draining a FIFO job queue.
pub struct Executor {
    name: &'static str,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Executor {
    /// Spawns the worker thread, which calls `run` for each job it
    /// dequeues. `run` receives the environment the jobs operate on; errors
    /// are logged but never stop the executor, matching the original.
    pub fn spawn<F>(name: &'static str, run: F) -> Self
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared { mu: Mutex::new(State { jobs: VecDeque::new(), stopped: false, suspended: false }), cv: Condvar::new() });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run_loop(&worker_shared, name, &run))
            .expect("spawning a background executor thread");

        Self { name, shared, handle: Some(handle) }
    }

    fn run_loop<F>(shared: &Arc<Shared>, name: &str, run: &F)
    where
        F: Fn(&Job),
    {
        loop {
            let job = {
                let mut guard = lock(&shared.mu);
                loop {
                    if guard.stopped {
                        return;
                    }
                    if !guard.suspended {
                        if let Some(j) = guard.jobs.front() {
                            break j.clone();
                        }
                    }
                    guard = shared.cv.wait(guard).unwrap_or_else(PoisonError::into_inner);
                }
            };

            let start = Instant::now();
            run(&job);
            let elapsed = start.elapsed();
            if elapsed > LOG_THRESHOLD {
                tracing::info!(executor = name, job = %job.describe(), elapsed_ms = elapsed.as_millis(), "finished background job");
            }

            let mut guard = lock(&shared.mu);
            guard.jobs.pop_front();
        }
    }

    /// Enqueues `job` unless it is a duplicate of the current tail job.
    /// Returns `true` if the job was enqueued.
    pub fn add_job(&self, job: Job) -> bool {
        let mut guard = lock(&self.shared.mu);
        if let Some(last) = guard.jobs.back() {
            if job.is_duplicate_of_tail(last) {
                tracing::debug!(executor = self.name, job = %job.describe(), "suppressing duplicate job");
                return false;
            }
        }
        guard.jobs.push_back(job);
        self.shared.cv.notify_one();
        true
    }

    /// Pauses job execution; jobs keep queuing but none run until resumed.
    pub fn suspend(&self) {
        lock(&self.shared.mu).suspended = true;
    }

    /// Resumes job execution.
    pub fn resume(&self) {
        lock(&self.shared.mu).suspended = false;
        self.shared.cv.notify_one();
    }

    /// Resumes job execution only if currently suspended; a no-op
    /// otherwise.
    pub fn resume_if_suspended(&self) {
        let mut guard = lock(&self.shared.mu);
        if guard.suspended {
            guard.suspended = false;
            self.shared.cv.notify_one();
        }
    }

    /// Number of jobs currently queued (including one in flight, if any).
    #[must_use]
    pub fn pending_task_num(&self) -> usize {
        lock(&self.shared.mu).jobs.len()
    }

    /// True if the executor is currently suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        lock(&self.shared.mu).suspended
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        {
            let mut guard = lock(&self.shared.mu);
            let pending = guard.jobs.len();
            if pending != 0 {
                tracing::error!(executor = self.name, pending, "stopping executor with jobs still queued");
            }
            guard.stopped = true;
        }
        self.shared.cv.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        // Remaining queued jobs are dropped here along with `shared`; they
        // carry no resources of their own to release.
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{Executor, Job};

    #[test]
    fn jobs_run_in_order() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let exec = Executor::spawn("test", move |job| {
            seen2.lock().unwrap().push(job.clone());
        });

        exec.add_job(Job::Dump { start_block: 0, end_block: 1 });
        exec.add_job(Job::Dump { start_block: 1, end_block: 2 });

        for _ in 0..50 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let final_seen = seen.lock().unwrap().clone();
        assert_eq!(
            final_seen,
            vec![Job::Dump { start_block: 0, end_block: 1 }, Job::Dump { start_block: 1, end_block: 2 }]
        );
    }

    #[test]
    fn non_adjacent_dump_job_is_a_duplicate() {
        let a = Job::Dump { start_block: 0, end_block: 1 };
        let b = Job::Dump { start_block: 1, end_block: 2 };
        let c = Job::Dump { start_block: 5, end_block: 6 };
        assert!(!b.is_duplicate_of_tail(&a));
        assert!(c.is_duplicate_of_tail(&a));
    }

    #[test]
    fn add_job_suppresses_duplicate_against_tail() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let exec = Executor::spawn("test", move |_job| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        exec.suspend();
        assert!(exec.add_job(Job::Dump { start_block: 0, end_block: 1 }));
        assert!(!exec.add_job(Job::Dump { start_block: 5, end_block: 6 }));
        assert_eq!(exec.pending_task_num(), 1);
    }

    #[test]
    fn suspend_blocks_execution_until_resumed() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let exec = Executor::spawn("test", move |_job| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        exec.suspend();
        exec.add_job(Job::Dump { start_block: 0, end_block: 1 });
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        exec.resume();
        for _ in 0..50 {
            if count.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
