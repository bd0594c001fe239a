use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::retry::RetryPolicy;
use crate::shards::ShardHandle;
use crate::util::format_elapsed;
use crate::worker::{ShardOutcome, ShardStats};

pub const DEFAULT_RESERVED_CORES: usize = 2;

/// Pool size: an explicit thread count wins, otherwise all cores minus `reserved`, never below one.
pub fn pool_size(threads: Option<usize>, reserved: usize) -> usize {
    match threads {
        Some(n) if n > 0 => n,
        _ => num_cpus::get().saturating_sub(reserved).max(1),
    }
}

#[derive(Debug)]
pub struct ProcessedShard {
    pub shard: ShardHandle,
    pub attempts: u32,
    pub stats: ShardStats,
}

#[derive(Debug)]
pub struct FailedShard {
    pub shard: ShardHandle,
    pub attempts: u32,
    pub error: anyhow::Error,
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    pub total: usize,
    pub processed: Vec<ProcessedShard>,
    pub skipped: Vec<ShardHandle>,
    pub failed: Vec<FailedShard>,
    /// Every call into the worker function, retries included.
    pub invocations: u64,
}

impl DispatchReport {
    pub fn completed(&self) -> usize {
        self.processed.len() + self.skipped.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

struct Completion {
    index: usize,
    attempt: u32,
    result: Result<ShardOutcome>,
}

/// Runs one worker task per shard on a fixed-size pool with bounded retries.
pub struct Dispatcher {
    pool: Arc<ThreadPool>,
    threads: usize,
    policy: RetryPolicy,
    show_progress: bool,
}

impl Dispatcher {
    pub fn new(threads: usize, policy: RetryPolicy) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("shard-worker-{}", i))
            .build()
            .context("Failed to build shard worker pool")?;
        Ok(Self { pool: Arc::new(pool), threads, policy, show_progress: true })
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Blocks until every shard has succeeded, been skipped, or exhausted its retries.
    ///
    /// Completions are observed in whatever order the pool finishes them. A failed
    /// shard is resubmitted whole once the policy's backoff has elapsed; other shards
    /// keep the pool busy meanwhile. One shard that keeps failing never aborts the run.
    pub fn run<F>(&self, shards: Vec<ShardHandle>, worker_fn: F) -> DispatchReport
    where
        F: Fn(&ShardHandle) -> Result<ShardOutcome> + Send + Sync + 'static,
    {
        let start = Instant::now();
        let total = shards.len();
        let mut report = DispatchReport { total, ..Default::default() };
        if total == 0 {
            return report;
        }

        let shards: Arc<Vec<ShardHandle>> = Arc::new(shards);
        let worker_fn = Arc::new(worker_fn);
        let (sender, receiver) = unbounded::<Completion>();
        let progress = self.progress_bar(total as u64);

        info!(
            "Dispatching {} shards on {} workers (up to {} attempts each)",
            total,
            self.threads,
            self.policy.max_attempts()
        );
        for index in 0..total {
            self.submit(&shards, &worker_fn, &sender, index, 1);
        }

        // Retries waiting out their backoff, soonest first. No pool thread is held while they wait.
        let mut delayed: BinaryHeap<Reverse<(Instant, usize, u32)>> = BinaryHeap::new();
        let mut in_flight = total;
        while in_flight > 0 || !delayed.is_empty() {
            let now = Instant::now();
            while let Some(Reverse((ready_at, index, attempt))) = delayed.peek().copied() {
                if ready_at > now {
                    break;
                }
                delayed.pop();
                self.submit(&shards, &worker_fn, &sender, index, attempt);
                in_flight += 1;
            }
            if in_flight == 0 {
                if let Some(Reverse((ready_at, _, _))) = delayed.peek() {
                    thread::sleep(ready_at.saturating_duration_since(Instant::now()));
                }
                continue;
            }

            let completion = match delayed.peek() {
                Some(Reverse((ready_at, _, _))) => {
                    match receiver.recv_timeout(ready_at.saturating_duration_since(Instant::now())) {
                        Ok(completion) => completion,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => {
                            error!("Shard completion channel closed with {} tasks in flight", in_flight);
                            break;
                        }
                    }
                }
                None => match receiver.recv() {
                    Ok(completion) => completion,
                    Err(_) => {
                        error!("Shard completion channel closed with {} tasks in flight", in_flight);
                        break;
                    }
                },
            };
            in_flight -= 1;
            report.invocations += 1;
            let shard = &shards[completion.index];

            match completion.result {
                Ok(ShardOutcome::Processed(stats)) => {
                    progress.set_message(format!("OK: {} ({} rows)", shard, stats.total_rows()));
                    progress.inc(1);
                    report.processed.push(ProcessedShard { shard: shard.clone(), attempts: completion.attempt, stats });
                }
                Ok(ShardOutcome::Skipped) => {
                    progress.inc(1);
                    report.skipped.push(shard.clone());
                }
                Err(e) => {
                    error!(
                        "Failed processing shard {} (Attempt {}/{}): {:#}",
                        shard,
                        completion.attempt,
                        self.policy.max_attempts(),
                        e
                    );
                    if self.policy.should_retry(completion.attempt) {
                        let ready_at = Instant::now() + self.policy.delay_for(completion.attempt);
                        delayed.push(Reverse((ready_at, completion.index, completion.attempt + 1)));
                    } else {
                        error!("Shard {} failed after {} attempts.", shard, completion.attempt);
                        progress.set_message(format!("ERR: {}", shard));
                        progress.inc(1);
                        report.failed.push(FailedShard { shard: shard.clone(), attempts: completion.attempt, error: e });
                    }
                }
            }
        }

        progress.finish_with_message(format!(
            "Dispatch finished in {}. {} processed, {} skipped, {} failed.",
            format_elapsed(start.elapsed()),
            report.processed.len(),
            report.skipped.len(),
            report.failed.len()
        ));
        if !report.failed.is_empty() {
            warn!("{} shards permanently failed in this run", report.failed.len());
        }
        report
    }

    fn submit<F>(
        &self,
        shards: &Arc<Vec<ShardHandle>>,
        worker_fn: &Arc<F>,
        sender: &Sender<Completion>,
        index: usize,
        attempt: u32,
    ) where
        F: Fn(&ShardHandle) -> Result<ShardOutcome> + Send + Sync + 'static,
    {
        let shards = Arc::clone(shards);
        let worker_fn = Arc::clone(worker_fn);
        let sender = sender.clone();
        self.pool.spawn(move || {
            let shard = &shards[index];
            let result = match catch_unwind(AssertUnwindSafe(|| (*worker_fn)(shard))) {
                Ok(result) => result,
                Err(payload) => Err(anyhow::anyhow!("worker panicked: {}", panic_message(payload.as_ref()))),
            };
            // The receiver only goes away if the dispatcher itself is gone.
            let _ = sender.send(Completion { index, attempt, result });
        });
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len);
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta} @ {per_sec}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        bar.set_style(style);
        bar.set_message("Starting processing...");
        bar
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::Duration;

    fn shards(names: &[&str]) -> Vec<ShardHandle> {
        names
            .iter()
            .map(|n| ShardHandle::new(Path::new("/corpus"), PathBuf::from(format!("/corpus/{}", n))).unwrap())
            .collect()
    }

    fn dispatcher(max_retries: u32) -> Dispatcher {
        Dispatcher::new(3, RetryPolicy::immediate(max_retries)).unwrap().with_progress(false)
    }

    #[test]
    fn failing_shard_is_attempted_max_retries_plus_one_times() {
        let calls: Arc<Mutex<HashMap<String, u32>>> = Arc::default();
        let seen = Arc::clone(&calls);

        let report = dispatcher(2).run(shards(&["good_a.gz", "bad.gz", "good_b.gz"]), move |shard| {
            *seen.lock().unwrap().entry(shard.to_string()).or_default() += 1;
            if shard.to_string() == "bad.gz" {
                anyhow::bail!("disk on fire")
            }
            Ok(ShardOutcome::Processed(ShardStats::default()))
        });

        let calls = calls.lock().unwrap();
        assert_eq!(calls["bad.gz"], 3);
        assert_eq!(calls["good_a.gz"], 1);
        assert_eq!(calls["good_b.gz"], 1);
        assert_eq!(report.processed.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].attempts, 3);
        assert!(report.failed[0].error.to_string().contains("disk on fire"));
        assert_eq!(report.invocations, 5);
        assert_eq!(report.completed(), 3);
    }

    #[test]
    fn transient_failure_recovers_on_retry() {
        let calls = Arc::new(Mutex::new(0u32));
        let seen = Arc::clone(&calls);

        let report = dispatcher(3).run(shards(&["flaky.gz"]), move |_| {
            let mut n = seen.lock().unwrap();
            *n += 1;
            if *n < 3 {
                anyhow::bail!("transient")
            }
            Ok(ShardOutcome::Processed(ShardStats::default()))
        });

        assert!(report.is_success());
        assert_eq!(report.processed[0].attempts, 3);
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[test]
    fn panics_are_contained_as_failures() {
        let report = dispatcher(0).run(shards(&["panics.gz", "fine.gz"]), |shard| {
            if shard.to_string() == "panics.gz" {
                panic!("boom");
            }
            Ok(ShardOutcome::Skipped)
        });

        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].error.to_string().contains("boom"));
        assert_eq!(report.skipped.len(), 1);
    }

    #[test]
    fn backoff_does_not_occupy_the_only_worker() {
        let delay = Duration::from_millis(400);
        let policy = RetryPolicy { initial_delay_ms: delay.as_millis() as u64, ..RetryPolicy::new(1) };
        let dispatcher = Dispatcher::new(1, policy).unwrap().with_progress(false);
        let retries: Arc<Mutex<Vec<Instant>>> = Arc::default();
        let seen = Arc::clone(&retries);
        let attempts: Arc<Mutex<HashMap<String, u32>>> = Arc::default();

        let report = dispatcher.run(shards(&["bad_a.gz", "bad_b.gz"]), move |shard| {
            let mut attempts = attempts.lock().unwrap();
            let n = attempts.entry(shard.to_string()).or_default();
            *n += 1;
            if *n == 1 {
                anyhow::bail!("first attempt fails")
            }
            seen.lock().unwrap().push(Instant::now());
            Ok(ShardOutcome::Processed(ShardStats::default()))
        });

        assert!(report.is_success());
        assert_eq!(report.invocations, 4);
        let retries = retries.lock().unwrap();
        assert_eq!(retries.len(), 2);
        // Both backoffs elapse concurrently, so the retries are not a full delay apart.
        assert!(retries[1].duration_since(retries[0]) < delay);
    }

    #[test]
    fn empty_input_returns_immediately() {
        let report = dispatcher(1).run(Vec::new(), |_| Ok(ShardOutcome::Skipped));
        assert_eq!(report.total, 0);
        assert_eq!(report.invocations, 0);
    }

    #[test]
    fn pool_size_reserves_cores_but_never_drops_to_zero() {
        assert_eq!(pool_size(Some(4), 2), 4);
        assert_eq!(pool_size(None, usize::MAX), 1);
        assert!(pool_size(Some(0), 0) >= 1);
    }
}
