#![deny(warnings)]

//! Asynchronous job queue for simulation runs.
//!
//! Jobs are admitted FIFO through a bounded semaphore, executed on blocking
//! worker threads, cached by canonical config fingerprint, reaped by a TTL
//! sweep, and cancelled cooperatively between simulated months. Progress is
//! streamed through per-job watch channels: late subscribers observe the
//! latest known state immediately, with no backlog replay.
//!
//! The store is an explicit context object created at process start and
//! passed to the queue at construction time; there is no global registry.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sim_core::{config_fingerprint, JobOutput, NormalizedConfig};
use sim_engine::{run_job, EngineError, ProgressSink};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique job identifier.
pub type JobId = Uuid;

/// Lifecycle states of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states cannot transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Progress and terminal events published per job.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress {
        progress_pct: f64,
        current_month: u32,
        total_months: u32,
    },
    Done {
        progress_pct: f64,
    },
    Error {
        error_message: String,
    },
}

/// Errors returned to callers of the queue API.
#[derive(Debug, Error, PartialEq)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {0} is not completed")]
    NotReady(JobId),
    #[error("job {0} failed: {1}")]
    Failed(JobId, String),
    #[error("queue is shut down")]
    ShutDown,
}

/// Receipt returned by `submit`.
#[derive(Clone, Debug, Serialize)]
pub struct SubmitReceipt {
    pub job_id: JobId,
    pub status: JobStatus,
    /// True when an equivalent non-expired job absorbed this submission.
    pub cached: bool,
}

/// Receipt returned by `cancel`.
#[derive(Clone, Debug, Serialize)]
pub struct CancelReceipt {
    pub success: bool,
    pub message: String,
}

/// Point-in-time view of one job.
#[derive(Clone, Debug, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress_pct: f64,
    pub current_month: u32,
    pub total_months: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Aggregate queue counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total_jobs: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Completed jobs currently holding a cached result.
    pub cache_size: usize,
}

/// Queue tuning knobs.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Bounded worker slots pulling pending jobs FIFO.
    pub max_concurrent_jobs: usize,
    /// Retention of completed/failed/cancelled jobs and their results.
    pub ttl: Duration,
    /// Interval of the background eviction sweep.
    pub sweep_interval: std::time::Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            ttl: Duration::hours(24),
            sweep_interval: std::time::Duration::from_secs(60),
        }
    }
}

/// Unit of work scheduled by the queue.
///
/// The production implementation drives the simulation engine; tests inject
/// stubs to exercise queue mechanics without real simulations.
pub trait JobRunner: Send + Sync + 'static {
    fn run(
        &self,
        config: &NormalizedConfig,
        cancel: &AtomicBool,
        progress: &dyn ProgressSink,
    ) -> Result<JobOutput, EngineError>;
}

/// Runner executing the real engine (single run or Monte Carlo).
pub struct SimulationRunner;

impl JobRunner for SimulationRunner {
    fn run(
        &self,
        config: &NormalizedConfig,
        cancel: &AtomicBool,
        progress: &dyn ProgressSink,
    ) -> Result<JobOutput, EngineError> {
        run_job(config, cancel, progress)
    }
}

/// Engine-facing publisher backing one job's progress channel.
///
/// Guards monotonicity: parallel Monte Carlo trials may report completions
/// out of order, and only strictly increasing counts are published.
pub struct ProgressPublisher {
    tx: watch::Sender<ProgressEvent>,
    last: AtomicU32,
}

impl ProgressSink for ProgressPublisher {
    fn on_progress(&self, completed: u32, total: u32) {
        let prev = self.last.fetch_max(completed, Ordering::Relaxed);
        if completed <= prev {
            return;
        }
        let progress_pct = if total > 0 {
            100.0 * f64::from(completed) / f64::from(total)
        } else {
            100.0
        };
        let _ = self.tx.send(ProgressEvent::Progress {
            progress_pct,
            current_month: completed,
            total_months: total,
        });
    }
}

struct JobEntry {
    fingerprint: String,
    status: JobStatus,
    error: Option<String>,
    result: Option<JobOutput>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cancel: Arc<AtomicBool>,
    progress_tx: watch::Sender<ProgressEvent>,
    // Held so publishes always land, even with no external subscriber.
    progress_rx: watch::Receiver<ProgressEvent>,
}

/// Shared registry of jobs and cached results.
///
/// All mutations funnel through the single `RwLock`, so status transitions,
/// cache lookups, and the eviction sweep never race per job.
pub struct JobStore {
    jobs: RwLock<HashMap<JobId, JobEntry>>,
}

impl JobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
        })
    }
}

/// Bounded-concurrency job queue with content-addressed result caching.
pub struct JobQueue {
    store: Arc<JobStore>,
    config: QueueConfig,
    runner: Arc<dyn JobRunner>,
    semaphore: Arc<Semaphore>,
    accepting: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    /// Build the queue over an externally owned store and start the TTL
    /// sweep. Must be called inside a tokio runtime.
    pub fn new(store: Arc<JobStore>, config: QueueConfig, runner: Arc<dyn JobRunner>) -> Arc<Self> {
        let queue = Arc::new(Self {
            store,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            config,
            runner,
            accepting: AtomicBool::new(true),
            workers: Mutex::new(Vec::new()),
            sweeper: Mutex::new(None),
        });
        let sweeper = tokio::spawn(sweep_loop(Arc::downgrade(&queue)));
        // Uncontended: the queue has not been shared yet.
        *queue.sweeper.try_lock().expect("fresh queue") = Some(sweeper);
        queue
    }

    /// Submit a config, deduplicating against an equivalent non-expired job.
    ///
    /// A pending, running, or completed job with the same fingerprint is
    /// returned as `cached = true` and no second execution starts. Failed
    /// and cancelled jobs are not cache hits.
    pub async fn submit(
        self: &Arc<Self>,
        config: NormalizedConfig,
    ) -> Result<SubmitReceipt, JobError> {
        if !self.accepting.load(Ordering::Relaxed) {
            return Err(JobError::ShutDown);
        }
        let fingerprint = config_fingerprint(&config);
        let now = Utc::now();

        let mut jobs = self.store.jobs.write().await;
        let cached = jobs.iter().find(|(_, entry)| {
            entry.fingerprint == fingerprint
                && match entry.status {
                    JobStatus::Pending | JobStatus::Running => true,
                    JobStatus::Completed => entry
                        .completed_at
                        .map(|done| now - done < self.config.ttl)
                        .unwrap_or(false),
                    JobStatus::Failed | JobStatus::Cancelled => false,
                }
        });
        if let Some((&job_id, entry)) = cached {
            debug!(%job_id, "submission absorbed by cached job");
            return Ok(SubmitReceipt {
                job_id,
                status: entry.status,
                cached: true,
            });
        }

        let job_id = Uuid::new_v4();
        let cancel = Arc::new(AtomicBool::new(false));
        let (progress_tx, progress_rx) = watch::channel(ProgressEvent::Progress {
            progress_pct: 0.0,
            current_month: 0,
            total_months: 0,
        });
        jobs.insert(
            job_id,
            JobEntry {
                fingerprint,
                status: JobStatus::Pending,
                error: None,
                result: None,
                created_at: now,
                started_at: None,
                completed_at: None,
                cancel: Arc::clone(&cancel),
                progress_tx: progress_tx.clone(),
                progress_rx,
            },
        );
        drop(jobs);
        info!(%job_id, "job submitted");

        let worker = tokio::spawn(run_worker(Arc::clone(self), job_id, config, cancel, progress_tx));
        self.workers.lock().await.push(worker);

        Ok(SubmitReceipt {
            job_id,
            status: JobStatus::Pending,
            cached: false,
        })
    }

    /// Current status and progress of a job.
    pub async fn status(&self, job_id: JobId) -> Result<JobSnapshot, JobError> {
        let jobs = self.store.jobs.read().await;
        let entry = jobs.get(&job_id).ok_or(JobError::NotFound(job_id))?;
        let (progress_pct, current_month, total_months) = match *entry.progress_rx.borrow() {
            ProgressEvent::Progress {
                progress_pct,
                current_month,
                total_months,
            } => (progress_pct, current_month, total_months),
            ProgressEvent::Done { progress_pct } => (progress_pct, 0, 0),
            ProgressEvent::Error { .. } => (0.0, 0, 0),
        };
        Ok(JobSnapshot {
            job_id,
            status: entry.status,
            progress_pct,
            current_month,
            total_months,
            error: entry.error.clone(),
            created_at: entry.created_at,
            started_at: entry.started_at,
            completed_at: entry.completed_at,
        })
    }

    /// Result of a completed job.
    pub async fn results(&self, job_id: JobId) -> Result<JobOutput, JobError> {
        let jobs = self.store.jobs.read().await;
        let entry = jobs.get(&job_id).ok_or(JobError::NotFound(job_id))?;
        match entry.status {
            JobStatus::Completed => entry
                .result
                .clone()
                .ok_or_else(|| JobError::Failed(job_id, "result evicted".to_string())),
            JobStatus::Failed => Err(JobError::Failed(
                job_id,
                entry.error.clone().unwrap_or_default(),
            )),
            _ => Err(JobError::NotReady(job_id)),
        }
    }

    /// Request cooperative cancellation.
    ///
    /// The flag is observed between simulated months, so cancellation is
    /// bounded by one month's computation. Finished jobs return a no-op
    /// success.
    pub async fn cancel(&self, job_id: JobId) -> Result<CancelReceipt, JobError> {
        let jobs = self.store.jobs.read().await;
        let entry = jobs.get(&job_id).ok_or(JobError::NotFound(job_id))?;
        if entry.status.is_terminal() {
            return Ok(CancelReceipt {
                success: true,
                message: format!("job already {:?}", entry.status).to_lowercase(),
            });
        }
        entry.cancel.store(true, Ordering::Relaxed);
        Ok(CancelReceipt {
            success: true,
            message: "cancellation requested".to_string(),
        })
    }

    /// Subscribe to a job's progress stream.
    ///
    /// The receiver immediately holds the latest known event; historical
    /// events are not replayed.
    pub async fn subscribe(&self, job_id: JobId) -> Result<watch::Receiver<ProgressEvent>, JobError> {
        let jobs = self.store.jobs.read().await;
        let entry = jobs.get(&job_id).ok_or(JobError::NotFound(job_id))?;
        Ok(entry.progress_tx.subscribe())
    }

    /// Aggregate counters over the registry.
    pub async fn stats(&self) -> QueueStats {
        let jobs = self.store.jobs.read().await;
        let mut stats = QueueStats {
            total_jobs: jobs.len(),
            ..QueueStats::default()
        };
        for entry in jobs.values() {
            match entry.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => {
                    stats.completed += 1;
                    if entry.result.is_some() {
                        stats.cache_size += 1;
                    }
                }
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Stop accepting submissions, drain every in-flight job, and stop the
    /// sweep.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Relaxed);
        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        if let Some(sweeper) = self.sweeper.lock().await.take() {
            sweeper.abort();
        }
        info!("queue shut down");
    }

    /// Drop terminal jobs past their TTL, freeing cached results.
    async fn sweep(&self) {
        let now = Utc::now();
        let ttl = self.config.ttl;
        let mut jobs = self.store.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, entry| {
            !(entry.status.is_terminal()
                && entry
                    .completed_at
                    .map(|done| now - done >= ttl)
                    .unwrap_or(false))
        });
        let evicted = before - jobs.len();
        if evicted > 0 {
            debug!(evicted, "ttl sweep evicted jobs");
        }
        drop(jobs);
        // Opportunistically prune finished worker handles.
        self.workers.lock().await.retain(|w| !w.is_finished());
    }

    async fn transition(&self, job_id: JobId, apply: impl FnOnce(&mut JobEntry)) {
        let mut jobs = self.store.jobs.write().await;
        if let Some(entry) = jobs.get_mut(&job_id) {
            apply(entry);
        }
    }
}

/// One job's lifecycle: FIFO admission, blocking execution, terminal
/// transition. A failing or panicking job never takes the worker pool down.
async fn run_worker(
    queue: Arc<JobQueue>,
    job_id: JobId,
    config: NormalizedConfig,
    cancel: Arc<AtomicBool>,
    progress_tx: watch::Sender<ProgressEvent>,
) {
    let permit = match Arc::clone(&queue.semaphore).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    if cancel.load(Ordering::Relaxed) {
        queue
            .transition(job_id, |entry| {
                entry.status = JobStatus::Cancelled;
                entry.completed_at = Some(Utc::now());
            })
            .await;
        let _ = progress_tx.send(ProgressEvent::Error {
            error_message: "cancelled before start".to_string(),
        });
        return;
    }

    queue
        .transition(job_id, |entry| {
            entry.status = JobStatus::Running;
            entry.started_at = Some(Utc::now());
        })
        .await;
    debug!(%job_id, "job running");

    let runner = Arc::clone(&queue.runner);
    let worker_cancel = Arc::clone(&cancel);
    let publisher = ProgressPublisher {
        tx: progress_tx.clone(),
        last: AtomicU32::new(0),
    };
    let outcome = tokio::task::spawn_blocking(move || {
        runner.run(&config, &worker_cancel, &publisher)
    })
    .await;
    drop(permit);

    match outcome {
        Ok(Ok(output)) => {
            queue
                .transition(job_id, |entry| {
                    entry.status = JobStatus::Completed;
                    entry.completed_at = Some(Utc::now());
                    entry.result = Some(output);
                })
                .await;
            let _ = progress_tx.send(ProgressEvent::Done { progress_pct: 100.0 });
            info!(%job_id, "job completed");
        }
        Ok(Err(EngineError::Cancelled)) => {
            queue
                .transition(job_id, |entry| {
                    entry.status = JobStatus::Cancelled;
                    entry.completed_at = Some(Utc::now());
                })
                .await;
            let _ = progress_tx.send(ProgressEvent::Error {
                error_message: "cancelled".to_string(),
            });
            info!(%job_id, "job cancelled");
        }
        Ok(Err(error)) => {
            let message = error.to_string();
            queue
                .transition(job_id, |entry| {
                    entry.status = JobStatus::Failed;
                    entry.completed_at = Some(Utc::now());
                    entry.error = Some(message.clone());
                })
                .await;
            let _ = progress_tx.send(ProgressEvent::Error {
                error_message: message.clone(),
            });
            warn!(%job_id, %message, "job failed");
        }
        Err(join_error) => {
            let message = format!("job worker panicked: {join_error}");
            queue
                .transition(job_id, |entry| {
                    entry.status = JobStatus::Failed;
                    entry.completed_at = Some(Utc::now());
                    entry.error = Some(message.clone());
                })
                .await;
            let _ = progress_tx.send(ProgressEvent::Error {
                error_message: message.clone(),
            });
            warn!(%job_id, %message, "job panicked");
        }
    }
}

async fn sweep_loop(queue: std::sync::Weak<JobQueue>) {
    let interval = match queue.upgrade() {
        Some(q) => q.config.sweep_interval,
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match queue.upgrade() {
            Some(q) => q.sweep().await,
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_core::{MonthMetrics, SimulationRun};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Condvar;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration as StdDuration;

    fn tiny_config(seed: u64) -> NormalizedConfig {
        NormalizedConfig {
            project: "queue-test".to_string(),
            total_supply: 1_000.0,
            initial_price: 1.0,
            horizon_months: 3,
            buckets: Vec::new(),
            cohorts: BTreeMap::new(),
            pricing: sim_core::PricingModel::Constant,
            staking: None,
            treasury: None,
            agents: sim_core::AgentConfig::default(),
            monte_carlo: None,
            seed,
            price_floor: 1e-9,
        }
    }

    fn tiny_output() -> JobOutput {
        JobOutput::Single(SimulationRun {
            horizon_months: 0,
            months: Vec::<MonthMetrics>::new(),
            warnings: Vec::new(),
        })
    }

    /// Counts executions; completes instantly.
    struct CountingRunner {
        executions: AtomicUsize,
    }

    impl JobRunner for CountingRunner {
        fn run(
            &self,
            _config: &NormalizedConfig,
            _cancel: &AtomicBool,
            _progress: &dyn ProgressSink,
        ) -> Result<JobOutput, EngineError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            Ok(tiny_output())
        }
    }

    /// Blocks every run until the gate opens.
    struct GatedRunner {
        gate: Arc<(StdMutex<bool>, Condvar)>,
    }

    impl GatedRunner {
        fn pair() -> (Arc<(StdMutex<bool>, Condvar)>, Arc<Self>) {
            let gate = Arc::new((StdMutex::new(false), Condvar::new()));
            let runner = Arc::new(Self {
                gate: Arc::clone(&gate),
            });
            (gate, runner)
        }
    }

    impl JobRunner for GatedRunner {
        fn run(
            &self,
            _config: &NormalizedConfig,
            _cancel: &AtomicBool,
            _progress: &dyn ProgressSink,
        ) -> Result<JobOutput, EngineError> {
            let (lock, cvar) = &*self.gate;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cvar.wait(open).unwrap();
            }
            Ok(tiny_output())
        }
    }

    fn open_gate(gate: &Arc<(StdMutex<bool>, Condvar)>) {
        let (lock, cvar) = &**gate;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    /// Walks 36 slow months, honoring cancellation between months.
    struct SlowMonthsRunner;

    impl JobRunner for SlowMonthsRunner {
        fn run(
            &self,
            _config: &NormalizedConfig,
            cancel: &AtomicBool,
            progress: &dyn ProgressSink,
        ) -> Result<JobOutput, EngineError> {
            for month in 0..36u32 {
                if cancel.load(Ordering::Relaxed) {
                    return Err(EngineError::Cancelled);
                }
                progress.on_progress(month + 1, 36);
                std::thread::sleep(StdDuration::from_millis(5));
            }
            Ok(tiny_output())
        }
    }

    async fn wait_terminal(queue: &Arc<JobQueue>, job_id: JobId) -> JobSnapshot {
        for _ in 0..500 {
            let snapshot = queue.status(job_id).await.unwrap();
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn identical_configs_hit_the_cache_without_reexecution() {
        let runner = Arc::new(CountingRunner {
            executions: AtomicUsize::new(0),
        });
        let queue = JobQueue::new(JobStore::new(), QueueConfig::default(), Arc::clone(&runner) as _);

        let first = queue.submit(tiny_config(1)).await.unwrap();
        assert!(!first.cached);
        wait_terminal(&queue, first.job_id).await;

        let second = queue.submit(tiny_config(1)).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(second.status, JobStatus::Completed);
        assert_eq!(runner.executions.load(Ordering::SeqCst), 1);

        // A structurally different config is a fresh execution.
        let third = queue.submit(tiny_config(2)).await.unwrap();
        assert!(!third.cached);
        wait_terminal(&queue, third.job_id).await;
        assert_eq!(runner.executions.load(Ordering::SeqCst), 2);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn worker_pool_bounds_concurrency_fifo() {
        let (gate, runner) = GatedRunner::pair();
        let config = QueueConfig {
            max_concurrent_jobs: 2,
            ..QueueConfig::default()
        };
        let queue = JobQueue::new(JobStore::new(), config, runner as _);

        let a = queue.submit(tiny_config(1)).await.unwrap();
        let b = queue.submit(tiny_config(2)).await.unwrap();
        let c = queue.submit(tiny_config(3)).await.unwrap();

        let mut settled = queue.stats().await;
        for _ in 0..500 {
            if settled.running == 2 && settled.pending == 1 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
            settled = queue.stats().await;
        }
        assert_eq!(settled.running, 2);
        assert_eq!(settled.pending, 1);
        assert_eq!(
            queue.status(c.job_id).await.unwrap().status,
            JobStatus::Pending
        );

        open_gate(&gate);
        for id in [a.job_id, b.job_id, c.job_id] {
            assert_eq!(wait_terminal(&queue, id).await.status, JobStatus::Completed);
        }
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_yields_cancelled_and_no_partial_results() {
        let queue = JobQueue::new(
            JobStore::new(),
            QueueConfig::default(),
            Arc::new(SlowMonthsRunner) as _,
        );
        let receipt = queue.submit(tiny_config(1)).await.unwrap();

        let mut snapshot = queue.status(receipt.job_id).await.unwrap();
        for _ in 0..500 {
            if snapshot.current_month >= 3 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
            snapshot = queue.status(receipt.job_id).await.unwrap();
        }
        assert!(snapshot.current_month >= 3);

        let cancel = queue.cancel(receipt.job_id).await.unwrap();
        assert!(cancel.success);
        let snapshot = wait_terminal(&queue, receipt.job_id).await;
        assert_eq!(snapshot.status, JobStatus::Cancelled);
        assert_eq!(
            queue.results(receipt.job_id).await,
            Err(JobError::NotReady(receipt.job_id))
        );
        assert_eq!(queue.stats().await.running, 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_jobs_return_not_found() {
        let queue = JobQueue::new(
            JobStore::new(),
            QueueConfig::default(),
            Arc::new(CountingRunner {
                executions: AtomicUsize::new(0),
            }) as _,
        );
        let ghost = Uuid::new_v4();
        assert_eq!(queue.status(ghost).await.unwrap_err(), JobError::NotFound(ghost));
        assert_eq!(queue.results(ghost).await.unwrap_err(), JobError::NotFound(ghost));
        assert_eq!(queue.cancel(ghost).await.unwrap_err(), JobError::NotFound(ghost));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn cancelling_a_finished_job_is_a_noop_success() {
        let queue = JobQueue::new(
            JobStore::new(),
            QueueConfig::default(),
            Arc::new(CountingRunner {
                executions: AtomicUsize::new(0),
            }) as _,
        );
        let receipt = queue.submit(tiny_config(1)).await.unwrap();
        wait_terminal(&queue, receipt.job_id).await;

        let cancel = queue.cancel(receipt.job_id).await.unwrap();
        assert!(cancel.success);
        assert_eq!(
            queue.status(receipt.job_id).await.unwrap().status,
            JobStatus::Completed
        );
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn ttl_sweep_evicts_completed_jobs() {
        let config = QueueConfig {
            max_concurrent_jobs: 2,
            ttl: Duration::milliseconds(50),
            sweep_interval: StdDuration::from_millis(20),
        };
        let queue = JobQueue::new(
            JobStore::new(),
            config,
            Arc::new(CountingRunner {
                executions: AtomicUsize::new(0),
            }) as _,
        );
        let receipt = queue.submit(tiny_config(1)).await.unwrap();
        wait_terminal(&queue, receipt.job_id).await;

        let mut evicted = false;
        for _ in 0..500 {
            if queue.status(receipt.job_id).await.is_err() {
                evicted = true;
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        assert!(evicted, "sweep never evicted the expired job");
        assert_eq!(queue.stats().await.total_jobs, 0);

        // An expired fingerprint is a fresh execution, not a cache hit.
        let again = queue.submit(tiny_config(1)).await.unwrap();
        assert!(!again.cached);
        queue.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn progress_stream_is_monotonic_with_terminal_done() {
        let queue = JobQueue::new(
            JobStore::new(),
            QueueConfig::default(),
            Arc::new(SlowMonthsRunner) as _,
        );
        let receipt = queue.submit(tiny_config(1)).await.unwrap();
        let mut rx = queue.subscribe(receipt.job_id).await.unwrap();

        let mut last_pct = -1.0;
        let mut saw_done = false;
        while rx.changed().await.is_ok() {
            match rx.borrow().clone() {
                ProgressEvent::Progress { progress_pct, .. } => {
                    assert!(progress_pct >= last_pct);
                    last_pct = progress_pct;
                }
                ProgressEvent::Done { progress_pct } => {
                    assert_eq!(progress_pct, 100.0);
                    saw_done = true;
                    break;
                }
                ProgressEvent::Error { error_message } => panic!("unexpected error: {error_message}"),
            }
        }
        assert!(saw_done);

        // Late subscribers observe the latest state immediately.
        let late = queue.subscribe(receipt.job_id).await.unwrap();
        assert_eq!(
            *late.borrow(),
            ProgressEvent::Done {
                progress_pct: 100.0
            }
        );
        queue.shutdown().await;
    }

    /// Fails runs whose project is "boom"; succeeds otherwise.
    struct FaultyRunner;

    impl JobRunner for FaultyRunner {
        fn run(
            &self,
            config: &NormalizedConfig,
            _cancel: &AtomicBool,
            _progress: &dyn ProgressSink,
        ) -> Result<JobOutput, EngineError> {
            if config.project == "boom" {
                Err(EngineError::InvariantViolation(
                    "negative balance".to_string(),
                ))
            } else {
                Ok(tiny_output())
            }
        }
    }

    #[tokio::test]
    async fn one_failed_job_does_not_poison_the_pool() {
        let queue = JobQueue::new(
            JobStore::new(),
            QueueConfig::default(),
            Arc::new(FaultyRunner) as _,
        );
        let mut bad_config = tiny_config(1);
        bad_config.project = "boom".to_string();
        let bad = queue.submit(bad_config).await.unwrap();
        let good = queue.submit(tiny_config(2)).await.unwrap();

        assert_eq!(wait_terminal(&queue, bad.job_id).await.status, JobStatus::Failed);
        assert_eq!(
            wait_terminal(&queue, good.job_id).await.status,
            JobStatus::Completed
        );
        match queue.results(bad.job_id).await {
            Err(JobError::Failed(_, message)) => assert!(message.contains("negative balance")),
            other => panic!("expected stored failure, got {other:?}"),
        }

        let stats = queue.stats().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.cache_size, 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_and_rejects_new_submissions() {
        let queue = JobQueue::new(
            JobStore::new(),
            QueueConfig::default(),
            Arc::new(CountingRunner {
                executions: AtomicUsize::new(0),
            }) as _,
        );
        let receipt = queue.submit(tiny_config(1)).await.unwrap();
        queue.shutdown().await;
        assert!(queue
            .status(receipt.job_id)
            .await
            .unwrap()
            .status
            .is_terminal());
        assert_eq!(
            queue.submit(tiny_config(2)).await.unwrap_err(),
            JobError::ShutDown
        );
    }
}
