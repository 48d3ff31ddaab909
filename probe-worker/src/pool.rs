//! The worker pool: a bounded pool of execution contexts that run
//! retry-wrapped probes off the scheduler's control thread. FIFO queueing,
//! a fixed worker count, and worker-crash recovery via a pluggable
//! worker-construction hook so tests can exercise it deterministically.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use probe_common::{ProbeResult, ProbeStatus, RetryPolicy, ServiceConfig};
use tokio::sync::{oneshot, Notify};
use tokio::task::{Id, JoinHandle, JoinSet};
use tracing::warn;
use uuid::Uuid;

use crate::error::PoolError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The worker-construction hook: production code runs probes over real
/// HTTP, tests can substitute a runner that fails or panics on cue to
/// exercise crash recovery deterministically.
pub trait ProbeRunner: Send + Sync + 'static {
    fn run<'a>(&'a self, config: &'a ServiceConfig, correlation_id: Uuid) -> BoxFuture<'a, ProbeResult>;
}

/// The default runner: one HTTP client shared by every worker, wrapped in
/// the Retry Envelope.
pub struct ReqwestRunner {
    client: reqwest::Client,
    retry_policy: RetryPolicy,
}

impl ReqwestRunner {
    pub fn new(client: reqwest::Client, retry_policy: RetryPolicy) -> Self {
        Self { client, retry_policy }
    }
}

impl ProbeRunner for ReqwestRunner {
    fn run<'a>(&'a self, config: &'a ServiceConfig, correlation_id: Uuid) -> BoxFuture<'a, ProbeResult> {
        Box::pin(probe_common::probe::execute_with_retry(
            &self.client,
            config,
            correlation_id,
            &self.retry_policy,
        ))
    }
}

struct Job {
    config: Arc<ServiceConfig>,
    correlation_id: Uuid,
    respond_to: oneshot::Sender<ProbeResult>,
}

/// FIFO wait queue with head-requeue support for jobs recovered from a
/// crashed worker: such a job goes back in at the head, ahead of anything
/// already waiting.
struct JobQueue {
    jobs: StdMutex<VecDeque<Job>>,
    notify: Notify,
}

impl JobQueue {
    fn new() -> Self {
        Self {
            jobs: StdMutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push_back(&self, job: Job) {
        self.jobs.lock().unwrap().push_back(job);
        self.notify.notify_one();
    }

    fn push_front(&self, job: Job) {
        self.jobs.lock().unwrap().push_front(job);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Job {
        loop {
            if let Some(job) = self.jobs.lock().unwrap().pop_front() {
                return job;
            }
            self.notify.notified().await;
        }
    }

    fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    fn drain(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().drain(..).collect()
    }
}

#[derive(Default)]
struct PoolMetrics {
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    crashes: AtomicU64,
}

/// A snapshot of the pool's observable counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMetricsSnapshot {
    pub total_workers: usize,
    pub active_workers: usize,
    pub idle_workers: usize,
    pub queue_depth: usize,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub worker_crashes: u64,
}

struct ShutdownState {
    requested: AtomicBool,
    notify: Notify,
    done: Notify,
    deadline: StdMutex<Duration>,
}

/// The bounded worker pool. Construct with [`WorkerPool::new`]; the returned
/// `Arc<WorkerPool>` is the only handle callers need — the driver task and
/// all workers run in the background for the pool's lifetime.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    metrics: Arc<PoolMetrics>,
    pool_size: usize,
    shutdown: Arc<ShutdownState>,
    driver: StdMutex<Option<JoinHandle<()>>>,
}

/// The configured pool size defaults to `2 × CPU count`, minimum 1. `0`
/// means "use the default."
pub fn resolve_pool_size(configured: usize) -> usize {
    if configured != 0 {
        return configured;
    }
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(2)
        .max(1)
}

impl WorkerPool {
    pub fn new(pool_size: usize, runner: Arc<dyn ProbeRunner>) -> Arc<Self> {
        let pool_size = resolve_pool_size(pool_size);
        let queue = Arc::new(JobQueue::new());
        let metrics = Arc::new(PoolMetrics::default());
        let shutdown = Arc::new(ShutdownState {
            requested: AtomicBool::new(false),
            notify: Notify::new(),
            done: Notify::new(),
            deadline: StdMutex::new(Duration::from_secs(30)),
        });

        let driver = tokio::spawn(drive(pool_size, queue.clone(), runner, metrics.clone(), shutdown.clone()));

        Arc::new(Self {
            queue,
            metrics,
            pool_size,
            shutdown,
            driver: StdMutex::new(Some(driver)),
        })
    }

    /// The sole public operation: submit one probe for execution and await
    /// its result. Rejects immediately if the pool is shutting down;
    /// otherwise always resolves with a `ProbeResult`, synthesizing a FAIL
    /// result if the pool itself could not complete the job cleanly.
    pub async fn execute(&self, config: Arc<ServiceConfig>, correlation_id: Uuid) -> Result<ProbeResult, PoolError> {
        if self.shutdown.requested.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }

        let (tx, rx) = oneshot::channel();
        self.queue.push_back(Job {
            config,
            correlation_id,
            respond_to: tx,
        });

        rx.await.map_err(|_| PoolError::Closed)
    }

    pub fn metrics(&self) -> PoolMetricsSnapshot {
        let active = self.metrics.active.load(Ordering::Relaxed);
        PoolMetricsSnapshot {
            total_workers: self.pool_size,
            active_workers: active,
            idle_workers: self.pool_size.saturating_sub(active),
            queue_depth: self.queue.len(),
            completed_jobs: self.metrics.completed.load(Ordering::Relaxed),
            failed_jobs: self.metrics.failed.load(Ordering::Relaxed),
            worker_crashes: self.metrics.crashes.load(Ordering::Relaxed),
        }
    }

    /// Mark the pool as shutting down, drain the wait queue (failing each
    /// pending job), wait up to `graceful_deadline` for active jobs to
    /// finish, then force-terminate stragglers.
    pub async fn shutdown(&self, graceful_deadline: Duration) {
        self.shutdown.requested.store(true, Ordering::SeqCst);
        *self.shutdown.deadline.lock().unwrap() = graceful_deadline;

        for job in self.queue.drain() {
            let _ = job.respond_to.send(shutdown_result(&job.config, job.correlation_id, "pool shutting down"));
        }

        self.shutdown.notify.notify_one();
        self.shutdown.done.notified().await;

        if let Some(handle) = self.driver.lock().unwrap().take() {
            let _ = handle.await;
        }
    }
}

fn shutdown_result(config: &ServiceConfig, correlation_id: Uuid, reason: &str) -> ProbeResult {
    ProbeResult {
        service_name: config.name.clone(),
        correlation_id,
        timestamp: Some(chrono::Utc::now()),
        status: ProbeStatus::Fail,
        latency_ms: None,
        http_status_code: 0,
        expected_status: config.expected_status,
        failure_reason: reason.to_string(),
    }
}

fn spawn_one(
    join_set: &mut JoinSet<()>,
    slots: &mut HashMap<Id, Arc<StdMutex<Option<Job>>>>,
    queue: Arc<JobQueue>,
    runner: Arc<dyn ProbeRunner>,
    metrics: Arc<PoolMetrics>,
) {
    let slot: Arc<StdMutex<Option<Job>>> = Arc::new(StdMutex::new(None));
    let worker_slot = slot.clone();
    let abort_handle = join_set.spawn(worker_loop(queue, worker_slot, runner, metrics));
    slots.insert(abort_handle.id(), slot);
}

async fn worker_loop(queue: Arc<JobQueue>, slot: Arc<StdMutex<Option<Job>>>, runner: Arc<dyn ProbeRunner>, metrics: Arc<PoolMetrics>) {
    loop {
        let job = queue.pop().await;
        let config = job.config.clone();
        let correlation_id = job.correlation_id;
        *slot.lock().unwrap() = Some(job);

        metrics.active.fetch_add(1, Ordering::Relaxed);
        let result = runner.run(&config, correlation_id).await;
        metrics.active.fetch_sub(1, Ordering::Relaxed);

        if let Some(completed) = slot.lock().unwrap().take() {
            metrics.completed.fetch_add(1, Ordering::Relaxed);
            let _ = completed.respond_to.send(result);
        }
    }
}

async fn drive(pool_size: usize, queue: Arc<JobQueue>, runner: Arc<dyn ProbeRunner>, metrics: Arc<PoolMetrics>, shutdown: Arc<ShutdownState>) {
    let mut join_set: JoinSet<()> = JoinSet::new();
    let mut slots: HashMap<Id, Arc<StdMutex<Option<Job>>>> = HashMap::new();

    for _ in 0..pool_size {
        spawn_one(&mut join_set, &mut slots, queue.clone(), runner.clone(), metrics.clone());
    }

    let mut shutdown_in_progress = false;

    loop {
        if join_set.is_empty() {
            if shutdown_in_progress {
                shutdown.done.notify_one();
            }
            break;
        }

        tokio::select! {
            joined = join_set.join_next_with_id() => {
                let Some(joined) = joined else { continue };
                let (id, crashed) = match joined {
                    Ok((id, ())) => (id, false),
                    Err(join_error) => (join_error.id(), !join_error.is_cancelled()),
                };
                let slot = slots.remove(&id);

                if crashed {
                    metrics.crashes.fetch_add(1, Ordering::Relaxed);
                    warn!("worker pool: a worker crashed, recovering its in-flight job");
                }

                let in_flight = slot.and_then(|slot| slot.lock().unwrap().take());

                if shutdown_in_progress {
                    if let Some(job) = in_flight {
                        metrics.failed.fetch_add(1, Ordering::Relaxed);
                        let _ = job.respond_to.send(shutdown_result(&job.config, job.correlation_id, "pool shutdown: task timeout"));
                    }
                } else {
                    if let Some(job) = in_flight {
                        queue.push_front(job);
                    }
                    spawn_one(&mut join_set, &mut slots, queue.clone(), runner.clone(), metrics.clone());
                }
            }
            _ = shutdown.notify.notified(), if !shutdown_in_progress => {
                shutdown_in_progress = true;
                let deadline = *shutdown.deadline.lock().unwrap();
                let _ = tokio::time::timeout(deadline, wait_until_idle(&metrics)).await;
                join_set.abort_all();
            }
        }
    }
}

async fn wait_until_idle(metrics: &PoolMetrics) {
    while metrics.active.load(Ordering::Relaxed) > 0 {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration as StdDuration;

    fn test_config(name: &str) -> Arc<ServiceConfig> {
        Arc::new(ServiceConfig {
            name: name.to_string(),
            url: "http://example.invalid".to_string(),
            method: probe_common::HttpMethod::GET,
            expected_status: 200,
            expected_text: None,
            expected_headers: None,
            request_headers: None,
            request_payload: None,
            interval_ms: 1000,
            warning_threshold_ms: 500,
            timeout_ms: 1000,
            max_retries: 0,
            tags: vec![],
            max_response_bytes: 1000,
        })
    }

    struct InstantPassRunner;
    impl ProbeRunner for InstantPassRunner {
        fn run<'a>(&'a self, config: &'a ServiceConfig, correlation_id: Uuid) -> BoxFuture<'a, ProbeResult> {
            Box::pin(async move {
                ProbeResult {
                    service_name: config.name.clone(),
                    correlation_id,
                    timestamp: Some(chrono::Utc::now()),
                    status: ProbeStatus::Pass,
                    latency_ms: Some(1),
                    http_status_code: 200,
                    expected_status: config.expected_status,
                    failure_reason: String::new(),
                }
            })
        }
    }

    struct CrashOnceRunner {
        crashed_already: AtomicU32,
    }
    impl ProbeRunner for CrashOnceRunner {
        fn run<'a>(&'a self, config: &'a ServiceConfig, correlation_id: Uuid) -> BoxFuture<'a, ProbeResult> {
            if self.crashed_already.fetch_add(1, Ordering::SeqCst) == 0 {
                Box::pin(async { panic!("simulated worker crash") })
            } else {
                Box::pin(async move {
                    ProbeResult {
                        service_name: config.name.clone(),
                        correlation_id,
                        timestamp: Some(chrono::Utc::now()),
                        status: ProbeStatus::Pass,
                        latency_ms: Some(1),
                        http_status_code: 200,
                        expected_status: config.expected_status,
                        failure_reason: String::new(),
                    }
                })
            }
        }
    }

    #[tokio::test]
    async fn executes_and_reports_pass() {
        let pool = WorkerPool::new(2, Arc::new(InstantPassRunner));
        let result = pool.execute(test_config("svc"), Uuid::new_v4()).await.unwrap();
        assert_eq!(result.status, ProbeStatus::Pass);
        assert_eq!(pool.metrics().completed_jobs, 1);
    }

    #[tokio::test]
    async fn crashed_worker_job_is_recovered_and_retried_by_a_fresh_worker() {
        let pool = WorkerPool::new(
            1,
            Arc::new(CrashOnceRunner {
                crashed_already: AtomicU32::new(0),
            }),
        );

        // The first submitted job hits the crashing attempt; the pool must
        // recover by re-queueing it onto a freshly spawned worker. We give
        // the crash-recovery path a little time (the exit event is async).
        let result = tokio::time::timeout(StdDuration::from_secs(5), pool.execute(test_config("svc"), Uuid::new_v4()))
            .await
            .expect("job should eventually resolve")
            .unwrap();

        assert_eq!(result.status, ProbeStatus::Pass);
        assert!(pool.metrics().worker_crashes >= 1);
    }

    #[tokio::test]
    async fn shutdown_fails_pending_jobs_with_shutting_down_reason() {
        let pool = WorkerPool::new(1, Arc::new(InstantPassRunner));
        pool.shutdown(StdDuration::from_secs(1)).await;

        let result = pool.execute(test_config("svc"), Uuid::new_v4()).await;
        assert!(matches!(result, Err(PoolError::ShuttingDown)));
    }
}
