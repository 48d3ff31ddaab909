//! The scheduler: a priority queue of scheduled entries ordered by
//! `next_due_at`, driven by a single control task so the queue and dispatch
//! timer are never touched from two places at once. External callers talk to it
//! only through `schedule`/`unschedule`/`start`/`stop`/`run_once`/
//! `get_latest_results`; the queue itself never leaves this module.
//!
//! The priority queue uses lazy deletion: `unschedule` and re-scheduling an
//! existing name bump a per-name version counter instead of touching the
//! heap directly, and stale heap entries are discarded when popped. This
//! keeps `schedule()` O(log n) without needing a heap that supports
//! arbitrary removal.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::Either;
use health::HealthHandle;
use probe_common::{correlation::new_correlation_id, ServiceConfig};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::SchedulerError;
use crate::pool::WorkerPool;
use crate::store::ResultSink;

/// How often the control loop reports itself healthy, independent of
/// whatever cadence its configured services probe at.
const LIVENESS_REPORT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Stopped,
    Running,
    ShuttingDown,
}

struct EntryRecord {
    config: Arc<ServiceConfig>,
    interval_ms: u64,
    next_due_at: Instant,
    version: u64,
}

struct HeapItem {
    due_at: Instant,
    seq: u64,
    name: String,
    version: u64,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.due_at == other.due_at && self.seq == other.seq
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Primary: next_due_at ascending. Secondary: insertion order
        // ascending, as a stable tie-break.
        self.due_at.cmp(&other.due_at).then_with(|| self.seq.cmp(&other.seq))
    }
}

struct Completion {
    name: String,
    result: probe_common::ProbeResult,
    dispatched_at: Instant,
}

enum Command {
    Schedule(Arc<ServiceConfig>, oneshot::Sender<Result<(), SchedulerError>>),
    Unschedule(String, oneshot::Sender<()>),
    Start(oneshot::Sender<Result<(), SchedulerError>>),
    Stop(Duration, oneshot::Sender<Result<(), SchedulerError>>),
    RunOnce(oneshot::Sender<Result<(), SchedulerError>>),
    /// Terminates the control task for good. Distinct from `Stop`, which
    /// only parks the queue in STOPPED — the task must stay alive across a
    /// stop()/start() cycle, so only `join()` ever sends this.
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the running Scheduler control task.
pub struct Scheduler {
    cmd_tx: mpsc::UnboundedSender<Command>,
    sink: Arc<dyn ResultSink>,
    driver: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(pool: Arc<WorkerPool>, sink: Arc<dyn ResultSink>, liveness: HealthHandle) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(run(pool, sink.clone(), cmd_rx, liveness));
        Arc::new(Self {
            cmd_tx,
            sink,
            driver: std::sync::Mutex::new(Some(driver)),
        })
    }

    /// Upsert by `config.name`; sets `nextDueAt = now + intervalMs`.
    pub async fn schedule(&self, config: Arc<ServiceConfig>) -> Result<(), SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Schedule(config, tx)).map_err(|_| SchedulerError::ShuttingDown)?;
        rx.await.map_err(|_| SchedulerError::ShuttingDown)?
    }

    pub async fn unschedule(&self, name: impl Into<String>) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Unschedule(name.into(), tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Start(tx)).map_err(|_| SchedulerError::ShuttingDown)?;
        rx.await.map_err(|_| SchedulerError::ShuttingDown)?
    }

    /// Stop dispatching, await in-flight completions up to
    /// `graceful_shutdown_timeout`, then transition to STOPPED. Safe to call
    /// repeatedly.
    pub async fn stop(&self, graceful_shutdown_timeout: Duration) -> Result<(), SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Stop(graceful_shutdown_timeout, tx))
            .map_err(|_| SchedulerError::ShuttingDown)?;
        rx.await.map_err(|_| SchedulerError::ShuttingDown)?
    }

    /// Dispatch every currently scheduled entry exactly once, concurrently,
    /// and await them all. Used by once-mode.
    pub async fn run_once(&self) -> Result<(), SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::RunOnce(tx)).map_err(|_| SchedulerError::ShuttingDown)?;
        rx.await.map_err(|_| SchedulerError::ShuttingDown)?
    }

    pub fn get_latest_results(&self) -> Vec<probe_common::ProbeResult> {
        self.sink.latest()
    }

    /// Tear down the control task. Called once the Orchestrator is certain
    /// no further scheduling is needed (after `stop()`/`run_once()`). The
    /// control task otherwise runs forever across `stop()`/`start()`
    /// cycles, so this sends an explicit shutdown command rather than
    /// relying on the command channel closing.
    pub async fn join(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        if let Some(handle) = self.driver.lock().unwrap().take() {
            let _ = handle.await;
        }
    }
}

struct SchedulerState {
    status: Status,
    entries: HashMap<String, EntryRecord>,
    heap: BinaryHeap<Reverse<HeapItem>>,
    seq_counter: u64,
    in_flight: HashSet<String>,
    pending_stop: Option<(Instant, oneshot::Sender<Result<(), SchedulerError>>)>,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            status: Status::Stopped,
            entries: HashMap::new(),
            heap: BinaryHeap::new(),
            seq_counter: 0,
            in_flight: HashSet::new(),
            pending_stop: None,
        }
    }

    fn upsert(&mut self, config: Arc<ServiceConfig>, now: Instant) {
        let name = config.name.clone();
        let interval_ms = config.interval_ms;
        let version = self.entries.get(&name).map(|e| e.version + 1).unwrap_or(0);
        let seq = self.seq_counter;
        self.seq_counter += 1;

        let due_at = now + Duration::from_millis(interval_ms);
        self.entries.insert(
            name.clone(),
            EntryRecord {
                config,
                interval_ms,
                next_due_at: due_at,
                version,
            },
        );
        self.heap.push(Reverse(HeapItem {
            due_at,
            seq,
            name,
            version,
        }));
    }

    fn remove(&mut self, name: &str) {
        if let Some(entry) = self.entries.remove(name) {
            // Bumping beyond the live version orphans every heap entry for
            // this name; they're skipped the next time they surface.
            let _ = entry.version;
        }
    }

    /// Peek the earliest *live* due time, discarding stale heap entries
    /// along the way.
    fn next_wake(&mut self) -> Option<Instant> {
        loop {
            let Reverse(top) = self.heap.peek()?;
            match self.entries.get(&top.name) {
                Some(record) if record.version == top.version => return Some(record.next_due_at),
                _ => {
                    self.heap.pop();
                }
            }
        }
    }

    /// Pop every entry whose `nextDueAt <= now` (a "cycle"), discarding stale
    /// entries encountered along the way.
    fn pop_due(&mut self, now: Instant) -> Vec<Arc<ServiceConfig>> {
        let mut due = Vec::new();
        loop {
            let Reverse(top) = match self.heap.peek() {
                Some(item) => item,
                None => break,
            };
            let is_live = self
                .entries
                .get(&top.name)
                .map(|record| record.version == top.version)
                .unwrap_or(false);

            if !is_live {
                self.heap.pop();
                continue;
            }
            if top.due_at > now {
                break;
            }

            let Reverse(item) = self.heap.pop().unwrap();
            if let Some(record) = self.entries.get(&item.name) {
                due.push(record.config.clone());
                self.in_flight.insert(item.name);
            }
        }
        due
    }

    /// Re-insert `name` for its next cycle. `dispatched_at` is the instant
    /// the just-completed probe was *dispatched*, not the instant it
    /// completed — intervals are measured from dispatch so a slow probe
    /// doesn't push its service's whole schedule later. If the probe ran
    /// longer than its interval, the next fire is clamped to `now` rather
    /// than landing in the past.
    fn reinsert_after_completion(&mut self, name: &str, dispatched_at: Instant, now: Instant) {
        self.in_flight.remove(name);
        if self.status != Status::Running {
            return;
        }
        if let Some(record) = self.entries.get_mut(name) {
            record.version += 1;
            let due_at = (dispatched_at + Duration::from_millis(record.interval_ms)).max(now);
            record.next_due_at = due_at;
            self.seq_counter += 1;
            self.heap.push(Reverse(HeapItem {
                due_at,
                seq: self.seq_counter,
                name: name.to_string(),
                version: record.version,
            }));
        }
    }
}

async fn run(pool: Arc<WorkerPool>, sink: Arc<dyn ResultSink>, mut cmd_rx: mpsc::UnboundedReceiver<Command>, liveness: HealthHandle) {
    let mut state = SchedulerState::new();
    let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<Completion>();
    let mut liveness_ticker = tokio::time::interval(LIVENESS_REPORT_INTERVAL);

    loop {
        let wake_at = if state.status == Status::Running {
            state.next_wake()
        } else {
            None
        };

        let timer = match wake_at {
            Some(instant) => Either::Left(tokio::time::sleep_until(instant)),
            None => Either::Right(std::future::pending()),
        };

        tokio::select! {
            _ = liveness_ticker.tick() => {
                liveness.report_healthy().await;
            }

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Schedule(config, reply) => {
                        if state.status == Status::ShuttingDown {
                            let _ = reply.send(Err(SchedulerError::ShuttingDown));
                            continue;
                        }
                        state.upsert(config, Instant::now());
                        let _ = reply.send(Ok(()));
                    }
                    Command::Unschedule(name, reply) => {
                        state.remove(&name);
                        let _ = reply.send(());
                    }
                    Command::Start(reply) => {
                        if state.status != Status::Stopped {
                            let _ = reply.send(Err(SchedulerError::AlreadyRunning));
                        } else {
                            state.status = Status::Running;
                            let _ = reply.send(Ok(()));
                        }
                    }
                    Command::Stop(graceful_deadline, reply) => {
                        if state.status == Status::Stopped {
                            let _ = reply.send(Ok(()));
                            continue;
                        }
                        state.status = Status::ShuttingDown;
                        if state.in_flight.is_empty() {
                            state.status = Status::Stopped;
                            let _ = reply.send(Ok(()));
                        } else {
                            state.pending_stop = Some((Instant::now() + graceful_deadline, reply));
                        }
                    }
                    Command::RunOnce(reply) => {
                        if state.status != Status::Stopped {
                            let _ = reply.send(Err(SchedulerError::AlreadyRunning));
                            continue;
                        }
                        let configs: Vec<Arc<ServiceConfig>> =
                            state.entries.values().map(|e| e.config.clone()).collect();
                        let mut tasks = Vec::with_capacity(configs.len());
                        for config in configs {
                            let pool = pool.clone();
                            tasks.push(async move {
                                let correlation_id = new_correlation_id();
                                pool.execute(config, correlation_id).await
                            });
                        }
                        let results = futures::future::join_all(tasks).await;
                        for result in results.into_iter().flatten() {
                            sink.record(result);
                        }
                        let _ = reply.send(Ok(()));
                    }
                    Command::Shutdown(reply) => {
                        let _ = reply.send(());
                        return;
                    }
                }
            }

            Some(completion) = completion_rx.recv() => {
                sink.record(completion.result);
                state.reinsert_after_completion(&completion.name, completion.dispatched_at, Instant::now());

                if state.status == Status::ShuttingDown && state.in_flight.is_empty() {
                    state.status = Status::Stopped;
                    if let Some((_, reply)) = state.pending_stop.take() {
                        let _ = reply.send(Ok(()));
                    }
                }
            }

            _ = timer => {
                let now = Instant::now();
                let due = state.pop_due(now);
                for config in due {
                    let pool = pool.clone();
                    let completion_tx = completion_tx.clone();
                    let name = config.name.clone();
                    let dispatched_at = now;
                    tokio::spawn(async move {
                        let correlation_id = new_correlation_id();
                        let result = pool.execute(config, correlation_id).await;
                        if let Ok(result) = result {
                            let _ = completion_tx.send(Completion { name, result, dispatched_at });
                        } else {
                            warn!(service = %name, "pool rejected probe submission; will retry next cycle");
                        }
                    });
                }
            }
        }

        if let Some((deadline, _)) = &state.pending_stop {
            if Instant::now() >= *deadline {
                state.status = Status::Stopped;
                if let Some((_, reply)) = state.pending_stop.take() {
                    let _ = reply.send(Ok(()));
                }
                info!("scheduler stop deadline reached with probes still in flight");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ProbeRunner, WorkerPool};
    use crate::store::ResultStore;
    use probe_common::{HttpMethod, ProbeStatus};
    use uuid::Uuid;

    struct InstantPassRunner;
    impl ProbeRunner for InstantPassRunner {
        fn run<'a>(
            &'a self,
            config: &'a ServiceConfig,
            correlation_id: Uuid,
        ) -> crate::pool::BoxFuture<'a, probe_common::ProbeResult> {
            Box::pin(async move {
                probe_common::ProbeResult {
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

    fn test_config(name: &str, interval_ms: u64) -> Arc<ServiceConfig> {
        Arc::new(ServiceConfig {
            name: name.to_string(),
            url: "http://example.invalid".to_string(),
            method: HttpMethod::GET,
            expected_status: 200,
            expected_text: None,
            expected_headers: None,
            request_headers: None,
            request_payload: None,
            interval_ms,
            warning_threshold_ms: 500,
            timeout_ms: 1000,
            max_retries: 0,
            tags: vec![],
            max_response_bytes: 1000,
        })
    }

    fn test_store(dir: &tempfile::TempDir) -> Arc<ResultStore> {
        ResultStore::new(dir.path().join("snap.json"), dir.path().join("log.csv")).unwrap()
    }

    async fn test_liveness() -> HealthHandle {
        health::HealthRegistry::new("test")
            .register("scheduler".to_string(), time::Duration::seconds(120))
            .await
    }

    #[tokio::test]
    async fn run_once_probes_every_entry_and_returns() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(2, Arc::new(InstantPassRunner));
        let store = test_store(&dir);
        let scheduler = Scheduler::new(pool, store.clone(), test_liveness().await);

        scheduler.schedule(test_config("a", 60_000)).await.unwrap();
        scheduler.schedule(test_config("b", 60_000)).await.unwrap();

        scheduler.run_once().await.unwrap();

        let results = scheduler.get_latest_results();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == ProbeStatus::Pass));
    }

    #[tokio::test]
    async fn scheduling_same_name_twice_keeps_queue_size_one() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(1, Arc::new(InstantPassRunner));
        let store = test_store(&dir);
        let scheduler = Scheduler::new(pool, store, test_liveness().await);

        scheduler.schedule(test_config("svc", 60_000)).await.unwrap();
        scheduler.schedule(test_config("svc", 30_000)).await.unwrap();

        scheduler.run_once().await.unwrap();
        assert_eq!(scheduler.get_latest_results().len(), 1);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(1, Arc::new(InstantPassRunner));
        let store = test_store(&dir);
        let scheduler = Scheduler::new(pool, store, test_liveness().await);

        scheduler.start().await.unwrap();
        let err = scheduler.start().await.unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyRunning));

        scheduler.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn stop_after_stop_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(1, Arc::new(InstantPassRunner));
        let store = test_store(&dir);
        let scheduler = Scheduler::new(pool, store, test_liveness().await);

        scheduler.stop(Duration::from_secs(1)).await.unwrap();
        scheduler.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn zero_interval_fires_again_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(2, Arc::new(InstantPassRunner));
        let store = test_store(&dir);
        let scheduler = Scheduler::new(pool, store.clone(), test_liveness().await);

        scheduler.schedule(test_config("svc", 0)).await.unwrap();
        scheduler.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop(Duration::from_secs(1)).await.unwrap();

        assert_eq!(store.latest().len(), 1);
    }

    #[tokio::test]
    async fn reinsert_after_completion_measures_interval_from_dispatch_not_completion() {
        let mut state = SchedulerState::new();
        let dispatched_at = Instant::now();
        state.upsert(test_config("svc", 1_000), dispatched_at);
        state.in_flight.insert("svc".to_string());

        // The probe ran for 400ms after being dispatched at `dispatched_at`;
        // completion happens "now", well after dispatch.
        let completed_at = dispatched_at + Duration::from_millis(400);
        state.reinsert_after_completion("svc", dispatched_at, completed_at);

        let due_at = state.entries.get("svc").unwrap().next_due_at;
        assert_eq!(due_at, dispatched_at + Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn reinsert_after_completion_clamps_to_now_when_probe_outran_its_interval() {
        let mut state = SchedulerState::new();
        let dispatched_at = Instant::now();
        state.upsert(test_config("svc", 100), dispatched_at);
        state.in_flight.insert("svc".to_string());

        // The probe took 5 seconds against a 100ms interval: dispatch +
        // interval is already in the past, so the next fire clamps to now
        // instead of landing behind the clock.
        let completed_at = dispatched_at + Duration::from_secs(5);
        state.reinsert_after_completion("svc", dispatched_at, completed_at);

        let due_at = state.entries.get("svc").unwrap().next_due_at;
        assert_eq!(due_at, completed_at);
    }

    #[tokio::test]
    async fn unschedule_removes_entry_and_is_a_no_op_if_absent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(1, Arc::new(InstantPassRunner));
        let store = test_store(&dir);
        let scheduler = Scheduler::new(pool, store, test_liveness().await);

        scheduler.schedule(test_config("svc", 60_000)).await.unwrap();
        scheduler.unschedule("svc").await;
        scheduler.unschedule("does-not-exist").await;

        scheduler.run_once().await.unwrap();
        assert!(scheduler.get_latest_results().is_empty());
    }
}
