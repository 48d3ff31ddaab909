//! The result store: an in-memory latest-result map behind two write
//! sinks — an overwrite-semantics JSON snapshot and an append-only CSV
//! log. The periodic snapshot writer is a `tokio::time::interval` ticking
//! a fixed cadence, run as its own background task.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use health::HealthHandle;
use probe_common::{ProbeResult, ProbeStatus};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::StoreError;

/// What the scheduler (and anything else that completes a probe) hands to
/// the store. Kept as a trait so the scheduler doesn't need to know about
/// JSON/CSV specifics, only "a place results go."
pub trait ResultSink: Send + Sync + 'static {
    fn record(&self, result: ProbeResult);
    fn latest(&self) -> Vec<ProbeResult>;
}

struct Entry {
    result: ProbeResult,
    tags: Vec<String>,
}

/// The external snapshot schema — distinct from `ProbeResult` because
/// PENDING fields serialize as explicit JSON `null`, and `tags` is joined
/// in from registration rather than carried on the result itself.
#[derive(Debug, Serialize)]
struct SnapshotEntry {
    name: String,
    status: &'static str,
    latency_ms: Option<u64>,
    last_check_time: Option<chrono::DateTime<chrono::Utc>>,
    tags: Vec<String>,
    http_status_code: Option<u16>,
    failure_reason: String,
}

fn status_label(status: ProbeStatus) -> &'static str {
    match status {
        ProbeStatus::Pending => "PENDING",
        ProbeStatus::Pass => "PASS",
        ProbeStatus::Degraded => "DEGRADED",
        ProbeStatus::Fail => "FAIL",
    }
}

struct AppendLog {
    path: PathBuf,
}

impl AppendLog {
    fn new(path: PathBuf) -> Result<Self, StoreError> {
        if !path.exists() {
            let file = File::create(&path).map_err(|source| StoreError::AppendWrite { source })?;
            let mut writer = csv::Writer::from_writer(file);
            writer
                .write_record([
                    "timestamp",
                    "service_name",
                    "status",
                    "latency_ms",
                    "http_status_code",
                    "failure_reason",
                    "correlation_id",
                ])
                .map_err(|e| StoreError::AppendWrite {
                    source: std::io::Error::new(std::io::ErrorKind::Other, e),
                })?;
            writer.flush().map_err(|source| StoreError::AppendWrite { source })?;
        }
        Ok(Self { path })
    }

    fn append(&self, result: &ProbeResult) -> Result<(), StoreError> {
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|source| StoreError::AppendWrite { source })?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        writer
            .write_record([
                result
                    .timestamp
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
                result.service_name.clone(),
                status_label(result.status).to_string(),
                result.latency_ms.map(|v| v.to_string()).unwrap_or_default(),
                result.http_status_code.to_string(),
                result.failure_reason.clone(),
                result.correlation_id.to_string(),
            ])
            .map_err(|e| StoreError::AppendWrite {
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?;
        writer.flush().map_err(|source| StoreError::AppendWrite { source })
    }
}

/// The in-memory latest-result map plus its two sinks.
pub struct ResultStore {
    entries: StdMutex<HashMap<String, Entry>>,
    snapshot_path: PathBuf,
    append: AppendLog,
}

impl ResultStore {
    pub fn new(snapshot_path: PathBuf, append_path: PathBuf) -> Result<Arc<Self>, StoreError> {
        let append = AppendLog::new(append_path)?;
        Ok(Arc::new(Self {
            entries: StdMutex::new(HashMap::new()),
            snapshot_path,
            append,
        }))
    }

    /// Register a configured service before its first probe completes, so
    /// the snapshot can carry its PENDING entry and tags. Tags are attached
    /// here, at registration, rather than carried on each probe result.
    pub fn register(&self, service_name: &str, expected_status: u16, tags: Vec<String>) {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(service_name.to_string()).or_insert(Entry {
            result: ProbeResult::pending(service_name, expected_status),
            tags,
        });
    }

    /// Overwrite the entire snapshot map to a JSON array at the stable path.
    /// Write-then-rename keeps the file atomic from a reader's perspective.
    pub fn write_snapshot(&self) -> Result<(), StoreError> {
        let mut rows: Vec<SnapshotEntry> = {
            let entries = self.entries.lock().unwrap();
            if entries.is_empty() {
                return Ok(());
            }
            entries
                .values()
                .map(|entry| SnapshotEntry {
                    name: entry.result.service_name.clone(),
                    status: status_label(entry.result.status),
                    latency_ms: entry.result.latency_ms,
                    last_check_time: entry.result.timestamp,
                    tags: entry.tags.clone(),
                    http_status_code: if entry.result.status == ProbeStatus::Pending {
                        None
                    } else {
                        Some(entry.result.http_status_code)
                    },
                    failure_reason: entry.result.failure_reason.clone(),
                })
                .collect()
        };

        rows.sort_by(|a, b| {
            let rank = |s: &str| match s {
                "FAIL" => 0u8,
                "DEGRADED" => 1,
                "PASS" => 2,
                _ => 3,
            };
            rank(a.status).cmp(&rank(b.status)).then_with(|| a.name.cmp(&b.name))
        });

        let json = serde_json::to_vec_pretty(&rows)?;

        let tmp_path = tmp_path_for(&self.snapshot_path);
        fs::write(&tmp_path, &json).map_err(|source| StoreError::SnapshotWrite {
            path: tmp_path.display().to_string(),
            source,
        })?;
        fs::rename(&tmp_path, &self.snapshot_path).map_err(|source| StoreError::SnapshotWrite {
            path: self.snapshot_path.display().to_string(),
            source,
        })?;

        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

impl ResultSink for ResultStore {
    fn record(&self, result: ProbeResult) {
        if let Err(error) = self.append.append(&result) {
            error!(error = %error, service = %result.service_name, "failed to append probe result to log");
        }

        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(result.service_name.clone())
            .and_modify(|entry| entry.result = result.clone())
            .or_insert_with(|| Entry {
                result,
                tags: Vec::new(),
            });
    }

    fn latest(&self) -> Vec<ProbeResult> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.result.clone())
            .collect()
    }
}

/// Spawn the periodic snapshot writer: ticks every `interval`, skipping the
/// write entirely when the map is empty. Returns a handle the caller aborts
/// on shutdown after performing one final write. Reports healthy to
/// `liveness` on every successful tick so the Result Store's own cadence is
/// independently observable from the Scheduler's.
pub fn spawn_periodic_writer(store: Arc<ResultStore>, interval: Duration, liveness: HealthHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        liveness.report_healthy().await;
        loop {
            ticker.tick().await;
            if let Err(error) = store.write_snapshot() {
                error!(error = %error, "periodic snapshot write failed");
            } else {
                info!("wrote snapshot");
            }
            liveness.report_healthy().await;
        }
    })
}
