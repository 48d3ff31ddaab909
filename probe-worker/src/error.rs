use thiserror::Error;

/// Errors surfaced by the worker pool to its caller. A
/// `ShuttingDown` rejection is the only error path that escapes `execute()`;
/// every other outcome — including pool-induced failures — comes back as a
/// FAIL `ProbeResult`, because the pool's job is to always resolve a
/// submitted probe with *something* the Scheduler can store and publish.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("pool is shutting down")]
    ShuttingDown,
    #[error("pool dropped the job before it completed")]
    Closed,
}

/// Errors surfaced by the scheduler.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// Errors surfaced by the result store's sinks.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to write snapshot to {path}: {source}")]
    SnapshotWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write append log row: {source}")]
    AppendWrite {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Top-level error returned by the binary's fatal paths: configuration
/// failures and truly unexpected exceptions only.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("configuration error: {0}")]
    Config(#[from] probe_common::ConfigError),
    #[error("result store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
