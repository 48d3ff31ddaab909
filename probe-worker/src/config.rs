//! Process configuration: the environment-variable layer plus the
//! `--once`/`--config` CLI flags. The monitor document format itself
//! (settings/pings) lives in `probe_common::config`.

use std::path::PathBuf;

use clap::Parser;
use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub metrics_host: String,

    #[envconfig(from = "METRICS_PORT", default = "9090")]
    pub metrics_port: u16,

    #[envconfig(from = "SNAPSHOT_PATH", default = "status.json")]
    pub snapshot_path: PathBuf,

    #[envconfig(from = "APPEND_LOG_PATH", default = "history.csv")]
    pub append_log_path: PathBuf,

    /// Snapshot rewrite cadence.
    #[envconfig(from = "SNAPSHOT_INTERVAL_SECS", default = "10")]
    pub snapshot_interval_secs: u64,

    /// Hard deadline for the whole shutdown sequence.
    #[envconfig(from = "SHUTDOWN_DEADLINE_SECS", default = "30")]
    pub shutdown_deadline_secs: u64,
}

impl Config {
    pub fn metrics_bind(&self) -> String {
        format!("{}:{}", self.metrics_host, self.metrics_port)
    }
}

/// CLI flags: `--once` selects once-mode, `--config` points at the monitor document.
#[derive(Parser, Debug)]
#[command(name = "probe-worker", about = "Periodic multi-service health monitor")]
pub struct Cli {
    /// Path to the monitor configuration document (settings + pings).
    #[arg(long, default_value = "monitor.yaml")]
    pub config: PathBuf,

    /// Run every configured probe exactly once, write the outputs, then
    /// exit. Used by CI to smoke-test a configuration.
    #[arg(long)]
    pub once: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_bind_joins_host_and_port() {
        let config = Config {
            metrics_host: "127.0.0.1".to_string(),
            metrics_port: 9090,
            snapshot_path: PathBuf::from("status.json"),
            append_log_path: PathBuf::from("history.csv"),
            snapshot_interval_secs: 10,
            shutdown_deadline_secs: 30,
        };
        assert_eq!(config.metrics_bind(), "127.0.0.1:9090");
    }
}
