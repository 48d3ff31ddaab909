use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::http_method::HttpMethod;

/// One configured probe target. Immutable after load; created at startup,
/// destroyed at process exit.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    pub url: String,
    pub method: HttpMethod,
    pub expected_status: u16,
    pub expected_text: Option<String>,
    pub expected_headers: Option<HashMap<String, String>>,
    pub request_headers: Option<HashMap<String, String>>,
    pub request_payload: Option<String>,
    pub interval_ms: u64,
    pub warning_threshold_ms: u64,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub tags: Vec<String>,
    pub max_response_bytes: usize,
}

/// The three-tier health classification, plus the synthetic `Pending` state
/// a service carries before its first probe completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "DEGRADED")]
    Degraded,
    #[serde(rename = "FAIL")]
    Fail,
}

impl ProbeStatus {
    /// Sort weight used by the snapshot sink: FAIL before DEGRADED before
    /// PASS before PENDING.
    pub fn sort_rank(&self) -> u8 {
        match self {
            ProbeStatus::Fail => 0,
            ProbeStatus::Degraded => 1,
            ProbeStatus::Pass => 2,
            ProbeStatus::Pending => 3,
        }
    }
}

/// The outcome of a single probe execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub service_name: String,
    pub correlation_id: Uuid,
    pub timestamp: Option<DateTime<Utc>>,
    pub status: ProbeStatus,
    pub latency_ms: Option<u64>,
    pub http_status_code: u16,
    pub expected_status: u16,
    pub failure_reason: String,
}

impl ProbeResult {
    /// The synthetic result assigned to a service that has been scheduled
    /// but not yet probed.
    pub fn pending(service_name: &str, expected_status: u16) -> Self {
        Self {
            service_name: service_name.to_owned(),
            correlation_id: Uuid::nil(),
            timestamp: None,
            status: ProbeStatus::Pending,
            latency_ms: None,
            http_status_code: 0,
            expected_status,
            failure_reason: String::new(),
        }
    }
}
