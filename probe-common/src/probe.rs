//! The probe executor and its retry envelope.
//!
//! These two responsibilities are kept in one module because the envelope
//! is a thin, stateless loop around the executor — there is no shared
//! mutable state to separate them across crates, unlike the
//! Scheduler/Pool/Store split which does have state to isolate.

use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

use crate::error::{ProbeError, TransportFaultKind};
use crate::model::{ProbeResult, ProbeStatus, ServiceConfig};
use crate::retry::RetryPolicy;

struct ProbeOutcome {
    result: ProbeResult,
    retryable: bool,
}

/// Run one HTTP request against `config` and classify the outcome.
/// Deterministic given identical inputs and an identical response: the
/// order of checks (status → text → headers → latency) never changes, and
/// the first failing predicate sets `failure_reason`.
async fn execute_once(client: &reqwest::Client, config: &ServiceConfig, correlation_id: Uuid) -> ProbeOutcome {
    let start = tokio::time::Instant::now();

    let request = match build_request(client, config) {
        Ok(request) => request,
        Err(message) => {
            return ProbeOutcome {
                result: fail_result(
                    config,
                    correlation_id,
                    None,
                    0,
                    ProbeError::InvalidRequest(message).failure_reason(),
                ),
                retryable: false,
            }
        }
    };

    let send_result = request
        .timeout(Duration::from_millis(config.timeout_ms))
        .send()
        .await;

    let response = match send_result {
        Ok(response) => response,
        Err(error) => {
            let (kind, message) = if error.is_timeout() {
                (TransportFaultKind::Timeout, "request timed out".to_string())
            } else {
                (
                    TransportFaultKind::classify(&error).unwrap_or(TransportFaultKind::HostNotFound),
                    error.to_string(),
                )
            };
            return ProbeOutcome {
                result: fail_result(
                    config,
                    correlation_id,
                    Some(start.elapsed().as_millis() as u64),
                    0,
                    ProbeError::Transport { kind, message }.failure_reason(),
                ),
                retryable: true,
            };
        }
    };

    let http_status_code = response.status().as_u16();
    let response_headers = response.headers().clone();
    let body = match read_body_capped(response, config.max_response_bytes).await {
        Ok(bytes) => bytes,
        Err(error) => {
            return ProbeOutcome {
                result: fail_result(
                    config,
                    correlation_id,
                    Some(start.elapsed().as_millis() as u64),
                    http_status_code,
                    ProbeError::Transport {
                        kind: TransportFaultKind::ConnectionReset,
                        message: error.to_string(),
                    }
                    .failure_reason(),
                ),
                retryable: true,
            };
        }
    };

    let latency_ms = start.elapsed().as_millis() as u64;

    if http_status_code != config.expected_status {
        return ProbeOutcome {
            result: fail_result(
                config,
                correlation_id,
                Some(latency_ms),
                http_status_code,
                ProbeError::StatusMismatch {
                    actual: http_status_code,
                    expected: config.expected_status,
                }
                .failure_reason(),
            ),
            retryable: false,
        };
    }

    if let Some(expected_text) = &config.expected_text {
        let body_text = String::from_utf8_lossy(&body);
        if !body_text.contains(expected_text.as_str()) {
            return ProbeOutcome {
                result: fail_result(
                    config,
                    correlation_id,
                    Some(latency_ms),
                    http_status_code,
                    ProbeError::TextMismatch.failure_reason(),
                ),
                retryable: false,
            };
        }
    }

    if let Some(expected_headers) = &config.expected_headers {
        for (name, expected_value) in expected_headers {
            let actual = response_headers.get(name).and_then(|v| v.to_str().ok());
            if actual != Some(expected_value.as_str()) {
                return ProbeOutcome {
                    result: fail_result(
                        config,
                        correlation_id,
                        Some(latency_ms),
                        http_status_code,
                        ProbeError::HeaderMismatch.failure_reason(),
                    ),
                    retryable: false,
                };
            }
        }
    }

    let status = if latency_ms > config.warning_threshold_ms {
        ProbeStatus::Degraded
    } else {
        ProbeStatus::Pass
    };

    ProbeOutcome {
        result: ProbeResult {
            service_name: config.name.clone(),
            correlation_id,
            timestamp: Some(Utc::now()),
            status,
            latency_ms: Some(latency_ms),
            http_status_code,
            expected_status: config.expected_status,
            failure_reason: String::new(),
        },
        retryable: false,
    }
}

fn fail_result(
    config: &ServiceConfig,
    correlation_id: Uuid,
    latency_ms: Option<u64>,
    http_status_code: u16,
    failure_reason: String,
) -> ProbeResult {
    ProbeResult {
        service_name: config.name.clone(),
        correlation_id,
        timestamp: Some(Utc::now()),
        status: ProbeStatus::Fail,
        latency_ms,
        http_status_code,
        expected_status: config.expected_status,
        failure_reason,
    }
}

fn build_request(
    client: &reqwest::Client,
    config: &ServiceConfig,
) -> Result<reqwest::RequestBuilder, String> {
    let method: reqwest::Method = config.method.into();
    let mut builder = client.request(method, &config.url);

    if let Some(headers) = &config.request_headers {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| e.to_string())?;
            let value = HeaderValue::from_str(value).map_err(|e| e.to_string())?;
            header_map.insert(name, value);
        }
        builder = builder.headers(header_map);
    }

    if let Some(payload) = &config.request_payload {
        builder = builder
            .header("content-type", "application/json")
            .body(payload.clone());
    }

    Ok(builder)
}

/// Read up to `cap` bytes of the response body. Excess is silently
/// truncated; the caller still validates `expected_text` against this
/// truncated prefix only.
async fn read_body_capped(response: reqwest::Response, cap: usize) -> Result<Vec<u8>, reqwest::Error> {
    let mut stream = response.bytes_stream();
    let mut buf = Vec::with_capacity(cap.min(8192));

    while buf.len() < cap {
        match stream.next().await {
            Some(Ok(chunk)) => {
                let remaining = cap - buf.len();
                let take = remaining.min(chunk.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            Some(Err(error)) => return Err(error),
            None => break,
        }
    }

    Ok(buf)
}

/// Wraps the probe executor in a bounded, immediate (no backoff) retry loop
/// for transport faults only. Returns the first PASS/DEGRADED result, or
/// the last FAIL result after exhaustion.
pub async fn execute_with_retry(
    client: &reqwest::Client,
    config: &ServiceConfig,
    correlation_id: Uuid,
    retry_policy: &RetryPolicy,
) -> ProbeResult {
    let mut attempts_made = 0u32;
    loop {
        let outcome = execute_once(client, config, correlation_id).await;

        if outcome.result.status != ProbeStatus::Fail || !outcome.retryable {
            return outcome.result;
        }

        attempts_made += 1;
        if !retry_policy.has_attempts_remaining(attempts_made) {
            return outcome.result;
        }
    }
}
