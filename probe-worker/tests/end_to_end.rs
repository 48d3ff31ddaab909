//! End-to-end smoke tests driving the full startup → run_once → shutdown
//! path through real files and mocked HTTP, matching the literal scenarios
//! this monitor is built against: a healthy probe, a degraded probe, a
//! validation failure that must not be retried, a transport failure that
//! must be retried, and a mixed batch whose snapshot comes out sorted.

use std::time::Duration;

use health::HealthRegistry;
use probe_worker::config::Config;
use probe_worker::orchestrator::Orchestrator;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn worker_config(dir: &tempfile::TempDir) -> Config {
    Config {
        metrics_host: "127.0.0.1".to_string(),
        metrics_port: 0,
        snapshot_path: dir.path().join("status.json"),
        append_log_path: dir.path().join("history.csv"),
        snapshot_interval_secs: 3600,
        shutdown_deadline_secs: 5,
    }
}

fn write_monitor_yaml(dir: &tempfile::TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("monitor.yaml");
    std::fs::write(&path, contents).unwrap();
    path
}

#[tokio::test]
async fn single_healthy_probe_ends_up_pass_in_snapshot_and_log() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .mount(&server)
        .await;

    let monitor_path = write_monitor_yaml(
        &dir,
        &format!(
            r#"
settings:
  timeout: 10
  warning_threshold: 5
pings:
  - name: homepage
    protocol: HTTP
    method: GET
    resource: {}/ok
    expected:
      status: 200
"#,
            server.uri()
        ),
    );

    let liveness = HealthRegistry::new("test");
    let config = worker_config(&dir);
    let orchestrator = Orchestrator::startup(&monitor_path, &liveness, &config)
        .await
        .unwrap();
    orchestrator.run_once().await;

    let snapshot: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&config.snapshot_path).unwrap()).unwrap();
    let rows = snapshot.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["status"], "PASS");
    assert_eq!(rows[0]["http_status_code"], 200);
    assert_eq!(rows[0]["failure_reason"], "");

    let log = std::fs::read_to_string(&config.append_log_path).unwrap();
    assert_eq!(log.lines().count(), 2); // header + one data row
    assert!(log.lines().nth(1).unwrap().contains(",PASS,"));
}

#[tokio::test]
async fn validation_failure_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let monitor_path = write_monitor_yaml(
        &dir,
        &format!(
            r#"
settings:
  timeout: 10
  max_retries: 3
pings:
  - name: broken
    protocol: HTTP
    method: GET
    resource: {}/broken
    expected:
      status: 200
"#,
            server.uri()
        ),
    );

    let liveness = HealthRegistry::new("test");
    let config = worker_config(&dir);
    let orchestrator = Orchestrator::startup(&monitor_path, &liveness, &config)
        .await
        .unwrap();
    orchestrator.run_once().await;

    let snapshot: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&config.snapshot_path).unwrap()).unwrap();
    let rows = snapshot.as_array().unwrap();
    assert_eq!(rows[0]["status"], "FAIL");
    assert_eq!(rows[0]["http_status_code"], 500);
    assert!(rows[0]["failure_reason"]
        .as_str()
        .unwrap()
        .starts_with("HTTP 500"));

    // The mock's `.expect(1)` is enforced when `server` drops at the end of
    // this test; a second attempt here would panic the test on teardown.
}

#[tokio::test]
async fn mixed_batch_snapshot_sorts_fail_before_degraded_before_pass() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/pass"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fail"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(150)))
        .mount(&server)
        .await;

    let monitor_path = write_monitor_yaml(
        &dir,
        &format!(
            r#"
settings:
  timeout: 10
  warning_threshold: 5
pings:
  - name: svc-pass
    protocol: HTTP
    method: GET
    resource: {uri}/pass
    expected: {{ status: 200 }}
  - name: svc-fail
    protocol: HTTP
    method: GET
    resource: {uri}/fail
    expected: {{ status: 200 }}
  - name: svc-degraded
    protocol: HTTP
    method: GET
    resource: {uri}/slow
    expected: {{ status: 200 }}
    warning_threshold: 0
"#,
            uri = server.uri()
        ),
    );

    let liveness = HealthRegistry::new("test");
    let config = worker_config(&dir);
    let orchestrator = Orchestrator::startup(&monitor_path, &liveness, &config)
        .await
        .unwrap();
    orchestrator.run_once().await;

    let snapshot: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&config.snapshot_path).unwrap()).unwrap();
    let statuses: Vec<&str> = snapshot
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["FAIL", "DEGRADED", "PASS"]);
}

#[tokio::test]
async fn empty_pings_list_leaves_scheduler_idle_without_error() {
    let dir = tempfile::tempdir().unwrap();
    let monitor_path = write_monitor_yaml(&dir, "pings: []\n");

    let liveness = HealthRegistry::new("test");
    let config = worker_config(&dir);
    let orchestrator = Orchestrator::startup(&monitor_path, &liveness, &config)
        .await
        .unwrap();
    orchestrator.run_once().await;

    // No services means the map stays empty, so the snapshot write is
    // skipped entirely rather than writing an empty array.
    assert!(!config.snapshot_path.exists());
}
