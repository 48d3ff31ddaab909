//! Loading of the `settings` + `pings` configuration document.
//!
//! This is deliberately thin: the out-of-scope collaborator is the full
//! schema-validation pipeline a product config tool would run offline. What
//! lives here is just enough to turn the document into typed, validated
//! `ServiceConfig`s or fail loudly with a diagnostic.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::http_method::HttpMethod;
use crate::model::ServiceConfig;

fn default_check_interval() -> u64 {
    60
}
fn default_warning_threshold() -> u64 {
    2
}
fn default_timeout() -> u64 {
    5
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_response_bytes() -> usize {
    100_000
}

/// Process-wide defaults, overridable per ping. All time fields are in
/// seconds in the document.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u64,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub worker_pool_size: usize,
    /// Exposes the ~100 KB response body cap as a configurable knob rather
    /// than a hardcoded constant.
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            warning_threshold: default_warning_threshold(),
            timeout: default_timeout(),
            max_retries: default_max_retries(),
            worker_pool_size: 0,
            max_response_bytes: default_max_response_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum Protocol {
    Http,
    Https,
}

impl Protocol {
    fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Expected {
    status: u16,
    text: Option<String>,
    headers: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct PingConfig {
    name: String,
    protocol: Protocol,
    method: HttpMethod,
    resource: String,
    expected: Expected,
    headers: Option<HashMap<String, String>>,
    payload: Option<String>,
    interval: Option<u64>,
    warning_threshold: Option<u64>,
    timeout: Option<u64>,
    max_retries: Option<u32>,
    #[serde(default)]
    tags: Vec<String>,
}

/// The full `settings` + `pings` document.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub settings: Settings,
    pub pings: Vec<PingConfigDocument>,
}

/// Re-exported alias so callers don't need to reach into the private
/// `PingConfig` type to talk about "one entry in `pings`".
pub type PingConfigDocument = PingConfig;

impl MonitorConfig {
    /// Load and validate the configuration document from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: MonitorConfig =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pings.is_empty() {
            // An empty list leaves the scheduler idle rather than erroring;
            // callers that want strict CI behavior can check this themselves.
            return Ok(());
        }
        let mut seen = std::collections::HashSet::new();
        for ping in &self.pings {
            if !seen.insert(ping.name.as_str()) {
                return Err(ConfigError::DuplicateName(ping.name.clone()));
            }
            let url = ping.url();
            url::Url::from_str(&url).map_err(|source| ConfigError::InvalidUrl(ping.name.clone(), source))?;
        }
        Ok(())
    }

    /// Project every ping into a `ServiceConfig`, applying per-ping overrides
    /// over `settings`.
    pub fn service_configs(&self) -> Vec<ServiceConfig> {
        self.pings.iter().map(|p| p.to_service_config(&self.settings)).collect()
    }
}

impl PingConfig {
    fn url(&self) -> String {
        if self.resource.contains("://") {
            self.resource.clone()
        } else {
            format!("{}://{}", self.protocol.scheme(), self.resource)
        }
    }

    fn to_service_config(&self, settings: &Settings) -> ServiceConfig {
        ServiceConfig {
            name: self.name.clone(),
            url: self.url(),
            method: self.method,
            expected_status: self.expected.status,
            expected_text: self.expected.text.clone(),
            expected_headers: self.expected.headers.clone(),
            request_headers: self.headers.clone(),
            request_payload: self.payload.clone(),
            interval_ms: self.interval.unwrap_or(settings.check_interval) * 1000,
            warning_threshold_ms: self.warning_threshold.unwrap_or(settings.warning_threshold) * 1000,
            timeout_ms: self.timeout.unwrap_or(settings.timeout) * 1000,
            max_retries: self.max_retries.unwrap_or(settings.max_retries),
            tags: self.tags.clone(),
            max_response_bytes: settings.max_response_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_minimal_document_with_defaults() {
        let file = write_temp(
            r#"
pings:
  - name: homepage
    protocol: HTTPS
    method: GET
    resource: example.com/health
    expected:
      status: 200
"#,
        );
        let config = MonitorConfig::load(file.path()).unwrap();
        assert_eq!(config.settings.check_interval, 60);
        let services = config.service_configs();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].url, "https://example.com/health");
        assert_eq!(services[0].interval_ms, 60_000);
        assert_eq!(services[0].max_retries, 3);
    }

    #[test]
    fn rejects_duplicate_names() {
        let file = write_temp(
            r#"
pings:
  - name: svc
    protocol: HTTP
    method: GET
    resource: a.test
    expected: { status: 200 }
  - name: svc
    protocol: HTTP
    method: GET
    resource: b.test
    expected: { status: 200 }
"#,
        );
        let err = MonitorConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName(name) if name == "svc"));
    }

    #[test]
    fn per_ping_overrides_win_over_settings() {
        let file = write_temp(
            r#"
settings:
  check_interval: 30
  max_retries: 1
pings:
  - name: svc
    protocol: HTTP
    method: GET
    resource: a.test
    expected: { status: 200 }
    interval: 5
    max_retries: 0
"#,
        );
        let config = MonitorConfig::load(file.path()).unwrap();
        let services = config.service_configs();
        assert_eq!(services[0].interval_ms, 5_000);
        assert_eq!(services[0].max_retries, 0);
    }

    #[test]
    fn empty_pings_list_is_not_an_error() {
        let file = write_temp("pings: []\n");
        assert!(MonitorConfig::load(file.path()).is_ok());
    }
}
