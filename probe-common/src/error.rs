use thiserror::Error;

/// Errors surfaced while loading and validating the monitor's configuration
/// document. All of these are fatal at startup; none are raised afterwards.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{0} is not a supported protocol")]
    InvalidProtocol(String),
    #[error("{0} is not a supported HTTP method")]
    InvalidMethod(String),
    #[error("duplicate service name: {0}")]
    DuplicateName(String),
    #[error("service {0} has an invalid resource URL: {1}")]
    InvalidUrl(String, url::ParseError),
    #[error("no services configured")]
    Empty,
}

/// The transport-fault classes recognized by the retry envelope. A fault in
/// this enum is the sole retryable class: no HTTP response was received at all.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFaultKind {
    #[error("timeout")]
    Timeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset")]
    ConnectionReset,
    #[error("dns failure")]
    DnsFailure,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("host not found")]
    HostNotFound,
}

impl TransportFaultKind {
    /// Classify a `reqwest::Error` into one of the retryable transport
    /// fault kinds, or `None` if it does not look like a transport fault
    /// (e.g. it carries an HTTP status, which is a validation fault instead).
    pub fn classify(error: &reqwest::Error) -> Option<Self> {
        if error.is_timeout() {
            return Some(TransportFaultKind::Timeout);
        }
        if error.is_status() {
            return None;
        }
        if error.is_connect() {
            let message = error.to_string().to_ascii_lowercase();
            if message.contains("refused") {
                return Some(TransportFaultKind::ConnectionRefused);
            }
            if message.contains("reset") {
                return Some(TransportFaultKind::ConnectionReset);
            }
            if message.contains("unreachable") {
                return Some(TransportFaultKind::NetworkUnreachable);
            }
            if message.contains("dns") || message.contains("resolve") || message.contains("lookup")
            {
                return Some(TransportFaultKind::DnsFailure);
            }
            return Some(TransportFaultKind::HostNotFound);
        }
        None
    }
}

/// An error originating during a single probe attempt. `Validation` faults
/// are never retried; `Transport` faults are retryable up to `maxRetries`.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("request construction failed: {0}")]
    InvalidRequest(String),
    #[error("{kind}: {message}")]
    Transport {
        kind: TransportFaultKind,
        message: String,
    },
    #[error("HTTP {actual} (expected {expected})")]
    StatusMismatch { actual: u16, expected: u16 },
    #[error("text validation failed")]
    TextMismatch,
    #[error("header validation failed")]
    HeaderMismatch,
}

impl ProbeError {
    /// Whether this fault is in the retryable transport class. Faults with
    /// any received HTTP status code are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProbeError::Transport { .. })
    }

    /// The human-readable `failure_reason` recorded alongside a probe result.
    pub fn failure_reason(&self) -> String {
        match self {
            ProbeError::InvalidRequest(message) => format!("invalid request: {message}"),
            ProbeError::Transport { kind, message } => format!("{kind}: {message}"),
            ProbeError::StatusMismatch { actual, expected } => {
                format!("HTTP {actual} (expected {expected})")
            }
            ProbeError::TextMismatch => "text validation failed".to_string(),
            ProbeError::HeaderMismatch => "header validation failed".to_string(),
        }
    }
}
