//! Logging setup, ingest counters and health reporting.

use crate::config::LoggingConfig;
use crate::connection::ConnectionState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Telemetry errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TelemetryError {
    #[error("Logging initialization failed: {0}")]
    LoggingInit(String),
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. `config.format` selects
/// `json` or human-readable output.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| TelemetryError::LoggingInit(e.to_string()))
}

/// Counters maintained by the ingestion side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStats {
    /// Messages parsed into records.
    pub incoming_count: u64,
    /// Messages that failed to parse.
    pub dropped_count: u64,
    /// Wall-clock time of the last inbound message, parsed or not.
    pub last_message_ts_ms: Option<i64>,
}

impl IngestStats {
    pub fn record_incoming(&mut self, now_ms: i64) {
        self.incoming_count = self.incoming_count.saturating_add(1);
        self.last_message_ts_ms = Some(now_ms);
    }

    pub fn record_dropped(&mut self, now_ms: i64) {
        self.dropped_count = self.dropped_count.saturating_add(1);
        self.last_message_ts_ms = Some(now_ms);
    }
}

/// Health status for a component.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

impl From<ConnectionState> for HealthStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connected => Self::Healthy,
            ConnectionState::Connecting
            | ConnectionState::Reconnecting
            | ConnectionState::Error
            | ConnectionState::Stale => Self::Degraded,
            ConnectionState::Closed => Self::Unhealthy,
        }
    }
}

/// Health check result for the pipeline.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthCheck {
    /// Component name
    pub component: String,
    /// Health status
    pub status: HealthStatus,
    /// Check timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Additional details
    pub details: HashMap<String, String>,
}

impl HealthCheck {
    /// Create a new health check result.
    pub fn new(component: &str, status: HealthStatus) -> Self {
        Self {
            component: component.to_owned(),
            status,
            timestamp: chrono::Utc::now(),
            details: HashMap::new(),
        }
    }

    /// Derive health from connection state and counters.
    pub fn from_pipeline(state: ConnectionState, attempt: u32, stats: &IngestStats) -> Self {
        let mut check = Self::new("emitwatch-pipeline", HealthStatus::from(state));
        check.add_detail("connection_state", state.to_string());
        check.add_detail("reconnect_attempt", attempt.to_string());
        check.add_detail("incoming_count", stats.incoming_count.to_string());
        check.add_detail("dropped_count", stats.dropped_count.to_string());
        if let Some(ts) = stats.last_message_ts_ms {
            check.add_detail("last_message_ts_ms", ts.to_string());
        }
        check
    }

    /// Add a detail to the health check.
    pub fn add_detail(&mut self, key: &str, value: String) {
        self.details.insert(key.to_owned(), value);
    }
}
