//! Comparison and reporting policy.
//!
//! # Responsibilities
//! - Hold the compiled, immutable comparison settings of one handler
//! - Decide whether a response body is worth buffering
//! - Hold the mismatch reporting settings (suppression, level, redaction)
//!
//! # Design Decisions
//! - The buffering decision is a pure function of status, headers and policy,
//!   evaluated once per response at status-write time
//! - With nothing configured, no buffering and no comparison happen at all

use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use serde::{Deserialize, Serialize};

use crate::shadow::query::Query;

/// Minimum level at which mismatch logs are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => f.write_str("debug"),
            LogLevel::Info => f.write_str("info"),
            LogLevel::Error => f.write_str("error"),
        }
    }
}

/// What to compare between the primary and shadow responses.
#[derive(Debug, Clone, Default)]
pub struct ComparisonPolicy {
    /// Compare status codes.
    pub status: bool,
    /// Compare bodies byte for byte (superseded by `json`).
    pub body: bool,
    /// Header names whose full value lists are compared.
    pub headers: Vec<HeaderName>,
    /// JSON subset queries; when non-empty, bodies are compared through these.
    pub json: Vec<Query>,
    /// Paths removed from both bodies before comparing.
    pub ignore: Vec<Query>,
}

impl ComparisonPolicy {
    /// True when any comparison is configured.
    pub fn requires_any(&self) -> bool {
        self.status || !self.headers.is_empty() || self.requires_body()
    }

    /// True when bodies take part in the comparison.
    pub fn requires_body(&self) -> bool {
        self.body || !self.json.is_empty()
    }

    /// Whether a response with this status and headers should be buffered.
    ///
    /// Only successful, unencoded responses are buffered, and only when a
    /// body comparison is configured.
    pub fn should_buffer(&self, status: StatusCode, headers: &HeaderMap) -> bool {
        self.requires_body()
            && status.is_success()
            && !headers.contains_key(header::CONTENT_ENCODING)
    }
}

/// How mismatches are reported.
#[derive(Debug, Clone, Default)]
pub struct ReportingPolicy {
    /// Suppress mismatch logs entirely (counters still update).
    pub suppress_log: bool,
    /// Level mismatch logs are emitted at.
    pub level: LogLevel,
    /// Paths masked in logged bodies.
    pub redact: Vec<Query>,
}
