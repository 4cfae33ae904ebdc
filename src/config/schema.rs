//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::shadow::policy::LogLevel;

/// Root configuration for the shadow proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Request limits.
    pub limits: LimitsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Shadowing: upstreams, comparison and reporting.
    pub shadow: ShadowConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Request limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum request body size in bytes.
    pub max_body_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_size: 2 * 1024 * 1024, // 2MB
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log filter directive (e.g. "info", "shadow_proxy=debug").
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// An upstream a branch forwards to.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Upstream address (e.g., "127.0.0.1:3000").
    pub address: String,
}

/// Shadowing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// Upstream serving the real response.
    pub primary: Option<UpstreamConfig>,

    /// Upstream receiving the shadowed copy.
    pub shadow: Option<UpstreamConfig>,

    /// Compare status codes.
    pub compare_status: bool,

    /// Compare bodies byte for byte (ignored when `compare_json` is set).
    pub compare_body: bool,

    /// Header names whose value lists are compared.
    pub compare_headers: Vec<String>,

    /// Subset queries selecting the parts of JSON bodies to compare.
    #[serde(alias = "compare_jq")]
    pub compare_json: Vec<String>,

    /// Subset queries selecting paths removed before comparing.
    pub ignore_json: Vec<String>,

    /// Subset queries selecting paths masked before logging.
    pub redact_json: Vec<String>,

    /// Suppress mismatch logs; counters still update.
    pub no_log: bool,

    /// Level mismatch logs are written at.
    pub log_level: LogLevel,

    /// Namespace for timing and outcome metrics.
    #[serde(alias = "namespace")]
    pub metrics_name: Option<String>,

    /// Per-branch timeout (e.g., "30s", "200ms").
    pub timeout: String,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            primary: None,
            shadow: None,
            compare_status: false,
            compare_body: false,
            compare_headers: Vec::new(),
            compare_json: Vec::new(),
            ignore_json: Vec::new(),
            redact_json: Vec::new(),
            no_log: false,
            log_level: LogLevel::Info,
            metrics_name: None,
            timeout: "30s".to_string(),
        }
    }
}
