//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Both upstreams present and addressable
//! - Timeout, header names and every query compile
//! - Metrics namespace and endpoint address are usable
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use axum::http::HeaderName;
use thiserror::Error;

use crate::config::duration::parse_timeout;
use crate::config::schema::{ProxyConfig, UpstreamConfig};
use crate::http::upstream::parse_upstream;
use crate::shadow::query::Query;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing {0} upstream")]
    MissingUpstream(&'static str),

    #[error("invalid {branch} upstream {address:?}: {reason}")]
    InvalidUpstream {
        branch: &'static str,
        address: String,
        reason: String,
    },

    #[error("invalid timeout {value:?}: {reason}")]
    InvalidTimeout { value: String, reason: String },

    #[error("{list}[{index}] {query:?}: {reason}")]
    InvalidQuery {
        list: &'static str,
        index: usize,
        query: String,
        reason: String,
    },

    #[error("invalid header name {0:?}")]
    InvalidHeaderName(String),

    #[error("metrics namespace must not be empty")]
    EmptyMetricsName,

    #[error("invalid metrics address {0:?}")]
    InvalidMetricsAddress(String),

    #[error("max_body_size must be greater than zero")]
    ZeroBodyLimit,
}

/// Validate a parsed configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let shadow = &config.shadow;

    check_upstream("primary", shadow.primary.as_ref(), &mut errors);
    check_upstream("shadow", shadow.shadow.as_ref(), &mut errors);

    if let Err(reason) = parse_timeout(&shadow.timeout) {
        errors.push(ValidationError::InvalidTimeout {
            value: shadow.timeout.clone(),
            reason,
        });
    }

    for name in &shadow.compare_headers {
        if HeaderName::from_bytes(name.as_bytes()).is_err() {
            errors.push(ValidationError::InvalidHeaderName(name.clone()));
        }
    }

    check_queries("compare_json", &shadow.compare_json, &mut errors);
    check_queries("ignore_json", &shadow.ignore_json, &mut errors);
    check_queries("redact_json", &shadow.redact_json, &mut errors);

    if matches!(shadow.metrics_name.as_deref(), Some(name) if name.trim().is_empty()) {
        errors.push(ValidationError::EmptyMetricsName);
    }

    let observability = &config.observability;
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            observability.metrics_address.clone(),
        ));
    }

    if config.limits.max_body_size == 0 {
        errors.push(ValidationError::ZeroBodyLimit);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_upstream(
    branch: &'static str,
    upstream: Option<&UpstreamConfig>,
    errors: &mut Vec<ValidationError>,
) {
    match upstream {
        None => errors.push(ValidationError::MissingUpstream(branch)),
        Some(upstream) => {
            if let Err(reason) = parse_upstream(&upstream.address) {
                errors.push(ValidationError::InvalidUpstream {
                    branch,
                    address: upstream.address.clone(),
                    reason,
                });
            }
        }
    }
}

fn check_queries(list: &'static str, sources: &[String], errors: &mut Vec<ValidationError>) {
    for (index, source) in sources.iter().enumerate() {
        if let Err(e) = Query::compile(source) {
            errors.push(ValidationError::InvalidQuery {
                list,
                index,
                query: source.clone(),
                reason: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ShadowConfig;

    fn valid() -> ProxyConfig {
        ProxyConfig {
            shadow: ShadowConfig {
                primary: Some(UpstreamConfig {
                    address: "127.0.0.1:3000".into(),
                }),
                shadow: Some(UpstreamConfig {
                    address: "127.0.0.1:3001".into(),
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&valid()).is_ok());
    }

    #[test]
    fn test_missing_upstreams() {
        let errors = validate_config(&ProxyConfig::default()).unwrap_err();
        assert!(errors.contains(&ValidationError::MissingUpstream("primary")));
        assert!(errors.contains(&ValidationError::MissingUpstream("shadow")));
    }

    #[test]
    fn test_invalid_upstream_scheme() {
        let mut config = valid();
        config.shadow.shadow = Some(UpstreamConfig {
            address: "https://shadow:443".into(),
        });
        let errors = validate_config(&config).unwrap_err();
        assert!(matches!(
            errors.as_slice(),
            [ValidationError::InvalidUpstream { branch: "shadow", .. }]
        ));
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = valid();
        config.shadow.timeout = "-1s".into();
        config.shadow.compare_headers = vec!["bad header".into()];
        config.shadow.compare_json = vec![".ok".into(), ".[".into()];
        config.shadow.metrics_name = Some("  ".into());
        config.limits.max_body_size = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 5);
        assert!(errors.iter().any(|e| matches!(
            e,
            ValidationError::InvalidQuery { list: "compare_json", index: 1, .. }
        )));
        assert!(errors.contains(&ValidationError::EmptyMetricsName));
        assert!(errors.contains(&ValidationError::ZeroBodyLimit));
    }

    #[test]
    fn test_metrics_address_checked_only_when_enabled() {
        let mut config = valid();
        config.observability.metrics_address = "not-an-address".into();
        assert!(validate_config(&config).is_ok());

        config.observability.metrics_enabled = true;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::InvalidMetricsAddress("not-an-address".into())]
        );
    }
}
