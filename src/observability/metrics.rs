//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Register the shadow timing histograms and outcome counters once
//! - Record per-branch timings and comparison outcomes
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `{ns}_primary_time_to_first_byte_seconds` (histogram)
//! - `{ns}_shadow_time_to_first_byte_seconds` (histogram)
//! - `{ns}_primary_total_time_seconds` (histogram)
//! - `{ns}_shadow_total_time_seconds` (histogram)
//! - `{ns}_shadow_body_match` (counter): only with body comparison
//! - `{ns}_shadow_body_mismatch` (counter): only with body comparison
//!
//! # Design Decisions
//! - Handles are obtained at provisioning; the request path only touches them
//! - Histograms exist only under a namespace; counters fall back to
//!   unprefixed names when none is set
//! - Bucket boundaries are exponential, starting at one millisecond

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{Counter, Histogram, Unit};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};

use crate::shadow::runner::Branch;

/// Suffix shared by the time-to-first-byte histograms.
pub const TTFB_SUFFIX: &str = "time_to_first_byte_seconds";

/// Suffix shared by the total-time histograms.
pub const TOTAL_SUFFIX: &str = "total_time_seconds";

/// One millisecond, in seconds.
const MILLISECOND: f64 = 0.001;

/// Number of buckets per histogram.
const BUCKET_COUNT: usize = 16;

/// Initialize the Prometheus exporter with an HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Suffix(TTFB_SUFFIX.to_string()),
            &exponential_buckets(MILLISECOND, 2.0, BUCKET_COUNT),
        )?
        .set_buckets_for_metric(
            Matcher::Suffix(TOTAL_SUFFIX.to_string()),
            &exponential_buckets(MILLISECOND * 2.0, 2.0, BUCKET_COUNT),
        )?
        .install()?;

    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

/// `count` bucket boundaries starting at `start`, each `factor` times the last.
pub fn exponential_buckets(start: f64, factor: f64, count: usize) -> Vec<f64> {
    std::iter::successors(Some(start), |b| Some(b * factor))
        .take(count)
        .collect()
}

fn metric_name(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}_{name}"),
        _ => name.to_string(),
    }
}

#[derive(Debug, Clone)]
struct BranchTimings {
    ttfb: Histogram,
    total: Histogram,
}

impl BranchTimings {
    fn register(namespace: &str, branch: Branch) -> Self {
        let ttfb = metric_name(Some(namespace), &format!("{branch}_{TTFB_SUFFIX}"));
        let total = metric_name(Some(namespace), &format!("{branch}_{TOTAL_SUFFIX}"));

        metrics::describe_histogram!(
            ttfb.clone(),
            Unit::Seconds,
            format!("Time before the first byte of the {branch} response")
        );
        metrics::describe_histogram!(
            total.clone(),
            Unit::Seconds,
            format!("Time for the full {branch} response")
        );

        Self {
            ttfb: metrics::histogram!(ttfb),
            total: metrics::histogram!(total),
        }
    }
}

#[derive(Debug, Clone)]
struct OutcomeCounters {
    matched: Counter,
    mismatched: Counter,
}

/// Metrics state owned by one shadow handler.
#[derive(Debug, Clone, Default)]
pub struct ShadowMetrics {
    primary: Option<BranchTimings>,
    shadow: Option<BranchTimings>,
    outcomes: Option<OutcomeCounters>,
}

impl ShadowMetrics {
    /// Register the handler's metrics with the installed recorder.
    pub fn register(namespace: Option<&str>, body_comparison: bool) -> Self {
        let namespace = namespace.filter(|ns| !ns.is_empty());

        let (primary, shadow) = match namespace {
            Some(ns) => (
                Some(BranchTimings::register(ns, Branch::Primary)),
                Some(BranchTimings::register(ns, Branch::Shadow)),
            ),
            None => (None, None),
        };

        let outcomes = body_comparison.then(|| {
            let matched = metric_name(namespace, "shadow_body_match");
            let mismatched = metric_name(namespace, "shadow_body_mismatch");
            metrics::describe_counter!(matched.clone(), "Number of responses that matched");
            metrics::describe_counter!(
                mismatched.clone(),
                "Number of responses that did not match"
            );
            OutcomeCounters {
                matched: metrics::counter!(matched),
                mismatched: metrics::counter!(mismatched),
            }
        });

        Self {
            primary,
            shadow,
            outcomes,
        }
    }

    /// Metrics that record nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Whether per-branch timings are recorded.
    pub fn timings_enabled(&self) -> bool {
        self.primary.is_some()
    }

    /// Whether match/mismatch counters exist.
    pub fn outcomes_enabled(&self) -> bool {
        self.outcomes.is_some()
    }

    /// Record one branch's timings.
    pub fn record_branch(&self, branch: Branch, ttfb: Option<Duration>, total: Option<Duration>) {
        let timings = match branch {
            Branch::Primary => &self.primary,
            Branch::Shadow => &self.shadow,
        };
        let Some(timings) = timings else {
            return;
        };
        if let Some(ttfb) = ttfb {
            timings.ttfb.record(ttfb.as_secs_f64());
        }
        if let Some(total) = total {
            timings.total.record(total.as_secs_f64());
        }
    }

    /// Record the overall outcome of a comparison.
    pub fn record_comparison(&self, matched: bool) {
        if let Some(outcomes) = &self.outcomes {
            if matched {
                outcomes.matched.increment(1);
            } else {
                outcomes.mismatched.increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_buckets() {
        let buckets = exponential_buckets(0.001, 2.0, 16);
        assert_eq!(buckets.len(), 16);
        assert_eq!(buckets[0], 0.001);
        assert_eq!(buckets[1], 0.002);
        assert!((buckets[15] - 0.001 * 32768.0).abs() < 1e-9);
    }

    #[test]
    fn test_metric_name_prefix() {
        assert_eq!(metric_name(Some("api"), "shadow_body_match"), "api_shadow_body_match");
        assert_eq!(metric_name(Some(""), "shadow_body_match"), "shadow_body_match");
        assert_eq!(metric_name(None, "shadow_body_match"), "shadow_body_match");
    }

    #[test]
    fn test_register_without_namespace_has_no_timings() {
        let metrics = ShadowMetrics::register(None, true);
        assert!(!metrics.timings_enabled());
        assert!(metrics.outcomes_enabled());

        let metrics = ShadowMetrics::register(Some("api"), false);
        assert!(metrics.timings_enabled());
        assert!(!metrics.outcomes_enabled());
    }
}
