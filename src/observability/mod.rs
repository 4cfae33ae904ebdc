//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! shadow dispatch produces:
//!     → logging.rs (structured log events, mismatch reports)
//!     → metrics.rs (branch timing histograms, body outcome counters)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through every shadow log line
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
