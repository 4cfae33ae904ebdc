//! Comparison engine for primary and shadow outcomes.
//!
//! # Responsibilities
//! - Run every configured check: status, headers, body
//! - Pick byte-exact or JSON-subset body comparison from the policy
//! - Produce a [`ComparisonReport`] naming each difference found
//!
//! # Design Decisions
//! - A mismatch in one kind of check never skips the other kinds
//! - Unparsable JSON and absent results are ordinary mismatches, never errors
//! - A failed branch, or a body on only one side, never matches
//! - JSON values compare structurally; numbers compare by value, strings and
//!   booleans never equal each other

use std::sync::Arc;

use axum::http::{HeaderName, StatusCode};
use serde_json::Value;

use crate::shadow::capture::BranchOutcome;
use crate::shadow::policy::ComparisonPolicy;
use crate::shadow::query::{Output, Query};

/// Status codes of both branches when they differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMismatch {
    pub primary: Option<StatusCode>,
    pub shadow: Option<StatusCode>,
}

/// Full value lists of one header when they differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMismatch {
    pub name: HeaderName,
    pub primary: Vec<String>,
    pub shadow: Vec<String>,
}

/// Result of the body check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BodyCheck {
    /// Not configured, or neither body was buffered.
    #[default]
    Skipped,
    Matched,
    /// Bodies differ; `queries` lists every JSON query that failed, and is
    /// empty for byte-exact comparison.
    Mismatched { queries: Vec<String> },
}

impl BodyCheck {
    fn mismatched() -> Self {
        BodyCheck::Mismatched {
            queries: Vec::new(),
        }
    }
}

/// Every difference found between two outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ComparisonReport {
    pub status: Option<StatusMismatch>,
    pub headers: Vec<HeaderMismatch>,
    pub body: BodyCheck,
}

impl ComparisonReport {
    /// Overall outcome: true when no check found a difference.
    pub fn is_match(&self) -> bool {
        self.status.is_none()
            && self.headers.is_empty()
            && !matches!(self.body, BodyCheck::Mismatched { .. })
    }

    /// Whether the body check ran.
    pub fn body_checked(&self) -> bool {
        !matches!(self.body, BodyCheck::Skipped)
    }
}

/// Applies a [`ComparisonPolicy`] to pairs of outcomes.
#[derive(Debug, Clone)]
pub struct ComparisonEngine {
    policy: Arc<ComparisonPolicy>,
}

impl ComparisonEngine {
    pub fn new(policy: Arc<ComparisonPolicy>) -> Self {
        Self { policy }
    }

    /// Compare the two outcomes of one request.
    pub fn compare(&self, primary: &BranchOutcome, shadow: &BranchOutcome) -> ComparisonReport {
        let mut report = ComparisonReport::default();

        if self.policy.status && primary.status != shadow.status {
            report.status = Some(StatusMismatch {
                primary: primary.status,
                shadow: shadow.status,
            });
        }

        for name in &self.policy.headers {
            let (p, s) = (primary.header_values(name), shadow.header_values(name));
            if p != s {
                report.headers.push(HeaderMismatch {
                    name: name.clone(),
                    primary: p,
                    shadow: s,
                });
            }
        }

        let (p, s) = (primary.body_bytes(), shadow.body_bytes());
        if self.policy.requires_body() && (p.is_some() || s.is_some()) {
            report.body = if primary.error.is_some() || shadow.error.is_some() {
                BodyCheck::mismatched()
            } else {
                self.compare_bodies(p, s)
            };
        }

        report
    }

    /// Body comparison alone. Absent bodies are passed as `None`; a body on
    /// only one side is a mismatch.
    pub fn compare_bodies(&self, primary: Option<&[u8]>, shadow: Option<&[u8]>) -> BodyCheck {
        let (p, s) = match (primary, shadow) {
            (None, None) => return BodyCheck::Matched,
            (Some(p), Some(s)) => (p, s),
            _ => return BodyCheck::mismatched(),
        };

        if !self.policy.json.is_empty() {
            return compare_json(&self.policy.json, &self.policy.ignore, p, s);
        }

        let matched = if self.policy.ignore.is_empty() {
            p == s
        } else {
            match (parse(p), parse(s)) {
                (Some(pv), Some(sv)) => {
                    json_eq(&prune(pv, &self.policy.ignore), &prune(sv, &self.policy.ignore))
                }
                _ => p == s,
            }
        };

        if matched {
            BodyCheck::Matched
        } else {
            BodyCheck::mismatched()
        }
    }
}

fn parse(bytes: &[u8]) -> Option<Value> {
    serde_json::from_slice(bytes).ok()
}

fn prune(value: Value, ignore: &[Query]) -> Value {
    ignore.iter().fold(value, |value, query| query.delete(&value))
}

/// Every query runs on both sides; all failing queries are collected.
/// An unparsable body is queried as `null`.
fn compare_json(queries: &[Query], ignore: &[Query], primary: &[u8], shadow: &[u8]) -> BodyCheck {
    let primary = prune(parse(primary).unwrap_or(Value::Null), ignore);
    let shadow = prune(parse(shadow).unwrap_or(Value::Null), ignore);

    let failed: Vec<String> = queries
        .iter()
        .filter(|query| !outputs_eq(&query.run(&primary), &query.run(&shadow)))
        .map(|query| query.source().to_string())
        .collect();

    if failed.is_empty() {
        BodyCheck::Matched
    } else {
        BodyCheck::Mismatched { queries: failed }
    }
}

/// Runtime errors never compare equal.
fn outputs_eq(primary: &[Output], shadow: &[Output]) -> bool {
    primary.len() == shadow.len()
        && primary.iter().zip(shadow).all(|pair| match pair {
            (Ok(a), Ok(b)) => json_eq(a, b),
            _ => false,
        })
}

/// Structural equality with numbers compared by value.
pub fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                x == y
            } else if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                x == y
            } else {
                x.as_f64() == y.as_f64()
            }
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| json_eq(v, other)))
        }
        _ => a == b,
    }
}
