//! Mismatch reporting.
//!
//! Writes one structured log event per difference found, at the configured
//! level, with bodies passed through the redaction queries first.

use serde_json::Value;

use crate::http::request::RequestId;
use crate::shadow::capture::BranchOutcome;
use crate::shadow::compare::{BodyCheck, ComparisonReport};
use crate::shadow::policy::{LogLevel, ReportingPolicy};
use crate::shadow::query::mask_paths;

/// Replacement for redacted JSON values.
pub const REDACTED: &str = "REDACTED";

/// Logged in place of a body that cannot be redacted.
pub const WITHHELD: &str = "[body withheld: not JSON, redaction configured]";

macro_rules! emit {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            LogLevel::Debug => tracing::debug!($($arg)+),
            LogLevel::Info => tracing::info!($($arg)+),
            LogLevel::Error => tracing::error!($($arg)+),
        }
    };
}

/// Emits mismatch logs according to a [`ReportingPolicy`].
#[derive(Debug, Clone)]
pub struct MismatchReporter {
    policy: ReportingPolicy,
}

impl MismatchReporter {
    pub fn new(policy: ReportingPolicy) -> Self {
        Self { policy }
    }

    /// Log every difference in `report`. Does nothing on a match or when
    /// logging is suppressed.
    pub fn report(
        &self,
        request_id: &RequestId,
        report: &ComparisonReport,
        primary: &BranchOutcome,
        shadow: &BranchOutcome,
    ) {
        if self.policy.suppress_log || report.is_match() {
            return;
        }
        let level = self.policy.level;

        if let Some(status) = &report.status {
            emit!(
                level,
                request_id = %request_id,
                primary_status = status.primary.map(|s| s.as_u16()).unwrap_or(0),
                shadow_status = status.shadow.map(|s| s.as_u16()).unwrap_or(0),
                "shadow_status_mismatch"
            );
        }

        for header in &report.headers {
            emit!(
                level,
                request_id = %request_id,
                header = %header.name,
                primary_values = ?header.primary,
                shadow_values = ?header.shadow,
                "shadow_header_mismatch"
            );
        }

        if let BodyCheck::Mismatched { queries } = &report.body {
            let primary_body = self.render_body(primary.body_bytes());
            let shadow_body = self.render_body(shadow.body_bytes());
            emit!(
                level,
                request_id = %request_id,
                queries = ?queries,
                primary_body = %primary_body,
                shadow_body = %shadow_body,
                shadow_error = shadow.error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                "shadow_body_mismatch"
            );
        }
    }

    /// Body text as it appears in logs, with redaction applied.
    pub fn render_body(&self, body: Option<&[u8]>) -> String {
        let bytes = body.unwrap_or_default();
        if self.policy.redact.is_empty() {
            return String::from_utf8_lossy(bytes).into_owned();
        }

        let Ok(mut value) = serde_json::from_slice::<Value>(bytes) else {
            return WITHHELD.to_string();
        };
        let replacement = Value::String(REDACTED.to_string());
        for query in &self.policy.redact {
            let paths = query.paths(&value);
            mask_paths(&mut value, &paths, &replacement);
        }
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow::query::Query;

    fn reporter(redact: &[&str]) -> MismatchReporter {
        MismatchReporter::new(ReportingPolicy {
            redact: redact.iter().map(|q| Query::compile(q).unwrap()).collect(),
            ..Default::default()
        })
    }

    #[test]
    fn test_render_without_redaction() {
        let r = reporter(&[]);
        assert_eq!(r.render_body(Some(b"plain text")), "plain text");
        assert_eq!(r.render_body(None), "");
    }

    #[test]
    fn test_render_masks_paths() {
        let r = reporter(&[".user.email", ".tokens[]"]);
        let rendered = r.render_body(Some(
            br#"{"user":{"email":"a@b.c","name":"ann"},"tokens":["t1","t2"]}"#,
        ));
        let value: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["user"]["email"], "REDACTED");
        assert_eq!(value["user"]["name"], "ann");
        assert_eq!(value["tokens"], serde_json::json!(["REDACTED", "REDACTED"]));
    }

    #[test]
    fn test_render_does_not_create_missing_paths() {
        let r = reporter(&[".secret"]);
        let rendered = r.render_body(Some(br#"{"id":1}"#));
        assert_eq!(rendered, r#"{"id":1}"#);
    }

    #[test]
    fn test_render_masks_selected_elements() {
        let r = reporter(&[".users[] | select(.admin) | .name"]);
        let rendered = r.render_body(Some(
            br#"{"users":[{"name":"root","admin":true},{"name":"ann","admin":false}]}"#,
        ));
        let value: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["users"][0]["name"], "REDACTED");
        assert_eq!(value["users"][1]["name"], "ann");
    }

    #[test]
    fn test_render_withholds_unparsable() {
        let r = reporter(&[".secret"]);
        assert_eq!(r.render_body(Some(b"secret=1")), WITHHELD);
    }
}
