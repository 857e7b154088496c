//! Audit trail and decision counters for authentication outcomes.
//!
//! Every decision emits one structured event and increments
//! `jwt_gate_decisions_total{outcome,reason}`.
//!
//! | Event | When |
//! |-------|------|
//! | `auth.allowed` | Token verified and matches the live token |
//! | `auth.skipped` | Path is on the skip list |
//! | `auth.denied` | Any deny reason |
//! | `token.issued` | A token was signed for a consumer |
//!
//! Allowed and skipped events log at `INFO`. Denials log at `WARN`, or at
//! `ERROR` when a dependency (vault, store, key material) is at fault.

use std::sync::Once;

use serde::Serialize;
use telemetry_metrics::{counter, describe_counter};

use super::pipeline::{Denial, Outcome};

/// Decision counter name.
pub const DECISIONS_TOTAL: &str = "jwt_gate_decisions_total";

/// Issued token counter name.
pub const ISSUED_TOTAL: &str = "jwt_gate_tokens_issued_total";

static DESCRIBE: Once = Once::new();

/// Register metric descriptions with the installed recorder. Idempotent.
pub fn describe_metrics() {
    DESCRIBE.call_once(|| {
        describe_counter!(
            DECISIONS_TOTAL,
            "Authentication decisions by outcome and deny reason"
        );
        describe_counter!(ISSUED_TOTAL, "Tokens issued by consumer");
    });
}

/// Structured audit event.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type (e.g. `"auth.denied"`)
    pub event: &'static str,
    /// Request path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Consumer username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer: Option<String>,
    /// `sub` claim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Deny reason code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    /// Diagnostic detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEvent {
    /// Event for a decision on `path`.
    #[must_use]
    pub fn for_decision(path: &str, result: &Result<Outcome, Denial>) -> Self {
        let mut event = Self::bare("auth.skipped");
        event.path = Some(path.to_string());
        match result {
            Ok(Outcome::Skipped) => {}
            Ok(Outcome::Authenticated(who)) => {
                event.event = "auth.allowed";
                event.consumer = Some(who.username.clone());
                event.subject = Some(who.subject.clone());
            }
            Err(denial) => {
                event.event = "auth.denied";
                event.reason = Some(denial.reason.code());
                event.detail = Some(denial.detail.clone()).filter(|d| !d.is_empty());
            }
        }
        event
    }

    /// `token.issued` event.
    #[must_use]
    pub fn issued(consumer: &str, subject: Option<&str>) -> Self {
        let mut event = Self::bare("token.issued");
        event.consumer = Some(consumer.to_string());
        event.subject = subject.map(str::to_string);
        event
    }

    fn bare(event: &'static str) -> Self {
        Self {
            event,
            path: None,
            consumer: None,
            subject: None,
            reason: None,
            detail: None,
        }
    }
}

/// Emit the audit event and count the decision.
pub fn record(path: &str, result: &Result<Outcome, Denial>) {
    let event = AuditEvent::for_decision(path, result);
    let json = serde_json::to_string(&event).unwrap_or_default();

    match result {
        Ok(outcome) => {
            let outcome = if matches!(outcome, Outcome::Skipped) {
                "skipped"
            } else {
                "allowed"
            };
            counter!(DECISIONS_TOTAL, "outcome" => outcome, "reason" => "none").increment(1);
            tracing::info!(audit = %json, "jwt_auth audit");
        }
        Err(denial) => {
            counter!(DECISIONS_TOTAL, "outcome" => "denied", "reason" => denial.reason.code())
                .increment(1);
            if denial.reason.is_service_error() {
                tracing::error!(audit = %json, "jwt_auth audit");
            } else {
                tracing::warn!(audit = %json, "jwt_auth audit");
            }
        }
    }
}

/// Emit a `token.issued` event and count it.
pub fn record_issued(consumer: &str, subject: Option<&str>) {
    counter!(ISSUED_TOTAL, "consumer" => consumer.to_string()).increment(1);
    match serde_json::to_string(&AuditEvent::issued(consumer, subject)) {
        Ok(ref json) => tracing::info!(audit = %json, "jwt_auth audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
