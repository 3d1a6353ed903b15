//! Monitoring and audit capabilities.
//!
//! Both are optional collaborators: the core emits events at significant
//! milestones and must tolerate complete absence, so no-op implementations
//! are the default. Storage, encryption, and rotation of audit events are
//! not implemented here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A tag set for a metric sample. Small and borrowed: emission sites build
/// these inline.
pub type Tags<'a> = &'a [(&'a str, &'a str)];

#[derive(Debug, Clone)]
pub struct TraceSpan {
    pub name: String,
    pub trace_id: String,
    pub span_id: String,
    pub started_at: std::time::Instant,
}

pub trait Monitor: Send + Sync {
    fn metric(&self, name: &str, value: f64, tags: Tags<'_>);
    fn counter(&self, name: &str, value: u64, tags: Tags<'_>);

    fn start_trace(&self, name: &str, parent: Option<&TraceSpan>) -> TraceSpan {
        TraceSpan {
            name: name.to_string(),
            trace_id: parent
                .map(|p| p.trace_id.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            span_id: Uuid::new_v4().to_string(),
            started_at: std::time::Instant::now(),
        }
    }

    fn finish_trace(&self, span: &TraceSpan) {
        self.metric(
            &format!("trace.{}.duration_ms", span.name),
            span.started_at.elapsed().as_secs_f64() * 1000.0,
            &[],
        );
    }
}

/// Complete absence of a monitoring backend.
pub struct NoopMonitor;

impl Monitor for NoopMonitor {
    fn metric(&self, _name: &str, _value: f64, _tags: Tags<'_>) {}
    fn counter(&self, _name: &str, _value: u64, _tags: Tags<'_>) {}
    fn finish_trace(&self, _span: &TraceSpan) {}
}

/// Routes samples into the process log, for local debugging.
pub struct LogMonitor;

impl Monitor for LogMonitor {
    fn metric(&self, name: &str, value: f64, tags: Tags<'_>) {
        debug!(metric = name, value, ?tags, "metric");
    }

    fn counter(&self, name: &str, value: u64, tags: Tags<'_>) {
        debug!(counter = name, value, ?tags, "counter");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub category: String,
    pub action: String,
    pub level: AuditLevel,
    pub details: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        category: impl Into<String>,
        action: impl Into<String>,
        level: AuditLevel,
        details: serde_json::Value,
    ) -> Self {
        Self {
            category: category.into(),
            action: action.into(),
            level,
            details,
            at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

pub struct NoopAudit;

#[async_trait]
impl AuditSink for NoopAudit {
    async fn record(&self, _event: AuditEvent) {}
}

/// Writes audit events into the process log. Delivery is best-effort by
/// contract, so there is nothing to propagate.
pub struct LogAudit;

#[async_trait]
impl AuditSink for LogAudit {
    async fn record(&self, event: AuditEvent) {
        match event.level {
            AuditLevel::Info => {
                info!(category = %event.category, action = %event.action, details = %event.details, "audit")
            }
            AuditLevel::Warning | AuditLevel::Critical => {
                warn!(category = %event.category, action = %event.action, details = %event.details, "audit")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_span_inherits_trace_id() {
        let monitor = NoopMonitor;
        let root = monitor.start_trace("execute", None);
        let child = monitor.start_trace("dispatch", Some(&root));
        assert_eq!(root.trace_id, child.trace_id);
        assert_ne!(root.span_id, child.span_id);
    }

    #[tokio::test]
    async fn noop_sinks_accept_everything() {
        let monitor = NoopMonitor;
        monitor.counter("command.success", 1, &[("command", "cargo")]);
        monitor.metric("command.duration_ms", 12.5, &[]);

        let audit = NoopAudit;
        audit
            .record(AuditEvent::new(
                "rate_limit",
                "denied",
                AuditLevel::Warning,
                serde_json::json!({"key": "cargo test"}),
            ))
            .await;
    }
}
