use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Resource an audit event is about
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditResource {
    pub kind: String,
    pub id: Option<Uuid>,
}

/// Request context captured alongside an event
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// `None` for anonymous public hits
    pub actor_id: Option<Uuid>,
    pub action: String,
    pub resource: AuditResource,
    pub changes: Option<Value>,
    pub context: RequestContext,
    pub severity: Severity,
    pub recorded_at: DateTime<Utc>,
}
