use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::models::{AuditEvent, AuditResource, RequestContext, Severity};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),

    #[error("Audit write failed: {0}")]
    WriteFailed(String),
}

/// Destination for audit events. Errors are reported to the dispatcher,
/// which logs and drops them; they never reach the request that caused them.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

impl AuditEvent {
    pub fn new(
        tenant_id: Uuid,
        actor_id: Option<Uuid>,
        action: impl Into<String>,
        kind: impl Into<String>,
        resource_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            actor_id,
            action: action.into(),
            resource: AuditResource {
                kind: kind.into(),
                id: resource_id,
            },
            changes: None,
            context: RequestContext::default(),
            severity: Severity::Info,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_changes(mut self, changes: Value) -> Self {
        self.changes = Some(changes);
        self
    }

    pub fn with_context(mut self, context: &RequestContext) -> Self {
        self.context = context.clone();
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// Outbox in front of an [`AuditSink`].
///
/// `emit` never blocks and never fails: events go into a bounded channel
/// drained by a background task. When the channel is full the event is
/// dropped with a warning.
#[derive(Clone)]
pub struct AuditDispatcher {
    tx: Option<mpsc::Sender<AuditEvent>>,
}

impl AuditDispatcher {
    pub fn spawn(sink: Arc<dyn AuditSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.record(&event).await {
                    tracing::warn!(
                        "Audit write dropped: action={} tenant={} error={}",
                        event.action, event.tenant_id, e
                    );
                }
            }
            tracing::debug!("Audit dispatcher stopped");
        });

        (Self { tx: Some(tx) }, handle)
    }

    /// Dispatcher that discards everything (audit disabled by config)
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: AuditEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(event) {
            let event = match e {
                mpsc::error::TrySendError::Full(event) => event,
                mpsc::error::TrySendError::Closed(event) => event,
            };
            tracing::warn!(
                "Audit outbox unavailable, dropping event: action={} tenant={}",
                event.action, event.tenant_id
            );
        }
    }
}

/// Writes events to the log stream under the `audit` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let changes = event
            .changes
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_default();
        tracing::info!(
            target: "audit",
            "{} {} {:?} tenant={} actor={:?} severity={} changes={}",
            event.action,
            event.resource.kind,
            event.resource.id,
            event.tenant_id,
            event.actor_id,
            event.severity.as_str(),
            changes
        );
        Ok(())
    }
}

/// Keeps events in memory; used by tests and the development server
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    pub async fn actions(&self) -> Vec<String> {
        self.events.read().await.iter().map(|e| e.action.clone()).collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events.write().await.push(event.clone());
        Ok(())
    }
}
