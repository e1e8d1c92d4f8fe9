use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::config::ClaimConfig;
use crate::database::memory::MemoryStore;
use crate::engine::audit::{AuditDispatcher, AuditError, AuditSink, MemoryAuditSink};
use crate::engine::clock::ManualClock;
use crate::engine::email::MemoryMailer;
use crate::engine::facade::AddMember;
use crate::engine::identifier::CodeGenerator;
use crate::engine::{Actor, Engine};
use crate::models::{AuditEvent, RequestContext, ResourceCounters, Role, Tenant};

/// Hands out a fixed sequence of codes, then repeats the last one forever
pub struct ScriptedCodes {
    queue: Mutex<VecDeque<String>>,
    last: Mutex<String>,
}

impl ScriptedCodes {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queue: VecDeque<String> = codes.into_iter().map(Into::into).collect();
        let last = queue.back().cloned().unwrap_or_else(|| "AAAAAAAA".to_string());
        Self {
            queue: Mutex::new(queue),
            last: Mutex::new(last),
        }
    }
}

impl CodeGenerator for ScriptedCodes {
    fn next_code(&self) -> String {
        match self.queue.lock().unwrap().pop_front() {
            Some(code) => {
                *self.last.lock().unwrap() = code.clone();
                code
            }
            None => self.last.lock().unwrap().clone(),
        }
    }
}

/// Audit sink that is always down
pub struct FailingAuditSink;

#[async_trait]
impl AuditSink for FailingAuditSink {
    async fn record(&self, _event: &AuditEvent) -> Result<(), AuditError> {
        Err(AuditError::Unavailable("sink offline".into()))
    }
}

/// In-memory engine with one tenant and its owner, plus handles on every
/// collaborator so tests can look behind the facade
pub struct TestEngine {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub mailer: Arc<MemoryMailer>,
    pub audit: Arc<MemoryAuditSink>,
    pub clock: Arc<ManualClock>,
    pub tenant: Tenant,
    pub owner: Actor,
}

impl TestEngine {
    pub async fn new(limits: ResourceCounters) -> Self {
        Self::build(limits, ClaimConfig::default(), None).await
    }

    pub async fn with_settings(limits: ResourceCounters, claim: ClaimConfig) -> Self {
        Self::build(limits, claim, None).await
    }

    pub async fn with_audit_sink(limits: ResourceCounters, sink: Arc<dyn AuditSink>) -> Self {
        Self::build(limits, ClaimConfig::default(), Some(sink)).await
    }

    async fn build(limits: ResourceCounters, claim: ClaimConfig, sink: Option<Arc<dyn AuditSink>>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let mailer = Arc::new(MemoryMailer::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let sink = sink.unwrap_or_else(|| audit.clone() as Arc<dyn AuditSink>);
        let (dispatcher, _handle) = AuditDispatcher::spawn(sink, 256);

        let engine = Engine::builder(store.clone())
            .mailer(mailer.clone())
            .audit(dispatcher)
            .clock(clock.clone())
            .claim_settings(claim)
            .build();

        let owner_id = Uuid::new_v4();
        let tenant = engine
            .create_tenant("acme", limits, owner_id, "owner@acme.test")
            .await
            .expect("create tenant");
        let owner = Actor {
            user_id: owner_id,
            email: "owner@acme.test".to_string(),
            tenant_id: Some(tenant.id),
        };

        Self {
            engine,
            store,
            mailer,
            audit,
            clock,
            tenant,
            owner,
        }
    }

    /// Adds a plain member to the tenant through the facade
    pub async fn member(&self, email: &str) -> Actor {
        let user_id = Uuid::new_v4();
        let request = AddMember {
            user_id,
            email: email.to_string(),
            role: Role::Member,
        };
        self.engine
            .add_member(&self.owner, &RequestContext::default(), request)
            .await
            .expect("add member");
        Actor {
            user_id,
            email: email.to_string(),
            tenant_id: Some(self.tenant.id),
        }
    }

    /// Owner of a second tenant in the same store
    pub async fn foreign_owner(&self) -> Actor {
        let user_id = Uuid::new_v4();
        let tenant = self
            .engine
            .create_tenant("globex", ResourceCounters::unbounded(), user_id, "owner@globex.test")
            .await
            .expect("create foreign tenant");
        Actor {
            user_id,
            email: "owner@globex.test".to_string(),
            tenant_id: Some(tenant.id),
        }
    }

    /// A signed-in user with no tenant yet
    pub fn outsider(email: &str) -> Actor {
        Actor {
            user_id: Uuid::new_v4(),
            email: email.to_string(),
            tenant_id: None,
        }
    }

    /// Polls the audit sink until `action` shows up or a second passes
    pub async fn wait_for_audit(&self, action: &str) -> bool {
        for _ in 0..100 {
            if self.audit.actions().await.iter().any(|a| a == action) {
                return true;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        false
    }
}
