#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::StatusCode;
use serde_json::Value;
use uuid::Uuid;

use tapcard_api::app::{app, AppState};
use tapcard_api::auth::{encode_with_secret, Claims};
use tapcard_api::config::AppConfig;
use tapcard_api::database::MemoryStore;
use tapcard_api::engine::email::MemoryMailer;
use tapcard_api::engine::Engine;
use tapcard_api::models::{ResourceCounters, Tenant};

pub const SECRET: &str = "integration-test-secret";

/// A signed-in user as the tests see them
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub token: String,
}

impl User {
    pub fn new(email: &str, tenant_id: Option<Uuid>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            email: email.to_string(),
            token: token_for(id, email, tenant_id),
        }
    }
}

/// In-process server over a fresh in-memory store, with one tenant and its owner
pub struct TestApp {
    pub base_url: String,
    pub client: reqwest::Client,
    pub engine: Arc<Engine>,
    pub mailer: Arc<MemoryMailer>,
    pub tenant: Tenant,
    pub owner: User,
}

impl TestApp {
    pub async fn spawn(limits: ResourceCounters) -> Result<Self> {
        // Pick an unused port for isolation
        let port = portpicker::pick_unused_port().context("failed to pick free port")?;
        let base_url = format!("http://127.0.0.1:{}", port);

        let mailer = Arc::new(MemoryMailer::new());
        let engine = Arc::new(Engine::builder(Arc::new(MemoryStore::new())).mailer(mailer.clone()).build());

        let owner_id = Uuid::new_v4();
        let tenant = engine.create_tenant("acme", limits, owner_id, "owner@acme.test").await?;
        let owner = User {
            id: owner_id,
            email: "owner@acme.test".to_string(),
            token: token_for(owner_id, "owner@acme.test", Some(tenant.id)),
        };

        let router = app(AppState::new(engine.clone(), SECRET), &AppConfig::development());
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .context("failed to bind test port")?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        let app = Self {
            base_url,
            client: reqwest::Client::new(),
            engine,
            mailer,
            tenant,
            owner,
        };
        app.wait_ready(Duration::from_secs(5)).await?;
        Ok(app)
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(resp) = self.client.get(format!("{}/health", self.base_url)).send().await {
                if resp.status() == StatusCode::OK {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        anyhow::bail!("server did not become ready on {} within {:?}", self.base_url, timeout)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POST with a bearer token; returns status and parsed body
    pub async fn post(&self, path: &str, user: Option<&User>, body: Value) -> Result<(StatusCode, Value)> {
        let mut request = self.client.post(self.url(path)).json(&body);
        if let Some(user) = user {
            request = request.bearer_auth(&user.token);
        }
        let resp = request.send().await?;
        Ok((resp.status(), resp.json().await?))
    }

    pub async fn get(&self, path: &str, user: Option<&User>) -> Result<(StatusCode, Value)> {
        let mut request = self.client.get(self.url(path));
        if let Some(user) = user {
            request = request.bearer_auth(&user.token);
        }
        let resp = request.send().await?;
        Ok((resp.status(), resp.json().await?))
    }

    /// Adds a plain member through the API and returns their session
    pub async fn member(&self, email: &str) -> Result<User> {
        let user = User::new(email, Some(self.tenant.id));
        let (status, body) = self
            .post(
                "/tenant/members",
                Some(&self.owner),
                serde_json::json!({ "user_id": user.id, "email": email }),
            )
            .await?;
        anyhow::ensure!(status == StatusCode::CREATED, "add member failed: {}", body);
        Ok(user)
    }
}

pub fn token_for(user_id: Uuid, email: &str, tenant_id: Option<Uuid>) -> String {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id,
        email: email.to_string(),
        tenant_id,
        exp: now + 3600,
        iat: now,
    };
    encode_with_secret(&claims, SECRET).expect("sign test token")
}

/// Last path segment of a claim URL is the plaintext token
pub fn token_from_url(claim_url: &str) -> String {
    claim_url.rsplit('/').next().unwrap_or_default().to_string()
}
