use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tapcard_api::app::{app, AppState};
use tapcard_api::config::{self, AppConfig, Environment, StoreBackend};
use tapcard_api::database::{DatabaseManager, MemoryStore, PgStore, Store};
use tapcard_api::engine::audit::{AuditDispatcher, AuditSink, TracingAuditSink};
use tapcard_api::engine::email::{LogMailer, Mailer, WebhookMailer};
use tapcard_api::engine::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present so cargo run picks up DATABASE_URL, JWT_SECRET, etc.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tapcard_api=info,tower_http=info")),
        )
        .init();

    // Initialize configuration (this loads the config singleton)
    let config = config::config();
    info!("Starting Tap-Card API in {:?} mode", config.environment);

    if config.security.jwt_secret.is_empty() {
        bail!("JWT_SECRET must be set when APP_ENV is {:?}", config.environment);
    }

    let engine = Arc::new(build_engine(config).await?);

    if config.claim.sweep_interval_secs > 0 {
        spawn_claim_sweeper(engine.clone(), Duration::from_secs(config.claim.sweep_interval_secs));
    }

    let app = app(AppState::new(engine, config.security.jwt_secret.as_str()), config);

    let bind_addr = format!("0.0.0.0:{}", config.api.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;

    info!("Tap-Card API listening on http://{}", bind_addr);

    axum::serve(listener, app).await.context("server")?;
    Ok(())
}

async fn build_engine(config: &AppConfig) -> anyhow::Result<Engine> {
    let (store, sink): (Arc<dyn Store>, Arc<dyn AuditSink>) = match config.store.backend {
        StoreBackend::Memory => {
            if config.environment != Environment::Development {
                tracing::warn!("In-memory store selected outside development; state is lost on restart");
            }
            (Arc::new(MemoryStore::new()), Arc::new(TracingAuditSink))
        }
        StoreBackend::Postgres => {
            let pool = DatabaseManager::connect(&config.database).await?;
            let pg = Arc::new(PgStore::new(pool));
            (pg.clone(), pg)
        }
    };

    let mailer: Arc<dyn Mailer> = match &config.email.webhook_url {
        Some(raw) => {
            let endpoint = url::Url::parse(raw).context("EMAIL_WEBHOOK_URL is not a valid URL")?;
            Arc::new(WebhookMailer::new(endpoint))
        }
        None => Arc::new(LogMailer),
    };

    let audit = if config.audit.enabled {
        let (dispatcher, _drain) = AuditDispatcher::spawn(sink, config.audit.channel_capacity);
        dispatcher
    } else {
        AuditDispatcher::disabled()
    };

    Ok(Engine::builder(store)
        .mailer(mailer)
        .audit(audit)
        .claim_settings(config.claim.clone())
        .card_settings(config.cards.clone())
        .build())
}

/// Flips stale pending tokens to expired. Redemption never depends on this.
fn spawn_claim_sweeper(engine: Arc<Engine>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match engine.sweep_claims().await {
                Ok(0) => {}
                Ok(expired) => info!("Expired {} stale claim tokens", expired),
                Err(e) => error!("Claim sweep failed: {}", e),
            }
        }
    });
}
