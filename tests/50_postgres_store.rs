// Runs only when DATABASE_URL points at a Postgres the tests may write to.
// Every test creates its own tenant, so runs do not interfere.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use futures::future::join_all;
use uuid::Uuid;

use tapcard_api::config::DatabaseConfig;
use tapcard_api::database::{DatabaseManager, PgStore, ReserveOutcome, Store};
use tapcard_api::engine::claim::GenerateClaim;
use tapcard_api::engine::registry::NewCard;
use tapcard_api::engine::{Actor, Engine, EngineError};
use tapcard_api::models::{
    ClaimAttempt, ClaimStatus, ClaimToken, Claimant, RequestContext, ResourceClass, ResourceCounters, Tenant,
};

async fn pg_store() -> Result<Option<Arc<PgStore>>> {
    dotenvy::dotenv().ok();
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping Postgres store test");
        return Ok(None);
    };

    let config = DatabaseConfig {
        url: Some(url),
        max_connections: 16,
        connection_timeout: 5,
        run_migrations: true,
    };
    let pool = DatabaseManager::connect(&config).await?;
    Ok(Some(Arc::new(PgStore::new(pool))))
}

async fn tenant(store: &PgStore, limits: ResourceCounters) -> Result<Tenant> {
    let tenant = Tenant::new(format!("pg-{}", Uuid::new_v4()), limits, Utc::now());
    store.insert_tenant(&tenant).await?;
    Ok(tenant)
}

fn pending_token(tenant_id: Uuid, max_uses: i32) -> ClaimToken {
    let now = Utc::now();
    ClaimToken {
        id: Uuid::new_v4(),
        token_hash: Uuid::new_v4().simple().to_string(),
        tenant_id,
        card_id: None,
        assigned_to: Claimant { email: "jane@example.com".into(), name: None, phone: None },
        status: ClaimStatus::Pending,
        expires_at: now + Duration::hours(1),
        max_uses,
        used_count: 0,
        require_email_verification: false,
        email_verified: false,
        verification_code_hash: None,
        verification_code_expires: None,
        claimed_by: None,
        claimed_at: None,
        revoked_reason: None,
        revoked_at: None,
        created_by: Uuid::new_v4(),
        claim_attempts: Vec::new(),
        version: 0,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_never_pass_the_limit() -> Result<()> {
    let Some(store) = pg_store().await? else { return Ok(()) };
    let n = 12;
    let limits = ResourceCounters { cards: n - 1, ..ResourceCounters::unbounded() };
    let tenant_id = tenant(&store, limits).await?.id;

    let handles: Vec<_> = (0..n)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.try_reserve(tenant_id, ResourceClass::Cards, 1).await })
        })
        .collect();

    let mut reserved = 0;
    let mut exceeded = 0;
    for result in join_all(handles).await {
        match result?? {
            Some(ReserveOutcome::Reserved { .. }) => reserved += 1,
            Some(ReserveOutcome::Exceeded { limit, current }) => {
                assert_eq!((limit, current), (n - 1, n - 1));
                exceeded += 1;
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!((reserved, exceeded), (n - 1, 1));

    let stored = store.get_tenant(tenant_id).await?.expect("tenant");
    assert_eq!(stored.usage.cards, n - 1);

    // Releasing more than was reserved stops at zero
    store.release(tenant_id, ResourceClass::Cards, n).await?;
    assert_eq!(store.release(tenant_id, ResourceClass::Cards, 1).await?, Some(0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_use_token_is_consumed_once() -> Result<()> {
    let Some(store) = pg_store().await? else { return Ok(()) };
    let tenant = tenant(&store, ResourceCounters::unbounded()).await?;
    let token = pending_token(tenant.id, 1);
    store.insert_claim_token(&token).await?;

    let now = Utc::now();
    let (a, b) = tokio::join!(
        store.consume_claim_token(token.id, now),
        store.consume_claim_token(token.id, now)
    );
    assert_eq!(a?.is_some() as u8 + b?.is_some() as u8, 1);

    let stored = store.get_claim_token(token.id).await?.expect("token");
    assert_eq!((stored.status, stored.used_count), (ClaimStatus::Claimed, 1));
    assert!(stored.claimed_by.is_none());
    Ok(())
}

#[tokio::test]
async fn restore_gives_back_a_use_taken_before_a_later_consumer() -> Result<()> {
    let Some(store) = pg_store().await? else { return Ok(()) };
    let tenant = tenant(&store, ResourceCounters::unbounded()).await?;
    let token = pending_token(tenant.id, 2);
    store.insert_claim_token(&token).await?;
    let now = Utc::now();

    assert!(store.consume_claim_token(token.id, now).await?.is_some());
    assert!(store.consume_claim_token(token.id, now).await?.is_some());
    assert!(store.restore_claim_token(token.id, now).await?);

    let second = Uuid::new_v4();
    let recorded = store.record_claimant(token.id, second, now).await?.expect("token");
    assert_eq!(recorded.claimed_by, Some(second));
    assert_eq!((recorded.status, recorded.used_count), (ClaimStatus::Pending, 1));
    Ok(())
}

#[tokio::test]
async fn stale_token_version_is_rejected() -> Result<()> {
    let Some(store) = pg_store().await? else { return Ok(()) };
    let tenant = tenant(&store, ResourceCounters::unbounded()).await?;
    let token = pending_token(tenant.id, 1);
    store.insert_claim_token(&token).await?;

    let mut verified = token.clone();
    verified.email_verified = true;
    assert!(store.update_claim_token(&verified).await?);
    assert!(!store.update_claim_token(&verified).await?);

    let stored = store.get_claim_token(token.id).await?.expect("token");
    assert_eq!(stored.version, 1);
    assert!(stored.email_verified);
    Ok(())
}

#[tokio::test]
async fn attempt_log_keeps_only_the_newest_entries() -> Result<()> {
    let Some(store) = pg_store().await? else { return Ok(()) };
    let tenant = tenant(&store, ResourceCounters::unbounded()).await?;
    let token = pending_token(tenant.id, 1);
    store.insert_claim_token(&token).await?;

    for i in 0..5 {
        let attempt = ClaimAttempt {
            timestamp: Utc::now(),
            ip: None,
            user_agent: None,
            email: Some(format!("try{}@example.com", i)),
            success: false,
            failure_reason: Some("verification_failed".into()),
        };
        store.append_claim_attempt(token.id, attempt, 3).await?;
    }

    let stored = store.get_claim_token(token.id).await?.expect("token");
    let emails: Vec<_> = stored.claim_attempts.iter().filter_map(|a| a.email.clone()).collect();
    assert_eq!(emails, vec!["try2@example.com", "try3@example.com", "try4@example.com"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_redeemers_race_for_one_card() -> Result<()> {
    let Some(store) = pg_store().await? else { return Ok(()) };
    let engine = Arc::new(Engine::builder(store.clone()).build());
    let context = RequestContext::default();

    let owner_id = Uuid::new_v4();
    let tenant = engine
        .create_tenant(&format!("pg-{}", owner_id), ResourceCounters::unbounded(), owner_id, "owner@pg.test")
        .await?;
    let owner = Actor { user_id: owner_id, email: "owner@pg.test".into(), tenant_id: Some(tenant.id) };

    let card = engine.mint_card(&owner, &context, NewCard::default()).await?;
    let issued = engine
        .generate_claim(
            &owner,
            &context,
            GenerateClaim {
                card_id: Some(card.id),
                email: "jane@example.com".into(),
                name: None,
                phone: None,
                expires_in_hours: Some(1),
                max_uses: None,
                require_email_verification: false,
                send_email: false,
            },
        )
        .await?;
    let token = issued.claim_url.rsplit('/').next().unwrap_or_default().to_string();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let engine = engine.clone();
            let token = token.clone();
            let jane = Actor { user_id: Uuid::new_v4(), email: "jane@example.com".into(), tenant_id: None };
            tokio::spawn(async move { engine.redeem_claim(&jane, &RequestContext::default(), &token, None).await })
        })
        .collect();

    let mut wins = 0;
    for result in join_all(handles).await {
        match result? {
            Ok(_) => wins += 1,
            Err(EngineError::TokenInvalid) | Err(EngineError::Conflict(_)) => {}
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }
    assert_eq!(wins, 1);

    let stored = store.get_claim_token(issued.token.id).await?.expect("token");
    assert_eq!((stored.status, stored.used_count), (ClaimStatus::Claimed, 1));
    assert!(stored.claimed_by.is_some());
    Ok(())
}
