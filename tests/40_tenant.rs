mod common;

use anyhow::Result;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tapcard_api::models::{ResourceCounters, TenantStatus};

use common::TestApp;

fn usage_of(report: &Value, resource: &str) -> Value {
    report["data"]["resources"]
        .as_array()
        .and_then(|rows| rows.iter().find(|r| r["resource"] == resource))
        .cloned()
        .unwrap_or(Value::Null)
}

#[tokio::test]
async fn members_and_profiles_consume_quota() -> Result<()> {
    let limits = ResourceCounters {
        users: 2,
        profiles: 1,
        ..ResourceCounters::unbounded()
    };
    let app = TestApp::spawn(limits).await?;

    let member = app.member("crew@acme.test").await?;
    let extra = uuid::Uuid::new_v4();
    let (status, body) = app
        .post(
            "/tenant/members",
            Some(&app.owner),
            json!({ "user_id": extra, "email": "late@acme.test" }),
        )
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["resource"], "users");

    let (status, body) = app
        .post("/tenant/profiles", Some(&member), json!({ "display_name": "Crew Card" }))
        .await?;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    let profile_id = body["data"]["id"].as_str().unwrap_or_default().to_string();

    let (status, _) = app
        .post("/tenant/profiles", Some(&app.owner), json!({ "display_name": "Owner Card" }))
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, report) = app.get("/tenant/usage", Some(&app.owner)).await?;
    assert_eq!(usage_of(&report, "users")["current"], 2);
    assert_eq!(usage_of(&report, "profiles")["remaining"], 0);
    assert!(usage_of(&report, "cards")["remaining"].is_null());

    let deleted = app
        .client
        .delete(app.url(&format!("/tenant/profiles/{}", profile_id)))
        .bearer_auth(&member.token)
        .send()
        .await?;
    assert_eq!(deleted.status(), StatusCode::OK);

    let removed = app
        .client
        .delete(app.url(&format!("/tenant/members/{}", member.id)))
        .bearer_auth(&app.owner.token)
        .send()
        .await?;
    assert_eq!(removed.status(), StatusCode::OK);

    let (_, report) = app.get("/tenant/usage", Some(&app.owner)).await?;
    assert_eq!(usage_of(&report, "users")["current"], 1);
    assert_eq!(usage_of(&report, "profiles")["current"], 0);

    Ok(())
}

#[tokio::test]
async fn storage_release_saturates_at_zero() -> Result<()> {
    let limits = ResourceCounters {
        storage_mb: 100,
        ..ResourceCounters::unbounded()
    };
    let app = TestApp::spawn(limits).await?;

    let (status, body) = app.post("/tenant/storage", Some(&app.owner), json!({ "delta_mb": 60 })).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["storage_mb"], 60);

    let (status, body) = app.post("/tenant/storage", Some(&app.owner), json!({ "delta_mb": 50 })).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["current"], 60);

    let (_, body) = app.post("/tenant/storage", Some(&app.owner), json!({ "delta_mb": -500 })).await?;
    assert_eq!(body["data"]["storage_mb"], 0);

    Ok(())
}

#[tokio::test]
async fn suspended_tenants_are_frozen() -> Result<()> {
    let app = TestApp::spawn(ResourceCounters::unbounded()).await?;
    app.engine
        .set_tenant_status(app.tenant.id, TenantStatus::Suspended)
        .await?;

    let (status, body) = app.post("/cards", Some(&app.owner), json!({})).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "TENANT_INACTIVE");

    Ok(())
}
