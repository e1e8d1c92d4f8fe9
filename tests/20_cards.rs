mod common;

use anyhow::Result;
use reqwest::StatusCode;
use serde_json::json;
use tapcard_api::models::ResourceCounters;

#[tokio::test]
async fn minting_is_capped_by_the_card_quota() -> Result<()> {
    let limits = ResourceCounters {
        cards: 1,
        ..ResourceCounters::unbounded()
    };
    let app = common::TestApp::spawn(limits).await?;

    let (status, body) = app.post("/cards", Some(&app.owner), json!({ "sku": "NFC-BLK" })).await?;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["data"]["status"], "inventory");
    assert_eq!(body["data"]["lifecycle_stage"], "manufactured");

    let (status, body) = app.post("/cards", Some(&app.owner), json!({})).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "QUOTA_EXCEEDED");
    assert_eq!(body["resource"], "cards");
    assert_eq!(body["limit"], 1);
    assert_eq!(body["current"], 1);

    Ok(())
}

#[tokio::test]
async fn bulk_mint_renders_urls_and_validates_count() -> Result<()> {
    let app = common::TestApp::spawn(ResourceCounters::unbounded()).await?;

    let (status, body) = app
        .post(
            "/cards/bulk",
            Some(&app.owner),
            json!({
                "count": 3,
                "batch_number": "B-TEST",
                "url_template": "https://tap.example/{batch}/{index}/{code}"
            }),
        )
        .await?;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["data"]["count"], 3);
    assert_eq!(body["data"]["batch_number"], "B-TEST");

    let preview = body["data"]["preview"].as_array().cloned().unwrap_or_default();
    assert_eq!(preview.len(), 3);
    let first_code = preview[0]["card_code"].as_str().unwrap_or_default();
    assert_eq!(
        preview[0]["redirect_url"],
        format!("https://tap.example/B-TEST/1/{}", first_code)
    );

    let (status, body) = app.post("/cards/bulk", Some(&app.owner), json!({ "count": 0 })).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    Ok(())
}

#[tokio::test]
async fn roles_and_tenants_are_enforced() -> Result<()> {
    let app = common::TestApp::spawn(ResourceCounters::unbounded()).await?;
    let (_, body) = app.post("/cards", Some(&app.owner), json!({})).await?;
    let card_id = body["data"]["id"].as_str().unwrap_or_default().to_string();

    let member = app.member("crew@acme.test").await?;
    let (status, body) = app.post("/cards", Some(&member), json!({})).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");

    // Members may still read their tenant's cards
    let (status, _) = app.get(&format!("/cards/{}", card_id), Some(&member)).await?;
    assert_eq!(status, StatusCode::OK);

    // Another tenant's owner gets the same answer as for an unknown card
    let other_owner = uuid::Uuid::new_v4();
    let globex = app
        .engine
        .create_tenant("globex", ResourceCounters::unbounded(), other_owner, "owner@globex.test")
        .await?;
    let outsider = common::User {
        id: other_owner,
        email: "owner@globex.test".to_string(),
        token: common::token_for(other_owner, "owner@globex.test", Some(globex.id)),
    };
    let (status, body) = app.get(&format!("/cards/{}", card_id), Some(&outsider)).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (_, unknown) = app.get(&format!("/cards/{}", uuid::Uuid::new_v4()), Some(&outsider)).await?;
    assert_eq!(body, unknown);

    Ok(())
}

#[tokio::test]
async fn status_changes_follow_the_state_machine() -> Result<()> {
    let app = common::TestApp::spawn(ResourceCounters::unbounded()).await?;
    let (_, body) = app
        .post("/cards", Some(&app.owner), json!({ "url_template": "https://tap.example/{code}" }))
        .await?;
    let card_id = body["data"]["id"].as_str().unwrap_or_default().to_string();
    let code = body["data"]["card_code"].as_str().unwrap_or_default().to_string();

    // Inventory cards count taps but never redirect
    let (status, body) = app.post(&format!("/cards/{}/tap", code), None, json!({})).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["tap_count"], 1);
    assert!(body["data"]["redirect_url"].is_null());

    let (status, body) = app.post(&format!("/cards/{}/activate", card_id), Some(&app.owner), json!({})).await?;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["status"], "active");

    let (_, body) = app.post(&format!("/cards/{}/tap", code.to_lowercase()), None, json!({})).await?;
    assert_eq!(body["data"]["redirect_url"], format!("https://tap.example/{}", code));
    assert_eq!(body["data"]["tap_count"], 2);

    let (status, _) = app.post(&format!("/cards/{}/deactivate", card_id), Some(&app.owner), json!({})).await?;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.post(&format!("/cards/{}/activate", card_id), Some(&app.owner), json!({})).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_TRANSITION");
    assert_eq!(body["current"], "deactivated");
    assert_eq!(body["requested"], "activate");

    let (status, _) = app.post("/cards/NOPE0000/tap", None, json!({})).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn assignment_history_is_paginated() -> Result<()> {
    let app = common::TestApp::spawn(ResourceCounters::unbounded()).await?;
    let member = app.member("crew@acme.test").await?;

    let (_, body) = app.post("/cards", Some(&app.owner), json!({})).await?;
    let card_id = body["data"]["id"].as_str().unwrap_or_default().to_string();
    app.post(&format!("/cards/{}/activate", card_id), Some(&app.owner), json!({})).await?;

    let (status, body) = app
        .post(
            &format!("/cards/{}/assign", card_id),
            Some(&app.owner),
            json!({ "user_id": member.id, "reason": "issued at onboarding" }),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["assigned_to"], member.id.to_string());

    let (status, _) = app.post(&format!("/cards/{}/unassign", card_id), Some(&app.owner), json!({})).await?;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.get(&format!("/cards/{}/history?limit=1", card_id), Some(&app.owner)).await?;
    assert_eq!(status, StatusCode::OK);
    let page = body["data"].as_array().cloned().unwrap_or_default();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0]["reason"], "issued at onboarding");

    let (_, body) = app.get(&format!("/cards/{}/history?offset=1", card_id), Some(&app.owner)).await?;
    let rest = body["data"].as_array().cloned().unwrap_or_default();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0]["reason"], "unassign");
    assert!(rest[0]["user_id"].is_null());

    Ok(())
}
