// handlers/public/tap.rs - POST /cards/:code/{tap,view}
//
// Hits are counted whatever the card's state; the redirect target is only
// disclosed while the card is active.

use axum::extract::{Path, State};
use serde::Serialize;

use crate::app::AppState;
use crate::engine::facade::Hit;
use crate::middleware::{ApiResponse, ApiResult};
use crate::models::{CardStatus, HitKind};

#[derive(Debug, Serialize)]
pub struct HitResponse {
    pub card_code: String,
    pub status: CardStatus,
    pub redirect_url: Option<String>,
    pub tap_count: i64,
    pub view_count: i64,
}

impl From<Hit> for HitResponse {
    fn from(hit: Hit) -> Self {
        Self {
            card_code: hit.card.card_code,
            status: hit.card.status,
            redirect_url: hit.redirect_url,
            tap_count: hit.card.tap_count,
            view_count: hit.card.view_count,
        }
    }
}

async fn record(state: AppState, code: String, kind: HitKind) -> ApiResult<HitResponse> {
    let hit = state.engine.record_hit(&code, kind).await?;
    Ok(ApiResponse::success(hit.into()))
}

pub async fn card_tap(State(state): State<AppState>, Path(code): Path<String>) -> ApiResult<HitResponse> {
    record(state, code, HitKind::Tap).await
}

pub async fn card_view(State(state): State<AppState>, Path(code): Path<String>) -> ApiResult<HitResponse> {
    record(state, code, HitKind::View).await
}
