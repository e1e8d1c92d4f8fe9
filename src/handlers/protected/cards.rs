// handlers/protected/cards.rs - Card minting, lookup, assignment and status routes

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::app::AppState;
use crate::database::Page;
use crate::engine::facade::{AssignCard, BulkMintSummary};
use crate::engine::lifecycle::CardOp;
use crate::engine::registry::{BulkMint, NewCard};
use crate::engine::Actor;
use crate::middleware::{ApiResponse, ApiResult, ClientContext};
use crate::models::{AssignmentEntry, Card};

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReasonBody {
    pub reason: Option<String>,
}

/// POST /cards
pub async fn card_create(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ClientContext(context): ClientContext,
    Json(request): Json<NewCard>,
) -> ApiResult<Card> {
    let card = state.engine.mint_card(&actor, &context, request).await?;
    Ok(ApiResponse::created(card))
}

/// POST /cards/bulk
pub async fn card_bulk_create(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ClientContext(context): ClientContext,
    Json(request): Json<BulkMint>,
) -> ApiResult<BulkMintSummary> {
    let summary = state.engine.bulk_mint(&actor, &context, request).await?;
    Ok(ApiResponse::created(summary))
}

/// GET /cards/:id
pub async fn card_get(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(card_id): Path<Uuid>,
) -> ApiResult<Card> {
    Ok(ApiResponse::success(state.engine.get_card(&actor, card_id).await?))
}

/// GET /cards/:id/history?offset&limit
pub async fn card_history(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(card_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<AssignmentEntry>> {
    let page = Page::new(query.offset, query.limit);
    Ok(ApiResponse::success(state.engine.card_history(&actor, card_id, page).await?))
}

/// POST /cards/:id/assign
pub async fn card_assign(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ClientContext(context): ClientContext,
    Path(card_id): Path<Uuid>,
    Json(request): Json<AssignCard>,
) -> ApiResult<Card> {
    let card = state.engine.assign_card(&actor, &context, card_id, request).await?;
    Ok(ApiResponse::success(card))
}

/// POST /cards/:id/reassign
pub async fn card_reassign(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ClientContext(context): ClientContext,
    Path(card_id): Path<Uuid>,
    Json(request): Json<AssignCard>,
) -> ApiResult<Card> {
    let card = state.engine.reassign_card(&actor, &context, card_id, request).await?;
    Ok(ApiResponse::success(card))
}

/// POST /cards/:id/unassign (body optional)
pub async fn card_unassign(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ClientContext(context): ClientContext,
    Path(card_id): Path<Uuid>,
    body: Option<Json<ReasonBody>>,
) -> ApiResult<Card> {
    let reason = body.and_then(|Json(body)| body.reason);
    let card = state.engine.unassign_card(&actor, &context, card_id, reason).await?;
    Ok(ApiResponse::success(card))
}

async fn change_status(state: AppState, actor: Actor, context: ClientContext, card_id: Uuid, op: CardOp) -> ApiResult<Card> {
    let card = state.engine.change_status(&actor, &context.0, card_id, op).await?;
    Ok(ApiResponse::success(card))
}

/// POST /cards/:id/activate
pub async fn card_activate(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    context: ClientContext,
    Path(card_id): Path<Uuid>,
) -> ApiResult<Card> {
    change_status(state, actor, context, card_id, CardOp::Activate).await
}

/// POST /cards/:id/deactivate
pub async fn card_deactivate(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    context: ClientContext,
    Path(card_id): Path<Uuid>,
) -> ApiResult<Card> {
    change_status(state, actor, context, card_id, CardOp::Deactivate).await
}

/// POST /cards/:id/suspend
pub async fn card_suspend(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    context: ClientContext,
    Path(card_id): Path<Uuid>,
) -> ApiResult<Card> {
    change_status(state, actor, context, card_id, CardOp::Suspend).await
}

/// POST /cards/:id/unsuspend
pub async fn card_unsuspend(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    context: ClientContext,
    Path(card_id): Path<Uuid>,
) -> ApiResult<Card> {
    change_status(state, actor, context, card_id, CardOp::Unsuspend).await
}
