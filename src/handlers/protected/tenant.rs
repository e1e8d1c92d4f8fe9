// handlers/protected/tenant.rs - Usage report plus the quota-metered tenant resources

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app::AppState;
use crate::engine::facade::{AddMember, NewProfile};
use crate::engine::Actor;
use crate::middleware::{ApiResponse, ApiResult, ClientContext};
use crate::models::{Membership, Profile, UsageReport};

#[derive(Debug, Deserialize)]
pub struct StorageDelta {
    pub delta_mb: i64,
}

#[derive(Debug, Serialize)]
pub struct StorageUsage {
    pub storage_mb: i64,
}

#[derive(Debug, Serialize)]
pub struct Removed {
    pub id: Uuid,
    pub removed: bool,
}

/// GET /tenant/usage
pub async fn tenant_usage(State(state): State<AppState>, Extension(actor): Extension<Actor>) -> ApiResult<UsageReport> {
    Ok(ApiResponse::success(state.engine.tenant_usage(&actor).await?))
}

/// POST /tenant/members
pub async fn member_add(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ClientContext(context): ClientContext,
    Json(request): Json<AddMember>,
) -> ApiResult<Membership> {
    let membership = state.engine.add_member(&actor, &context, request).await?;
    Ok(ApiResponse::created(membership))
}

/// DELETE /tenant/members/:user_id
pub async fn member_remove(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ClientContext(context): ClientContext,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Removed> {
    state.engine.remove_member(&actor, &context, user_id).await?;
    Ok(ApiResponse::success(Removed { id: user_id, removed: true }))
}

/// POST /tenant/profiles
pub async fn profile_create(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ClientContext(context): ClientContext,
    Json(request): Json<NewProfile>,
) -> ApiResult<Profile> {
    let profile = state.engine.create_profile(&actor, &context, request).await?;
    Ok(ApiResponse::created(profile))
}

/// DELETE /tenant/profiles/:id
pub async fn profile_delete(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ClientContext(context): ClientContext,
    Path(profile_id): Path<Uuid>,
) -> ApiResult<Removed> {
    state.engine.delete_profile(&actor, &context, profile_id).await?;
    Ok(ApiResponse::success(Removed { id: profile_id, removed: true }))
}

/// POST /tenant/storage - positive deltas reserve, negative deltas release
pub async fn storage_adjust(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ClientContext(context): ClientContext,
    Json(body): Json<StorageDelta>,
) -> ApiResult<StorageUsage> {
    let storage_mb = state.engine.adjust_storage(&actor, &context, body.delta_mb).await?;
    Ok(ApiResponse::success(StorageUsage { storage_mb }))
}
