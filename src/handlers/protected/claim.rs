// handlers/protected/claim.rs - Claim issuance, redemption and revocation

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::app::AppState;
use crate::engine::claim::{GenerateClaim, IssuedClaim, Redemption};
use crate::engine::Actor;
use crate::middleware::{ApiResponse, ApiResult, ClientContext};
use crate::models::ClaimToken;

#[derive(Debug, Default, Deserialize)]
pub struct RedeemBody {
    pub profile_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct RevokeBody {
    pub reason: String,
}

/// POST /claim/generate
///
/// The plaintext token appears only inside `claim_url` of this response.
pub async fn claim_generate(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ClientContext(context): ClientContext,
    Json(request): Json<GenerateClaim>,
) -> ApiResult<IssuedClaim> {
    let issued = state.engine.generate_claim(&actor, &context, request).await?;
    Ok(ApiResponse::created(issued))
}

/// POST /claim/:token/claim
pub async fn claim_redeem(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ClientContext(context): ClientContext,
    Path(token): Path<String>,
    body: Option<Json<RedeemBody>>,
) -> ApiResult<Redemption> {
    let profile_id = body.and_then(|Json(body)| body.profile_id);
    let redemption = state.engine.redeem_claim(&actor, &context, &token, profile_id).await?;
    Ok(ApiResponse::success(redemption))
}

/// POST /claim/:token/revoke (`:token` is the plaintext or the token id)
pub async fn claim_revoke(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ClientContext(context): ClientContext,
    Path(token): Path<String>,
    Json(body): Json<RevokeBody>,
) -> ApiResult<ClaimToken> {
    let revoked = state.engine.revoke_claim(&actor, &context, &token, &body.reason).await?;
    Ok(ApiResponse::success(revoked))
}
