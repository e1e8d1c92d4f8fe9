// handlers/public/claim.rs - Anonymous claim-link endpoints
//
// The link itself is the credential, so none of these require a session.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::app::AppState;
use crate::engine::claim::{ClaimPreview, VerificationSent};
use crate::middleware::{ApiResponse, ApiResult, ClientContext};

#[derive(Debug, Deserialize)]
pub struct VerifyCodeBody {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct CodeVerified {
    pub email_verified: bool,
}

/// GET /claim/:token
pub async fn claim_inspect(State(state): State<AppState>, Path(token): Path<String>) -> ApiResult<ClaimPreview> {
    Ok(ApiResponse::success(state.engine.inspect_claim(&token).await?))
}

/// POST /claim/:token/verify-email - mails a one-time code to the claimant
pub async fn claim_send_code(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<VerificationSent> {
    Ok(ApiResponse::success(state.engine.send_verification_code(&token).await?))
}

/// POST /claim/:token/verify-code
pub async fn claim_verify_code(
    State(state): State<AppState>,
    ClientContext(context): ClientContext,
    Path(token): Path<String>,
    Json(body): Json<VerifyCodeBody>,
) -> ApiResult<CodeVerified> {
    let verified = state.engine.verify_claim_code(&token, body.code.trim(), &context).await?;
    Ok(ApiResponse::success(CodeVerified {
        email_verified: verified.email_verified,
    }))
}
