use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use serde_json::{json, Value};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::config::AppConfig;
use crate::engine::Engine;
use crate::handlers::{protected, public};
use crate::middleware::jwt_auth_middleware;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub jwt_secret: Arc<str>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, jwt_secret: impl Into<Arc<str>>) -> Self {
        Self {
            engine,
            jwt_secret: jwt_secret.into(),
        }
    }
}

pub fn app(state: AppState, config: &AppConfig) -> Router {
    let protected = Router::new()
        .merge(card_routes())
        .merge(claim_routes())
        .merge(tenant_routes())
        .route_layer(middleware::from_fn_with_state(state.clone(), jwt_auth_middleware));

    let router = Router::new()
        // Public
        .route("/", get(root))
        .route("/health", get(health))
        .merge(public_routes())
        // Protected
        .merge(protected)
        .with_state(state)
        // Global middleware
        .layer(DefaultBodyLimit::max(config.api.max_request_size_bytes))
        .layer(cors_layer(&config.security.cors_origins));

    // Spans are emitted at DEBUG, so claim paths never reach info-level logs
    if config.api.enable_request_logging {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

fn public_routes() -> Router<AppState> {
    use public::{claim, tap};

    Router::new()
        // Card hits by card code
        .route("/cards/:id/tap", post(tap::card_tap))
        .route("/cards/:id/view", post(tap::card_view))
        // Claim links
        .route("/claim/:token", get(claim::claim_inspect))
        .route("/claim/:token/verify-email", post(claim::claim_send_code))
        .route("/claim/:token/verify-code", post(claim::claim_verify_code))
}

fn card_routes() -> Router<AppState> {
    use protected::cards;

    Router::new()
        .route("/cards", post(cards::card_create))
        .route("/cards/bulk", post(cards::card_bulk_create))
        .route("/cards/:id", get(cards::card_get))
        .route("/cards/:id/history", get(cards::card_history))
        .route("/cards/:id/assign", post(cards::card_assign))
        .route("/cards/:id/unassign", post(cards::card_unassign))
        .route("/cards/:id/reassign", post(cards::card_reassign))
        .route("/cards/:id/activate", post(cards::card_activate))
        .route("/cards/:id/deactivate", post(cards::card_deactivate))
        .route("/cards/:id/suspend", post(cards::card_suspend))
        .route("/cards/:id/unsuspend", post(cards::card_unsuspend))
}

fn claim_routes() -> Router<AppState> {
    use protected::claim;

    Router::new()
        .route("/claim/generate", post(claim::claim_generate))
        .route("/claim/:token/claim", post(claim::claim_redeem))
        .route("/claim/:token/revoke", post(claim::claim_revoke))
}

fn tenant_routes() -> Router<AppState> {
    use protected::tenant;

    Router::new()
        .route("/tenant/usage", get(tenant::tenant_usage))
        .route("/tenant/members", post(tenant::member_add))
        .route("/tenant/members/:user_id", delete(tenant::member_remove))
        .route("/tenant/profiles", post(tenant::profile_create))
        .route("/tenant/profiles/:id", delete(tenant::profile_delete))
        .route("/tenant/storage", post(tenant::storage_adjust))
}

async fn root() -> Json<Value> {
    let version = env!("CARGO_PKG_VERSION");

    Json(json!({
        "success": true,
        "data": {
            "name": "Tap-Card API",
            "version": version,
            "description": "Card lifecycle and claim-token provisioning for multi-tenant NFC cards",
            "endpoints": {
                "cards": "/cards[/:id[/history|/assign|/unassign|/reassign|/activate|/deactivate|/suspend|/unsuspend]] (protected)",
                "taps": "/cards/:code/tap, /cards/:code/view (public)",
                "claim_admin": "/claim/generate, /claim/:token/revoke (protected)",
                "claim_redeem": "/claim/:token/claim (protected)",
                "claim_public": "/claim/:token[/verify-email|/verify-code] (public)",
                "tenant": "/tenant/usage, /tenant/members, /tenant/profiles, /tenant/storage (protected)",
                "health": "/health (public)",
            }
        }
    }))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let now = chrono::Utc::now();

    match state.engine.health().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "data": {
                    "status": "ok",
                    "timestamp": now,
                    "store": "ok"
                }
            })),
        ),
        Err(e) => {
            tracing::error!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "success": false,
                    "error": "store unavailable",
                    "code": "SERVICE_UNAVAILABLE",
                    "data": {
                        "status": "degraded",
                        "timestamp": now
                    }
                })),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn router() -> Router {
        let engine = Arc::new(Engine::builder(Arc::new(MemoryStore::new())).build());
        app(AppState::new(engine, "unit-test-secret"), &AppConfig::development())
    }

    async fn status_of(method: &str, uri: &str) -> StatusCode {
        let request = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
        router().oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn public_and_protected_tiers() {
        assert_eq!(status_of("GET", "/health").await, StatusCode::OK);
        assert_eq!(status_of("GET", "/claim/unknown-token").await, StatusCode::GONE);
        assert_eq!(status_of("POST", "/cards/ABCD2345/tap").await, StatusCode::NOT_FOUND);

        assert_eq!(status_of("POST", "/claim/generate").await, StatusCode::UNAUTHORIZED);
        assert_eq!(status_of("GET", "/tenant/usage").await, StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_of("GET", &format!("/cards/{}", uuid::Uuid::new_v4())).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn explicit_origins_build_a_restricted_layer() {
        let _ = cors_layer(&["https://admin.example".to_string(), "bad\norigin".to_string()]);
        let _ = cors_layer(&[]);
    }
}
