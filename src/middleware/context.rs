use std::convert::Infallible;

use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts, http::HeaderMap};

use crate::models::RequestContext;

/// Client address and user agent, recorded with claim attempts and audit events
#[derive(Debug, Clone, Default)]
pub struct ClientContext(pub RequestContext);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientContext {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientContext(context_from_headers(&parts.headers)))
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn context_from_headers(headers: &HeaderMap) -> RequestContext {
    // First hop of x-forwarded-for is the original client
    let ip = header(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
        .or_else(|| header(headers, "x-real-ip"));

    RequestContext {
        ip,
        user_agent: header(headers, "user-agent"),
    }
}
