use thiserror::Error;

use crate::database::store::StoreError;
use crate::engine::lifecycle::TransitionDenied;
use crate::models::{ResourceClass, TenantStatus};

/// Domain errors raised by the provisioning engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Cannot {requested} a card in state {current}")]
    InvalidTransition { current: String, requested: String },

    #[error("Quota exceeded for {resource}: limit {limit}, current {current}")]
    QuotaExceeded {
        resource: ResourceClass,
        limit: i64,
        current: i64,
    },

    /// Deliberately carries no reason so callers cannot probe why
    #[error("Claim link is invalid or has expired")]
    TokenInvalid,

    #[error("Verification failed")]
    VerificationFailed,

    #[error("Too many failed attempts, try again later")]
    TooManyAttempts,

    #[error("Could not generate a unique card identifier after {attempts} attempts")]
    GenerationExhausted { attempts: u32 },

    #[error("{entity} belongs to another tenant")]
    CrossTenantAccess { entity: &'static str },

    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Tenant is {0:?}")]
    TenantInactive(TenantStatus),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<TransitionDenied> for EngineError {
    fn from(denied: TransitionDenied) -> Self {
        EngineError::InvalidTransition {
            current: denied.current.as_str().to_string(),
            requested: denied.requested.as_str().to_string(),
        }
    }
}

impl EngineError {
    pub fn not_found(entity: &'static str) -> Self {
        EngineError::NotFound { entity }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation(message.into())
    }

    /// Short tag recorded in claim attempt logs and audit events
    pub fn reason_tag(&self) -> &'static str {
        match self {
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::QuotaExceeded { .. } => "quota_exceeded",
            EngineError::TokenInvalid => "token_invalid",
            EngineError::VerificationFailed => "verification_failed",
            EngineError::TooManyAttempts => "too_many_attempts",
            EngineError::GenerationExhausted { .. } => "generation_exhausted",
            EngineError::CrossTenantAccess { .. } => "cross_tenant",
            EngineError::NotFound { .. } => "not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::Conflict(_) => "conflict",
            EngineError::TenantInactive(_) => "tenant_inactive",
            EngineError::Validation(_) => "validation",
            EngineError::Store(_) => "internal",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
