use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Pending,
    Claimed,
    Expired,
    Revoked,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Pending => "pending",
            ClaimStatus::Claimed => "claimed",
            ClaimStatus::Expired => "expired",
            ClaimStatus::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ClaimStatus::Pending),
            "claimed" => Some(ClaimStatus::Claimed),
            "expired" => Some(ClaimStatus::Expired),
            "revoked" => Some(ClaimStatus::Revoked),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The intended claimant, known before they have an account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claimant {
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,
}

/// One redemption or verification attempt, kept for abuse forensics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaimAttempt {
    pub timestamp: DateTime<Utc>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub email: Option<String>,
    pub success: bool,
    pub failure_reason: Option<String>,
}

/// Persisted claim token. The plaintext token never appears here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimToken {
    pub id: Uuid,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub tenant_id: Uuid,
    pub card_id: Option<Uuid>,
    pub assigned_to: Claimant,
    pub status: ClaimStatus,
    pub expires_at: DateTime<Utc>,
    pub max_uses: i32,
    pub used_count: i32,
    pub require_email_verification: bool,
    pub email_verified: bool,
    #[serde(skip_serializing)]
    pub verification_code_hash: Option<String>,
    pub verification_code_expires: Option<DateTime<Utc>>,
    pub claimed_by: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_by: Uuid,
    /// Newest last; capped by the store
    #[serde(default)]
    pub claim_attempts: Vec<ClaimAttempt>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
