use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    AssignmentEntry, Card, ClaimAttempt, ClaimToken, HitKind, Membership, Profile, ResourceClass,
    Tenant, TenantStatus,
};

/// Errors raised by a storage backend
#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique constraint rejected the write; carries the constraint name
    #[error("Unique constraint violated: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    #[error(transparent)]
    Sqlx(sqlx::Error),

    #[error("Injected failure: {0}")]
    Injected(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        // 23505 = unique_violation
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some("23505") {
                return StoreError::Conflict(
                    db_err.constraint().unwrap_or("unique").to_string(),
                );
            }
        }
        StoreError::Sqlx(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of the atomic conditional increment on a tenant counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved { usage: i64 },
    Exceeded { limit: i64, current: i64 },
    Inactive(TenantStatus),
}

/// Offset pagination for append-only logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

impl Page {
    pub const MAX_LIMIT: i64 = 200;

    pub fn new(offset: Option<i64>, limit: Option<i64>) -> Self {
        Self {
            offset: offset.unwrap_or(0).max(0),
            limit: limit.unwrap_or(50).clamp(1, Self::MAX_LIMIT),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Durable storage for every piece of shared mutable state the engine owns.
///
/// Every cross-request invariant is enforced here, not by the caller:
/// - `try_reserve` is a single conditional increment ("usage += n iff it fits")
/// - `release` saturates at zero
/// - `insert_card` rejects duplicate card codes and serial numbers
/// - `update_card` / `update_claim_token` are compare-and-swap on `version`
/// - `consume_claim_token` re-checks validity and increments `used_count` in one step
#[async_trait]
pub trait Store: Send + Sync {
    // Tenants and quota counters

    async fn insert_tenant(&self, tenant: &Tenant) -> StoreResult<()>;

    async fn get_tenant(&self, id: Uuid) -> StoreResult<Option<Tenant>>;

    async fn set_tenant_status(&self, id: Uuid, status: TenantStatus) -> StoreResult<bool>;

    /// `None` when the tenant does not exist
    async fn try_reserve(
        &self,
        tenant_id: Uuid,
        resource: ResourceClass,
        amount: i64,
    ) -> StoreResult<Option<ReserveOutcome>>;

    /// Returns the usage after release, `None` when the tenant does not exist
    async fn release(
        &self,
        tenant_id: Uuid,
        resource: ResourceClass,
        amount: i64,
    ) -> StoreResult<Option<i64>>;

    // Memberships and profiles

    async fn get_membership(&self, tenant_id: Uuid, user_id: Uuid) -> StoreResult<Option<Membership>>;

    async fn insert_membership(&self, membership: &Membership) -> StoreResult<()>;

    async fn delete_membership(&self, tenant_id: Uuid, user_id: Uuid) -> StoreResult<bool>;

    async fn get_profile(&self, id: Uuid) -> StoreResult<Option<Profile>>;

    async fn insert_profile(&self, profile: &Profile) -> StoreResult<()>;

    async fn delete_profile(&self, id: Uuid) -> StoreResult<bool>;

    // Cards

    async fn card_code_exists(&self, code: &str) -> StoreResult<bool>;

    async fn insert_card(&self, card: &Card) -> StoreResult<()>;

    async fn get_card(&self, id: Uuid) -> StoreResult<Option<Card>>;

    async fn get_card_by_code(&self, code: &str) -> StoreResult<Option<Card>>;

    /// Commits `card` iff the stored version equals `card.version`; the stored
    /// copy gets `version + 1`. Returns false on a lost race.
    async fn update_card(&self, card: &Card) -> StoreResult<bool>;

    /// Atomically bumps the tap or view counter, returning the updated card
    async fn record_hit(
        &self,
        card_id: Uuid,
        kind: HitKind,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Card>>;

    /// Appends to the card's assignment log; the store assigns `seq`
    async fn append_assignment(&self, entry: AssignmentEntry) -> StoreResult<AssignmentEntry>;

    /// Oldest first
    async fn list_assignments(&self, card_id: Uuid, page: Page) -> StoreResult<Vec<AssignmentEntry>>;

    // Claim tokens

    async fn insert_claim_token(&self, token: &ClaimToken) -> StoreResult<()>;

    async fn get_claim_token(&self, id: Uuid) -> StoreResult<Option<ClaimToken>>;

    async fn get_claim_token_by_hash(&self, token_hash: &str) -> StoreResult<Option<ClaimToken>>;

    /// Compare-and-swap on `version`; the attempt log is not written here
    async fn update_claim_token(&self, token: &ClaimToken) -> StoreResult<bool>;

    /// Consumes one use iff status is pending, `now < expires_at` and
    /// `used_count < max_uses`, all evaluated at write time. The token flips
    /// to claimed when the last use is taken. The claimant is not written.
    async fn consume_claim_token(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<ClaimToken>>;

    /// Gives back one use whose follow-up work failed. Only `used_count` and
    /// the claimed flip are undone, so other consumers are unaffected.
    async fn restore_claim_token(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Records who redeemed the token once the redemption has fully succeeded
    async fn record_claimant(&self, id: Uuid, claimed_by: Uuid, now: DateTime<Utc>) -> StoreResult<Option<ClaimToken>>;

    /// Appends to the attempt ring buffer, keeping the newest `capacity` entries
    async fn append_claim_attempt(
        &self,
        id: Uuid,
        attempt: ClaimAttempt,
        capacity: usize,
    ) -> StoreResult<()>;

    /// Flips pending tokens past their expiry to expired; returns the count
    async fn expire_stale_claim_tokens(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    async fn health_check(&self) -> StoreResult<()>;
}
