use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::store::{Page, ReserveOutcome, Store, StoreError, StoreResult};
use crate::engine::lifecycle;
use crate::models::{
    AssignmentEntry, Card, ClaimAttempt, ClaimStatus, ClaimToken, HitKind, Membership, Profile,
    ResourceClass, Tenant, TenantStatus,
};

#[derive(Default)]
struct Inner {
    tenants: HashMap<Uuid, Tenant>,
    memberships: HashMap<(Uuid, Uuid), Membership>,
    profiles: HashMap<Uuid, Profile>,
    cards: HashMap<Uuid, Card>,
    card_codes: HashMap<String, Uuid>,
    serial_numbers: HashMap<String, Uuid>,
    assignments: HashMap<Uuid, Vec<AssignmentEntry>>,
    claim_tokens: HashMap<Uuid, ClaimToken>,
    token_hashes: HashMap<String, Uuid>,
}

/// Process-local store. Every primitive runs under one write guard, which
/// gives it the same atomicity the Postgres store gets from single-statement
/// conditional updates. Suitable for tests and single-instance development.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    /// Remaining successful card inserts before an injected failure
    card_insert_budget: AtomicUsize,
    card_insert_fault: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection for tests: the `(n + 1)`-th card insert from now fails
    pub fn fail_card_inserts_after(&self, n: usize) {
        self.card_insert_budget.store(n, Ordering::SeqCst);
        self.card_insert_fault.store(true, Ordering::SeqCst);
    }

    pub async fn count_tenants(&self) -> usize {
        self.inner.read().await.tenants.len()
    }

    /// Number of stored cards for a tenant
    pub async fn count_cards(&self, tenant_id: Uuid) -> usize {
        let inner = self.inner.read().await;
        inner.cards.values().filter(|c| c.tenant_id == tenant_id).count()
    }

    fn take_insert_fault(&self) -> bool {
        if !self.card_insert_fault.load(Ordering::SeqCst) {
            return false;
        }
        let remaining = self.card_insert_budget.load(Ordering::SeqCst);
        if remaining == 0 {
            self.card_insert_fault.store(false, Ordering::SeqCst);
            return true;
        }
        self.card_insert_budget.store(remaining - 1, Ordering::SeqCst);
        false
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.tenants.contains_key(&tenant.id) {
            return Err(StoreError::Conflict("tenants_pkey".to_string()));
        }
        inner.tenants.insert(tenant.id, tenant.clone());
        Ok(())
    }

    async fn get_tenant(&self, id: Uuid) -> StoreResult<Option<Tenant>> {
        Ok(self.inner.read().await.tenants.get(&id).cloned())
    }

    async fn set_tenant_status(&self, id: Uuid, status: TenantStatus) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.tenants.get_mut(&id) {
            Some(tenant) => {
                tenant.status = status;
                tenant.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn try_reserve(
        &self,
        tenant_id: Uuid,
        resource: ResourceClass,
        amount: i64,
    ) -> StoreResult<Option<ReserveOutcome>> {
        let mut inner = self.inner.write().await;
        let Some(tenant) = inner.tenants.get_mut(&tenant_id) else {
            return Ok(None);
        };

        if !tenant.status.is_operational() {
            return Ok(Some(ReserveOutcome::Inactive(tenant.status)));
        }

        let limit = tenant.limits.get(resource);
        let current = tenant.usage.get(resource);
        if !lifecycle::fits_within_limit(limit, current, amount) {
            return Ok(Some(ReserveOutcome::Exceeded { limit, current }));
        }

        let usage = tenant.usage.get_mut(resource);
        *usage += amount;
        let usage = *usage;
        tenant.updated_at = Utc::now();
        Ok(Some(ReserveOutcome::Reserved { usage }))
    }

    async fn release(
        &self,
        tenant_id: Uuid,
        resource: ResourceClass,
        amount: i64,
    ) -> StoreResult<Option<i64>> {
        let mut inner = self.inner.write().await;
        let Some(tenant) = inner.tenants.get_mut(&tenant_id) else {
            return Ok(None);
        };
        let usage = tenant.usage.get_mut(resource);
        *usage = (*usage - amount).max(0);
        let usage = *usage;
        tenant.updated_at = Utc::now();
        Ok(Some(usage))
    }

    async fn get_membership(&self, tenant_id: Uuid, user_id: Uuid) -> StoreResult<Option<Membership>> {
        Ok(self.inner.read().await.memberships.get(&(tenant_id, user_id)).cloned())
    }

    async fn insert_membership(&self, membership: &Membership) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let key = (membership.tenant_id, membership.user_id);
        if inner.memberships.contains_key(&key) {
            return Err(StoreError::Conflict("memberships_pkey".to_string()));
        }
        inner.memberships.insert(key, membership.clone());
        Ok(())
    }

    async fn delete_membership(&self, tenant_id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner.memberships.remove(&(tenant_id, user_id)).is_some())
    }

    async fn get_profile(&self, id: Uuid) -> StoreResult<Option<Profile>> {
        Ok(self.inner.read().await.profiles.get(&id).cloned())
    }

    async fn insert_profile(&self, profile: &Profile) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.profiles.contains_key(&profile.id) {
            return Err(StoreError::Conflict("profiles_pkey".to_string()));
        }
        inner.profiles.insert(profile.id, profile.clone());
        Ok(())
    }

    async fn delete_profile(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner.profiles.remove(&id).is_some())
    }

    async fn card_code_exists(&self, code: &str) -> StoreResult<bool> {
        Ok(self.inner.read().await.card_codes.contains_key(code))
    }

    async fn insert_card(&self, card: &Card) -> StoreResult<()> {
        if self.take_insert_fault() {
            return Err(StoreError::Injected("card insert".to_string()));
        }

        let mut inner = self.inner.write().await;
        if inner.card_codes.contains_key(&card.card_code) {
            return Err(StoreError::Conflict("cards_card_code_key".to_string()));
        }
        if let Some(serial) = &card.serial_number {
            if inner.serial_numbers.contains_key(serial) {
                return Err(StoreError::Conflict("cards_serial_number_key".to_string()));
            }
            inner.serial_numbers.insert(serial.clone(), card.id);
        }
        inner.card_codes.insert(card.card_code.clone(), card.id);
        inner.cards.insert(card.id, card.clone());
        Ok(())
    }

    async fn get_card(&self, id: Uuid) -> StoreResult<Option<Card>> {
        Ok(self.inner.read().await.cards.get(&id).cloned())
    }

    async fn get_card_by_code(&self, code: &str) -> StoreResult<Option<Card>> {
        let inner = self.inner.read().await;
        Ok(inner
            .card_codes
            .get(code)
            .and_then(|id| inner.cards.get(id))
            .cloned())
    }

    async fn update_card(&self, card: &Card) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(stored) = inner.cards.get_mut(&card.id) else {
            return Err(StoreError::NotFound(format!("card {}", card.id)));
        };
        if stored.version != card.version {
            return Ok(false);
        }
        let mut next = card.clone();
        next.version += 1;
        *stored = next;
        Ok(true)
    }

    async fn record_hit(
        &self,
        card_id: Uuid,
        kind: HitKind,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Card>> {
        let mut inner = self.inner.write().await;
        let Some(card) = inner.cards.get_mut(&card_id) else {
            return Ok(None);
        };
        match kind {
            HitKind::Tap => {
                card.tap_count += 1;
                card.last_tapped_at = Some(at);
            }
            HitKind::View => card.view_count += 1,
        }
        Ok(Some(card.clone()))
    }

    async fn append_assignment(&self, mut entry: AssignmentEntry) -> StoreResult<AssignmentEntry> {
        let mut inner = self.inner.write().await;
        let log = inner.assignments.entry(entry.card_id).or_default();
        entry.seq = log.last().map(|e| e.seq + 1).unwrap_or(1);
        log.push(entry.clone());
        Ok(entry)
    }

    async fn list_assignments(&self, card_id: Uuid, page: Page) -> StoreResult<Vec<AssignmentEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .assignments
            .get(&card_id)
            .map(|log| {
                log.iter()
                    .skip(page.offset as usize)
                    .take(page.limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_claim_token(&self, token: &ClaimToken) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.token_hashes.contains_key(&token.token_hash) {
            return Err(StoreError::Conflict("claim_tokens_token_hash_key".to_string()));
        }
        inner.token_hashes.insert(token.token_hash.clone(), token.id);
        inner.claim_tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn get_claim_token(&self, id: Uuid) -> StoreResult<Option<ClaimToken>> {
        Ok(self.inner.read().await.claim_tokens.get(&id).cloned())
    }

    async fn get_claim_token_by_hash(&self, token_hash: &str) -> StoreResult<Option<ClaimToken>> {
        let inner = self.inner.read().await;
        Ok(inner
            .token_hashes
            .get(token_hash)
            .and_then(|id| inner.claim_tokens.get(id))
            .cloned())
    }

    async fn update_claim_token(&self, token: &ClaimToken) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(stored) = inner.claim_tokens.get_mut(&token.id) else {
            return Err(StoreError::NotFound(format!("claim token {}", token.id)));
        };
        if stored.version != token.version {
            return Ok(false);
        }
        let attempts = std::mem::take(&mut stored.claim_attempts);
        let mut next = token.clone();
        next.claim_attempts = attempts;
        next.version += 1;
        *stored = next;
        Ok(true)
    }

    async fn consume_claim_token(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<ClaimToken>> {
        let mut inner = self.inner.write().await;
        let Some(token) = inner.claim_tokens.get_mut(&id) else {
            return Ok(None);
        };
        if !lifecycle::token_is_valid(token, now) {
            return Ok(None);
        }
        token.used_count += 1;
        if token.used_count >= token.max_uses {
            token.status = ClaimStatus::Claimed;
        }
        token.updated_at = now;
        token.version += 1;
        Ok(Some(token.clone()))
    }

    async fn restore_claim_token(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(token) = inner.claim_tokens.get_mut(&id) else {
            return Ok(false);
        };
        if token.used_count == 0 {
            return Ok(false);
        }
        token.used_count -= 1;
        if token.status == ClaimStatus::Claimed {
            token.status = ClaimStatus::Pending;
        }
        token.updated_at = now;
        token.version += 1;
        Ok(true)
    }

    async fn record_claimant(&self, id: Uuid, claimed_by: Uuid, now: DateTime<Utc>) -> StoreResult<Option<ClaimToken>> {
        let mut inner = self.inner.write().await;
        let Some(token) = inner.claim_tokens.get_mut(&id) else {
            return Ok(None);
        };
        token.claimed_by = Some(claimed_by);
        token.claimed_at = Some(now);
        token.updated_at = now;
        token.version += 1;
        Ok(Some(token.clone()))
    }

    async fn append_claim_attempt(
        &self,
        id: Uuid,
        attempt: ClaimAttempt,
        capacity: usize,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let Some(token) = inner.claim_tokens.get_mut(&id) else {
            return Err(StoreError::NotFound(format!("claim token {}", id)));
        };
        token.claim_attempts.push(attempt);
        let overflow = token.claim_attempts.len().saturating_sub(capacity);
        if overflow > 0 {
            token.claim_attempts.drain(..overflow);
        }
        Ok(())
    }

    async fn expire_stale_claim_tokens(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        let mut expired = 0;
        for token in inner.claim_tokens.values_mut() {
            if token.status == ClaimStatus::Pending && token.expires_at <= now {
                token.status = ClaimStatus::Expired;
                token.updated_at = now;
                token.version += 1;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Claimant, ResourceCounters};

    fn tenant_with_cards(limit: i64) -> Tenant {
        let limits = ResourceCounters {
            cards: limit,
            ..ResourceCounters::unbounded()
        };
        Tenant::new("acme", limits, Utc::now())
    }

    fn multi_use_token(max_uses: i32) -> ClaimToken {
        let now = Utc::now();
        ClaimToken {
            id: Uuid::new_v4(),
            token_hash: "hash".into(),
            tenant_id: Uuid::new_v4(),
            card_id: None,
            assigned_to: Claimant { email: "team@acme.test".into(), name: None, phone: None },
            status: ClaimStatus::Pending,
            expires_at: now + chrono::Duration::hours(1),
            max_uses,
            used_count: 0,
            require_email_verification: false,
            email_verified: false,
            verification_code_hash: None,
            verification_code_expires: None,
            claimed_by: None,
            claimed_at: None,
            revoked_reason: None,
            revoked_at: None,
            created_by: Uuid::new_v4(),
            claim_attempts: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn restore_after_a_later_consumer_gives_the_use_back() {
        let store = MemoryStore::new();
        let token = multi_use_token(2);
        store.insert_claim_token(&token).await.unwrap();
        let now = Utc::now();

        // A consumes, B consumes the last use, then A's follow-up work fails
        let a = store.consume_claim_token(token.id, now).await.unwrap().unwrap();
        assert_eq!(a.status, ClaimStatus::Pending);
        assert!(a.claimed_by.is_none());
        let b = store.consume_claim_token(token.id, now).await.unwrap().unwrap();
        assert_eq!(b.status, ClaimStatus::Claimed);
        assert!(store.consume_claim_token(token.id, now).await.unwrap().is_none());

        assert!(store.restore_claim_token(token.id, now).await.unwrap());
        let b_user = Uuid::new_v4();
        store.record_claimant(token.id, b_user, now).await.unwrap();

        let stored = store.get_claim_token(token.id).await.unwrap().unwrap();
        assert_eq!(stored.used_count, 1);
        assert_eq!(stored.status, ClaimStatus::Pending);
        assert_eq!(stored.claimed_by, Some(b_user));

        // The returned use can be taken again, and never twice
        assert!(store.consume_claim_token(token.id, now).await.unwrap().is_some());
        assert!(store.consume_claim_token(token.id, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn restore_never_goes_below_zero() {
        let store = MemoryStore::new();
        let token = multi_use_token(1);
        store.insert_claim_token(&token).await.unwrap();
        assert!(!store.restore_claim_token(token.id, Utc::now()).await.unwrap());
        assert!(!store.restore_claim_token(Uuid::new_v4(), Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn reserve_stops_at_limit() {
        let store = MemoryStore::new();
        let tenant = tenant_with_cards(2);
        store.insert_tenant(&tenant).await.unwrap();

        let first = store.try_reserve(tenant.id, ResourceClass::Cards, 2).await.unwrap();
        assert_eq!(first, Some(ReserveOutcome::Reserved { usage: 2 }));

        let second = store.try_reserve(tenant.id, ResourceClass::Cards, 1).await.unwrap();
        assert_eq!(second, Some(ReserveOutcome::Exceeded { limit: 2, current: 2 }));
    }

    #[tokio::test]
    async fn release_saturates_at_zero() {
        let store = MemoryStore::new();
        let tenant = tenant_with_cards(5);
        store.insert_tenant(&tenant).await.unwrap();

        store.try_reserve(tenant.id, ResourceClass::Cards, 1).await.unwrap();
        assert_eq!(store.release(tenant.id, ResourceClass::Cards, 1).await.unwrap(), Some(0));
        assert_eq!(store.release(tenant.id, ResourceClass::Cards, 1).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn reserve_on_missing_tenant_is_none() {
        let store = MemoryStore::new();
        let outcome = store.try_reserve(Uuid::new_v4(), ResourceClass::Users, 1).await.unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn stale_card_version_is_rejected() {
        let store = MemoryStore::new();
        let tenant = tenant_with_cards(-1);
        let card = Card::new(tenant.id, "ABCD1234".into(), &Default::default(), 0, Utc::now());
        store.insert_card(&card).await.unwrap();

        let mut first = card.clone();
        first.status = crate::models::CardStatus::Active;
        assert!(store.update_card(&first).await.unwrap());

        // Same expected version again: someone else already committed
        assert!(!store.update_card(&first).await.unwrap());
        assert_eq!(store.get_card(card.id).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn duplicate_card_code_conflicts() {
        let store = MemoryStore::new();
        let tenant_id = Uuid::new_v4();
        let a = Card::new(tenant_id, "SAMECODE".into(), &Default::default(), 0, Utc::now());
        let b = Card::new(tenant_id, "SAMECODE".into(), &Default::default(), 1, Utc::now());
        store.insert_card(&a).await.unwrap();
        assert!(matches!(store.insert_card(&b).await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn injected_insert_failure_fires_once() {
        let store = MemoryStore::new();
        let tenant_id = Uuid::new_v4();
        store.fail_card_inserts_after(1);

        let a = Card::new(tenant_id, "AAAAAAAA".into(), &Default::default(), 0, Utc::now());
        let b = Card::new(tenant_id, "BBBBBBBB".into(), &Default::default(), 1, Utc::now());
        let c = Card::new(tenant_id, "CCCCCCCC".into(), &Default::default(), 2, Utc::now());
        assert!(store.insert_card(&a).await.is_ok());
        assert!(matches!(store.insert_card(&b).await, Err(StoreError::Injected(_))));
        assert!(store.insert_card(&c).await.is_ok());
    }
}
