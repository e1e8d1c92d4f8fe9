use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::clock::Clock;
use super::email::{EmailMessage, EmailTemplate, Mailer};
use super::error::{EngineError, EngineResult};
use super::lifecycle::{self, CardOp};
use super::quota::QuotaLedger;
use super::registry::CardRegistry;
use super::secrets;
use crate::config::ClaimConfig;
use crate::database::store::{Store, StoreError};
use crate::models::{
    Card, ClaimAttempt, ClaimStatus, ClaimToken, Claimant, Membership, RequestContext, ResourceClass, Role,
};

const MAX_CAS_RETRIES: usize = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateClaim {
    pub card_id: Option<Uuid>,
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub expires_in_hours: Option<i64>,
    pub max_uses: Option<i32>,
    #[serde(default)]
    pub require_email_verification: bool,
    #[serde(default)]
    pub send_email: bool,
}

/// The freshly issued token. `claim_url` carries the only copy of the
/// plaintext and is handed back exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedClaim {
    pub token: ClaimToken,
    pub claim_url: String,
    pub card: Option<Card>,
}

/// What an anonymous holder of a claim link may learn about it
#[derive(Debug, Clone, Serialize)]
pub struct ClaimPreview {
    pub status: ClaimStatus,
    pub expires_at: DateTime<Utc>,
    pub email_hint: String,
    pub require_email_verification: bool,
    pub email_verified: bool,
    pub card_code: Option<String>,
    pub sku: Option<String>,
    pub product_line: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationSent {
    pub email_hint: String,
    pub expires_at: DateTime<Utc>,
}

/// The authenticated user redeeming a token
#[derive(Debug, Clone)]
pub struct Redeemer {
    pub user_id: Uuid,
    pub email: String,
    /// Tenant the user already belongs to, if any
    pub tenant_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Redemption {
    pub token: ClaimToken,
    pub card: Option<Card>,
    pub joined_tenant: bool,
}

/// Issues, verifies and redeems single-use claim tokens
#[derive(Clone)]
pub struct ClaimTokenService {
    store: Arc<dyn Store>,
    quota: QuotaLedger,
    registry: CardRegistry,
    mailer: Arc<dyn Mailer>,
    clock: Arc<dyn Clock>,
    settings: ClaimConfig,
}

impl ClaimTokenService {
    pub fn new(
        store: Arc<dyn Store>,
        quota: QuotaLedger,
        registry: CardRegistry,
        mailer: Arc<dyn Mailer>,
        clock: Arc<dyn Clock>,
        settings: ClaimConfig,
    ) -> Self {
        Self {
            store,
            quota,
            registry,
            mailer,
            clock,
            settings,
        }
    }

    pub async fn generate(&self, tenant_id: Uuid, actor_id: Uuid, request: GenerateClaim) -> EngineResult<IssuedClaim> {
        let email = request.email.trim().to_string();
        if !looks_like_email(&email) {
            return Err(EngineError::validation("email is not a valid address"));
        }

        let ttl_hours = request.expires_in_hours.unwrap_or(self.settings.token_ttl_hours);
        if ttl_hours < 1 || ttl_hours > self.settings.max_ttl_hours {
            return Err(EngineError::validation(format!(
                "expires_in_hours must be between 1 and {}",
                self.settings.max_ttl_hours
            )));
        }

        let max_uses = request.max_uses.unwrap_or(1);
        if max_uses < 1 || (request.card_id.is_some() && max_uses != 1) {
            return Err(EngineError::validation("a card claim is single-use; max_uses must be 1"));
        }

        let now = self.clock.now();

        // Snapshot the card and whatever token it points at
        let prior_token_id = match request.card_id {
            Some(card_id) => {
                let card = self.registry.get(tenant_id, card_id).await?;
                lifecycle::plan_transition(&card, CardOp::GenerateClaim)?;

                let outstanding = match card.claim_token_id {
                    Some(id) => self.load_fresh(id).await?,
                    None => None,
                };
                if !lifecycle::is_claimable(&card, outstanding.as_ref(), now) {
                    return Err(EngineError::InvalidTransition {
                        current: card.status.as_str().to_string(),
                        requested: CardOp::GenerateClaim.as_str().to_string(),
                    });
                }
                card.claim_token_id
            }
            None => None,
        };

        let plaintext = secrets::generate_claim_token();
        let token = ClaimToken {
            id: Uuid::new_v4(),
            token_hash: secrets::hash_claim_token(&plaintext),
            tenant_id,
            card_id: request.card_id,
            assigned_to: Claimant {
                email: email.clone(),
                name: request.name.clone(),
                phone: request.phone.clone(),
            },
            status: ClaimStatus::Pending,
            expires_at: now + Duration::hours(ttl_hours),
            max_uses,
            used_count: 0,
            require_email_verification: request.require_email_verification,
            email_verified: false,
            verification_code_hash: None,
            verification_code_expires: None,
            claimed_by: None,
            claimed_at: None,
            revoked_reason: None,
            revoked_at: None,
            created_by: actor_id,
            claim_attempts: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_claim_token(&token).await?;

        // The card commit is the serialization point: only one generator wins
        let card = match request.card_id {
            Some(card_id) => {
                let bound = self
                    .registry
                    .commit(tenant_id, card_id, CardOp::GenerateClaim, |card| {
                        if card.claim_token_id != prior_token_id {
                            return Err(EngineError::Conflict(
                                "card was issued another claim token concurrently".to_string(),
                            ));
                        }
                        card.claim_token_id = Some(token.id);
                        Ok(true)
                    })
                    .await;

                match bound {
                    Ok(committed) => Some(committed.after),
                    Err(e) => {
                        self.retire(token.id, "superseded").await;
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let claim_url = format!("{}/claim/{}", self.settings.base_url.trim_end_matches('/'), plaintext);
        tracing::info!(
            "Issued claim token {} for tenant {} (card {:?}, expires {})",
            token.id, tenant_id, token.card_id, token.expires_at
        );

        if request.send_email {
            let message = EmailMessage {
                recipient: email,
                template: EmailTemplate::ClaimInvitation,
                template_data: json!({
                    "name": request.name,
                    "claim_url": claim_url,
                    "expires_at": token.expires_at,
                    "card_code": card.as_ref().map(|c| c.card_code.clone()),
                }),
            };
            if let Err(e) = self.mailer.send(&message).await {
                tracing::warn!("Claim invitation for token {} not delivered: {}", token.id, e);
            }
        }

        Ok(IssuedClaim { token, claim_url, card })
    }

    pub async fn inspect(&self, plaintext: &str) -> EngineResult<ClaimPreview> {
        let token = self.valid_token(plaintext).await?;
        let card = match token.card_id {
            Some(card_id) => self.store.get_card(card_id).await?,
            None => None,
        };

        Ok(ClaimPreview {
            status: token.status,
            expires_at: token.expires_at,
            email_hint: mask_email(&token.assigned_to.email),
            require_email_verification: token.require_email_verification,
            email_verified: token.email_verified,
            card_code: card.as_ref().map(|c| c.card_code.clone()),
            sku: card.as_ref().and_then(|c| c.sku.clone()),
            product_line: card.and_then(|c| c.product_line),
        })
    }

    /// Issues a fresh six-digit code to the claimant's address. The code is
    /// never returned; only the mailer sees it.
    pub async fn send_verification_code(&self, plaintext: &str) -> EngineResult<VerificationSent> {
        let token = self.valid_token(plaintext).await?;
        self.ensure_not_throttled(&token)?;
        if !token.require_email_verification {
            return Err(EngineError::validation("this claim does not require email verification"));
        }

        let code = secrets::generate_verification_code();
        let code_hash = secrets::hash_verification_code(token.id, &code);
        let expires_at = self.clock.now() + Duration::minutes(self.settings.verification_code_ttl_minutes);

        let token = self
            .update_token(token.id, |t| {
                t.verification_code_hash = Some(code_hash.clone());
                t.verification_code_expires = Some(expires_at);
                Ok(())
            })
            .await?;

        let message = EmailMessage {
            recipient: token.assigned_to.email.clone(),
            template: EmailTemplate::VerificationCode,
            template_data: json!({
                "code": code,
                "expires_at": expires_at,
                "name": token.assigned_to.name,
            }),
        };
        if let Err(e) = self.mailer.send(&message).await {
            tracing::warn!("Verification code for token {} not delivered: {}", token.id, e);
        }

        Ok(VerificationSent {
            email_hint: mask_email(&token.assigned_to.email),
            expires_at,
        })
    }

    /// Checks a verification code. Success marks the email verified without
    /// consuming the token. Every call is recorded in the attempt log.
    pub async fn verify_code(&self, plaintext: &str, code: &str, context: &RequestContext) -> EngineResult<ClaimToken> {
        let token = self.lookup(plaintext).await?;
        let result = self.verify_code_inner(&token, code).await;
        self.record_attempt(&token, context, None, &result).await;
        result
    }

    async fn verify_code_inner(&self, token: &ClaimToken, code: &str) -> EngineResult<ClaimToken> {
        self.ensure_not_throttled(token)?;
        let now = self.clock.now();
        if lifecycle::token_is_stale(token, now) {
            self.expire(token.id).await;
            return Err(EngineError::TokenInvalid);
        }
        if !lifecycle::token_is_valid(token, now) {
            return Err(EngineError::TokenInvalid);
        }
        if !token.require_email_verification {
            return Err(EngineError::validation("this claim does not require email verification"));
        }

        let (Some(stored), Some(expires)) = (&token.verification_code_hash, token.verification_code_expires) else {
            return Err(EngineError::VerificationFailed);
        };
        if now >= expires || !secrets::digests_match(stored, &secrets::hash_verification_code(token.id, code)) {
            return Err(EngineError::VerificationFailed);
        }

        let verified = self
            .update_token(token.id, |t| {
                t.email_verified = true;
                t.verification_code_hash = None;
                t.verification_code_expires = None;
                Ok(())
            })
            .await?;
        tracing::info!("Claim token {} email verified", token.id);
        Ok(verified)
    }

    /// Redeems a token for `redeemer`. The attempt is recorded whatever the
    /// outcome, before returning.
    pub async fn redeem(
        &self,
        plaintext: &str,
        redeemer: &Redeemer,
        profile_id: Option<Uuid>,
        context: &RequestContext,
    ) -> EngineResult<Redemption> {
        let token = self.lookup(plaintext).await?;
        let result = self.redeem_inner(&token, redeemer, profile_id).await;
        self.record_attempt(&token, context, Some(&redeemer.email), &result).await;

        if let Err(e) = &result {
            tracing::warn!("Claim token {} redemption refused: {}", token.id, e.reason_tag());
        }
        result
    }

    async fn redeem_inner(
        &self,
        token: &ClaimToken,
        redeemer: &Redeemer,
        profile_id: Option<Uuid>,
    ) -> EngineResult<Redemption> {
        self.ensure_not_throttled(token)?;

        let now = self.clock.now();
        if lifecycle::token_is_stale(token, now) {
            self.expire(token.id).await;
            return Err(EngineError::TokenInvalid);
        }
        if !lifecycle::token_is_valid(token, now) {
            return Err(EngineError::TokenInvalid);
        }
        if redeemer.tenant_id.is_some_and(|t| t != token.tenant_id) {
            return Err(EngineError::TokenInvalid);
        }
        if token.require_email_verification && !token.email_verified {
            return Err(EngineError::VerificationFailed);
        }
        if !token.assigned_to.email.trim().eq_ignore_ascii_case(redeemer.email.trim()) {
            return Err(EngineError::TokenInvalid);
        }

        if let Some(card_id) = token.card_id {
            let card = self.registry.get(token.tenant_id, card_id).await?;
            if card.claim_token_id != Some(token.id) {
                return Err(EngineError::TokenInvalid);
            }
            lifecycle::plan_transition(&card, CardOp::RedeemClaim)?;
        }

        if let Some(profile_id) = profile_id {
            let profile = self
                .store
                .get_profile(profile_id)
                .await?
                .filter(|p| p.tenant_id == token.tenant_id && p.user_id == redeemer.user_id);
            if profile.is_none() {
                return Err(EngineError::not_found("Profile"));
            }
        }

        // Single-use gate; everything after this point must compensate
        let consumed = self
            .store
            .consume_claim_token(token.id, now)
            .await?
            .ok_or(EngineError::TokenInvalid)?;

        let joined_tenant = match self.join_tenant(token.tenant_id, redeemer).await {
            Ok(joined) => joined,
            Err(e) => {
                self.restore(token.id).await;
                return Err(e);
            }
        };

        let card = match token.card_id {
            Some(card_id) => match self.bind_card(token, card_id, redeemer.user_id, profile_id).await {
                Ok(card) => Some(card),
                Err(e) => {
                    self.restore(token.id).await;
                    if joined_tenant {
                        self.leave_tenant(token.tenant_id, redeemer.user_id).await;
                    }
                    return Err(e);
                }
            },
            None => None,
        };

        let claimed = match self.store.record_claimant(token.id, redeemer.user_id, self.clock.now()).await {
            Ok(Some(recorded)) => recorded,
            Ok(None) => consumed,
            Err(e) => {
                tracing::error!("Failed to record claimant of token {}: {}", token.id, e);
                ClaimToken {
                    claimed_by: Some(redeemer.user_id),
                    claimed_at: Some(now),
                    ..consumed
                }
            }
        };

        tracing::info!(
            "Claim token {} redeemed by user {} (card {:?})",
            token.id, redeemer.user_id, token.card_id
        );
        Ok(Redemption {
            token: claimed,
            card,
            joined_tenant,
        })
    }

    /// Returns true when a new membership was created
    async fn join_tenant(&self, tenant_id: Uuid, redeemer: &Redeemer) -> EngineResult<bool> {
        if self.store.get_membership(tenant_id, redeemer.user_id).await?.is_some() {
            return Ok(false);
        }

        self.quota.reserve(tenant_id, ResourceClass::Users, 1).await?;
        let membership = Membership {
            tenant_id,
            user_id: redeemer.user_id,
            email: redeemer.email.trim().to_string(),
            role: Role::Member,
            joined_at: self.clock.now(),
        };
        match self.store.insert_membership(&membership).await {
            Ok(()) => Ok(true),
            Err(StoreError::Conflict(_)) => {
                self.quota.release_quietly(tenant_id, ResourceClass::Users, 1).await;
                Ok(false)
            }
            Err(e) => {
                self.quota.release_quietly(tenant_id, ResourceClass::Users, 1).await;
                Err(e.into())
            }
        }
    }

    async fn leave_tenant(&self, tenant_id: Uuid, user_id: Uuid) {
        match self.store.delete_membership(tenant_id, user_id).await {
            Ok(true) => self.quota.release_quietly(tenant_id, ResourceClass::Users, 1).await,
            Ok(false) => {}
            Err(e) => tracing::error!("Failed to roll back membership of {} in {}: {}", user_id, tenant_id, e),
        }
    }

    async fn bind_card(
        &self,
        token: &ClaimToken,
        card_id: Uuid,
        user_id: Uuid,
        profile_id: Option<Uuid>,
    ) -> EngineResult<Card> {
        let committed = self
            .registry
            .commit(token.tenant_id, card_id, CardOp::RedeemClaim, |card| {
                if card.claim_token_id != Some(token.id) {
                    return Err(EngineError::TokenInvalid);
                }
                card.assigned_to = Some(user_id);
                card.assigned_profile = profile_id;
                Ok(true)
            })
            .await?;

        if let Err(e) = self.registry.append_history(&committed.after, user_id, "claimed").await {
            tracing::error!("Failed to append claim history for card {}: {}", card_id, e);
        }
        Ok(committed.after)
    }

    async fn restore(&self, token_id: Uuid) {
        match self.store.restore_claim_token(token_id, self.clock.now()).await {
            Ok(true) => tracing::warn!("Rolled back consumption of claim token {}", token_id),
            Ok(false) => tracing::error!("Claim token {} could not be restored", token_id),
            Err(e) => tracing::error!("Failed to restore claim token {}: {}", token_id, e),
        }
    }

    /// Revokes a pending token. `token_ref` is the plaintext token or the
    /// token id. A provisioned card goes back to inventory.
    pub async fn revoke(&self, tenant_id: Uuid, token_ref: &str, reason: &str) -> EngineResult<ClaimToken> {
        let token = match Uuid::parse_str(token_ref) {
            Ok(id) => self.store.get_claim_token(id).await?,
            Err(_) => self.store.get_claim_token_by_hash(&secrets::hash_claim_token(token_ref)).await?,
        };
        let token = token.ok_or(EngineError::not_found("Claim token"))?;
        if token.tenant_id != tenant_id {
            return Err(EngineError::CrossTenantAccess { entity: "Claim token" });
        }
        if lifecycle::token_is_stale(&token, self.clock.now()) {
            self.expire(token.id).await;
        }

        let now = self.clock.now();
        let reason = reason.trim().to_string();
        let revoked = self
            .update_token(token.id, |t| {
                if t.status != ClaimStatus::Pending || now >= t.expires_at {
                    return Err(EngineError::InvalidTransition {
                        current: t.status.as_str().to_string(),
                        requested: "revoke".to_string(),
                    });
                }
                t.status = ClaimStatus::Revoked;
                t.revoked_reason = Some(reason.clone());
                t.revoked_at = Some(now);
                Ok(())
            })
            .await?;

        if let Some(card_id) = revoked.card_id {
            self.registry.detach_claim_token(tenant_id, card_id, revoked.id).await?;
        }

        tracing::info!("Revoked claim token {} for tenant {}", revoked.id, tenant_id);
        Ok(revoked)
    }

    /// Revokes a token whose card moved on without it; failures are logged
    pub async fn retire(&self, token_id: Uuid, reason: &str) {
        let now = self.clock.now();
        let result = self
            .update_token(token_id, |t| {
                if t.status == ClaimStatus::Pending {
                    t.status = ClaimStatus::Revoked;
                    t.revoked_reason = Some(reason.to_string());
                    t.revoked_at = Some(now);
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::error!("Failed to retire claim token {}: {}", token_id, e);
        }
    }

    /// Bulk form of the lazy expiry every read already applies
    pub async fn sweep(&self) -> EngineResult<u64> {
        let expired = self.store.expire_stale_claim_tokens(self.clock.now()).await?;
        if expired > 0 {
            tracing::info!("Expired {} stale claim tokens", expired);
        }
        Ok(expired)
    }

    async fn lookup(&self, plaintext: &str) -> EngineResult<ClaimToken> {
        self.store
            .get_claim_token_by_hash(&secrets::hash_claim_token(plaintext.trim()))
            .await?
            .ok_or(EngineError::TokenInvalid)
    }

    /// Lookup that also refuses anything not redeemable right now
    async fn valid_token(&self, plaintext: &str) -> EngineResult<ClaimToken> {
        let token = self.lookup(plaintext).await?;
        let now = self.clock.now();
        if lifecycle::token_is_stale(&token, now) {
            self.expire(token.id).await;
            return Err(EngineError::TokenInvalid);
        }
        if !lifecycle::token_is_valid(&token, now) {
            return Err(EngineError::TokenInvalid);
        }
        Ok(token)
    }

    /// Loads a token, flipping it to expired if it is pending past its expiry
    async fn load_fresh(&self, id: Uuid) -> EngineResult<Option<ClaimToken>> {
        let Some(token) = self.store.get_claim_token(id).await? else {
            return Ok(None);
        };
        if lifecycle::token_is_stale(&token, self.clock.now()) {
            self.expire(id).await;
            return Ok(self.store.get_claim_token(id).await?);
        }
        Ok(Some(token))
    }

    async fn expire(&self, token_id: Uuid) {
        let now = self.clock.now();
        let result = self
            .update_token(token_id, |t| {
                if lifecycle::token_is_stale(t, now) {
                    t.status = ClaimStatus::Expired;
                }
                Ok(())
            })
            .await;
        match result {
            Ok(_) => tracing::debug!("Claim token {} expired on access", token_id),
            Err(e) => tracing::warn!("Failed to expire claim token {}: {}", token_id, e),
        }
    }

    fn ensure_not_throttled(&self, token: &ClaimToken) -> EngineResult<()> {
        let since = self.clock.now() - Duration::minutes(self.settings.attempt_window_minutes);
        let recent_failures = token
            .claim_attempts
            .iter()
            .filter(|a| !a.success && a.timestamp > since)
            .count();
        if recent_failures >= self.settings.max_failed_attempts {
            return Err(EngineError::TooManyAttempts);
        }
        Ok(())
    }

    async fn record_attempt<T>(
        &self,
        token: &ClaimToken,
        context: &RequestContext,
        email: Option<&str>,
        result: &EngineResult<T>,
    ) {
        let attempt = ClaimAttempt {
            timestamp: self.clock.now(),
            ip: context.ip.clone(),
            user_agent: context.user_agent.clone(),
            email: email.map(str::to_string),
            success: result.is_ok(),
            failure_reason: result.as_ref().err().map(|e| e.reason_tag().to_string()),
        };
        if let Err(e) = self
            .store
            .append_claim_attempt(token.id, attempt, self.settings.attempt_log_capacity)
            .await
        {
            tracing::error!("Failed to record claim attempt for token {}: {}", token.id, e);
        }
    }

    /// Read-modify-write with compare-and-swap on `version`
    async fn update_token<F>(&self, id: Uuid, mut apply: F) -> EngineResult<ClaimToken>
    where
        F: FnMut(&mut ClaimToken) -> EngineResult<()> + Send,
    {
        for _ in 0..MAX_CAS_RETRIES {
            let mut token = self
                .store
                .get_claim_token(id)
                .await?
                .ok_or(EngineError::not_found("Claim token"))?;
            apply(&mut token)?;
            token.updated_at = self.clock.now();
            if self.store.update_claim_token(&token).await? {
                token.version += 1;
                return Ok(token);
            }
        }
        Err(EngineError::Conflict("claim token was modified concurrently".to_string()))
    }
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    }
}

/// `jane@example.com` -> `j***@example.com`
fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let first: String = local.chars().take(1).collect();
            format!("{}***@{}", first, domain)
        }
        None => "***".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_local_part() {
        assert_eq!(mask_email("jane@example.com"), "j***@example.com");
        assert_eq!(mask_email("nonsense"), "***");
    }

    #[test]
    fn email_shape_check() {
        assert!(looks_like_email("a@b.co"));
        assert!(!looks_like_email("@b.co"));
        assert!(!looks_like_email("a@localhost"));
        assert!(!looks_like_email("plain"));
    }
}
