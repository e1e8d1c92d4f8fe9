use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::audit::AuditDispatcher;
use super::claim::{
    ClaimPreview, ClaimTokenService, GenerateClaim, IssuedClaim, Redeemer, Redemption, VerificationSent,
};
use super::clock::{Clock, SystemClock};
use super::email::{LogMailer, Mailer};
use super::error::{EngineError, EngineResult};
use super::identifier::{CodeGenerator, RandomCodeGenerator};
use super::lifecycle::{self, CardOp};
use super::quota::QuotaLedger;
use super::registry::{BulkMint, CardRegistry, Committed, NewCard};
use crate::config::{CardConfig, ClaimConfig};
use crate::database::store::{Page, Store, StoreError};
use crate::models::{
    AssignmentEntry, AuditEvent, Card, CardStatus, ClaimToken, HitKind, Membership, Profile, RequestContext,
    ResourceClass, ResourceCounters, Role, Severity, Tenant, TenantStatus, UsageReport,
};

/// The authenticated caller, as established by the HTTP layer
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: Uuid,
    pub email: String,
    pub tenant_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignCard {
    pub user_id: Uuid,
    pub profile_id: Option<Uuid>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddMember {
    pub user_id: Uuid,
    pub email: String,
    #[serde(default = "default_role")]
    pub role: Role,
}

fn default_role() -> Role {
    Role::Member
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProfile {
    /// Defaults to the caller
    pub user_id: Option<Uuid>,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkMintSummary {
    pub count: usize,
    pub batch_number: String,
    pub preview: Vec<Card>,
}

/// Result of a public tap or view
#[derive(Debug, Clone)]
pub struct Hit {
    pub card: Card,
    /// Present only when the card is active and has a target
    pub redirect_url: Option<String>,
}

pub struct EngineBuilder {
    store: Arc<dyn Store>,
    mailer: Arc<dyn Mailer>,
    audit: AuditDispatcher,
    clock: Arc<dyn Clock>,
    codes: Option<Arc<dyn CodeGenerator>>,
    claim: ClaimConfig,
    cards: CardConfig,
}

impl EngineBuilder {
    pub fn mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    pub fn audit(mut self, audit: AuditDispatcher) -> Self {
        self.audit = audit;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn codes(mut self, codes: Arc<dyn CodeGenerator>) -> Self {
        self.codes = Some(codes);
        self
    }

    pub fn claim_settings(mut self, claim: ClaimConfig) -> Self {
        self.claim = claim;
        self
    }

    pub fn card_settings(mut self, cards: CardConfig) -> Self {
        self.cards = cards;
        self
    }

    pub fn build(self) -> Engine {
        let codes = self
            .codes
            .unwrap_or_else(|| Arc::new(RandomCodeGenerator::new(self.cards.id_length)));
        let quota = QuotaLedger::new(self.store.clone());
        let registry = CardRegistry::new(
            self.store.clone(),
            quota.clone(),
            codes,
            self.clock.clone(),
            self.cards.clone(),
        );
        let claims = ClaimTokenService::new(
            self.store.clone(),
            quota.clone(),
            registry.clone(),
            self.mailer,
            self.clock.clone(),
            self.claim,
        );

        Engine {
            store: self.store,
            quota,
            registry,
            claims,
            audit: self.audit,
            clock: self.clock,
            preview_size: self.cards.preview_size,
        }
    }
}

/// Public operations. Each one runs: authorize, check tenant and quota,
/// mutate, emit audit, respond. Audit is fire-and-forget.
pub struct Engine {
    store: Arc<dyn Store>,
    quota: QuotaLedger,
    registry: CardRegistry,
    claims: ClaimTokenService,
    audit: AuditDispatcher,
    clock: Arc<dyn Clock>,
    preview_size: usize,
}

impl Engine {
    pub fn builder(store: Arc<dyn Store>) -> EngineBuilder {
        EngineBuilder {
            store,
            mailer: Arc::new(LogMailer),
            audit: AuditDispatcher::disabled(),
            clock: Arc::new(SystemClock),
            codes: None,
            claim: ClaimConfig::default(),
            cards: CardConfig::default(),
        }
    }

    pub async fn health(&self) -> EngineResult<()> {
        Ok(self.store.health_check().await?)
    }

    // Authorization

    /// Re-reads the membership on every call; the token only says who the
    /// caller is, not what they may do today.
    async fn membership(&self, actor: &Actor) -> EngineResult<Membership> {
        let tenant_id = actor
            .tenant_id
            .ok_or_else(|| EngineError::Forbidden("caller does not belong to a tenant".to_string()))?;
        self.store
            .get_membership(tenant_id, actor.user_id)
            .await?
            .ok_or_else(|| EngineError::Forbidden("caller is not a member of this tenant".to_string()))
    }

    async fn require_admin(&self, actor: &Actor) -> EngineResult<Membership> {
        let membership = self.membership(actor).await?;
        if !membership.role.is_admin() {
            return Err(EngineError::Forbidden("requires the owner or admin role".to_string()));
        }
        Ok(membership)
    }

    fn emit(&self, event: AuditEvent, context: &RequestContext) {
        self.audit.emit(event.with_context(context));
    }

    // Tenants

    /// Creates a tenant with `owner` as its first member
    pub async fn create_tenant(
        &self,
        name: &str,
        limits: ResourceCounters,
        owner_id: Uuid,
        owner_email: &str,
    ) -> EngineResult<Tenant> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::validation("tenant name must not be empty"));
        }

        if !lifecycle::fits_within_limit(limits.users, 0, 1) {
            return Err(EngineError::validation("users limit must leave a seat for the owner"));
        }

        // The owner's seat is counted in the inserted row, not reserved afterwards
        let mut tenant = Tenant::new(name, limits, self.clock.now());
        tenant.usage.users = 1;
        self.store.insert_tenant(&tenant).await?;
        self.store
            .insert_membership(&Membership {
                tenant_id: tenant.id,
                user_id: owner_id,
                email: owner_email.trim().to_string(),
                role: Role::Owner,
                joined_at: self.clock.now(),
            })
            .await?;

        tracing::info!("Created tenant {} ({})", tenant.name, tenant.id);
        self.audit.emit(
            AuditEvent::new(tenant.id, Some(owner_id), "tenant.created", "tenant", Some(tenant.id))
                .with_changes(json!({ "name": tenant.name, "limits": limits })),
        );
        self.quota.tenant(tenant.id).await
    }

    pub async fn tenant(&self, tenant_id: Uuid) -> EngineResult<Tenant> {
        self.quota.tenant(tenant_id).await
    }

    /// Operator action (CLI only). Suspended and expired tenants are frozen.
    pub async fn set_tenant_status(&self, tenant_id: Uuid, status: TenantStatus) -> EngineResult<Tenant> {
        if !self.store.set_tenant_status(tenant_id, status).await? {
            return Err(EngineError::not_found("Tenant"));
        }

        tracing::info!("Tenant {} is now {}", tenant_id, status.as_str());
        self.audit.emit(
            AuditEvent::new(tenant_id, None, "tenant.status_changed", "tenant", Some(tenant_id))
                .with_changes(json!({ "status": status }))
                .with_severity(Severity::Warning),
        );
        self.quota.tenant(tenant_id).await
    }

    pub async fn tenant_usage(&self, actor: &Actor) -> EngineResult<UsageReport> {
        let membership = self.membership(actor).await?;
        let tenant = self.quota.tenant(membership.tenant_id).await?;
        Ok(UsageReport::from_tenant(&tenant))
    }

    pub async fn add_member(&self, actor: &Actor, context: &RequestContext, request: AddMember) -> EngineResult<Membership> {
        let admin = self.require_admin(actor).await?;
        if request.role == Role::Owner && admin.role != Role::Owner {
            return Err(EngineError::Forbidden("only an owner can add another owner".to_string()));
        }
        if self.store.get_membership(admin.tenant_id, request.user_id).await?.is_some() {
            return Err(EngineError::Conflict("user is already a member".to_string()));
        }

        self.quota.reserve(admin.tenant_id, ResourceClass::Users, 1).await?;
        let membership = Membership {
            tenant_id: admin.tenant_id,
            user_id: request.user_id,
            email: request.email.trim().to_string(),
            role: request.role,
            joined_at: self.clock.now(),
        };
        if let Err(e) = self.store.insert_membership(&membership).await {
            self.quota.release_quietly(admin.tenant_id, ResourceClass::Users, 1).await;
            return Err(match e {
                StoreError::Conflict(_) => EngineError::Conflict("user is already a member".to_string()),
                other => other.into(),
            });
        }

        self.emit(
            AuditEvent::new(admin.tenant_id, Some(actor.user_id), "member.added", "user", Some(request.user_id))
                .with_changes(json!({ "role": membership.role })),
            context,
        );
        Ok(membership)
    }

    pub async fn remove_member(&self, actor: &Actor, context: &RequestContext, user_id: Uuid) -> EngineResult<()> {
        let admin = self.require_admin(actor).await?;
        let target = self
            .store
            .get_membership(admin.tenant_id, user_id)
            .await?
            .ok_or(EngineError::not_found("Member"))?;
        if target.role == Role::Owner {
            return Err(EngineError::Forbidden("owners cannot be removed".to_string()));
        }

        if self.store.delete_membership(admin.tenant_id, user_id).await? {
            self.quota.release(admin.tenant_id, ResourceClass::Users, 1).await?;
            self.emit(
                AuditEvent::new(admin.tenant_id, Some(actor.user_id), "member.removed", "user", Some(user_id))
                    .with_severity(Severity::Warning),
                context,
            );
        }
        Ok(())
    }

    pub async fn create_profile(&self, actor: &Actor, context: &RequestContext, request: NewProfile) -> EngineResult<Profile> {
        let caller = self.membership(actor).await?;
        let owner_id = request.user_id.unwrap_or(actor.user_id);
        if owner_id != actor.user_id && !caller.role.is_admin() {
            return Err(EngineError::Forbidden("cannot create profiles for other users".to_string()));
        }
        if self.store.get_membership(caller.tenant_id, owner_id).await?.is_none() {
            return Err(EngineError::not_found("Member"));
        }
        let display_name = request.display_name.trim();
        if display_name.is_empty() {
            return Err(EngineError::validation("display_name must not be empty"));
        }

        self.quota.reserve(caller.tenant_id, ResourceClass::Profiles, 1).await?;
        let profile = Profile {
            id: Uuid::new_v4(),
            tenant_id: caller.tenant_id,
            user_id: owner_id,
            display_name: display_name.to_string(),
            created_at: self.clock.now(),
        };
        if let Err(e) = self.store.insert_profile(&profile).await {
            self.quota.release_quietly(caller.tenant_id, ResourceClass::Profiles, 1).await;
            return Err(e.into());
        }

        self.emit(
            AuditEvent::new(caller.tenant_id, Some(actor.user_id), "profile.created", "profile", Some(profile.id)),
            context,
        );
        Ok(profile)
    }

    pub async fn delete_profile(&self, actor: &Actor, context: &RequestContext, profile_id: Uuid) -> EngineResult<()> {
        let caller = self.membership(actor).await?;
        let profile = self
            .store
            .get_profile(profile_id)
            .await?
            .ok_or(EngineError::not_found("Profile"))?;
        if profile.tenant_id != caller.tenant_id {
            return Err(EngineError::CrossTenantAccess { entity: "Profile" });
        }
        if profile.user_id != actor.user_id && !caller.role.is_admin() {
            return Err(EngineError::Forbidden("cannot delete another user's profile".to_string()));
        }

        if self.store.delete_profile(profile_id).await? {
            self.quota.release(caller.tenant_id, ResourceClass::Profiles, 1).await?;
            self.emit(
                AuditEvent::new(caller.tenant_id, Some(actor.user_id), "profile.deleted", "profile", Some(profile_id)),
                context,
            );
        }
        Ok(())
    }

    /// Signed delta in megabytes; growth is quota-checked, shrinkage saturates
    pub async fn adjust_storage(&self, actor: &Actor, context: &RequestContext, delta_mb: i64) -> EngineResult<i64> {
        let admin = self.require_admin(actor).await?;
        let usage = if delta_mb >= 0 {
            self.quota.reserve(admin.tenant_id, ResourceClass::StorageMb, delta_mb).await?
        } else {
            self.quota.release(admin.tenant_id, ResourceClass::StorageMb, delta_mb.saturating_neg()).await?
        };

        self.emit(
            AuditEvent::new(admin.tenant_id, Some(actor.user_id), "storage.adjusted", "tenant", Some(admin.tenant_id))
                .with_changes(json!({ "delta_mb": delta_mb, "usage_mb": usage })),
            context,
        );
        Ok(usage)
    }

    // Cards

    pub async fn mint_card(&self, actor: &Actor, context: &RequestContext, request: NewCard) -> EngineResult<Card> {
        let admin = self.require_admin(actor).await?;
        let card = self.registry.mint_single(admin.tenant_id, request).await?;

        self.emit(
            AuditEvent::new(admin.tenant_id, Some(actor.user_id), "card.created", "card", Some(card.id))
                .with_changes(json!({ "card_code": card.card_code, "serial_number": card.serial_number })),
            context,
        );
        Ok(card)
    }

    pub async fn bulk_mint(&self, actor: &Actor, context: &RequestContext, request: BulkMint) -> EngineResult<BulkMintSummary> {
        let admin = self.require_admin(actor).await?;
        let requested = request.count;

        let batch = match self.registry.bulk_mint(admin.tenant_id, request).await {
            Ok(batch) => batch,
            Err(e) => {
                self.emit(
                    AuditEvent::new(admin.tenant_id, Some(actor.user_id), "card.bulk_mint_failed", "card", None)
                        .with_changes(json!({ "requested": requested, "reason": e.reason_tag() }))
                        .with_severity(Severity::Warning),
                    context,
                );
                return Err(e);
            }
        };

        // The full code list goes to the audit trail, never to the response
        let codes: Vec<&str> = batch.cards.iter().map(|c| c.card_code.as_str()).collect();
        self.emit(
            AuditEvent::new(admin.tenant_id, Some(actor.user_id), "card.bulk_minted", "card", None)
                .with_changes(json!({
                    "count": batch.cards.len(),
                    "batch_number": batch.batch_number,
                    "card_codes": codes,
                })),
            context,
        );

        let count = batch.cards.len();
        let preview = batch.cards.into_iter().take(self.preview_size).collect();
        Ok(BulkMintSummary {
            count,
            batch_number: batch.batch_number,
            preview,
        })
    }

    pub async fn get_card(&self, actor: &Actor, card_id: Uuid) -> EngineResult<Card> {
        let member = self.membership(actor).await?;
        self.registry.get(member.tenant_id, card_id).await
    }

    pub async fn card_history(&self, actor: &Actor, card_id: Uuid, page: Page) -> EngineResult<Vec<AssignmentEntry>> {
        let member = self.membership(actor).await?;
        self.registry.history(member.tenant_id, card_id, page).await
    }

    pub async fn assign_card(
        &self,
        actor: &Actor,
        context: &RequestContext,
        card_id: Uuid,
        request: AssignCard,
    ) -> EngineResult<Card> {
        self.set_assignee(actor, context, card_id, CardOp::Assign, request).await
    }

    pub async fn reassign_card(
        &self,
        actor: &Actor,
        context: &RequestContext,
        card_id: Uuid,
        request: AssignCard,
    ) -> EngineResult<Card> {
        self.set_assignee(actor, context, card_id, CardOp::Reassign, request).await
    }

    async fn set_assignee(
        &self,
        actor: &Actor,
        context: &RequestContext,
        card_id: Uuid,
        op: CardOp,
        request: AssignCard,
    ) -> EngineResult<Card> {
        let admin = self.require_admin(actor).await?;
        let tenant_id = admin.tenant_id;

        if self.store.get_membership(tenant_id, request.user_id).await?.is_none() {
            return Err(EngineError::not_found("Member"));
        }
        if let Some(profile_id) = request.profile_id {
            let profile = self
                .store
                .get_profile(profile_id)
                .await?
                .filter(|p| p.tenant_id == tenant_id)
                .ok_or(EngineError::not_found("Profile"))?;
            if profile.user_id != request.user_id {
                return Err(EngineError::validation("profile does not belong to the assignee"));
            }
        }

        let committed = self
            .registry
            .set_assignee(tenant_id, card_id, op, request.user_id, request.profile_id)
            .await?;
        if !committed.changed {
            return Ok(committed.after);
        }

        let reason = request.reason.unwrap_or_else(|| op.as_str().to_string());
        self.registry.append_history(&committed.after, actor.user_id, reason).await?;
        self.retire_dropped_token(&committed, op).await;

        self.emit(
            AuditEvent::new(tenant_id, Some(actor.user_id), format!("card.{}", op.as_str()), "card", Some(card_id))
                .with_changes(json!({
                    "from": { "user_id": committed.before.assigned_to, "profile_id": committed.before.assigned_profile },
                    "to": { "user_id": committed.after.assigned_to, "profile_id": committed.after.assigned_profile },
                })),
            context,
        );
        Ok(committed.after)
    }

    pub async fn unassign_card(
        &self,
        actor: &Actor,
        context: &RequestContext,
        card_id: Uuid,
        reason: Option<String>,
    ) -> EngineResult<Card> {
        let admin = self.require_admin(actor).await?;
        let committed = self.registry.clear_assignee(admin.tenant_id, card_id).await?;
        if !committed.changed {
            return Ok(committed.after);
        }

        self.registry
            .append_history(&committed.after, actor.user_id, reason.unwrap_or_else(|| "unassign".to_string()))
            .await?;
        self.emit(
            AuditEvent::new(admin.tenant_id, Some(actor.user_id), "card.unassign", "card", Some(card_id))
                .with_changes(json!({ "from": { "user_id": committed.before.assigned_to } })),
            context,
        );
        Ok(committed.after)
    }

    /// activate / deactivate / suspend / unsuspend
    pub async fn change_status(&self, actor: &Actor, context: &RequestContext, card_id: Uuid, op: CardOp) -> EngineResult<Card> {
        if !matches!(op, CardOp::Activate | CardOp::Deactivate | CardOp::Suspend | CardOp::Unsuspend) {
            return Err(EngineError::validation(format!("{} is not a status change", op)));
        }
        let admin = self.require_admin(actor).await?;
        let committed = self.registry.transition(admin.tenant_id, card_id, op).await?;
        if !committed.changed {
            return Ok(committed.after);
        }

        self.retire_dropped_token(&committed, op).await;
        let severity = if op == CardOp::Deactivate { Severity::Warning } else { Severity::Info };
        self.emit(
            AuditEvent::new(admin.tenant_id, Some(actor.user_id), format!("card.{}", op.as_str()), "card", Some(card_id))
                .with_changes(json!({
                    "status": { "from": committed.before.status, "to": committed.after.status },
                    "lifecycle_stage": { "from": committed.before.lifecycle_stage, "to": committed.after.lifecycle_stage },
                }))
                .with_severity(severity),
            context,
        );
        Ok(committed.after)
    }

    /// A provisioned card that moved on without redemption revokes its token
    async fn retire_dropped_token(&self, committed: &Committed, op: CardOp) {
        if committed.before.status != CardStatus::Provisioned || committed.after.claim_token_id.is_some() {
            return;
        }
        if let Some(token_id) = committed.before.claim_token_id {
            self.claims.retire(token_id, &format!("superseded by {}", op)).await;
        }
    }

    /// Public tap/view by card code. Counts always; redirects only when active.
    pub async fn record_hit(&self, card_code: &str, kind: HitKind) -> EngineResult<Hit> {
        let card = self.registry.record_hit(card_code, kind).await?;
        let redirect_url = if lifecycle::allows_redirect(&card) {
            card.redirect_url.clone()
        } else {
            None
        };
        Ok(Hit { card, redirect_url })
    }

    // Claims

    pub async fn generate_claim(
        &self,
        actor: &Actor,
        context: &RequestContext,
        request: GenerateClaim,
    ) -> EngineResult<IssuedClaim> {
        let admin = self.require_admin(actor).await?;
        let issued = self.claims.generate(admin.tenant_id, actor.user_id, request).await?;

        self.emit(
            AuditEvent::new(admin.tenant_id, Some(actor.user_id), "claim.generated", "claim_token", Some(issued.token.id))
                .with_changes(json!({
                    "card_id": issued.token.card_id,
                    "expires_at": issued.token.expires_at,
                    "max_uses": issued.token.max_uses,
                    "require_email_verification": issued.token.require_email_verification,
                })),
            context,
        );
        Ok(issued)
    }

    pub async fn inspect_claim(&self, token: &str) -> EngineResult<ClaimPreview> {
        self.claims.inspect(token).await
    }

    pub async fn send_verification_code(&self, token: &str) -> EngineResult<VerificationSent> {
        self.claims.send_verification_code(token).await
    }

    pub async fn verify_claim_code(&self, token: &str, code: &str, context: &RequestContext) -> EngineResult<ClaimToken> {
        self.claims.verify_code(token, code, context).await
    }

    /// Any authenticated caller may redeem a claim addressed to their email
    pub async fn redeem_claim(
        &self,
        actor: &Actor,
        context: &RequestContext,
        token: &str,
        profile_id: Option<Uuid>,
    ) -> EngineResult<Redemption> {
        let redeemer = Redeemer {
            user_id: actor.user_id,
            email: actor.email.clone(),
            tenant_id: actor.tenant_id,
        };
        let redemption = self.claims.redeem(token, &redeemer, profile_id, context).await?;

        self.emit(
            AuditEvent::new(
                redemption.token.tenant_id,
                Some(actor.user_id),
                "claim.redeemed",
                "claim_token",
                Some(redemption.token.id),
            )
            .with_changes(json!({
                "card_id": redemption.token.card_id,
                "joined_tenant": redemption.joined_tenant,
            })),
            context,
        );
        Ok(redemption)
    }

    pub async fn revoke_claim(
        &self,
        actor: &Actor,
        context: &RequestContext,
        token_ref: &str,
        reason: &str,
    ) -> EngineResult<ClaimToken> {
        let admin = self.require_admin(actor).await?;
        if reason.trim().is_empty() {
            return Err(EngineError::validation("a revocation reason is required"));
        }
        let revoked = self.claims.revoke(admin.tenant_id, token_ref, reason).await?;

        self.emit(
            AuditEvent::new(admin.tenant_id, Some(actor.user_id), "claim.revoked", "claim_token", Some(revoked.id))
                .with_changes(json!({ "reason": revoked.revoked_reason, "card_id": revoked.card_id }))
                .with_severity(Severity::Warning),
            context,
        );
        Ok(revoked)
    }

    pub async fn sweep_claims(&self) -> EngineResult<u64> {
        self.claims.sweep().await
    }
}
