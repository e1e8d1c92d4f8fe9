use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use super::clock::Clock;
use super::error::{EngineError, EngineResult};
use super::identifier::{self, CodeGenerator};
use super::lifecycle::{self, CardOp};
use super::quota::QuotaLedger;
use crate::config::CardConfig;
use crate::database::store::{Page, Store, StoreError};
use crate::models::{AssignmentEntry, Card, CardStatus, CardTemplate, HitKind, ResourceClass};

/// Attempts at a compare-and-swap before giving up with `Conflict`
const MAX_CAS_RETRIES: usize = 5;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewCard {
    pub serial_number: Option<String>,
    #[serde(flatten)]
    pub template: CardTemplate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkMint {
    pub count: usize,
    #[serde(flatten)]
    pub template: CardTemplate,
}

#[derive(Debug, Clone)]
pub struct MintedBatch {
    pub batch_number: String,
    pub cards: Vec<Card>,
}

/// A committed (or skipped) card mutation
#[derive(Debug, Clone)]
pub struct Committed {
    pub before: Card,
    pub after: Card,
    /// False when the mutation was already in effect and nothing was written
    pub changed: bool,
}

/// Owner of card records and the only writer of their state machine
#[derive(Clone)]
pub struct CardRegistry {
    store: Arc<dyn Store>,
    quota: QuotaLedger,
    codes: Arc<dyn CodeGenerator>,
    clock: Arc<dyn Clock>,
    settings: CardConfig,
}

impl CardRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        quota: QuotaLedger,
        codes: Arc<dyn CodeGenerator>,
        clock: Arc<dyn Clock>,
        settings: CardConfig,
    ) -> Self {
        Self {
            store,
            quota,
            codes,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &CardConfig {
        &self.settings
    }

    /// Loads a card and checks it belongs to `tenant_id`
    pub async fn get(&self, tenant_id: Uuid, card_id: Uuid) -> EngineResult<Card> {
        let card = self
            .store
            .get_card(card_id)
            .await?
            .ok_or(EngineError::not_found("Card"))?;
        if card.tenant_id != tenant_id {
            return Err(EngineError::CrossTenantAccess { entity: "Card" });
        }
        Ok(card)
    }

    pub async fn mint_single(&self, tenant_id: Uuid, request: NewCard) -> EngineResult<Card> {
        let serial = match request.serial_number {
            Some(s) if s.trim().is_empty() => {
                return Err(EngineError::validation("serial_number must not be blank"))
            }
            other => other.map(|s| s.trim().to_string()),
        };

        self.quota.reserve(tenant_id, ResourceClass::Cards, 1).await?;

        match self.insert_with_fresh_code(tenant_id, &request.template, 1, serial).await {
            Ok(card) => {
                tracing::info!("Minted card {} ({}) for tenant {}", card.card_code, card.id, tenant_id);
                Ok(card)
            }
            Err(e) => {
                self.quota.release_quietly(tenant_id, ResourceClass::Cards, 1).await;
                Err(e)
            }
        }
    }

    /// Reserves the whole batch up front, then mints card by card. On failure
    /// the cards already written stay; the reservation for the rest is released.
    pub async fn bulk_mint(&self, tenant_id: Uuid, request: BulkMint) -> EngineResult<MintedBatch> {
        if request.count == 0 || request.count > self.settings.max_bulk_count {
            return Err(EngineError::validation(format!(
                "count must be between 1 and {}",
                self.settings.max_bulk_count
            )));
        }

        let mut template = request.template;
        let batch_number = match template.batch_number.take() {
            Some(b) if !b.trim().is_empty() => b.trim().to_string(),
            _ => self.generate_batch_number(),
        };
        template.batch_number = Some(batch_number.clone());

        let count = request.count as i64;
        self.quota.reserve(tenant_id, ResourceClass::Cards, count).await?;

        let mut cards = Vec::with_capacity(request.count);
        for index in 1..=request.count {
            match self.insert_with_fresh_code(tenant_id, &template, index, None).await {
                Ok(card) => cards.push(card),
                Err(e) => {
                    let unused = count - cards.len() as i64;
                    tracing::warn!(
                        "Bulk mint {} for tenant {} stopped after {}/{} cards: {}",
                        batch_number, tenant_id, cards.len(), count, e
                    );
                    self.quota.release_quietly(tenant_id, ResourceClass::Cards, unused).await;
                    return Err(e);
                }
            }
        }

        tracing::info!("Minted batch {} of {} cards for tenant {}", batch_number, count, tenant_id);
        tracing::debug!(
            "Batch {} codes: {}",
            batch_number,
            cards.iter().map(|c| c.card_code.as_str()).collect::<Vec<_>>().join(",")
        );

        Ok(MintedBatch { batch_number, cards })
    }

    fn generate_batch_number(&self) -> String {
        let suffix: String = self.codes.next_code().chars().take(6).collect();
        format!("B{}-{}", self.clock.now().format("%Y%m%d"), suffix)
    }

    /// Writes a card under a freshly generated code. The unique index on
    /// `card_code` has the final word: a conflict on insert counts as a
    /// collision and is retried like one.
    async fn insert_with_fresh_code(
        &self,
        tenant_id: Uuid,
        template: &CardTemplate,
        index: usize,
        serial_number: Option<String>,
    ) -> EngineResult<Card> {
        let max_attempts = self.settings.id_max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let code = self.codes.next_code();
            if !identifier::is_well_formed(&code) {
                tracing::warn!("Code generator produced a malformed code on attempt {}", attempt);
                continue;
            }
            if self.store.card_code_exists(&code).await? {
                tracing::debug!("Card code collision on attempt {}", attempt);
                continue;
            }

            let mut card = Card::new(tenant_id, code, template, index, self.clock.now());
            card.serial_number = serial_number.clone();

            match self.store.insert_card(&card).await {
                Ok(()) => return Ok(card),
                Err(StoreError::Conflict(constraint)) if constraint.contains("card_code") => {
                    tracing::debug!("Card code lost insert race on attempt {}", attempt);
                }
                Err(StoreError::Conflict(constraint)) if constraint.contains("serial") => {
                    return Err(EngineError::Conflict("serial number is already registered".to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::error!("Card code generation exhausted after {} attempts", max_attempts);
        Err(EngineError::GenerationExhausted { attempts: max_attempts })
    }

    /// Loads, plans `op`, applies `apply` and commits with compare-and-swap.
    ///
    /// `apply` sees the card in its pre-transition status and returns whether
    /// anything needs writing. A lost race reloads and re-runs the guard.
    pub async fn commit<F>(&self, tenant_id: Uuid, card_id: Uuid, op: CardOp, mut apply: F) -> EngineResult<Committed>
    where
        F: FnMut(&mut Card) -> EngineResult<bool> + Send,
    {
        for _ in 0..MAX_CAS_RETRIES {
            let before = self.get(tenant_id, card_id).await?;
            let (status, stage) = lifecycle::plan_transition(&before, op)?;

            let mut after = before.clone();
            let mut changed = apply(&mut after)?;
            changed |= after.status != status || after.lifecycle_stage != stage;
            if !changed {
                return Ok(Committed { before, after, changed: false });
            }

            after.status = status;
            after.lifecycle_stage = stage;
            after.updated_at = self.clock.now();

            if self.store.update_card(&after).await? {
                after.version += 1;
                tracing::info!(
                    "Card {} {}: {} -> {}",
                    after.card_code, op, before.status, after.status
                );
                return Ok(Committed { before, after, changed: true });
            }
            tracing::debug!("Card {} changed underneath {}, retrying", card_id, op);
        }

        tracing::warn!("Giving up on {} for card {} after {} lost races", op, card_id, MAX_CAS_RETRIES);
        Err(EngineError::Conflict("card was modified concurrently".to_string()))
    }

    /// Plain status transitions that touch nothing but status and stage
    pub async fn transition(&self, tenant_id: Uuid, card_id: Uuid, op: CardOp) -> EngineResult<Committed> {
        debug_assert!(matches!(
            op,
            CardOp::Activate | CardOp::Deactivate | CardOp::Suspend | CardOp::Unsuspend
        ));
        self.commit(tenant_id, card_id, op, |card| {
            // A card leaving provisioned drops its token reference; the caller revokes it
            if card.status == CardStatus::Provisioned && card.claim_token_id.is_some() {
                card.claim_token_id = None;
                return Ok(true);
            }
            Ok(false)
        })
        .await
    }

    /// Assign or reassign. The caller has already checked that `user_id` and
    /// `profile_id` belong to the tenant.
    pub async fn set_assignee(
        &self,
        tenant_id: Uuid,
        card_id: Uuid,
        op: CardOp,
        user_id: Uuid,
        profile_id: Option<Uuid>,
    ) -> EngineResult<Committed> {
        debug_assert!(matches!(op, CardOp::Assign | CardOp::Reassign));
        self.commit(tenant_id, card_id, op, |card| {
            if op == CardOp::Reassign && !lifecycle::is_reassignable(card) {
                return Err(EngineError::InvalidTransition {
                    current: card.status.as_str().to_string(),
                    requested: op.as_str().to_string(),
                });
            }
            let mut changed = false;
            if card.status == CardStatus::Provisioned && card.claim_token_id.is_some() {
                card.claim_token_id = None;
                changed = true;
            }
            if card.assigned_to != Some(user_id) || card.assigned_profile != profile_id {
                card.assigned_to = Some(user_id);
                card.assigned_profile = profile_id;
                changed = true;
            }
            Ok(changed)
        })
        .await
    }

    pub async fn clear_assignee(&self, tenant_id: Uuid, card_id: Uuid) -> EngineResult<Committed> {
        self.commit(tenant_id, card_id, CardOp::Unassign, |card| {
            let changed = card.assigned_to.is_some() || card.assigned_profile.is_some();
            card.assigned_to = None;
            card.assigned_profile = None;
            Ok(changed)
        })
        .await
    }

    /// Drops the card's reference to `token_id`; a provisioned card goes back
    /// to inventory. The stage stays where it is. No-op when the card has
    /// already moved on to another token.
    pub async fn detach_claim_token(&self, tenant_id: Uuid, card_id: Uuid, token_id: Uuid) -> EngineResult<Card> {
        for _ in 0..MAX_CAS_RETRIES {
            let mut card = self.get(tenant_id, card_id).await?;
            if card.claim_token_id != Some(token_id) {
                return Ok(card);
            }

            card.claim_token_id = None;
            if card.status == CardStatus::Provisioned {
                card.status = CardStatus::Inventory;
            }
            card.updated_at = self.clock.now();

            if self.store.update_card(&card).await? {
                card.version += 1;
                tracing::info!("Card {} released claim token {}", card.card_code, token_id);
                return Ok(card);
            }
        }
        Err(EngineError::Conflict("card was modified concurrently".to_string()))
    }

    pub async fn append_history(
        &self,
        card: &Card,
        actor_id: Uuid,
        reason: impl Into<String>,
    ) -> EngineResult<AssignmentEntry> {
        let entry = AssignmentEntry {
            seq: 0,
            card_id: card.id,
            user_id: card.assigned_to,
            profile_id: card.assigned_profile,
            actor_id,
            reason: reason.into(),
            recorded_at: self.clock.now(),
        };
        Ok(self.store.append_assignment(entry).await?)
    }

    pub async fn history(&self, tenant_id: Uuid, card_id: Uuid, page: Page) -> EngineResult<Vec<AssignmentEntry>> {
        self.get(tenant_id, card_id).await?;
        Ok(self.store.list_assignments(card_id, page).await?)
    }

    /// Public tap/view. Counters move whatever the status; the caller decides
    /// about redirecting.
    pub async fn record_hit(&self, card_code: &str, kind: HitKind) -> EngineResult<Card> {
        let code = card_code.trim().to_ascii_uppercase();
        if !identifier::is_well_formed(&code) {
            return Err(EngineError::not_found("Card"));
        }
        let card = self
            .store
            .get_card_by_code(&code)
            .await?
            .ok_or(EngineError::not_found("Card"))?;

        self.store
            .record_hit(card.id, kind, self.clock.now())
            .await?
            .ok_or(EngineError::not_found("Card"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryStore;
    use crate::engine::clock::SystemClock;
    use crate::models::{LifecycleStage, ResourceCounters, Tenant};
    use crate::testing::ScriptedCodes;
    use chrono::Utc;
    use std::collections::HashSet;

    async fn registry_with(
        limits: ResourceCounters,
        codes: Arc<dyn CodeGenerator>,
    ) -> (CardRegistry, Arc<MemoryStore>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let tenant = Tenant::new("acme", limits, Utc::now());
        store.insert_tenant(&tenant).await.unwrap();
        let registry = CardRegistry::new(
            store.clone(),
            QuotaLedger::new(store.clone()),
            codes,
            Arc::new(SystemClock),
            CardConfig::default(),
        );
        (registry, store, tenant.id)
    }

    fn random_codes() -> Arc<dyn CodeGenerator> {
        Arc::new(identifier::RandomCodeGenerator::default())
    }

    fn bulk(count: usize) -> BulkMint {
        BulkMint {
            count,
            template: CardTemplate {
                url_template: Some("https://tap.example.com/{batch}/{index}/{code}".into()),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn bulk_mint_of_a_thousand_yields_distinct_codes() {
        let (registry, store, tenant_id) = registry_with(ResourceCounters::unbounded(), random_codes()).await;

        let batch = registry.bulk_mint(tenant_id, bulk(1000)).await.unwrap();
        let codes: HashSet<_> = batch.cards.iter().map(|c| c.card_code.clone()).collect();
        assert_eq!(codes.len(), 1000);
        assert_eq!(store.count_cards(tenant_id).await, 1000);

        let usage = store.get_tenant(tenant_id).await.unwrap().unwrap().usage;
        assert_eq!(usage.cards, 1000);

        let first = &batch.cards[0];
        assert_eq!(
            first.redirect_url.as_deref(),
            Some(format!("https://tap.example.com/{}/1/{}", batch.batch_number, first.card_code).as_str())
        );
        assert_eq!(first.status, CardStatus::Inventory);
        assert_eq!(first.lifecycle_stage, LifecycleStage::Manufactured);
    }

    #[tokio::test]
    async fn bulk_mint_rejects_out_of_range_counts() {
        let (registry, _, tenant_id) = registry_with(ResourceCounters::unbounded(), random_codes()).await;
        assert!(matches!(registry.bulk_mint(tenant_id, bulk(0)).await, Err(EngineError::Validation(_))));
        assert!(matches!(registry.bulk_mint(tenant_id, bulk(1001)).await, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn forced_collision_is_retried_not_duplicated() {
        let codes = Arc::new(ScriptedCodes::new(["AAAA1111", "AAAA1111", "BBBB2222"]));
        let (registry, store, tenant_id) = registry_with(ResourceCounters::unbounded(), codes).await;

        let first = registry.mint_single(tenant_id, NewCard::default()).await.unwrap();
        let second = registry.mint_single(tenant_id, NewCard::default()).await.unwrap();

        assert_eq!(first.card_code, "AAAA1111");
        assert_eq!(second.card_code, "BBBB2222");
        assert_eq!(store.count_cards(tenant_id).await, 2);
    }

    #[tokio::test]
    async fn exhausted_generation_releases_the_reservation() {
        let codes = Arc::new(ScriptedCodes::new(["SAME0000"]));
        let (registry, store, tenant_id) = registry_with(ResourceCounters::unbounded(), codes).await;

        registry.mint_single(tenant_id, NewCard::default()).await.unwrap();
        let err = registry.mint_single(tenant_id, NewCard::default()).await.unwrap_err();

        assert!(matches!(err, EngineError::GenerationExhausted { attempts: 10 }));
        let usage = store.get_tenant(tenant_id).await.unwrap().unwrap().usage;
        assert_eq!(usage.cards, 1);
    }

    #[tokio::test]
    async fn failed_bulk_mint_releases_uncreated_cards() {
        let (registry, store, tenant_id) = registry_with(ResourceCounters::unbounded(), random_codes()).await;
        store.fail_card_inserts_after(3);

        let err = registry.bulk_mint(tenant_id, bulk(10)).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Injected(_))));

        assert_eq!(store.count_cards(tenant_id).await, 3);
        let usage = store.get_tenant(tenant_id).await.unwrap().unwrap().usage;
        assert_eq!(usage.cards, 3);
    }

    #[tokio::test]
    async fn bulk_mint_over_quota_creates_nothing() {
        let limits = ResourceCounters { cards: 5, ..ResourceCounters::unbounded() };
        let (registry, store, tenant_id) = registry_with(limits, random_codes()).await;

        let err = registry.bulk_mint(tenant_id, bulk(6)).await.unwrap_err();
        assert!(matches!(err, EngineError::QuotaExceeded { limit: 5, current: 0, .. }));
        assert_eq!(store.count_cards(tenant_id).await, 0);
    }

    #[tokio::test]
    async fn duplicate_serial_is_a_conflict() {
        let (registry, store, tenant_id) = registry_with(ResourceCounters::unbounded(), random_codes()).await;
        let request = NewCard {
            serial_number: Some("SN-0001".into()),
            ..Default::default()
        };

        registry.mint_single(tenant_id, request.clone()).await.unwrap();
        let err = registry.mint_single(tenant_id, request).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        assert_eq!(store.get_tenant(tenant_id).await.unwrap().unwrap().usage.cards, 1);
    }

    #[tokio::test]
    async fn refused_transition_leaves_card_untouched() {
        let (registry, store, tenant_id) = registry_with(ResourceCounters::unbounded(), random_codes()).await;
        let card = registry.mint_single(tenant_id, NewCard::default()).await.unwrap();

        let err = registry.transition(tenant_id, card.id, CardOp::Suspend).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition { ref current, ref requested } if current == "inventory" && requested == "suspend"
        ));
        assert_eq!(store.get_card(card.id).await.unwrap().unwrap(), card);
    }

    #[tokio::test]
    async fn other_tenants_cannot_see_the_card() {
        let (registry, _, tenant_id) = registry_with(ResourceCounters::unbounded(), random_codes()).await;
        let card = registry.mint_single(tenant_id, NewCard::default()).await.unwrap();

        let err = registry.get(Uuid::new_v4(), card.id).await.unwrap_err();
        assert!(matches!(err, EngineError::CrossTenantAccess { .. }));
    }

    #[tokio::test]
    async fn reassigning_the_same_user_is_idempotent() {
        let (registry, _, tenant_id) = registry_with(ResourceCounters::unbounded(), random_codes()).await;
        let card = registry.mint_single(tenant_id, NewCard::default()).await.unwrap();
        registry.transition(tenant_id, card.id, CardOp::Activate).await.unwrap();

        let user = Uuid::new_v4();
        let first = registry.set_assignee(tenant_id, card.id, CardOp::Assign, user, None).await.unwrap();
        let again = registry.set_assignee(tenant_id, card.id, CardOp::Assign, user, None).await.unwrap();

        assert!(first.changed);
        assert!(!again.changed);
        assert_eq!(again.after.version, first.after.version);
    }

    #[tokio::test]
    async fn hits_count_even_when_inactive() {
        let (registry, _, tenant_id) = registry_with(ResourceCounters::unbounded(), random_codes()).await;
        let card = registry.mint_single(tenant_id, NewCard::default()).await.unwrap();

        let tapped = registry.record_hit(&card.card_code.to_lowercase(), HitKind::Tap).await.unwrap();
        assert_eq!(tapped.tap_count, 1);
        assert!(tapped.last_tapped_at.is_some());
        assert!(!lifecycle::allows_redirect(&tapped));

        let viewed = registry.record_hit(&card.card_code, HitKind::View).await.unwrap();
        assert_eq!(viewed.view_count, 1);
        assert!(matches!(
            registry.record_hit("NOPE!!", HitKind::Tap).await,
            Err(EngineError::NotFound { .. })
        ));
    }
}
