use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::store::{Page, ReserveOutcome, Store, StoreError, StoreResult};
use crate::engine::audit::{AuditError, AuditSink};
use crate::models::{
    AssignmentEntry, AuditEvent, Card, CardStatus, ClaimAttempt, ClaimStatus, ClaimToken, Claimant, HitKind,
    LifecycleStage, Membership, Profile, ResourceClass, ResourceCounters, Role, Tenant, TenantStatus,
};

const CARD_COLUMNS: &str = "id, tenant_id, card_code, serial_number, sku, batch_number, product_line, \
     attributes, redirect_url, status, lifecycle_stage, assigned_to, assigned_profile, claim_token_id, \
     tap_count, view_count, last_tapped_at, version, created_at, updated_at";

const TOKEN_COLUMNS: &str = "id, token_hash, tenant_id, card_id, claimant_email, claimant_name, \
     claimant_phone, status, expires_at, max_uses, used_count, require_email_verification, email_verified, \
     verification_code_hash, verification_code_expires, claimed_by, claimed_at, revoked_reason, revoked_at, \
     created_by, version, created_at, updated_at";

const TENANT_COLUMNS: &str = "id, name, status, limit_users, limit_cards, limit_profiles, limit_storage_mb, \
     usage_users, usage_cards, usage_profiles, usage_storage_mb, created_at, updated_at";

/// `(limit, usage)` column names for a resource class
fn counter_columns(resource: ResourceClass) -> (&'static str, &'static str) {
    match resource {
        ResourceClass::Users => ("limit_users", "usage_users"),
        ResourceClass::Cards => ("limit_cards", "usage_cards"),
        ResourceClass::Profiles => ("limit_profiles", "usage_profiles"),
        ResourceClass::StorageMb => ("limit_storage_mb", "usage_storage_mb"),
    }
}

fn corrupt(what: &str, value: &str) -> StoreError {
    StoreError::CorruptRow(format!("unexpected {} '{}'", what, value))
}

fn tenant_from_row(row: &PgRow) -> StoreResult<Tenant> {
    let status: String = row.try_get("status")?;
    Ok(Tenant {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status: TenantStatus::parse(&status).ok_or_else(|| corrupt("tenant status", &status))?,
        limits: ResourceCounters {
            users: row.try_get("limit_users")?,
            cards: row.try_get("limit_cards")?,
            profiles: row.try_get("limit_profiles")?,
            storage_mb: row.try_get("limit_storage_mb")?,
        },
        usage: ResourceCounters {
            users: row.try_get("usage_users")?,
            cards: row.try_get("usage_cards")?,
            profiles: row.try_get("usage_profiles")?,
            storage_mb: row.try_get("usage_storage_mb")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn membership_from_row(row: &PgRow) -> StoreResult<Membership> {
    let role: String = row.try_get("role")?;
    Ok(Membership {
        tenant_id: row.try_get("tenant_id")?,
        user_id: row.try_get("user_id")?,
        email: row.try_get("email")?,
        role: Role::parse(&role).ok_or_else(|| corrupt("role", &role))?,
        joined_at: row.try_get("joined_at")?,
    })
}

fn profile_from_row(row: &PgRow) -> StoreResult<Profile> {
    Ok(Profile {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        user_id: row.try_get("user_id")?,
        display_name: row.try_get("display_name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn card_from_row(row: &PgRow) -> StoreResult<Card> {
    let status: String = row.try_get("status")?;
    let stage: String = row.try_get("lifecycle_stage")?;
    Ok(Card {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        card_code: row.try_get("card_code")?,
        serial_number: row.try_get("serial_number")?,
        sku: row.try_get("sku")?,
        batch_number: row.try_get("batch_number")?,
        product_line: row.try_get("product_line")?,
        attributes: row.try_get("attributes")?,
        redirect_url: row.try_get("redirect_url")?,
        status: CardStatus::parse(&status).ok_or_else(|| corrupt("card status", &status))?,
        lifecycle_stage: LifecycleStage::parse(&stage).ok_or_else(|| corrupt("lifecycle stage", &stage))?,
        assigned_to: row.try_get("assigned_to")?,
        assigned_profile: row.try_get("assigned_profile")?,
        claim_token_id: row.try_get("claim_token_id")?,
        tap_count: row.try_get("tap_count")?,
        view_count: row.try_get("view_count")?,
        last_tapped_at: row.try_get("last_tapped_at")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn token_from_row(row: &PgRow) -> StoreResult<ClaimToken> {
    let status: String = row.try_get("status")?;
    Ok(ClaimToken {
        id: row.try_get("id")?,
        token_hash: row.try_get("token_hash")?,
        tenant_id: row.try_get("tenant_id")?,
        card_id: row.try_get("card_id")?,
        assigned_to: Claimant {
            email: row.try_get("claimant_email")?,
            name: row.try_get("claimant_name")?,
            phone: row.try_get("claimant_phone")?,
        },
        status: ClaimStatus::parse(&status).ok_or_else(|| corrupt("claim status", &status))?,
        expires_at: row.try_get("expires_at")?,
        max_uses: row.try_get("max_uses")?,
        used_count: row.try_get("used_count")?,
        require_email_verification: row.try_get("require_email_verification")?,
        email_verified: row.try_get("email_verified")?,
        verification_code_hash: row.try_get("verification_code_hash")?,
        verification_code_expires: row.try_get("verification_code_expires")?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: row.try_get("claimed_at")?,
        revoked_reason: row.try_get("revoked_reason")?,
        revoked_at: row.try_get("revoked_at")?,
        created_by: row.try_get("created_by")?,
        claim_attempts: Vec::new(),
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn attempt_from_row(row: &PgRow) -> StoreResult<ClaimAttempt> {
    Ok(ClaimAttempt {
        timestamp: row.try_get("attempted_at")?,
        ip: row.try_get("ip")?,
        user_agent: row.try_get("user_agent")?,
        email: row.try_get("email")?,
        success: row.try_get("success")?,
        failure_reason: row.try_get("failure_reason")?,
    })
}

fn assignment_from_row(row: &PgRow) -> StoreResult<AssignmentEntry> {
    Ok(AssignmentEntry {
        seq: row.try_get("seq")?,
        card_id: row.try_get("card_id")?,
        user_id: row.try_get("user_id")?,
        profile_id: row.try_get("profile_id")?,
        actor_id: row.try_get("actor_id")?,
        reason: row.try_get("reason")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

/// PostgreSQL store. Every invariant-bearing primitive is a single
/// conditional statement, so concurrent API instances stay consistent.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn with_attempts(&self, mut token: ClaimToken) -> StoreResult<ClaimToken> {
        let rows = sqlx::query(
            "SELECT attempted_at, ip, user_agent, email, success, failure_reason \
             FROM claim_attempts WHERE token_id = $1 ORDER BY id",
        )
        .bind(token.id)
        .fetch_all(&self.pool)
        .await?;

        token.claim_attempts = rows.iter().map(attempt_from_row).collect::<StoreResult<_>>()?;
        Ok(token)
    }

    async fn hydrate(&self, row: Option<PgRow>) -> StoreResult<Option<ClaimToken>> {
        match row {
            Some(row) => Ok(Some(self.with_attempts(token_from_row(&row)?).await?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO tenants (id, name, status, limit_users, limit_cards, limit_profiles, limit_storage_mb, \
             usage_users, usage_cards, usage_profiles, usage_storage_mb, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(tenant.id)
        .bind(&tenant.name)
        .bind(tenant.status.as_str())
        .bind(tenant.limits.users)
        .bind(tenant.limits.cards)
        .bind(tenant.limits.profiles)
        .bind(tenant.limits.storage_mb)
        .bind(tenant.usage.users)
        .bind(tenant.usage.cards)
        .bind(tenant.usage.profiles)
        .bind(tenant.usage.storage_mb)
        .bind(tenant.created_at)
        .bind(tenant.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_tenant(&self, id: Uuid) -> StoreResult<Option<Tenant>> {
        let sql = format!("SELECT {} FROM tenants WHERE id = $1", TENANT_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(tenant_from_row).transpose()
    }

    async fn set_tenant_status(&self, id: Uuid, status: TenantStatus) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE tenants SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn try_reserve(
        &self,
        tenant_id: Uuid,
        resource: ResourceClass,
        amount: i64,
    ) -> StoreResult<Option<ReserveOutcome>> {
        let (limit_col, usage_col) = counter_columns(resource);

        let sql = format!(
            "UPDATE tenants SET {usage} = {usage} + $2, updated_at = now() \
             WHERE id = $1 AND status IN ('active', 'trial') \
               AND ({limit} = -1 OR {usage} + $2 <= {limit}) \
             RETURNING {usage}",
            usage = usage_col,
            limit = limit_col
        );
        let reserved: Option<(i64,)> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(amount)
            .fetch_optional(&self.pool)
            .await?;
        if let Some((usage,)) = reserved {
            return Ok(Some(ReserveOutcome::Reserved { usage }));
        }

        // Nothing matched: tell a missing tenant from a frozen or full one
        let sql = format!("SELECT status, {}, {} FROM tenants WHERE id = $1", limit_col, usage_col);
        let row: Option<(String, i64, i64)> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some((status, limit, current)) = row else {
            return Ok(None);
        };
        let status = TenantStatus::parse(&status).ok_or_else(|| corrupt("tenant status", &status))?;
        if !status.is_operational() {
            return Ok(Some(ReserveOutcome::Inactive(status)));
        }
        Ok(Some(ReserveOutcome::Exceeded { limit, current }))
    }

    async fn release(
        &self,
        tenant_id: Uuid,
        resource: ResourceClass,
        amount: i64,
    ) -> StoreResult<Option<i64>> {
        let (_, usage_col) = counter_columns(resource);
        let sql = format!(
            "UPDATE tenants SET {usage} = GREATEST({usage} - $2, 0), updated_at = now() \
             WHERE id = $1 RETURNING {usage}",
            usage = usage_col
        );
        let row: Option<(i64,)> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(amount)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(usage,)| usage))
    }

    async fn get_membership(&self, tenant_id: Uuid, user_id: Uuid) -> StoreResult<Option<Membership>> {
        let row = sqlx::query(
            "SELECT tenant_id, user_id, email, role, joined_at FROM memberships \
             WHERE tenant_id = $1 AND user_id = $2",
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(membership_from_row).transpose()
    }

    async fn insert_membership(&self, membership: &Membership) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO memberships (tenant_id, user_id, email, role, joined_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(membership.tenant_id)
        .bind(membership.user_id)
        .bind(&membership.email)
        .bind(membership.role.as_str())
        .bind(membership.joined_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_membership(&self, tenant_id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM memberships WHERE tenant_id = $1 AND user_id = $2")
            .bind(tenant_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_profile(&self, id: Uuid) -> StoreResult<Option<Profile>> {
        let row = sqlx::query("SELECT id, tenant_id, user_id, display_name, created_at FROM profiles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn insert_profile(&self, profile: &Profile) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO profiles (id, tenant_id, user_id, display_name, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(profile.id)
        .bind(profile.tenant_id)
        .bind(profile.user_id)
        .bind(&profile.display_name)
        .bind(profile.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_profile(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM profiles WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn card_code_exists(&self, code: &str) -> StoreResult<bool> {
        let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM cards WHERE card_code = $1)")
            .bind(code)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn insert_card(&self, card: &Card) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO cards ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, \
             $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)",
            CARD_COLUMNS
        );
        sqlx::query(&sql)
            .bind(card.id)
            .bind(card.tenant_id)
            .bind(&card.card_code)
            .bind(&card.serial_number)
            .bind(&card.sku)
            .bind(&card.batch_number)
            .bind(&card.product_line)
            .bind(&card.attributes)
            .bind(&card.redirect_url)
            .bind(card.status.as_str())
            .bind(card.lifecycle_stage.as_str())
            .bind(card.assigned_to)
            .bind(card.assigned_profile)
            .bind(card.claim_token_id)
            .bind(card.tap_count)
            .bind(card.view_count)
            .bind(card.last_tapped_at)
            .bind(card.version)
            .bind(card.created_at)
            .bind(card.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_card(&self, id: Uuid) -> StoreResult<Option<Card>> {
        let sql = format!("SELECT {} FROM cards WHERE id = $1", CARD_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(card_from_row).transpose()
    }

    async fn get_card_by_code(&self, code: &str) -> StoreResult<Option<Card>> {
        let sql = format!("SELECT {} FROM cards WHERE card_code = $1", CARD_COLUMNS);
        let row = sqlx::query(&sql).bind(code).fetch_optional(&self.pool).await?;
        row.as_ref().map(card_from_row).transpose()
    }

    async fn update_card(&self, card: &Card) -> StoreResult<bool> {
        // Counters are owned by record_hit and deliberately not written here
        let result = sqlx::query(
            "UPDATE cards SET serial_number = $3, sku = $4, batch_number = $5, product_line = $6, \
             attributes = $7, redirect_url = $8, status = $9, lifecycle_stage = $10, assigned_to = $11, \
             assigned_profile = $12, claim_token_id = $13, updated_at = $14, version = version + 1 \
             WHERE id = $1 AND version = $2",
        )
        .bind(card.id)
        .bind(card.version)
        .bind(&card.serial_number)
        .bind(&card.sku)
        .bind(&card.batch_number)
        .bind(&card.product_line)
        .bind(&card.attributes)
        .bind(&card.redirect_url)
        .bind(card.status.as_str())
        .bind(card.lifecycle_stage.as_str())
        .bind(card.assigned_to)
        .bind(card.assigned_profile)
        .bind(card.claim_token_id)
        .bind(card.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_hit(
        &self,
        card_id: Uuid,
        kind: HitKind,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Card>> {
        let set = match kind {
            HitKind::Tap => "tap_count = tap_count + 1, last_tapped_at = $2",
            HitKind::View => "view_count = view_count + 1",
        };
        let sql = format!("UPDATE cards SET {} WHERE id = $1 RETURNING {}", set, CARD_COLUMNS);
        let mut query = sqlx::query(&sql).bind(card_id);
        if kind == HitKind::Tap {
            query = query.bind(at);
        }
        let row = query.fetch_optional(&self.pool).await?;
        row.as_ref().map(card_from_row).transpose()
    }

    async fn append_assignment(&self, entry: AssignmentEntry) -> StoreResult<AssignmentEntry> {
        let (seq,): (i64,) = sqlx::query_as(
            "INSERT INTO card_assignments (card_id, user_id, profile_id, actor_id, reason, recorded_at) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING seq",
        )
        .bind(entry.card_id)
        .bind(entry.user_id)
        .bind(entry.profile_id)
        .bind(entry.actor_id)
        .bind(&entry.reason)
        .bind(entry.recorded_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(AssignmentEntry { seq, ..entry })
    }

    async fn list_assignments(&self, card_id: Uuid, page: Page) -> StoreResult<Vec<AssignmentEntry>> {
        let rows = sqlx::query(
            "SELECT seq, card_id, user_id, profile_id, actor_id, reason, recorded_at \
             FROM card_assignments WHERE card_id = $1 ORDER BY seq OFFSET $2 LIMIT $3",
        )
        .bind(card_id)
        .bind(page.offset)
        .bind(page.limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(assignment_from_row).collect()
    }

    async fn insert_claim_token(&self, token: &ClaimToken) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO claim_tokens ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, \
             $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23)",
            TOKEN_COLUMNS
        );
        sqlx::query(&sql)
            .bind(token.id)
            .bind(&token.token_hash)
            .bind(token.tenant_id)
            .bind(token.card_id)
            .bind(&token.assigned_to.email)
            .bind(&token.assigned_to.name)
            .bind(&token.assigned_to.phone)
            .bind(token.status.as_str())
            .bind(token.expires_at)
            .bind(token.max_uses)
            .bind(token.used_count)
            .bind(token.require_email_verification)
            .bind(token.email_verified)
            .bind(&token.verification_code_hash)
            .bind(token.verification_code_expires)
            .bind(token.claimed_by)
            .bind(token.claimed_at)
            .bind(&token.revoked_reason)
            .bind(token.revoked_at)
            .bind(token.created_by)
            .bind(token.version)
            .bind(token.created_at)
            .bind(token.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_claim_token(&self, id: Uuid) -> StoreResult<Option<ClaimToken>> {
        let sql = format!("SELECT {} FROM claim_tokens WHERE id = $1", TOKEN_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        self.hydrate(row).await
    }

    async fn get_claim_token_by_hash(&self, token_hash: &str) -> StoreResult<Option<ClaimToken>> {
        let sql = format!("SELECT {} FROM claim_tokens WHERE token_hash = $1", TOKEN_COLUMNS);
        let row = sqlx::query(&sql).bind(token_hash).fetch_optional(&self.pool).await?;
        self.hydrate(row).await
    }

    async fn update_claim_token(&self, token: &ClaimToken) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE claim_tokens SET status = $3, expires_at = $4, email_verified = $5, \
             verification_code_hash = $6, verification_code_expires = $7, claimed_by = $8, claimed_at = $9, \
             revoked_reason = $10, revoked_at = $11, updated_at = $12, version = version + 1 \
             WHERE id = $1 AND version = $2",
        )
        .bind(token.id)
        .bind(token.version)
        .bind(token.status.as_str())
        .bind(token.expires_at)
        .bind(token.email_verified)
        .bind(&token.verification_code_hash)
        .bind(token.verification_code_expires)
        .bind(token.claimed_by)
        .bind(token.claimed_at)
        .bind(&token.revoked_reason)
        .bind(token.revoked_at)
        .bind(token.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn consume_claim_token(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<ClaimToken>> {
        let sql = format!(
            "UPDATE claim_tokens SET used_count = used_count + 1, \
               status = CASE WHEN used_count + 1 >= max_uses THEN 'claimed' ELSE status END, \
               updated_at = $2, version = version + 1 \
             WHERE id = $1 AND status = 'pending' AND expires_at > $2 AND used_count < max_uses \
             RETURNING {}",
            TOKEN_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        self.hydrate(row).await
    }

    async fn restore_claim_token(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE claim_tokens SET used_count = used_count - 1, \
               status = CASE WHEN status = 'claimed' THEN 'pending' ELSE status END, \
               updated_at = $2, version = version + 1 \
             WHERE id = $1 AND used_count > 0",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_claimant(&self, id: Uuid, claimed_by: Uuid, now: DateTime<Utc>) -> StoreResult<Option<ClaimToken>> {
        let sql = format!(
            "UPDATE claim_tokens SET claimed_by = $2, claimed_at = $3, updated_at = $3, version = version + 1 \
             WHERE id = $1 RETURNING {}",
            TOKEN_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(claimed_by)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        self.hydrate(row).await
    }

    async fn append_claim_attempt(
        &self,
        id: Uuid,
        attempt: ClaimAttempt,
        capacity: usize,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO claim_attempts (token_id, attempted_at, ip, user_agent, email, success, failure_reason) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(id)
        .bind(attempt.timestamp)
        .bind(&attempt.ip)
        .bind(&attempt.user_agent)
        .bind(&attempt.email)
        .bind(attempt.success)
        .bind(&attempt.failure_reason)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM claim_attempts WHERE token_id = $1 AND id NOT IN \
             (SELECT id FROM claim_attempts WHERE token_id = $1 ORDER BY id DESC LIMIT $2)",
        )
        .bind(id)
        .bind(capacity as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn expire_stale_claim_tokens(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE claim_tokens SET status = 'expired', updated_at = $1, version = version + 1 \
             WHERE status = 'pending' AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for PgStore {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        sqlx::query(
            "INSERT INTO audit_logs (id, tenant_id, actor_id, action, resource_kind, resource_id, changes, \
             ip, user_agent, severity, recorded_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(event.id)
        .bind(event.tenant_id)
        .bind(event.actor_id)
        .bind(&event.action)
        .bind(&event.resource.kind)
        .bind(event.resource.id)
        .bind(&event.changes)
        .bind(&event.context.ip)
        .bind(&event.context.user_agent)
        .bind(event.severity.as_str())
        .bind(event.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AuditError::WriteFailed(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_resource_has_distinct_columns() {
        let mut seen = std::collections::HashSet::new();
        for resource in ResourceClass::ALL {
            let (limit, usage) = counter_columns(resource);
            assert!(limit.starts_with("limit_") && usage.starts_with("usage_"));
            assert_eq!(&limit["limit_".len()..], resource.as_str());
            assert_eq!(&usage["usage_".len()..], resource.as_str());
            assert!(seen.insert(usage));
        }
    }

    #[test]
    fn column_lists_match_bind_counts() {
        assert_eq!(CARD_COLUMNS.split(',').count(), 20);
        assert_eq!(TOKEN_COLUMNS.split(',').count(), 23);
        assert_eq!(TENANT_COLUMNS.split(',').count(), 13);
    }
}
