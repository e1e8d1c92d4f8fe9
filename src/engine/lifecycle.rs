//! Pure decision functions over explicit snapshots.
//!
//! Nothing here touches storage or the clock: callers load a snapshot, ask
//! for a decision, and commit through the store's conditional primitives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    Card, CardStatus, ClaimStatus, ClaimToken, LifecycleStage, ResourceClass, Tenant, UNBOUNDED,
};

/// Operations that move a card through its state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardOp {
    GenerateClaim,
    RedeemClaim,
    Assign,
    Unassign,
    Reassign,
    Activate,
    Deactivate,
    Suspend,
    Unsuspend,
}

impl CardOp {
    pub const ALL: [CardOp; 9] = [
        CardOp::GenerateClaim,
        CardOp::RedeemClaim,
        CardOp::Assign,
        CardOp::Unassign,
        CardOp::Reassign,
        CardOp::Activate,
        CardOp::Deactivate,
        CardOp::Suspend,
        CardOp::Unsuspend,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CardOp::GenerateClaim => "generate_claim",
            CardOp::RedeemClaim => "redeem_claim",
            CardOp::Assign => "assign",
            CardOp::Unassign => "unassign",
            CardOp::Reassign => "reassign",
            CardOp::Activate => "activate",
            CardOp::Deactivate => "deactivate",
            CardOp::Suspend => "suspend",
            CardOp::Unsuspend => "unsuspend",
        }
    }
}

impl std::fmt::Display for CardOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A guard refused the transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionDenied {
    pub current: CardStatus,
    pub requested: CardOp,
}

/// Status and stage a card lands in after `op`, or why it cannot move.
///
/// This is the whole state-machine table; every pair not matched here is
/// refused.
pub fn plan_transition(
    card: &Card,
    op: CardOp,
) -> Result<(CardStatus, LifecycleStage), TransitionDenied> {
    use CardStatus::*;

    let stage = card.lifecycle_stage;
    let planned = match (card.status, op) {
        (Inventory | Provisioned, CardOp::GenerateClaim) => Some((Provisioned, LifecycleStage::Encoded)),
        (Inventory | Provisioned, CardOp::RedeemClaim) => Some((Active, LifecycleStage::Claimed)),
        (Active, CardOp::Assign) => Some((Active, stage)),
        (Active, CardOp::Unassign) => Some((Active, stage)),
        (Active, CardOp::Reassign) => Some((Active, stage)),
        (Provisioned, CardOp::Reassign) => Some((Active, LifecycleStage::Claimed)),
        (Inventory | Provisioned | Active | Suspended, CardOp::Activate) => Some((Active, stage)),
        (Active, CardOp::Deactivate) => Some((Deactivated, LifecycleStage::Retired)),
        (Active, CardOp::Suspend) => Some((Suspended, stage)),
        (Suspended, CardOp::Unsuspend) => Some((Active, stage)),
        _ => None,
    };

    planned.ok_or(TransitionDenied {
        current: card.status,
        requested: op,
    })
}

/// Pending and not yet past its expiry; says nothing about remaining uses
pub fn token_is_outstanding(token: &ClaimToken, now: DateTime<Utc>) -> bool {
    token.status == ClaimStatus::Pending && now < token.expires_at
}

/// A token may be consumed right now
pub fn token_is_valid(token: &ClaimToken, now: DateTime<Utc>) -> bool {
    token_is_outstanding(token, now) && token.used_count < token.max_uses
}

/// Pending but past expiry: should be flipped to expired on sight
pub fn token_is_stale(token: &ClaimToken, now: DateTime<Utc>) -> bool {
    token.status == ClaimStatus::Pending && now >= token.expires_at
}

/// `outstanding` is the token the card currently references, if any
pub fn is_claimable(card: &Card, outstanding: Option<&ClaimToken>, now: DateTime<Utc>) -> bool {
    let status_ok = matches!(card.status, CardStatus::Inventory | CardStatus::Provisioned);
    let blocked = outstanding.map(|t| token_is_outstanding(t, now)).unwrap_or(false);
    status_ok && !blocked
}

pub fn is_reassignable(card: &Card) -> bool {
    !matches!(card.status, CardStatus::Deactivated | CardStatus::Suspended)
}

/// Public redirects follow `status` only; the lifecycle stage is telemetry
pub fn allows_redirect(card: &Card) -> bool {
    card.status == CardStatus::Active
}

/// `-1` is unbounded and never compared numerically
pub fn fits_within_limit(limit: i64, current: i64, amount: i64) -> bool {
    if limit == UNBOUNDED {
        return true;
    }
    current.saturating_add(amount) <= limit
}

/// Advisory check on a tenant snapshot. Reservations themselves go through
/// the store's atomic increment; this only answers "would it fit right now".
pub fn can_reserve(tenant: &Tenant, resource: ResourceClass, amount: i64) -> bool {
    tenant.status.is_operational()
        && fits_within_limit(tenant.limits.get(resource), tenant.usage.get(resource), amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CardTemplate, Claimant, ResourceCounters, TenantStatus};
    use chrono::Duration;
    use uuid::Uuid;

    fn card_in(status: CardStatus) -> Card {
        let mut card = Card::new(Uuid::new_v4(), "TESTCODE".into(), &CardTemplate::default(), 0, Utc::now());
        card.status = status;
        card
    }

    fn token(status: ClaimStatus, expires_in: Duration) -> ClaimToken {
        let now = Utc::now();
        ClaimToken {
            id: Uuid::new_v4(),
            token_hash: "h".into(),
            tenant_id: Uuid::new_v4(),
            card_id: None,
            assigned_to: Claimant { email: "a@b.c".into(), name: None, phone: None },
            status,
            expires_at: now + expires_in,
            max_uses: 1,
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

    fn allowed(status: CardStatus, op: CardOp) -> bool {
        use CardStatus::*;
        match op {
            CardOp::GenerateClaim | CardOp::RedeemClaim => matches!(status, Inventory | Provisioned),
            CardOp::Assign | CardOp::Unassign | CardOp::Deactivate | CardOp::Suspend => status == Active,
            CardOp::Reassign => matches!(status, Active | Provisioned),
            CardOp::Activate => status != Deactivated,
            CardOp::Unsuspend => status == Suspended,
        }
    }

    #[test]
    fn transition_table_is_closed() {
        for status in CardStatus::ALL {
            for op in CardOp::ALL {
                let card = card_in(status);
                let result = plan_transition(&card, op);
                if allowed(status, op) {
                    assert!(result.is_ok(), "{status} -> {op} should be allowed");
                } else {
                    assert_eq!(
                        result,
                        Err(TransitionDenied { current: status, requested: op }),
                        "{status} -> {op} should be refused"
                    );
                }
            }
        }
    }

    #[test]
    fn deactivation_is_terminal() {
        let card = card_in(CardStatus::Deactivated);
        for op in CardOp::ALL {
            assert!(plan_transition(&card, op).is_err());
        }
    }

    #[test]
    fn deactivate_retires_the_card() {
        let card = card_in(CardStatus::Active);
        assert_eq!(
            plan_transition(&card, CardOp::Deactivate),
            Ok((CardStatus::Deactivated, LifecycleStage::Retired))
        );
    }

    #[test]
    fn claimable_respects_outstanding_token() {
        let now = Utc::now();
        let card = card_in(CardStatus::Provisioned);
        let live = token(ClaimStatus::Pending, Duration::hours(1));
        let stale = token(ClaimStatus::Pending, Duration::hours(-1));
        let revoked = token(ClaimStatus::Revoked, Duration::hours(1));

        assert!(!is_claimable(&card, Some(&live), now));
        assert!(is_claimable(&card, Some(&stale), now));
        assert!(is_claimable(&card, Some(&revoked), now));
        assert!(is_claimable(&card, None, now));
        assert!(!is_claimable(&card_in(CardStatus::Active), None, now));
    }

    #[test]
    fn token_validity_checks_uses_and_expiry() {
        let now = Utc::now();
        let mut t = token(ClaimStatus::Pending, Duration::minutes(5));
        assert!(token_is_valid(&t, now));

        t.used_count = 1;
        assert!(!token_is_valid(&t, now));
        assert!(token_is_outstanding(&t, now));

        let expired = token(ClaimStatus::Pending, Duration::seconds(-1));
        assert!(!token_is_valid(&expired, now));
        assert!(token_is_stale(&expired, now));
    }

    #[test]
    fn reassignable_excludes_frozen_cards() {
        assert!(is_reassignable(&card_in(CardStatus::Active)));
        assert!(is_reassignable(&card_in(CardStatus::Provisioned)));
        assert!(!is_reassignable(&card_in(CardStatus::Suspended)));
        assert!(!is_reassignable(&card_in(CardStatus::Deactivated)));
    }

    #[test]
    fn unbounded_limit_always_fits() {
        assert!(fits_within_limit(UNBOUNDED, i64::MAX - 1, 10));
        assert!(fits_within_limit(3, 2, 1));
        assert!(!fits_within_limit(3, 3, 1));
        assert!(!fits_within_limit(0, 0, 1));
    }

    #[test]
    fn can_reserve_requires_operational_tenant() {
        let mut tenant = Tenant::new("t", ResourceCounters::unbounded(), Utc::now());
        assert!(can_reserve(&tenant, ResourceClass::Cards, 1000));

        tenant.status = TenantStatus::Trial;
        assert!(can_reserve(&tenant, ResourceClass::Cards, 1));

        tenant.status = TenantStatus::Suspended;
        assert!(!can_reserve(&tenant, ResourceClass::Cards, 1));
    }
}
