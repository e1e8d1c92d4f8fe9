use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Operational status of a card. This axis alone decides public redirects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Inventory,
    Provisioned,
    Active,
    Suspended,
    Deactivated,
}

impl CardStatus {
    pub const ALL: [CardStatus; 5] = [
        CardStatus::Inventory,
        CardStatus::Provisioned,
        CardStatus::Active,
        CardStatus::Suspended,
        CardStatus::Deactivated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::Inventory => "inventory",
            CardStatus::Provisioned => "provisioned",
            CardStatus::Active => "active",
            CardStatus::Suspended => "suspended",
            CardStatus::Deactivated => "deactivated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inventory" => Some(CardStatus::Inventory),
            "provisioned" => Some(CardStatus::Provisioned),
            "active" => Some(CardStatus::Active),
            "suspended" => Some(CardStatus::Suspended),
            "deactivated" => Some(CardStatus::Deactivated),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CardStatus::Deactivated)
    }
}

impl std::fmt::Display for CardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical-provisioning progress. Telemetry only, never a guard input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    Manufactured,
    Encoded,
    Claimed,
    Retired,
}

impl LifecycleStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStage::Manufactured => "manufactured",
            LifecycleStage::Encoded => "encoded",
            LifecycleStage::Claimed => "claimed",
            LifecycleStage::Retired => "retired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manufactured" => Some(LifecycleStage::Manufactured),
            "encoded" => Some(LifecycleStage::Encoded),
            "claimed" => Some(LifecycleStage::Claimed),
            "retired" => Some(LifecycleStage::Retired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Card {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Human-readable identifier printed on / encoded into the card
    pub card_code: String,
    pub serial_number: Option<String>,
    pub sku: Option<String>,
    pub batch_number: Option<String>,
    pub product_line: Option<String>,
    pub attributes: Value,
    pub redirect_url: Option<String>,
    pub status: CardStatus,
    pub lifecycle_stage: LifecycleStage,
    pub assigned_to: Option<Uuid>,
    pub assigned_profile: Option<Uuid>,
    pub claim_token_id: Option<Uuid>,
    pub tap_count: i64,
    pub view_count: i64,
    pub last_tapped_at: Option<DateTime<Utc>>,
    /// Compare-and-swap counter; bumped by the store on every committed update
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields shared by single and bulk creation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardTemplate {
    pub sku: Option<String>,
    pub batch_number: Option<String>,
    pub product_line: Option<String>,
    #[serde(default)]
    pub attributes: Option<Value>,
    /// Supports `{code}`, `{index}` and `{batch}` placeholders
    pub url_template: Option<String>,
}

impl CardTemplate {
    pub fn render_url(&self, code: &str, index: usize, batch: Option<&str>) -> Option<String> {
        self.url_template.as_ref().map(|template| {
            template
                .replace("{code}", code)
                .replace("{index}", &index.to_string())
                .replace("{batch}", batch.unwrap_or(""))
        })
    }
}

impl Card {
    /// Fresh card in `inventory / manufactured`
    pub fn new(
        tenant_id: Uuid,
        card_code: String,
        template: &CardTemplate,
        index: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let batch_number = template.batch_number.clone();
        let redirect_url = template.render_url(&card_code, index, batch_number.as_deref());

        Self {
            id: Uuid::new_v4(),
            tenant_id,
            card_code,
            serial_number: None,
            sku: template.sku.clone(),
            batch_number,
            product_line: template.product_line.clone(),
            attributes: template.attributes.clone().unwrap_or(Value::Object(Default::default())),
            redirect_url,
            status: CardStatus::Inventory,
            lifecycle_stage: LifecycleStage::Manufactured,
            assigned_to: None,
            assigned_profile: None,
            claim_token_id: None,
            tap_count: 0,
            view_count: 0,
            last_tapped_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One row of the append-only assignment log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentEntry {
    /// Increases with each append and orders a card's history. Gaps and
    /// starting values depend on the store.
    pub seq: i64,
    pub card_id: Uuid,
    pub user_id: Option<Uuid>,
    pub profile_id: Option<Uuid>,
    pub actor_id: Uuid,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Which public counter a hit increments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitKind {
    Tap,
    View,
}
