use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Limit value meaning "no upper bound" for a resource class.
pub const UNBOUNDED: i64 = -1;

/// Resource classes metered by the quota ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    Users,
    Cards,
    Profiles,
    StorageMb,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 4] = [
        ResourceClass::Users,
        ResourceClass::Cards,
        ResourceClass::Profiles,
        ResourceClass::StorageMb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::Users => "users",
            ResourceClass::Cards => "cards",
            ResourceClass::Profiles => "profiles",
            ResourceClass::StorageMb => "storage_mb",
        }
    }
}

impl std::fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One counter per resource class. Used for both `limits` and `usage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceCounters {
    pub users: i64,
    pub cards: i64,
    pub profiles: i64,
    pub storage_mb: i64,
}

impl ResourceCounters {
    pub fn unbounded() -> Self {
        Self {
            users: UNBOUNDED,
            cards: UNBOUNDED,
            profiles: UNBOUNDED,
            storage_mb: UNBOUNDED,
        }
    }

    pub fn get(&self, resource: ResourceClass) -> i64 {
        match resource {
            ResourceClass::Users => self.users,
            ResourceClass::Cards => self.cards,
            ResourceClass::Profiles => self.profiles,
            ResourceClass::StorageMb => self.storage_mb,
        }
    }

    pub fn get_mut(&mut self, resource: ResourceClass) -> &mut i64 {
        match resource {
            ResourceClass::Users => &mut self.users,
            ResourceClass::Cards => &mut self.cards,
            ResourceClass::Profiles => &mut self.profiles,
            ResourceClass::StorageMb => &mut self.storage_mb,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
    Trial,
    Expired,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Trial => "trial",
            TenantStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TenantStatus::Active),
            "suspended" => Some(TenantStatus::Suspended),
            "trial" => Some(TenantStatus::Trial),
            "expired" => Some(TenantStatus::Expired),
            _ => None,
        }
    }

    /// Trial tenants operate normally; suspended and expired tenants are frozen.
    pub fn is_operational(&self) -> bool {
        matches!(self, TenantStatus::Active | TenantStatus::Trial)
    }
}

/// Organization record as seen by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub status: TenantStatus,
    pub limits: ResourceCounters,
    pub usage: ResourceCounters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(name: impl Into<String>, limits: ResourceCounters, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: TenantStatus::Active,
            limits,
            usage: ResourceCounters::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-resource view used by `GET /tenant/usage`
#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub resource: ResourceClass,
    pub limit: i64,
    pub current: i64,
    /// `None` when the resource is unbounded
    pub remaining: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub tenant_id: Uuid,
    pub status: TenantStatus,
    pub resources: Vec<ResourceUsage>,
}

impl UsageReport {
    pub fn from_tenant(tenant: &Tenant) -> Self {
        let resources = ResourceClass::ALL
            .iter()
            .map(|&resource| {
                let limit = tenant.limits.get(resource);
                let current = tenant.usage.get(resource);
                ResourceUsage {
                    resource,
                    limit,
                    current,
                    remaining: (limit != UNBOUNDED).then(|| (limit - current).max(0)),
                }
            })
            .collect();

        Self {
            tenant_id: tenant.id,
            status: tenant.status,
            resources,
        }
    }
}
