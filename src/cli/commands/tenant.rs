use clap::Subcommand;
use serde_json::json;
use uuid::Uuid;

use crate::cli::utils::{output_record, output_success};
use crate::cli::{connect_engine, OutputFormat};
use crate::models::{ResourceCounters, TenantStatus, UsageReport, UNBOUNDED};

#[derive(Subcommand)]
pub enum TenantCommands {
    #[command(about = "Create a tenant and its owner membership")]
    Create {
        #[arg(help = "Tenant name")]
        name: String,

        #[arg(long, help = "Owner email address")]
        owner_email: String,

        #[arg(long, help = "Owner user id (generated when omitted)")]
        owner_id: Option<Uuid>,

        #[arg(long, default_value_t = UNBOUNDED, allow_hyphen_values = true, help = "Member limit, -1 for unbounded")]
        max_users: i64,

        #[arg(long, default_value_t = UNBOUNDED, allow_hyphen_values = true, help = "Card limit, -1 for unbounded")]
        max_cards: i64,

        #[arg(long, default_value_t = UNBOUNDED, allow_hyphen_values = true, help = "Profile limit, -1 for unbounded")]
        max_profiles: i64,

        #[arg(long, default_value_t = UNBOUNDED, allow_hyphen_values = true, help = "Storage limit in MB, -1 for unbounded")]
        max_storage_mb: i64,
    },

    #[command(about = "Set tenant status: active, trial, suspended or expired")]
    Status {
        #[arg(help = "Tenant ID")]
        tenant: Uuid,

        #[arg(value_parser = parse_status, help = "New status")]
        status: TenantStatus,
    },

    #[command(about = "Show tenant status, limits and usage")]
    Show {
        #[arg(help = "Tenant ID")]
        tenant: Uuid,
    },
}

pub async fn handle(cmd: TenantCommands, output_format: OutputFormat) -> anyhow::Result<()> {
    match cmd {
        TenantCommands::Create {
            name,
            owner_email,
            owner_id,
            max_users,
            max_cards,
            max_profiles,
            max_storage_mb,
        } => {
            let limits = ResourceCounters {
                users: max_users,
                cards: max_cards,
                profiles: max_profiles,
                storage_mb: max_storage_mb,
            };
            if limits_are_invalid(&limits) {
                anyhow::bail!("limits must be -1 (unbounded) or a non-negative number");
            }

            let owner_id = owner_id.unwrap_or_else(Uuid::new_v4);
            let engine = connect_engine().await?;
            let tenant = engine.create_tenant(&name, limits, owner_id, &owner_email).await?;

            output_success(
                output_format,
                &format!("Created tenant '{}' ({}) owned by {}", tenant.name, tenant.id, owner_id),
                json!({ "tenant": tenant, "owner_id": owner_id }),
            )
        }
        TenantCommands::Status { tenant, status } => {
            let engine = connect_engine().await?;
            let tenant = engine.set_tenant_status(tenant, status).await?;
            output_success(
                output_format,
                &format!("Tenant '{}' is now {}", tenant.name, tenant.status.as_str()),
                json!({ "tenant": tenant }),
            )
        }
        TenantCommands::Show { tenant } => {
            let engine = connect_engine().await?;
            let tenant = engine.tenant(tenant).await?;
            let report = UsageReport::from_tenant(&tenant);

            output_record(
                output_format,
                &json!({
                    "id": tenant.id,
                    "name": tenant.name,
                    "status": tenant.status,
                    "usage": report.resources,
                }),
            )
        }
    }
}

fn parse_status(raw: &str) -> Result<TenantStatus, String> {
    TenantStatus::parse(&raw.to_ascii_lowercase()).ok_or_else(|| format!("unknown tenant status '{}'", raw))
}

fn limits_are_invalid(limits: &ResourceCounters) -> bool {
    [limits.users, limits.cards, limits.profiles, limits.storage_mb]
        .iter()
        .any(|&limit| limit < UNBOUNDED)
}
