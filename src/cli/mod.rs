pub mod commands;
pub mod utils;

use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::config::{self, StoreBackend};
use crate::database::{DatabaseManager, PgStore};
use crate::engine::Engine;

#[derive(Parser)]
#[command(name = "tapcard")]
#[command(about = "Tap-Card CLI - tenant bootstrap and operator tasks")]
#[command(version)]
pub struct Cli {
    #[arg(long, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Create and inspect tenants")]
    Tenant {
        #[command(subcommand)]
        cmd: commands::tenant::TenantCommands,
    },

    #[command(about = "Issue development session tokens")]
    Token {
        #[command(subcommand)]
        cmd: commands::token::TokenCommands,
    },

    #[command(about = "Claim token maintenance")]
    Claims {
        #[command(subcommand)]
        cmd: commands::claims::ClaimCommands,
    },

    #[command(about = "Inspect the effective configuration")]
    Config {
        #[command(subcommand)]
        cmd: commands::config::ConfigCommands,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_cli(cli: &Cli) -> Self {
        if cli.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }
}

/// Engine over the configured PostgreSQL database. Operator commands make no
/// sense against the in-memory store, which lives only inside a server process.
pub async fn connect_engine() -> anyhow::Result<Engine> {
    let config = config::config();
    if config.store.backend != StoreBackend::Postgres {
        anyhow::bail!("this command needs STORE_BACKEND=postgres and DATABASE_URL");
    }

    let pool = DatabaseManager::connect(&config.database).await?;
    Ok(Engine::builder(Arc::new(PgStore::new(pool)))
        .claim_settings(config.claim.clone())
        .card_settings(config.cards.clone())
        .build())
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let output_format = OutputFormat::from_cli(&cli);

    match cli.command {
        Commands::Tenant { cmd } => commands::tenant::handle(cmd, output_format).await,
        Commands::Token { cmd } => commands::token::handle(cmd, output_format).await,
        Commands::Claims { cmd } => commands::claims::handle(cmd, output_format).await,
        Commands::Config { cmd } => commands::config::handle(cmd, output_format).await,
    }
}
