use clap::Subcommand;
use serde_json::json;

use crate::cli::utils::output_success;
use crate::cli::{connect_engine, OutputFormat};

#[derive(Subcommand)]
pub enum ClaimCommands {
    #[command(about = "Mark pending claim tokens past their expiry as expired")]
    Sweep,
}

pub async fn handle(cmd: ClaimCommands, output_format: OutputFormat) -> anyhow::Result<()> {
    match cmd {
        ClaimCommands::Sweep => {
            let engine = connect_engine().await?;
            let expired = engine.sweep_claims().await?;
            output_success(
                output_format,
                &format!("Expired {} claim token(s)", expired),
                json!({ "expired": expired }),
            )
        }
    }
}
