use clap::Subcommand;

use crate::cli::utils::output_record;
use crate::cli::OutputFormat;
use crate::config;

#[derive(Subcommand)]
pub enum ConfigCommands {
    #[command(about = "Print the effective configuration (secrets omitted)")]
    Show,
}

pub async fn handle(cmd: ConfigCommands, output_format: OutputFormat) -> anyhow::Result<()> {
    match cmd {
        ConfigCommands::Show => output_record(output_format, &serde_json::to_value(config::config())?),
    }
}
