use clap::Subcommand;
use serde_json::json;
use uuid::Uuid;

use crate::auth::{generate_jwt, Claims};
use crate::cli::utils::output_record;
use crate::cli::OutputFormat;

#[derive(Subcommand)]
pub enum TokenCommands {
    #[command(about = "Sign a session JWT with the configured secret")]
    Issue {
        #[arg(long, help = "User id (the JWT subject)")]
        user_id: Uuid,

        #[arg(long, help = "User email; claims are matched against it")]
        email: String,

        #[arg(long, help = "Tenant the session acts in")]
        tenant_id: Option<Uuid>,
    },
}

pub async fn handle(cmd: TokenCommands, output_format: OutputFormat) -> anyhow::Result<()> {
    match cmd {
        TokenCommands::Issue { user_id, email, tenant_id } => {
            let claims = Claims::new(user_id, email, tenant_id);
            let token = generate_jwt(&claims)?;

            match output_format {
                OutputFormat::Json => output_record(
                    output_format,
                    &json!({ "token": token, "expires_at": claims.exp, "sub": claims.sub }),
                ),
                // Bare token so it can be captured with $(tapcard token issue ...)
                OutputFormat::Text => {
                    println!("{}", token);
                    Ok(())
                }
            }
        }
    }
}
