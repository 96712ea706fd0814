//! Command-line interface.
//!
//! `admin create-token` is the only place an admin-role token can be
//! minted; it talks to the database directly and never crosses the HTTP
//! surface.

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::auth::authenticator::{generate_credential, hash_credential};
use crate::auth::Role;
use crate::store::postgres::{NewToken, PgStore};

/// pdf2md — PDF-to-markdown conversion service
#[derive(Parser)]
#[command(name = "pdf2md", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the API server and conversion worker
    Serve {
        /// Port to bind
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },

    /// Manage API tokens out-of-band
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
}

#[derive(Subcommand)]
pub enum AdminCommands {
    /// Create a token; the secret is printed once and never stored
    CreateToken {
        #[arg(long)]
        user_id: String,
        /// admin, job_manager, job_writer or job_reader
        #[arg(long, default_value = "job_reader")]
        role: String,
        /// Expiry in days from now; omit for a non-expiring token
        #[arg(long)]
        expires_days: Option<i64>,
        /// Requests per minute; defaults to the role's limit
        #[arg(long)]
        rate_limit: Option<i32>,
    },
    /// List all tokens (hashes redacted)
    ListTokens,
    /// Delete a token; its usage records are kept
    Revoke {
        #[arg(long)]
        token_id: Uuid,
    },
    /// Re-activate a disabled token
    Enable {
        #[arg(long)]
        token_id: Uuid,
    },
    /// Deactivate a token without deleting it
    Disable {
        #[arg(long)]
        token_id: Uuid,
    },
}

pub async fn handle_admin_command(
    db: &PgStore,
    pepper: &str,
    command: AdminCommands,
) -> anyhow::Result<()> {
    match command {
        AdminCommands::CreateToken {
            user_id,
            role,
            expires_days,
            rate_limit,
        } => {
            let role = Role::parse(&role)
                .ok_or_else(|| anyhow::anyhow!("unknown role '{role}'"))?;
            let rate_limit = rate_limit.unwrap_or_else(|| role.default_rate_limit());
            if rate_limit <= 0 {
                anyhow::bail!("rate limit must be positive");
            }

            let credential = generate_credential();
            let token = NewToken {
                token_id: Uuid::new_v4(),
                token_hash: hash_credential(pepper, &credential),
                user_id,
                role: role.as_str().to_string(),
                expires_at: expires_days.map(|d| Utc::now() + Duration::days(d)),
                rate_limit,
                created_by: None,
            };
            db.insert_token(&token).await?;

            println!("Token created.");
            println!("  token_id:   {}", token.token_id);
            println!("  user_id:    {}", token.user_id);
            println!("  role:       {}", token.role);
            println!("  rate_limit: {} req/min", token.rate_limit);
            match token.expires_at {
                Some(at) => println!("  expires_at: {at}"),
                None => println!("  expires_at: never"),
            }
            println!();
            println!("  {credential}");
            println!();
            println!("Store this secret now; it cannot be recovered later.");
        }
        AdminCommands::ListTokens => {
            let tokens = db.list_tokens().await?;
            if tokens.is_empty() {
                println!("No tokens.");
                return Ok(());
            }
            for t in tokens {
                println!(
                    "{}  {:<12}  user={}  active={}  rate={}/min  last_used={}",
                    t.token_id,
                    t.role,
                    t.user_id,
                    t.is_active,
                    t.rate_limit,
                    t.last_used_at
                        .map(|ts| ts.to_rfc3339())
                        .unwrap_or_else(|| "never".into()),
                );
            }
        }
        AdminCommands::Revoke { token_id } => {
            if db.delete_token(token_id).await? {
                println!("Token {token_id} revoked.");
            } else {
                anyhow::bail!("token {token_id} not found");
            }
        }
        AdminCommands::Enable { token_id } => {
            if db.set_token_active(token_id, true).await? {
                println!("Token {token_id} enabled.");
            } else {
                anyhow::bail!("token {token_id} not found");
            }
        }
        AdminCommands::Disable { token_id } => {
            if db.set_token_active(token_id, false).await? {
                println!("Token {token_id} disabled.");
            } else {
                anyhow::bail!("token {token_id} not found");
            }
        }
    }
    Ok(())
}
