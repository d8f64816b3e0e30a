//! Library entrypoint for kitchencraft-server so tests and other binaries
//! can host the actors without shelling out.

pub mod actors;
pub mod auth;
pub mod cli;
pub mod config;
pub mod remote;
pub mod server;

use anyhow::{anyhow, Result};
use kitchencraft_kit::{ActorKey, Caller, CallerType};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{
    cli::{Cli, Command, TokenArgs},
    config::{ServerConfig, TokenSettings},
};

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Mint a token from CLI arguments
pub fn mint_token(args: &TokenArgs) -> Result<String> {
    let issuer = TokenSettings::from_keys(&args.keys)?.issuer();
    let caller_type: CallerType = args.caller_type.parse().map_err(|e: String| anyhow!(e))?;
    if caller_type == CallerType::System {
        return Err(anyhow!("system tokens are never issued"));
    }
    let key = ActorKey::new(args.actor_type.as_str(), args.actor_id.clone());
    let token = issuer.issue(&key, &Caller::new(args.caller_id.clone(), caller_type))?;
    info!(actor = %key, caller = %args.caller_id, ttl = ?issuer.ttl(), "token minted");
    Ok(token)
}

/// Run the CLI (parsed by the caller).
pub async fn run_with_cli(cli: Cli) -> Result<()> {
    init_tracing(cli.verbose)?;

    match cli.command {
        Command::Serve(args) => {
            let cfg = ServerConfig::from_cli(&args)?;
            server::serve(cfg).await
        }
        Command::Token(args) => {
            println!("{}", mint_token(&args)?);
            Ok(())
        }
    }
}
