//! kitchencraft: actor host and state-sync server.
//!
//! Serves user and thread actors over HTTP and WebSocket, or mints
//! capability tokens for testing.

use anyhow::Result;
use clap::Parser;

use kitchencraft_server::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    kitchencraft_server::run_with_cli(cli).await
}
