use clap::{Args, Parser, Subcommand};

/// CLI for the KitchenCraft actor host
#[derive(Debug, Clone, Parser)]
#[command(
    name = "kitchencraft",
    about = "Actor host and state-sync server for KitchenCraft"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Serve actors over HTTP and WebSocket
    Serve(ServeArgs),
    /// Mint a capability token for one actor instance
    Token(TokenArgs),
}

/// Signing keys, shared by `serve` and `token`
#[derive(Debug, Clone, Args)]
pub struct KeyArgs {
    /// Secret for signing capability tokens (HS256)
    #[arg(long, env = "KITCHENCRAFT_SECRET", hide_env_values = true)]
    pub signing_secret: String,

    /// Key id written into the token header
    #[arg(long, env = "KITCHENCRAFT_KEY_ID", default_value = "k1")]
    pub key_id: String,

    /// Token lifetime in seconds
    #[arg(long, env = "KITCHENCRAFT_TOKEN_TTL_SECS", default_value = "300")]
    pub token_ttl_secs: u64,
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Listen address for HTTP/WS endpoints
    #[arg(long, env = "KITCHENCRAFT_ADDR", default_value = "127.0.0.1:8788")]
    pub listen_addr: String,

    #[command(flatten)]
    pub keys: KeyArgs,

    /// Previous signing secret, still accepted for verification
    #[arg(long, env = "KITCHENCRAFT_PREVIOUS_SECRET", hide_env_values = true)]
    pub previous_secret: Option<String>,

    /// Key id of the previous secret
    #[arg(long, env = "KITCHENCRAFT_PREVIOUS_KEY_ID", default_value = "k0")]
    pub previous_key_id: String,

    /// Database URL for actor state
    #[arg(
        long,
        env = "KITCHENCRAFT_DATABASE",
        default_value = "sqlite://kitchencraft.db"
    )]
    pub database: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Runtime options
    // ─────────────────────────────────────────────────────────────────────────

    /// Queued events per actor instance
    #[arg(long, env = "KITCHENCRAFT_INBOX_CAPACITY", default_value = "256")]
    pub inbox_capacity: usize,

    /// Queued frames per subscriber before it is dropped
    #[arg(long, env = "KITCHENCRAFT_SUBSCRIBER_CAPACITY", default_value = "64")]
    pub subscriber_capacity: usize,

    /// Child reconnect attempts before giving up
    #[arg(long, env = "KITCHENCRAFT_RECONNECT_ATTEMPTS", default_value = "5")]
    pub reconnect_attempts: u32,

    /// Delay between child reconnect attempts, in milliseconds
    #[arg(long, env = "KITCHENCRAFT_RECONNECT_DELAY_MS", default_value = "250")]
    pub reconnect_delay_ms: u64,

    /// Host child actors on another server (its base URL, e.g. ws://host:8788)
    #[arg(long, env = "KITCHENCRAFT_REMOTE")]
    pub remote: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct TokenArgs {
    #[command(flatten)]
    pub keys: KeyArgs,

    /// Actor type, e.g. `user`
    pub actor_type: String,

    /// Actor id
    pub actor_id: String,

    /// Caller the token is issued to
    #[arg(long)]
    pub caller_id: String,

    /// Caller type: client or service
    #[arg(long, default_value = "client")]
    pub caller_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["kitchencraft", "serve", "--signing-secret", "s"]).unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.listen_addr, "127.0.0.1:8788");
        assert_eq!(args.database, "sqlite://kitchencraft.db");
        assert_eq!(args.keys.token_ttl_secs, 300);
        assert_eq!(args.inbox_capacity, 256);
        assert_eq!(args.reconnect_attempts, 5);
        assert!(args.previous_secret.is_none());
    }

    #[test]
    fn test_token_subcommand() {
        let cli = Cli::try_parse_from([
            "kitchencraft",
            "token",
            "--signing-secret",
            "s",
            "--caller-id",
            "alice",
            "user",
            "u1",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Command::Token(args) = cli.command else {
            panic!("expected token");
        };
        assert_eq!(args.actor_type, "user");
        assert_eq!(args.caller_type, "client");
    }
}
