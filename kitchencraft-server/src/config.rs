use std::time::Duration;

use anyhow::{bail, Result};
use kitchencraft_kit::{ReconnectPolicy, RuntimeConfig, TokenIssuer};

use crate::cli::{KeyArgs, ServeArgs};

/// Token signing settings
#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub key_id: String,
    pub secret: String,
    /// Retired key still accepted for verification
    pub previous: Option<(String, String)>,
    pub ttl: Duration,
}

impl TokenSettings {
    pub fn from_keys(keys: &KeyArgs) -> Result<Self> {
        if keys.signing_secret.is_empty() {
            bail!("signing secret must not be empty");
        }
        if keys.token_ttl_secs == 0 {
            bail!("token ttl must be positive");
        }
        Ok(Self {
            key_id: keys.key_id.clone(),
            secret: keys.signing_secret.clone(),
            previous: None,
            ttl: Duration::from_secs(keys.token_ttl_secs),
        })
    }

    pub fn issuer(&self) -> TokenIssuer {
        let mut issuer =
            TokenIssuer::new(self.key_id.clone(), self.secret.as_bytes()).with_ttl(self.ttl);
        if let Some((kid, secret)) = &self.previous {
            issuer.retain_key(kid.clone(), secret.as_bytes());
        }
        issuer
    }
}

/// Runtime configuration derived from CLI/env.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub database: String,
    pub tokens: TokenSettings,
    pub runtime: RuntimeConfig,
    /// Base URL of the host that runs child actors, if not this one
    pub remote: Option<String>,
}

impl ServerConfig {
    pub fn from_cli(args: &ServeArgs) -> Result<Self> {
        let mut tokens = TokenSettings::from_keys(&args.keys)?;
        if let Some(secret) = &args.previous_secret {
            if args.previous_key_id == tokens.key_id {
                bail!("previous key id must differ from the active key id");
            }
            tokens.previous = Some((args.previous_key_id.clone(), secret.clone()));
        }
        if args.inbox_capacity == 0 || args.subscriber_capacity == 0 {
            bail!("inbox and subscriber capacities must be positive");
        }

        let runtime = RuntimeConfig {
            inbox_capacity: args.inbox_capacity,
            subscriber_capacity: args.subscriber_capacity,
            reconnect: ReconnectPolicy {
                max_attempts: args.reconnect_attempts,
                delay: Duration::from_millis(args.reconnect_delay_ms),
            },
        };

        Ok(Self {
            listen_addr: args.listen_addr.clone(),
            database: args.database.clone(),
            tokens,
            runtime,
            remote: args.remote.clone(),
        })
    }
}
