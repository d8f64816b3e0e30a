//! Capability tokens
//!
//! A token is an HS256 JWT asserting `(actorType, actorId, callerId,
//! callerType)`. Holding one authorizes opening a channel to exactly that
//! instance. Keys are addressed by `kid` so a previous secret can keep
//! verifying while a new one signs.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{ActorKey, ActorType, Caller, CallerType};

/// Default token lifetime
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Default clock skew tolerance in seconds
pub const DEFAULT_LEEWAY_SECS: u64 = 30;

/// Claims carried by a capability token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub actor_type: ActorType,
    pub actor_id: String,
    /// Caller id (also the JWT subject)
    #[serde(rename = "sub")]
    pub caller_id: String,
    pub caller_type: CallerType,
    pub iat: u64,
    pub exp: u64,
    /// Unique per minted token, for correlating audit lines
    ///
    /// Not a replay guard: a token is a bearer credential and may be
    /// presented any number of times until `exp`.
    pub jti: String,
}

impl Claims {
    pub fn key(&self) -> ActorKey {
        ActorKey::new(self.actor_type.clone(), self.actor_id.clone())
    }

    pub fn caller(&self) -> Caller {
        Caller::new(self.caller_id.clone(), self.caller_type)
    }

    /// Whether the token is scoped to `key`
    pub fn authorizes(&self, key: &ActorKey) -> bool {
        self.actor_type == key.actor_type && self.actor_id == key.actor_id
    }
}

/// Reasons a token is refused
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TokenError {
    #[error("missing capability token")]
    Missing,

    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("token expired")]
    Expired,

    #[error("unknown key id: {0}")]
    UnknownKeyId(String),

    #[error("token scoped to {actual}, presented to {expected}")]
    ScopeMismatch { expected: ActorKey, actual: ActorKey },

    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// Mints and verifies capability tokens
///
/// The issuer is a capability: whoever is handed one can mint tokens, so it
/// is injected into the runtime rather than reachable globally.
#[derive(Clone)]
pub struct TokenIssuer {
    active_kid: String,
    encoding: EncodingKey,
    /// Verification keys, including the active one
    keys: HashMap<String, DecodingKey>,
    ttl: Duration,
    leeway_secs: u64,
}

impl TokenIssuer {
    /// Create an issuer signing with `secret` under key id `kid`
    pub fn new(kid: impl Into<String>, secret: impl AsRef<[u8]>) -> Self {
        let kid = kid.into();
        let secret = secret.as_ref();
        let mut keys = HashMap::new();
        keys.insert(kid.clone(), DecodingKey::from_secret(secret));
        Self {
            active_kid: kid,
            encoding: EncodingKey::from_secret(secret),
            keys,
            ttl: DEFAULT_TTL,
            leeway_secs: DEFAULT_LEEWAY_SECS,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_leeway(mut self, secs: u64) -> Self {
        self.leeway_secs = secs;
        self
    }

    /// Keep verifying tokens signed by a retired key
    pub fn retain_key(&mut self, kid: impl Into<String>, secret: impl AsRef<[u8]>) {
        let kid = kid.into();
        if kid == self.active_kid {
            return;
        }
        self.keys
            .insert(kid, DecodingKey::from_secret(secret.as_ref()));
    }

    pub fn active_kid(&self) -> &str {
        &self.active_kid
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint a token scoping `caller` to the instance at `key`
    pub fn issue(&self, key: &ActorKey, caller: &Caller) -> Result<String, TokenError> {
        let now = Utc::now().timestamp().max(0) as u64;
        let claims = Claims {
            actor_type: key.actor_type.clone(),
            actor_id: key.actor_id.clone(),
            caller_id: caller.id.clone(),
            caller_type: caller.caller_type,
            iat: now,
            exp: now + self.ttl.as_secs(),
            jti: Uuid::new_v4().to_string(),
        };
        self.sign(&claims)
    }

    fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(self.active_kid.clone());
        encode(&header, claims, &self.encoding).map_err(|e| TokenError::Signing(e.to_string()))
    }

    /// Check signature and expiry without looking at scope
    pub fn decode(&self, token: &str) -> Result<Claims, TokenError> {
        if token.is_empty() {
            return Err(TokenError::Missing);
        }

        let header =
            jsonwebtoken::decode_header(token).map_err(|e| TokenError::Invalid(e.to_string()))?;
        let kid = header.kid.unwrap_or_else(|| self.active_kid.clone());
        let key = self
            .keys
            .get(&kid)
            .ok_or_else(|| TokenError::UnknownKeyId(kid.clone()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.leeway = self.leeway_secs;

        let data = decode::<Claims>(token, key, &validation).map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
            _ => TokenError::Invalid(e.to_string()),
        })?;
        Ok(data.claims)
    }

    /// Verify a token presented against the instance at `expected`
    pub fn verify(&self, token: &str, expected: &ActorKey) -> Result<Claims, TokenError> {
        let claims = self.decode(token)?;
        if !claims.authorizes(expected) {
            return Err(TokenError::ScopeMismatch {
                expected: expected.clone(),
                actual: claims.key(),
            });
        }
        Ok(claims)
    }
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("active_kid", &self.active_kid)
            .field("kids", &self.keys.keys().collect::<Vec<_>>())
            .field("ttl", &self.ttl)
            .finish()
    }
}
