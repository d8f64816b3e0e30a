//! Error types for the actor kit

use thiserror::Error;

use crate::storage::StorageError;
use crate::sync::PatchError;
use crate::token::TokenError;
use crate::types::{ActorKey, ActorType};

/// Top-level kit error
#[derive(Debug, Error)]
pub enum KitError {
    /// No machine is registered for the actor type
    #[error("unknown actor type: {0}")]
    UnknownActorType(ActorType),

    /// Event payload did not match the actor's schema for its origin
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    /// Capability token was missing, invalid, or scoped elsewhere
    #[error("token rejected: {0}")]
    Token(#[from] TokenError),

    /// Storage capability failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Patch could not be applied to a cached snapshot
    #[error("patch error: {0}")]
    Patch(#[from] PatchError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The channel was closed before the operation completed
    #[error("channel closed for {0}")]
    ChannelClosed(ActorKey),

    /// The instance task is no longer running
    #[error("instance {0} unavailable")]
    InstanceUnavailable(ActorKey),

    /// Transport failure in a connector
    #[error("transport error: {0}")]
    Transport(String),
}

impl KitError {
    /// Whether the channel or instance behind an operation is gone
    ///
    /// Anything else is a problem with one payload, and the channel stays
    /// usable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            KitError::ChannelClosed(_) | KitError::InstanceUnavailable(_) | KitError::Transport(_)
        )
    }
}

/// Result type using KitError
pub type Result<T> = std::result::Result<T, KitError>;
