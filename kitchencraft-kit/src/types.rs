//! Core identity types for the actor kit
//!
//! These are the addressing and caller types used throughout the
//! runtime, the router, and the capability tokens.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Actor type name
///
/// Actor types are lowercase names such as `user` or `thread`. The
/// uppercase form prefixes wire frame types (`THREAD_UPDATED`). Names read
/// off the wire are normalised the same way as [`ActorType::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ActorType(String);

impl ActorType {
    /// Create an actor type, normalised to lowercase
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().to_ascii_lowercase())
    }

    /// Get the actor type name
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The prefix used for wire frame types
    pub fn frame_prefix(&self) -> String {
        self.0.to_ascii_uppercase()
    }
}

impl fmt::Display for ActorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ActorType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ActorType {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<ActorType> for String {
    fn from(actor_type: ActorType) -> Self {
        actor_type.0
    }
}

/// Routing key for one actor instance
///
/// The pair `(actor_type, actor_id)` addresses exactly one authoritative
/// instance. Building the key is deterministic, so repeated lookups of the
/// same id always reach the same instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorKey {
    pub actor_type: ActorType,
    pub actor_id: String,
}

impl ActorKey {
    pub fn new(actor_type: impl Into<ActorType>, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type: actor_type.into(),
            actor_id: actor_id.into(),
        }
    }
}

impl fmt::Display for ActorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.actor_type, self.actor_id)
    }
}

/// Kind of caller submitting events or opening channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerType {
    Client,
    Service,
    System,
}

impl CallerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallerType::Client => "client",
            CallerType::Service => "service",
            CallerType::System => "system",
        }
    }
}

impl std::str::FromStr for CallerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(CallerType::Client),
            "service" => Ok(CallerType::Service),
            "system" => Ok(CallerType::System),
            other => Err(format!("unknown caller type: {other}")),
        }
    }
}

/// Identity used by guards and by private-context partitioning
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Caller {
    pub id: String,
    #[serde(rename = "type")]
    pub caller_type: CallerType,
}

impl Caller {
    pub fn new(id: impl Into<String>, caller_type: CallerType) -> Self {
        Self {
            id: id.into(),
            caller_type,
        }
    }

    pub fn client(id: impl Into<String>) -> Self {
        Self::new(id, CallerType::Client)
    }

    pub fn service(id: impl Into<String>) -> Self {
        Self::new(id, CallerType::Service)
    }

    /// The runtime itself, used for events it injects
    pub fn system() -> Self {
        Self::new("system", CallerType::System)
    }

    /// The same identity acting as a service
    ///
    /// Parents talk to their children this way so that the child's owner
    /// guard still sees the original caller id.
    pub fn as_service(&self) -> Self {
        Self::new(self.id.clone(), CallerType::Service)
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.caller_type.as_str(), self.id)
    }
}

/// Per-instance revision counter
///
/// Starts at zero for a fresh instance and increases by exactly one for
/// every accepted event.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    pub fn genesis() -> Self {
        Self(0)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rev:{}", self.0)
    }
}
