//! Events entering an instance
//!
//! External events arrive as [`RawEvent`]s and are parsed against the
//! machine's schema for their origin before they are queued. Child
//! notifications are produced by the runtime itself and carry the
//! `system` origin.

use chrono::{DateTime, Utc};
use serde::de::{Deserializer, Error as _, IgnoredAny};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sync::{Frame, PatchOp};
use crate::types::{ActorKey, Caller, CallerType, Revision};

/// Where an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Client,
    Service,
    System,
}

impl From<CallerType> for Origin {
    fn from(caller_type: CallerType) -> Self {
        match caller_type {
            CallerType::Client => Origin::Client,
            CallerType::Service => Origin::Service,
            CallerType::System => Origin::System,
        }
    }
}

/// An event before schema validation
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub origin: Origin,
    pub caller: Caller,
    pub payload: Value,
}

impl RawEvent {
    /// Event submitted by `caller`, with the origin its caller type implies
    pub fn from_caller(caller: Caller, payload: Value) -> Self {
        Self {
            origin: caller.caller_type.into(),
            caller,
            payload,
        }
    }
}

/// Notification about a child, delivered into the parent's queue
#[derive(Debug, Clone, PartialEq)]
pub enum ChildEvent {
    /// The child's channel (re)opened with a fresh snapshot
    Initialized {
        key: ActorKey,
        snapshot: Value,
        revision: Revision,
    },
    /// The child accepted an event
    Updated {
        key: ActorKey,
        operations: Vec<PatchOp>,
        revision: Revision,
    },
    /// The channel failed after it was established
    ChannelError { key: ActorKey, error: String },
    /// Token minting or the first channel open failed
    SpawnFailure { key: ActorKey, reason: String },
    /// Reconnection was given up; the handle is gone
    Closed { key: ActorKey },
}

impl ChildEvent {
    pub fn key(&self) -> &ActorKey {
        match self {
            ChildEvent::Initialized { key, .. }
            | ChildEvent::Updated { key, .. }
            | ChildEvent::ChannelError { key, .. }
            | ChildEvent::SpawnFailure { key, .. }
            | ChildEvent::Closed { key } => key,
        }
    }

    /// The frame this event mirrors, if it came from the channel
    pub fn as_frame(&self) -> Option<Frame> {
        match self {
            ChildEvent::Initialized {
                key,
                snapshot,
                revision,
            } => Some(Frame::Initialized {
                key: key.clone(),
                snapshot: snapshot.clone(),
                revision: *revision,
            }),
            ChildEvent::Updated {
                key,
                operations,
                revision,
            } => Some(Frame::Updated {
                key: key.clone(),
                operations: operations.clone(),
                revision: *revision,
            }),
            ChildEvent::ChannelError { key, error } => Some(Frame::Error {
                key: key.clone(),
                error: error.clone(),
            }),
            ChildEvent::SpawnFailure { .. } | ChildEvent::Closed { .. } => None,
        }
    }
}

impl From<Frame> for ChildEvent {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Initialized {
                key,
                snapshot,
                revision,
            } => ChildEvent::Initialized {
                key,
                snapshot,
                revision,
            },
            Frame::Updated {
                key,
                operations,
                revision,
            } => ChildEvent::Updated {
                key,
                operations,
                revision,
            },
            Frame::Error { key, error } => ChildEvent::ChannelError { key, error },
        }
    }
}

/// A validated event
#[derive(Debug, Clone, PartialEq)]
pub enum Event<C, S> {
    Client(C),
    Service(S),
    Child(ChildEvent),
}

impl<C, S> Event<C, S> {
    pub fn origin(&self) -> Origin {
        match self {
            Event::Client(_) => Origin::Client,
            Event::Service(_) => Origin::Service,
            Event::Child(_) => Origin::System,
        }
    }
}

/// A validated event together with who sent it and when
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<C, S> {
    pub event: Event<C, S>,
    pub caller: Caller,
    pub received_at: DateTime<Utc>,
}

impl<C, S> Envelope<C, S> {
    pub fn new(event: Event<C, S>, caller: Caller) -> Self {
        Self {
            event,
            caller,
            received_at: Utc::now(),
        }
    }

    pub fn child(event: ChildEvent) -> Self {
        Self::new(Event::Child(event), Caller::system())
    }

    pub fn origin(&self) -> Origin {
        self.event.origin()
    }
}

/// Event set for an origin a machine does not accept
///
/// Deserializing always fails, so such events are rejected at intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoEvents {}

impl<'de> Deserialize<'de> for NoEvents {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        IgnoredAny::deserialize(deserializer)?;
        Err(D::Error::custom("no events accepted from this origin"))
    }
}
