//! Wire frames for the sync protocol
//!
//! Frames are JSON objects tagged `<TYPE>_INITIALIZED`, `<TYPE>_UPDATED` or
//! `<TYPE>_ERROR`, where `<TYPE>` is the uppercase actor type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::patch::PatchOp;
use crate::types::{ActorKey, ActorType, Revision};

/// A frame sent from an instance to one subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireFrame", into = "WireFrame")]
pub enum Frame {
    /// Full caller-scoped snapshot, sent once per channel
    Initialized {
        key: ActorKey,
        snapshot: Value,
        revision: Revision,
    },
    /// Patch against the previous snapshot sent on this channel
    Updated {
        key: ActorKey,
        operations: Vec<PatchOp>,
        revision: Revision,
    },
    /// The channel cannot continue
    Error { key: ActorKey, error: String },
}

impl Frame {
    pub fn key(&self) -> &ActorKey {
        match self {
            Frame::Initialized { key, .. }
            | Frame::Updated { key, .. }
            | Frame::Error { key, .. } => key,
        }
    }

    pub fn revision(&self) -> Option<Revision> {
        match self {
            Frame::Initialized { revision, .. } | Frame::Updated { revision, .. } => {
                Some(*revision)
            }
            Frame::Error { .. } => None,
        }
    }

    /// Frame kind without the actor type prefix
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Initialized { .. } => "INITIALIZED",
            Frame::Updated { .. } => "UPDATED",
            Frame::Error { .. } => "ERROR",
        }
    }

    /// Full wire type, e.g. `THREAD_UPDATED`
    pub fn wire_type(&self) -> String {
        format!("{}_{}", self.key().actor_type.frame_prefix(), self.kind())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame {
    #[serde(rename = "type")]
    kind: String,
    actor_type: ActorType,
    actor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    snapshot: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    operations: Option<Vec<PatchOp>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    revision: Option<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<Frame> for WireFrame {
    fn from(frame: Frame) -> Self {
        let kind = frame.wire_type();
        match frame {
            Frame::Initialized {
                key,
                snapshot,
                revision,
            } => WireFrame {
                kind,
                actor_type: key.actor_type,
                actor_id: key.actor_id,
                snapshot: Some(snapshot),
                operations: None,
                revision: Some(revision),
                error: None,
            },
            Frame::Updated {
                key,
                operations,
                revision,
            } => WireFrame {
                kind,
                actor_type: key.actor_type,
                actor_id: key.actor_id,
                snapshot: None,
                operations: Some(operations),
                revision: Some(revision),
                error: None,
            },
            Frame::Error { key, error } => WireFrame {
                kind,
                actor_type: key.actor_type,
                actor_id: key.actor_id,
                snapshot: None,
                operations: None,
                revision: None,
                error: Some(error),
            },
        }
    }
}

impl TryFrom<WireFrame> for Frame {
    type Error = String;

    fn try_from(wire: WireFrame) -> Result<Self, <Frame as TryFrom<WireFrame>>::Error> {
        let prefix = wire.actor_type.frame_prefix();
        let suffix = wire
            .kind
            .strip_prefix(prefix.as_str())
            .and_then(|rest| rest.strip_prefix('_'))
            .ok_or_else(|| {
                format!(
                    "frame type {} does not match actor type {}",
                    wire.kind, wire.actor_type
                )
            })?;
        let key = ActorKey::new(wire.actor_type, wire.actor_id);

        match suffix {
            "INITIALIZED" => Ok(Frame::Initialized {
                key,
                snapshot: wire.snapshot.ok_or("INITIALIZED frame without snapshot")?,
                revision: wire.revision.ok_or("INITIALIZED frame without revision")?,
            }),
            "UPDATED" => Ok(Frame::Updated {
                key,
                operations: wire.operations.ok_or("UPDATED frame without operations")?,
                revision: wire.revision.ok_or("UPDATED frame without revision")?,
            }),
            "ERROR" => Ok(Frame::Error {
                key,
                error: wire.error.unwrap_or_default(),
            }),
            other => Err(format!("unknown frame kind: {other}")),
        }
    }
}
