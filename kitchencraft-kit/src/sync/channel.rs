//! Subscriber side of a sync channel
//!
//! A [`SyncChannel`] is one open subscription: a stream of [`Frame`]s from
//! an instance plus an [`EventSink`] for events going back. A [`Replica`]
//! folds those frames into a cached snapshot and tracks whether the cache
//! can be trusted.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::frame::Frame;
use super::patch::{apply_patch, PatchError};
use crate::error::Result;
use crate::types::{ActorKey, Caller, Revision};

/// Lifecycle of a subscriber's view of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Waiting for the first INITIALIZED frame
    Connecting,
    /// Cache mirrors the instance at `revision`
    Synced,
    /// Cache may be behind; only a fresh INITIALIZED recovers it
    Stale,
    /// Channel is done; further frames are discarded
    Closed,
}

/// What a frame did to a replica
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// Snapshot replaced from an INITIALIZED frame
    Reset,
    /// Patch applied on top of the cache
    Patched,
    /// Frame ignored in the current state
    Discarded,
    /// Cache fell out of step
    Stale(StaleReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StaleReason {
    /// Revision did not follow the last one seen
    Gap { expected: Revision, got: Revision },
    /// Patch did not apply to the cache
    Patch(PatchError),
    /// Remote reported an error
    Remote(String),
}

/// Cached snapshot of an instance, as seen by one subscriber
#[derive(Debug, Clone)]
pub struct Replica {
    key: ActorKey,
    state: ChannelState,
    snapshot: Option<Value>,
    revision: Option<Revision>,
}

impl Replica {
    pub fn new(key: ActorKey) -> Self {
        Self {
            key,
            state: ChannelState::Connecting,
            snapshot: None,
            revision: None,
        }
    }

    pub fn key(&self) -> &ActorKey {
        &self.key
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Last cached snapshot, trusted or not
    pub fn snapshot(&self) -> Option<&Value> {
        self.snapshot.as_ref()
    }

    /// Cached snapshot, only while it is in step with the instance
    pub fn synced_snapshot(&self) -> Option<&Value> {
        match self.state {
            ChannelState::Synced => self.snapshot.as_ref(),
            _ => None,
        }
    }

    pub fn revision(&self) -> Option<Revision> {
        self.revision
    }

    /// Fold one frame into the cache
    pub fn apply(&mut self, frame: &Frame) -> Applied {
        if self.state == ChannelState::Closed || frame.key() != &self.key {
            return Applied::Discarded;
        }

        match frame {
            Frame::Initialized {
                snapshot, revision, ..
            } => {
                self.snapshot = Some(snapshot.clone());
                self.revision = Some(*revision);
                self.state = ChannelState::Synced;
                Applied::Reset
            }
            Frame::Updated {
                operations,
                revision,
                ..
            } => {
                if self.state != ChannelState::Synced {
                    return Applied::Discarded;
                }
                let (Some(cached), Some(last)) = (self.snapshot.as_ref(), self.revision) else {
                    return Applied::Discarded;
                };
                if *revision != last.next() {
                    self.state = ChannelState::Stale;
                    return Applied::Stale(StaleReason::Gap {
                        expected: last.next(),
                        got: *revision,
                    });
                }
                match apply_patch(cached, operations) {
                    Ok(next) => {
                        self.snapshot = Some(next);
                        self.revision = Some(*revision);
                        Applied::Patched
                    }
                    Err(err) => {
                        self.state = ChannelState::Stale;
                        Applied::Stale(StaleReason::Patch(err))
                    }
                }
            }
            Frame::Error { error, .. } => {
                self.state = ChannelState::Stale;
                Applied::Stale(StaleReason::Remote(error.clone()))
            }
        }
    }

    pub fn mark_stale(&mut self) {
        if self.state != ChannelState::Closed {
            self.state = ChannelState::Stale;
        }
    }

    pub fn close(&mut self) {
        self.state = ChannelState::Closed;
    }
}

/// Outbound half of a channel
///
/// Events pushed here reach the instance with the channel's caller
/// identity attached.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, payload: Value) -> Result<()>;

    /// Called once when the channel is dropped
    fn close(&self) {}
}

/// One open subscription to an instance
pub struct SyncChannel {
    key: ActorKey,
    caller: Caller,
    frames: mpsc::Receiver<Frame>,
    sink: Box<dyn EventSink>,
}

impl SyncChannel {
    pub fn new(
        key: ActorKey,
        caller: Caller,
        frames: mpsc::Receiver<Frame>,
        sink: impl EventSink + 'static,
    ) -> Self {
        Self {
            key,
            caller,
            frames,
            sink: Box::new(sink),
        }
    }

    pub fn key(&self) -> &ActorKey {
        &self.key
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    /// Next frame, or `None` once the transport is gone
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    /// Submit an event payload on this channel
    pub async fn send(&self, payload: Value) -> Result<()> {
        self.sink.send(payload).await
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        self.sink.close();
    }
}

impl std::fmt::Debug for SyncChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncChannel")
            .field("key", &self.key)
            .field("caller", &self.caller)
            .finish_non_exhaustive()
    }
}
