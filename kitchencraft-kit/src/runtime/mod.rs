//! Instance hosting
//!
//! Each instance runs as one tokio task draining a bounded inbox, so its
//! context has a single writer and needs no locking. Everything outside the
//! task talks to it through an [`ActorRef`].

mod instance;

pub use instance::ActorRuntime;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::actor::RawEvent;
use crate::child::{ChildStatus, ReconnectPolicy};
use crate::error::Result;
use crate::router::Connector;
use crate::storage::Storage;
use crate::sync::SyncChannel;
use crate::token::TokenIssuer;
use crate::types::{ActorKey, Caller, Revision};

/// Tunables shared by every instance a router hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Queued commands per instance before senders wait
    pub inbox_capacity: usize,
    /// Queued frames per subscriber before it is dropped as lagging
    pub subscriber_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 256,
            subscriber_capacity: 64,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Capabilities handed to an instance when it is created
#[derive(Clone)]
pub struct Services {
    pub issuer: Arc<TokenIssuer>,
    pub connector: Arc<dyn Connector>,
    pub storage: Arc<dyn Storage>,
    pub config: RuntimeConfig,
}

/// Lifecycle of an instance task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Task started, persisted state not yet restored
    Created,
    /// Processing its inbox
    Active,
    /// Inbox closed, task finished
    Stopped,
}

/// A caller's view of an instance at one revision
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct View {
    pub snapshot: Value,
    pub revision: Revision,
}

/// Type-erased handle to a running instance
///
/// Callers here are already authenticated; token checks happen in the
/// router before a handle is used.
#[async_trait]
pub trait ActorRef: Send + Sync {
    fn key(&self) -> &ActorKey;

    fn phase(&self) -> Phase;

    /// Validate and queue an event
    async fn send(&self, raw: RawEvent) -> Result<()>;

    /// Open a sync channel for `caller`
    async fn subscribe(&self, caller: Caller) -> Result<SyncChannel>;

    /// The caller-scoped snapshot without opening a channel
    async fn snapshot(&self, caller: Caller) -> Result<View>;

    /// The instance's child handles
    async fn children(&self) -> Result<Vec<ChildStatus>>;
}
