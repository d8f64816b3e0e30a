//! KitchenCraft Kit - actor supervision and state sync for KitchenCraft
//!
//! This crate hosts independently addressable actors (a user, a
//! conversation thread), processes their events one at a time, and streams
//! each caller's view of an actor as an initial snapshot followed by
//! structural patches.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                           Router                              │
//! │   (actorType, actorId) -> instance     TokenIssuer, Storage   │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  ┌──────────────────────┐          ┌──────────────────────┐   │
//! │  │  ActorRuntime (user) │          │ ActorRuntime (thread)│   │
//! │  │  inbox ─► evaluate   │          │  inbox ─► evaluate   │   │
//! │  │  regions × context   │          │  regions × context   │   │
//! │  │  ┌────────────────┐  │  token   │                      │   │
//! │  │  │   ChildTable   │──┼─────────►│   subscribers        │   │
//! │  │  │  ChildProxy ◄──┼──┼──frames──┤   (SyncChannel)      │   │
//! │  │  └────────────────┘  │          │                      │   │
//! │  └──────────────────────┘          └──────────────────────┘   │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Core Concepts
//!
//! ## Machines and Regions
//!
//! A [`Machine`] describes one actor type as a list of orthogonal
//! [`Region`]s. Every event is offered to every region; each one either
//! ignores it, denies it through a [`Guard`], or transitions. Regions are
//! pure and declare side effects as [`Effect`]s (spawn a child, forward an
//! event to a child).
//!
//! ## Instances
//!
//! Each `(actorType, actorId)` has one [`ActorRuntime`] task draining a
//! bounded inbox. Every accepted event produces a new context and bumps the
//! [`Revision`] by one. Context and revision are persisted through the
//! [`Storage`] capability and restored when the instance is recreated.
//!
//! ## Sync Channels
//!
//! A subscriber receives one `INITIALIZED` [`Frame`] with its caller-scoped
//! snapshot, then one `UPDATED` frame per accepted event. A [`Replica`]
//! folds those frames and turns stale when a revision is skipped or a
//! patch fails to apply.
//!
//! ## Capability Tokens
//!
//! Opening a channel requires a token from the [`TokenIssuer`] scoped to
//! exactly one instance. Parents mint a fresh token each time their child
//! proxy connects.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kitchencraft_kit::{ActorKey, Caller, Router, RuntimeConfig, SqliteStorage, TokenIssuer};
//!
//! let issuer = Arc::new(TokenIssuer::new("k1", b"secret"));
//! let storage = Arc::new(SqliteStorage::in_memory().await?);
//! let router = Router::new(issuer.clone(), storage, RuntimeConfig::default());
//! router.register(MyMachine);
//!
//! let key = ActorKey::new("counter", "c1");
//! let token = issuer.issue(&key, &Caller::client("alice"))?;
//! let mut channel = router.open_channel(&key, &token).await?;
//! let initialized = channel.next_frame().await;
//! ```

pub mod actor;
pub mod child;
pub mod error;
pub mod router;
pub mod runtime;
pub mod storage;
pub mod sync;
pub mod testing;
pub mod token;
pub mod types;

pub use actor::{
    ActorInput, ChildEvent, Context, Effect, Envelope, Event, Guard, Machine, NoEvents, Origin,
    Owned, RawEvent, Region, Scope, Step, Transition,
};
pub use child::{ChildHandle, ChildStatus, ChildTable, ReconnectPolicy};
pub use error::{KitError, Result};
pub use router::{Connector, LocalConnector, Router};
pub use runtime::{ActorRef, ActorRuntime, Phase, RuntimeConfig, View};
pub use storage::{ScopedStorage, SqliteStorage, Storage, StorageError};
pub use sync::{ChannelState, Frame, PatchError, PatchOp, Replica, SyncChannel};
pub use token::{Claims, TokenError, TokenIssuer};
pub use types::{ActorKey, ActorType, Caller, CallerType, Revision};
