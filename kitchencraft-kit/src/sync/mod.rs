//! Snapshot/patch synchronization
//!
//! An instance sends each subscriber one INITIALIZED frame carrying a full
//! caller-scoped snapshot, then one UPDATED frame per accepted event with
//! the structural patch from the previous snapshot on that channel.

pub mod channel;
pub mod frame;
pub mod patch;

pub use channel::{Applied, ChannelState, EventSink, Replica, StaleReason, SyncChannel};
pub use frame::Frame;
pub use patch::{apply_patch, diff, PatchError, PatchOp};
