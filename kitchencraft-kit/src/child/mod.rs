//! Child handles
//!
//! A parent reaches its children only through its [`ChildTable`]. Each
//! entry owns a [`ChildProxy`] task holding the sync channel to the child,
//! plus a [`Replica`] of the child's snapshot folded from that channel.
//! Removing an entry drops the proxy, which closes the channel.

mod proxy;

pub use proxy::{ChildProxy, ParentInbox, ProxyLinks};

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use crate::actor::ChildEvent;
use crate::sync::{Applied, ChannelState, Replica};
use crate::types::{ActorKey, Caller, Revision};

/// How a proxy recovers a lost channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before the handle is given up
    pub max_attempts: u32,
    /// Pause between attempts
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(250),
        }
    }
}

/// One live child, owned by its parent
#[derive(Debug)]
pub struct ChildHandle {
    key: ActorKey,
    caller: Caller,
    replica: Replica,
    proxy: ChildProxy,
}

impl ChildHandle {
    pub(crate) fn new(key: ActorKey, caller: Caller, proxy: ChildProxy) -> Self {
        Self {
            replica: Replica::new(key.clone()),
            key,
            caller,
            proxy,
        }
    }

    pub fn key(&self) -> &ActorKey {
        &self.key
    }

    /// The caller the child was spawned on behalf of
    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    pub fn state(&self) -> ChannelState {
        self.replica.state()
    }

    pub fn revision(&self) -> Option<Revision> {
        self.replica.revision()
    }

    /// The child's snapshot, only while the cache is trustworthy
    pub fn snapshot(&self) -> Option<&Value> {
        self.replica.synced_snapshot()
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub(crate) fn proxy(&self) -> &ChildProxy {
        &self.proxy
    }
}

/// Effect of a child event on the table
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    /// No handle for that child
    Unknown,
    Applied(Applied),
    /// The handle was removed
    Removed,
}

/// Point-in-time view of one handle
#[derive(Debug, Clone, PartialEq)]
pub struct ChildStatus {
    pub key: ActorKey,
    pub caller: Caller,
    pub state: ChannelState,
    pub revision: Option<Revision>,
}

/// The parent's table of children, keyed by child actor id
#[derive(Debug, Default)]
pub struct ChildTable {
    entries: BTreeMap<String, ChildHandle>,
}

impl ChildTable {
    pub fn contains(&self, child_id: &str) -> bool {
        self.entries.contains_key(child_id)
    }

    pub fn get(&self, child_id: &str) -> Option<&ChildHandle> {
        self.entries.get(child_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChildHandle> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn status(&self) -> Vec<ChildStatus> {
        self.iter()
            .map(|h| ChildStatus {
                key: h.key.clone(),
                caller: h.caller.clone(),
                state: h.state(),
                revision: h.revision(),
            })
            .collect()
    }

    pub(crate) fn insert(&mut self, handle: ChildHandle) {
        self.entries.insert(handle.key.actor_id.clone(), handle);
    }

    pub(crate) fn remove(&mut self, child_id: &str) -> Option<ChildHandle> {
        self.entries.remove(child_id)
    }

    /// Fold a child event into the matching handle
    pub(crate) fn observe(&mut self, event: &ChildEvent) -> Observed {
        let child_id = &event.key().actor_id;
        match event {
            ChildEvent::SpawnFailure { .. } | ChildEvent::Closed { .. } => {
                match self.remove(child_id) {
                    Some(mut handle) => {
                        handle.replica.close();
                        Observed::Removed
                    }
                    None => Observed::Unknown,
                }
            }
            _ => {
                let Some(handle) = self.entries.get_mut(child_id) else {
                    return Observed::Unknown;
                };
                match event.as_frame() {
                    Some(frame) => Observed::Applied(handle.replica.apply(&frame)),
                    None => Observed::Unknown,
                }
            }
        }
    }
}
