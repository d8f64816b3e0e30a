//! The child proxy task
//!
//! One task per child handle. It mints a token for the spawning caller,
//! opens the channel through the connector, relays frames to the parent as
//! [`ChildEvent`]s and sends forwarded events to the child. A lost channel
//! is reported and reopened with a fresh token; the child then sends a new
//! INITIALIZED frame rather than resuming the old patch stream.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::ReconnectPolicy;
use crate::actor::ChildEvent;
use crate::error::Result;
use crate::router::Connector;
use crate::sync::{Frame, SyncChannel};
use crate::token::TokenIssuer;
use crate::types::{ActorKey, Caller};

/// Where a proxy delivers child events
#[async_trait]
pub trait ParentInbox: Send + Sync {
    /// Queue an event for the parent; `false` once the parent is gone
    async fn deliver(&self, event: ChildEvent) -> bool;
}

/// Capabilities a proxy is handed by its parent
#[derive(Clone)]
pub struct ProxyLinks {
    pub issuer: Arc<TokenIssuer>,
    pub connector: Arc<dyn Connector>,
    pub parent: Arc<dyn ParentInbox>,
    pub policy: ReconnectPolicy,
}

#[derive(Debug)]
enum ProxyCommand {
    Forward(Value),
    Resync,
}

/// Handle to a running proxy task
///
/// Dropping the last handle releases the channel.
#[derive(Debug, Clone)]
pub struct ChildProxy {
    key: ActorKey,
    commands: mpsc::UnboundedSender<ProxyCommand>,
}

impl ChildProxy {
    pub fn spawn(key: ActorKey, caller: Caller, links: ProxyLinks) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(key.clone(), caller, links, rx));
        Self { key, commands: tx }
    }

    pub fn key(&self) -> &ActorKey {
        &self.key
    }

    /// Queue an event for the child; held until the channel is open
    pub fn forward(&self, event: Value) -> bool {
        self.commands.send(ProxyCommand::Forward(event)).is_ok()
    }

    /// Drop the current channel and reopen it for a fresh snapshot
    pub fn resync(&self) -> bool {
        self.commands.send(ProxyCommand::Resync).is_ok()
    }
}

enum PumpExit {
    /// The parent dropped the handle
    Released,
    /// The parent inbox is closed
    ParentGone,
    /// A fresh snapshot was requested
    Resync,
    Lost(String),
}

async fn open(key: &ActorKey, caller: &Caller, links: &ProxyLinks) -> Result<SyncChannel> {
    let token = links.issuer.issue(key, caller)?;
    links.connector.connect(key, &token).await
}

async fn run(
    key: ActorKey,
    caller: Caller,
    links: ProxyLinks,
    mut commands: mpsc::UnboundedReceiver<ProxyCommand>,
) {
    // Same identity, so the child's owner guard sees the original caller.
    let caller = caller.as_service();
    let mut pending = VecDeque::new();
    let mut established = false;
    let mut failures: u32 = 0;

    loop {
        match open(&key, &caller, &links).await {
            Ok(mut channel) => {
                if established {
                    info!(child = %key, "child channel reopened");
                } else {
                    debug!(child = %key, caller = %caller, "child channel open");
                }
                established = true;
                failures = 0;

                match pump(&mut channel, &mut commands, &mut pending, links.parent.as_ref()).await {
                    PumpExit::Released => {
                        debug!(child = %key, "child handle released");
                        return;
                    }
                    PumpExit::ParentGone => return,
                    PumpExit::Resync => {
                        debug!(child = %key, "resyncing child channel");
                        continue;
                    }
                    PumpExit::Lost(reason) => {
                        warn!(child = %key, %reason, "child channel lost");
                        let event = ChildEvent::ChannelError {
                            key: key.clone(),
                            error: reason,
                        };
                        if !links.parent.deliver(event).await {
                            return;
                        }
                    }
                }
            }
            Err(err) if !established => {
                warn!(child = %key, error = %err, "child spawn failed");
                let event = ChildEvent::SpawnFailure {
                    key: key.clone(),
                    reason: err.to_string(),
                };
                links.parent.deliver(event).await;
                return;
            }
            Err(err) => {
                debug!(child = %key, error = %err, attempt = failures, "reconnect failed");
            }
        }

        failures += 1;
        if failures > links.policy.max_attempts {
            warn!(child = %key, attempts = failures - 1, "giving up on child channel");
            links.parent.deliver(ChildEvent::Closed { key: key.clone() }).await;
            return;
        }

        let deadline = Instant::now() + links.policy.delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => break,
                command = commands.recv() => match command {
                    Some(ProxyCommand::Forward(event)) => pending.push_back(event),
                    Some(ProxyCommand::Resync) => {}
                    None => return,
                },
            }
        }
    }
}

async fn pump(
    channel: &mut SyncChannel,
    commands: &mut mpsc::UnboundedReceiver<ProxyCommand>,
    pending: &mut VecDeque<Value>,
    parent: &dyn ParentInbox,
) -> PumpExit {
    while let Some(event) = pending.pop_front() {
        if let Err(reason) = push(channel, &event).await {
            pending.push_front(event);
            return PumpExit::Lost(reason);
        }
    }

    loop {
        tokio::select! {
            frame = channel.next_frame() => match frame {
                Some(Frame::Error { error, .. }) => return PumpExit::Lost(error),
                Some(frame) => {
                    if !parent.deliver(ChildEvent::from(frame)).await {
                        return PumpExit::ParentGone;
                    }
                }
                None => return PumpExit::Lost("channel closed".into()),
            },
            command = commands.recv() => match command {
                Some(ProxyCommand::Forward(event)) => {
                    if let Err(reason) = push(channel, &event).await {
                        pending.push_back(event);
                        return PumpExit::Lost(reason);
                    }
                }
                Some(ProxyCommand::Resync) => return PumpExit::Resync,
                None => return PumpExit::Released,
            },
        }
    }
}

/// Send one forwarded event; `Err` only when the channel itself is gone
///
/// An event the child refuses is dropped, so it is never retried on a
/// fresh channel.
async fn push(channel: &SyncChannel, event: &Value) -> std::result::Result<(), String> {
    match channel.send(event.clone()).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_transport() => Err(err.to_string()),
        Err(err) => {
            debug!(child = %channel.key(), error = %err, "child refused forwarded event");
            Ok(())
        }
    }
}
