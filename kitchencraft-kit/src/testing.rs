//! Helpers for exercising routers in tests
//!
//! [`TapConnector`] sits between a router and its real connector. It counts
//! connects and records the kind of every frame that passes through. It can
//! also cut live channels or swallow an UPDATED frame to simulate a broken
//! transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{KitError, Result};
use crate::router::Connector;
use crate::sync::{EventSink, Frame, Replica, SyncChannel};
use crate::types::ActorKey;

#[derive(Default)]
struct TapState {
    connects: HashMap<ActorKey, usize>,
    frames: HashMap<ActorKey, Vec<&'static str>>,
    cutters: Vec<(ActorKey, oneshot::Sender<()>)>,
    /// UPDATED frames still to be swallowed, per key
    swallow: HashMap<ActorKey, usize>,
}

impl TapState {
    /// Record a relayed frame; `false` if it should be swallowed instead
    fn relay(&mut self, key: &ActorKey, frame: &Frame) -> bool {
        if matches!(frame, Frame::Updated { .. }) {
            if let Some(pending) = self.swallow.get_mut(key).filter(|n| **n > 0) {
                *pending -= 1;
                debug!(actor = %key, revision = ?frame.revision(), "swallowed frame");
                return false;
            }
        }
        self.frames.entry(key.clone()).or_default().push(frame.kind());
        true
    }
}

/// Connector wrapper that records traffic and can sever channels
pub struct TapConnector {
    inner: Arc<dyn Connector>,
    state: Arc<Mutex<TapState>>,
}

impl TapConnector {
    pub fn new(inner: Arc<dyn Connector>) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(TapState::default())),
        }
    }

    /// Successful connects to `key`
    pub fn connects(&self, key: &ActorKey) -> usize {
        self.state.lock().connects.get(key).copied().unwrap_or(0)
    }

    /// Kinds of the frames relayed from `key`, in order
    pub fn frame_kinds(&self, key: &ActorKey) -> Vec<&'static str> {
        self.state
            .lock()
            .frames
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Cut every live channel to `key`; returns how many were still open
    pub fn sever(&self, key: &ActorKey) -> usize {
        let cutters = {
            let mut state = self.state.lock();
            let (matching, rest): (Vec<_>, Vec<_>) =
                state.cutters.drain(..).partition(|(k, _)| k == key);
            state.cutters = rest;
            matching
        };
        let count = cutters
            .into_iter()
            .map(|(_, cut)| cut.send(()).is_ok())
            .filter(|live| *live)
            .count();
        debug!(actor = %key, count, "severed channels");
        count
    }

    /// Lose the next UPDATED frame from `key` in transit
    pub fn drop_next_update(&self, key: &ActorKey) {
        *self.state.lock().swallow.entry(key.clone()).or_default() += 1;
    }
}

type Outbound = (Value, oneshot::Sender<Result<()>>);

/// Hands events to the relay task and waits for the upstream verdict
struct TapSink {
    key: ActorKey,
    events: mpsc::UnboundedSender<Outbound>,
}

#[async_trait]
impl EventSink for TapSink {
    async fn send(&self, payload: Value) -> Result<()> {
        let closed = || KitError::ChannelClosed(self.key.clone());
        let (reply, verdict) = oneshot::channel();
        self.events.send((payload, reply)).map_err(|_| closed())?;
        verdict.await.map_err(|_| closed())?
    }
}

#[async_trait]
impl Connector for TapConnector {
    async fn connect(&self, key: &ActorKey, token: &str) -> Result<SyncChannel> {
        let mut upstream = self.inner.connect(key, token).await?;
        let caller = upstream.caller().clone();

        let (frames_tx, frames_rx) = mpsc::channel(64);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Outbound>();
        let (cut_tx, mut cut_rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            *state.connects.entry(key.clone()).or_default() += 1;
            state.cutters.push((key.clone(), cut_tx));
        }

        let state = self.state.clone();
        let relay_key = key.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut cut_rx => break,
                    frame = upstream.next_frame() => {
                        let Some(frame) = frame else { break };
                        if !state.lock().relay(&relay_key, &frame) {
                            continue;
                        }
                        if frames_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    event = events_rx.recv() => {
                        let Some((event, reply)) = event else { break };
                        let result = upstream.send(event).await;
                        let lost = matches!(&result, Err(err) if err.is_transport());
                        let _ = reply.send(result);
                        if lost {
                            break;
                        }
                    }
                }
            }
            // Dropping both ends closes the upstream subscription and the
            // downstream frame stream.
        });

        Ok(SyncChannel::new(
            key.clone(),
            caller,
            frames_rx,
            TapSink {
                key: key.clone(),
                events: events_tx,
            },
        ))
    }
}

/// Drive `channel` into `replica` until `done` holds for the synced snapshot
///
/// Returns the matching snapshot, or `None` on timeout or channel end.
pub async fn sync_until(
    channel: &mut SyncChannel,
    replica: &mut Replica,
    timeout: Duration,
    done: impl Fn(&Value) -> bool,
) -> Option<Value> {
    let wait = async {
        loop {
            if let Some(snapshot) = replica.synced_snapshot() {
                if done(snapshot) {
                    return Some(snapshot.clone());
                }
            }
            let frame = channel.next_frame().await?;
            replica.apply(&frame);
        }
    };
    tokio::time::timeout(timeout, wait).await.ok().flatten()
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
