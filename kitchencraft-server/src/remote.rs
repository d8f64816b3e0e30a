//! Connector for actors hosted by another server.
//!
//! Opens the peer's `/ws/{actor_type}/{actor_id}` endpoint with the token
//! as the `accessToken` query parameter and bridges the socket onto a
//! [`SyncChannel`]. Both hosts must share the signing secret, since tokens
//! minted here are verified there.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use kitchencraft_kit::sync::EventSink;
use kitchencraft_kit::{ActorKey, Connector, Frame, KitError, Result, SyncChannel, TokenIssuer};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

/// Frames buffered between the socket reader and the channel owner
const FRAME_BUFFER: usize = 64;

pub struct WsConnector {
    base_url: String,
    issuer: Arc<TokenIssuer>,
}

impl WsConnector {
    /// `base_url` is the peer's scheme and authority, e.g. `ws://host:8788`
    pub fn new(base_url: impl Into<String>, issuer: Arc<TokenIssuer>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            issuer,
        }
    }

    /// Channel endpoint for `key`, with ids and token percent-encoded
    pub fn url_for(&self, key: &ActorKey, token: &str) -> Result<String> {
        let invalid =
            |reason: &str| KitError::Transport(format!("peer url {}: {reason}", self.base_url));

        let mut url = Url::parse(&self.base_url).map_err(|e| invalid(&e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("cannot carry a path"))?
            .pop_if_empty()
            .extend(["ws", key.actor_type.as_str(), key.actor_id.as_str()]);
        url.query_pairs_mut().append_pair("accessToken", token);
        Ok(url.into())
    }
}

struct WsSink {
    key: ActorKey,
    events: mpsc::UnboundedSender<Value>,
}

#[async_trait]
impl EventSink for WsSink {
    async fn send(&self, payload: Value) -> Result<()> {
        self.events
            .send(payload)
            .map_err(|_| KitError::ChannelClosed(self.key.clone()))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, key: &ActorKey, token: &str) -> Result<SyncChannel> {
        // The caller identity comes from the token; the peer checks the
        // signature again during its handshake.
        let caller = self.issuer.decode(token)?.caller();

        let (stream, _) = connect_async(self.url_for(key, token)?)
            .await
            .map_err(|e| KitError::Transport(format!("connect to {key}: {e}")))?;
        let (mut write, mut read) = stream.split();
        debug!(actor = %key, caller = %caller, "remote channel open");

        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Value>();

        let reader_key = key.clone();
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(actor = %reader_key, %err, "remote channel read failed");
                        break;
                    }
                };
                let frame = match serde_json::from_str::<Frame>(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        // A frame we cannot read leaves the cached copy unusable.
                        warn!(actor = %reader_key, %err, "malformed frame from peer");
                        break;
                    }
                };
                if frame.key() != &reader_key {
                    warn!(actor = %reader_key, other = %frame.key(), "frame for another actor");
                    break;
                }
                if frames_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let writer_key = key.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let Err(err) = write.send(Message::Text(event.to_string())).await {
                    debug!(actor = %writer_key, %err, "remote channel write failed");
                    break;
                }
            }
            let _ = write.close().await;
        });

        Ok(SyncChannel::new(
            key.clone(),
            caller,
            frames_rx,
            WsSink {
                key: key.clone(),
                events: events_tx,
            },
        ))
    }
}
