use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json,
};
use kitchencraft_kit::{ActorKey, Connector, Frame, Router, SqliteStorage, SyncChannel, View};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    actors,
    auth::{AccessToken, ApiError},
    config::ServerConfig,
    remote::WsConnector,
};

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
}

/// Build the actor router described by `config`
pub async fn build_router(config: &ServerConfig) -> Result<Arc<Router>> {
    let storage = Arc::new(SqliteStorage::connect(&config.database).await?);
    let issuer = Arc::new(config.tokens.issuer());

    let router = match &config.remote {
        Some(remote) => {
            info!(%remote, "child actors hosted remotely");
            let connector = Arc::new(WsConnector::new(remote.clone(), issuer.clone()));
            Router::with_connector(issuer, storage, config.runtime, move |_| {
                connector as Arc<dyn Connector>
            })
        }
        None => Router::new(issuer, storage, config.runtime),
    };
    actors::register(&router);
    Ok(router)
}

/// HTTP and WebSocket routes over `state`
pub fn app(state: AppState) -> axum::Router {
    axum::Router::new()
        // Public endpoints (no token required)
        .route("/healthz", get(healthz))
        // Token-scoped endpoints
        .route(
            "/api/{actor_type}/{actor_id}",
            get(get_snapshot).post(post_event),
        )
        .route("/ws/{actor_type}/{actor_id}", get(ws_actor))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(config: ServerConfig) -> Result<()> {
    let router = build_router(&config).await?;
    let state = AppState { router };

    info!(addr = %config.listen_addr, "kitchencraft listening");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

fn actor_key(actor_type: &str, actor_id: String) -> ActorKey {
    ActorKey::new(actor_type, actor_id)
}

async fn get_snapshot(
    Path((actor_type, actor_id)): Path<(String, String)>,
    State(state): State<AppState>,
    AccessToken(token): AccessToken,
) -> Result<Json<View>, ApiError> {
    let key = actor_key(&actor_type, actor_id);
    Ok(Json(state.router.snapshot(&key, &token).await?))
}

async fn post_event(
    Path((actor_type, actor_id)): Path<(String, String)>,
    State(state): State<AppState>,
    AccessToken(token): AccessToken,
    Json(payload): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let key = actor_key(&actor_type, actor_id);
    state.router.submit(&key, &token, payload).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn ws_actor(
    Path((actor_type, actor_id)): Path<(String, String)>,
    State(state): State<AppState>,
    AccessToken(token): AccessToken,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let key = actor_key(&actor_type, actor_id);
    // Verify and subscribe before upgrading so a bad token never sees a frame.
    let channel = state.router.open_channel(&key, &token).await?;
    info!(actor = %key, caller = %channel.caller(), "sync channel opened");

    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(err) = handle_ws(socket, channel).await {
            warn!(?err, "websocket session ended with error");
        }
    }))
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<bool> {
    let text = serde_json::to_string(frame)?;
    Ok(socket.send(WsMessage::Text(text.into())).await.is_ok())
}

async fn handle_ws(mut socket: WebSocket, mut channel: SyncChannel) -> Result<()> {
    let key = channel.key().clone();

    loop {
        tokio::select! {
            // Frames from the instance
            frame = channel.next_frame() => {
                let Some(frame) = frame else {
                    // The instance dropped this subscriber; the peer must resync.
                    let error = Frame::Error {
                        key: key.clone(),
                        error: "subscription closed".into(),
                    };
                    send_frame(&mut socket, &error).await?;
                    break;
                };
                if !send_frame(&mut socket, &frame).await? {
                    break;
                }
            }
            // Events from this peer
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(WsMessage::Text(txt))) => {
                        let Ok(payload) = serde_json::from_str::<Value>(&txt) else {
                            warn!(actor = %key, "ignoring non-json WS payload");
                            continue;
                        };
                        match channel.send(payload).await {
                            Ok(()) => {}
                            Err(err) if !err.is_transport() => {
                                debug!(actor = %key, %err, "ignoring invalid event");
                            }
                            Err(err) => {
                                warn!(actor = %key, %err, "instance unreachable");
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(actor = %key, %err, "websocket receive failed");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    debug!(actor = %key, "sync channel closed");
    Ok(())
}
