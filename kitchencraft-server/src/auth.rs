//! Handshake credentials and error responses.
//!
//! Capability tokens are accepted either as the `accessToken` query
//! parameter (browsers cannot set headers on a WebSocket upgrade) or as an
//! `Authorization: Bearer` header. Verification itself lives in the kit's
//! router; this module only extracts the credential and maps rejections
//! onto HTTP statuses.

use axum::{
    extract::{FromRequestParts, Query},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use kitchencraft_kit::{KitError, TokenError};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

/// The raw capability token presented with a request
#[derive(Debug, Clone)]
pub struct AccessToken(pub String);

#[derive(Deserialize)]
struct TokenQuery {
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
}

/// Extract bearer token from Authorization header
fn extract_bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn extract_query_token(parts: &Parts) -> Option<String> {
    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(q)| q.access_token)
}

impl<S> FromRequestParts<S> for AccessToken
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = extract_query_token(parts)
            .or_else(|| extract_bearer_token(parts).map(str::to_string))
            .filter(|t| !t.is_empty());

        match token {
            Some(token) => Ok(AccessToken(token)),
            None => {
                debug!(uri = %parts.uri, "request without capability token");
                Err(ApiError(KitError::Token(TokenError::Missing)))
            }
        }
    }
}

/// A kit error on its way out as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub KitError);

impl From<KitError> for ApiError {
    fn from(err: KitError) -> Self {
        Self(err)
    }
}

/// HTTP status for a kit error
pub fn status_for(err: &KitError) -> StatusCode {
    match err {
        KitError::Token(TokenError::ScopeMismatch { .. }) => StatusCode::FORBIDDEN,
        KitError::Token(TokenError::Signing(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        KitError::Token(_) => StatusCode::UNAUTHORIZED,
        KitError::SchemaValidation(_) | KitError::Serialization(_) => StatusCode::BAD_REQUEST,
        KitError::UnknownActorType(_) => StatusCode::NOT_FOUND,
        KitError::ChannelClosed(_) | KitError::InstanceUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        KitError::Transport(_) => StatusCode::BAD_GATEWAY,
        KitError::Storage(_) | KitError::Patch(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        } else {
            debug!(error = %self.0, %status, "request rejected");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
