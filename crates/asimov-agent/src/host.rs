//! The agent-hosted client half-channel.
//!
//! The agent publishes a URL the service posts messages back to. This
//! module owns the registry of live client contexts and the axum router
//! serving both routing schemas (headers-only and path-based).

use crate::context::ClientContext;
use asimov_contract::{
    generate_channel_id, generate_channel_token, HttpErrorBody, Message, MessageValidator,
    ProtocolError, WireErrorName, HEADER_CLIENT_CHANNEL_ID,
};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Registry plus router for the agent's half-channel endpoint.
pub struct AgentChannelHost {
    base_url: String,
    contexts: RwLock<HashMap<String, Arc<ClientContext>>>,
    validator: MessageValidator,
}

impl AgentChannelHost {
    /// `base_url` is the public prefix under which [`Self::router`] is
    /// mounted, e.g. `https://agent.example`.
    pub fn new(base_url: impl Into<String>) -> Result<Arc<Self>, ProtocolError> {
        Ok(Arc::new(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            contexts: RwLock::new(HashMap::new()),
            validator: MessageValidator::new()?,
        }))
    }

    /// Mint coordinates for a new client half-channel.
    pub fn allocate_half_channel(&self) -> (String, String, String) {
        let id = generate_channel_id();
        let url = format!("{}/channel/{}", self.base_url, id);
        let token = generate_channel_token();
        (id, url, token)
    }

    pub async fn register(&self, context: Arc<ClientContext>) {
        let id = context.channel().client_channel_id.clone();
        self.contexts.write().await.insert(id, context);
    }

    pub async fn get(&self, client_channel_id: &str) -> Option<Arc<ClientContext>> {
        self.contexts.read().await.get(client_channel_id).cloned()
    }

    pub async fn remove(&self, client_channel_id: &str) -> Option<Arc<ClientContext>> {
        self.contexts.write().await.remove(client_channel_id)
    }

    /// Router serving `POST /channel` (peer ID in headers) and
    /// `POST /channel/:id`.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/channel", post(post_channel_by_header))
            .route("/channel/:id", post(post_channel_by_path))
            .with_state(self.clone())
    }
}

fn error_response(body: HttpErrorBody) -> Response {
    let status =
        StatusCode::from_u16(body.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body)).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn post_channel_by_header(
    State(host): State<Arc<AgentChannelHost>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let Some(id) = headers
        .get(HEADER_CLIENT_CHANNEL_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return error_response(HttpErrorBody::new(
            WireErrorName::InvalidRequest,
            format!("missing {HEADER_CLIENT_CHANNEL_ID} header"),
        ));
    };
    accept_channel_message(host, id, headers, payload).await
}

async fn post_channel_by_path(
    State(host): State<Arc<AgentChannelHost>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    accept_channel_message(host, id, headers, payload).await
}

async fn accept_channel_message(
    host: Arc<AgentChannelHost>,
    id: String,
    headers: HeaderMap,
    payload: Value,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return error_response(
            HttpErrorBody::new(WireErrorName::Unauthorized, "missing bearer token")
                .with_channel_ids(None, Some(id)),
        );
    };
    let Some(context) = host.get(&id).await else {
        return error_response(
            HttpErrorBody::new(WireErrorName::SessionNotFound, "unknown client channel")
                .with_channel_ids(None, Some(id)),
        );
    };
    if token != context.channel().client_channel_token {
        return error_response(
            HttpErrorBody::new(WireErrorName::Forbidden, "channel token mismatch")
                .with_channel_ids(None, Some(id)),
        );
    }

    if let Err(e) = host.validator.validate(&payload) {
        return error_response(
            HttpErrorBody::new(WireErrorName::InvalidRequest, e.to_string())
                .with_details(serde_json::json!({ "childErrors": e.child_errors() }))
                .with_channel_ids(None, Some(id)),
        );
    }
    let message: Message = match serde_json::from_value(payload) {
        Ok(message) => message,
        Err(e) => {
            return error_response(
                HttpErrorBody::new(WireErrorName::InvalidRequest, e.to_string())
                    .with_channel_ids(None, Some(id)),
            );
        }
    };
    if matches!(message, Message::Invoke { .. }) {
        return error_response(
            HttpErrorBody::new(
                WireErrorName::InvalidRequest,
                "invoke is not accepted on a client channel",
            )
            .with_channel_ids(None, Some(id)),
        );
    }

    let closing = message.is_closing_return();
    if let Err(e) = context.handle_incoming_message(message) {
        return error_response(
            HttpErrorBody::new(WireErrorName::SessionNotFound, e.to_string())
                .with_channel_ids(None, Some(id)),
        );
    }
    if closing {
        debug!(channel = %id, "client channel closed by service");
        host.remove(&id).await;
    }
    StatusCode::NO_CONTENT.into_response()
}
