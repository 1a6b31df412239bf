//! HTTP binding for the service side: manifest, invoke, and channel
//! endpoints.

use crate::definition::{CommandRegistration, ServiceDefinition};
use crate::sender::ClientChannelSender;
use asimov_contract::{
    generate_channel_id, generate_channel_token, is_supported_version, Channel, ContextStore,
    HttpErrorBody, Message, MessageSender, MessageValidator, NestedError, ProtocolError,
    WireErrorName, HEADER_CLIENT_CHANNEL_ID, HEADER_CLIENT_CHANNEL_TOKEN,
    HEADER_CLIENT_CHANNEL_URL, HEADER_PROTOCOL_VERSION, HEADER_SERVICE_CHANNEL_ID,
    HEADER_SERVICE_CHANNEL_TOKEN, HEADER_SERVICE_CHANNEL_URL, PROTOCOL_VERSION,
    SUPPORTED_VERSIONS,
};
use asimov_runtime::{ContextManager, ExecutionRunner, ServiceContext, ServiceContextOptions};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared state behind the service router.
#[derive(Clone)]
pub struct AppState {
    service: Arc<ServiceDefinition>,
    manager: Arc<ContextManager>,
    store: Arc<dyn ContextStore>,
    runner: Arc<ExecutionRunner>,
    sender: Arc<dyn MessageSender>,
    validator: Arc<MessageValidator>,
    base_url: String,
    context_options: ServiceContextOptions,
    verbose_errors: bool,
}

impl AppState {
    /// State with the default reqwest sender posting to client channels.
    pub fn new(
        service: Arc<ServiceDefinition>,
        store: Arc<dyn ContextStore>,
        base_url: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        Self::with_sender(service, store, base_url, Arc::new(ClientChannelSender::new()))
    }

    /// State with an explicit sender (used by tests and embedded setups).
    pub fn with_sender(
        service: Arc<ServiceDefinition>,
        store: Arc<dyn ContextStore>,
        base_url: impl Into<String>,
        sender: Arc<dyn MessageSender>,
    ) -> Result<Self, ProtocolError> {
        let manager = Arc::new(ContextManager::new());
        let runner = Arc::new(ExecutionRunner::new(store.clone(), manager.clone()));
        let context_options = ServiceContextOptions {
            accepted_payment_schemas: service.accepted_payment_schemas().to_vec(),
            ..Default::default()
        };
        Ok(Self {
            service,
            manager,
            store,
            runner,
            sender,
            validator: Arc::new(MessageValidator::new()?),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            context_options,
            verbose_errors: false,
        })
    }

    #[must_use]
    pub fn with_verbose_errors(mut self, verbose: bool) -> Self {
        self.verbose_errors = verbose;
        self
    }

    #[must_use]
    pub fn with_context_options(mut self, options: ServiceContextOptions) -> Self {
        self.context_options = options;
        self
    }

    pub fn manager(&self) -> &Arc<ContextManager> {
        &self.manager
    }
}

/// The service router: manifest, invoke, and both channel routing schemas.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/manifest.json", get(manifest))
        .route("/invoke/:command", post(invoke))
        .route("/channel", post(post_channel_by_header))
        .route("/channel/:id", post(post_channel_by_path))
        .with_state(state)
}

struct WireError(HttpErrorBody);

impl IntoResponse for WireError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0)).into_response()
    }
}

fn wire_error(
    name: WireErrorName,
    message: impl Into<String>,
    service_channel_id: Option<String>,
    client_channel_id: Option<String>,
) -> WireError {
    WireError(
        HttpErrorBody::new(name, message).with_channel_ids(service_channel_id, client_channel_id),
    )
}

/// Map a dispatch failure onto the wire error taxonomy.
fn dispatch_error(
    error: ProtocolError,
    verbose: bool,
    service_channel_id: Option<String>,
    client_channel_id: Option<String>,
) -> WireError {
    let name = match &error {
        ProtocolError::MessageBufferFull => WireErrorName::MessageBufferFull,
        ProtocolError::InvalidMessage { .. }
        | ProtocolError::UnexpectedMessage(_)
        | ProtocolError::MissingConfigProfile(_)
        | ProtocolError::UnknownConfigProfile(_)
        | ProtocolError::InvalidConfigProfile { .. }
        | ProtocolError::UnknownInputType(_)
        | ProtocolError::InvalidInput { .. }
        | ProtocolError::NotActive => WireErrorName::InvalidRequest,
        _ => WireErrorName::UnexpectedError,
    };
    let mut body = HttpErrorBody::new(name, error.to_string())
        .with_channel_ids(service_channel_id, client_channel_id);
    let child_errors = error.child_errors();
    if !child_errors.is_empty() {
        body = body.with_details(json!({ "childErrors": child_errors }));
    }
    if name == WireErrorName::UnexpectedError {
        body = body.with_nested_error(NestedError {
            name: error.error_name().to_string(),
            message: error.to_string(),
            stack: verbose.then(|| format!("{error:?}")),
        });
    }
    WireError(body)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn required_header(headers: &HeaderMap, name: &'static str) -> Result<String, WireError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            wire_error(
                WireErrorName::InvalidRequest,
                format!("missing {name} header"),
                None,
                None,
            )
        })
}

async fn manifest(State(st): State<AppState>) -> Json<asimov_contract::ServiceManifest> {
    Json(st.service.manifest(&st.base_url))
}

async fn invoke(
    State(st): State<AppState>,
    Path(command): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Response, WireError> {
    let version = required_header(&headers, HEADER_PROTOCOL_VERSION)?;
    if !is_supported_version(&version) {
        return Err(WireError(
            HttpErrorBody::new(
                WireErrorName::VersionNotSupported,
                format!("protocol version {version} is not supported"),
            )
            .with_details(json!({
                "requestedVersion": version,
                "supportedVersions": SUPPORTED_VERSIONS,
            })),
        ));
    }

    let client_channel_id = required_header(&headers, HEADER_CLIENT_CHANNEL_ID)?;
    let client_channel_url = required_header(&headers, HEADER_CLIENT_CHANNEL_URL)?;
    let client_channel_token = required_header(&headers, HEADER_CLIENT_CHANNEL_TOKEN)?;

    let Some(registration) = st.service.command(&command).cloned() else {
        return Err(wire_error(
            WireErrorName::CommandNotFound,
            format!("command not found: {command}"),
            None,
            Some(client_channel_id),
        ));
    };

    st.validator
        .validate(&payload)
        .map_err(|e| dispatch_error(e, st.verbose_errors, None, Some(client_channel_id.clone())))?;
    let message: Message = serde_json::from_value(payload).map_err(|e| {
        wire_error(
            WireErrorName::InvalidRequest,
            e.to_string(),
            None,
            Some(client_channel_id.clone()),
        )
    })?;
    let Message::Invoke {
        ref user_confirmation,
        ..
    } = message
    else {
        return Err(wire_error(
            WireErrorName::InvalidRequest,
            format!("invoke endpoint only accepts invoke, got {}", message.tag()),
            None,
            Some(client_channel_id),
        ));
    };
    if registration.definition.requires_user_confirmation() && user_confirmation.is_none() {
        return Err(wire_error(
            WireErrorName::InvalidRequest,
            format!("command {command} requires user confirmation"),
            None,
            Some(client_channel_id),
        ));
    }

    let service_channel_id = generate_channel_id();
    let service_channel_token = generate_channel_token();
    let channel = Channel {
        protocol_version: PROTOCOL_VERSION.to_string(),
        command_name: command.clone(),
        client_channel_id: client_channel_id.clone(),
        client_channel_url,
        client_channel_token,
        service_channel_id: service_channel_id.clone(),
        service_channel_url: format!("{}/channel/{}", st.base_url, service_channel_id),
        service_channel_token: service_channel_token.clone(),
    };

    let context = Arc::new(ServiceContext::new(
        st.sender.clone(),
        registration.definition.clone(),
        st.service.profiles().clone(),
        channel.clone(),
        st.context_options.clone(),
    ));
    context.handle_incoming(message).await.map_err(|e| {
        dispatch_error(
            e,
            st.verbose_errors,
            Some(service_channel_id.clone()),
            Some(client_channel_id.clone()),
        )
    })?;

    st.manager.add(context.clone()).await;
    st.runner.spawn(context, registration.handler.clone());
    debug!(command = %command, channel = %service_channel_id, "invocation accepted");

    channel_accepted_response(&channel)
}

fn channel_accepted_response(channel: &Channel) -> Result<Response, WireError> {
    let mut headers = HeaderMap::new();
    for (name, value) in [
        (HEADER_SERVICE_CHANNEL_ID, &channel.service_channel_id),
        (HEADER_SERVICE_CHANNEL_URL, &channel.service_channel_url),
        (HEADER_SERVICE_CHANNEL_TOKEN, &channel.service_channel_token),
    ] {
        let value = HeaderValue::from_str(value).map_err(|e| {
            wire_error(
                WireErrorName::UnexpectedError,
                format!("channel coordinates are not header-safe: {e}"),
                Some(channel.service_channel_id.clone()),
                Some(channel.client_channel_id.clone()),
            )
        })?;
        headers.insert(HeaderName::from_static(name), value);
    }
    Ok((StatusCode::NO_CONTENT, headers).into_response())
}

async fn post_channel_by_header(
    State(st): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Response, WireError> {
    let id = required_header(&headers, HEADER_SERVICE_CHANNEL_ID)?;
    accept_channel_message(st, id, headers, payload).await
}

async fn post_channel_by_path(
    State(st): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Response, WireError> {
    accept_channel_message(st, id, headers, payload).await
}

async fn accept_channel_message(
    st: AppState,
    id: String,
    headers: HeaderMap,
    payload: Value,
) -> Result<Response, WireError> {
    let Some(token) = bearer_token(&headers) else {
        return Err(wire_error(
            WireErrorName::Unauthorized,
            "missing bearer token",
            Some(id),
            None,
        ));
    };

    let context = resolve_context(&st, &id).await?;
    if token != context.channel().service_channel_token {
        return Err(wire_error(
            WireErrorName::Forbidden,
            "channel token mismatch",
            Some(id),
            None,
        ));
    }

    st.validator
        .validate(&payload)
        .map_err(|e| dispatch_error(e, st.verbose_errors, Some(id.clone()), None))?;
    let message: Message = serde_json::from_value(payload)
        .map_err(|e| wire_error(WireErrorName::InvalidRequest, e.to_string(), Some(id.clone()), None))?;

    context
        .handle_incoming(message)
        .await
        .map_err(|e| dispatch_error(e, st.verbose_errors, Some(id), None))?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Find the live context for a service channel, restoring it from the
/// store (and re-entering its handler) when it was suspended.
///
/// Only one live context may exist per service channel ID. The restore
/// runs inside the manager's atomic [`ContextManager::get_or_restore`],
/// so two concurrent posts racing on the same suspended channel (a
/// retried request, a double delivery) resolve to a single restored
/// instance with a single handler re-entry.
async fn resolve_context(st: &AppState, id: &str) -> Result<Arc<ServiceContext>, WireError> {
    if let Some(context) = st.manager.get(id).await {
        return Ok(context);
    }

    let mut registration_slot: Option<CommandRegistration> = None;
    let resolved = st
        .manager
        .get_or_restore(id, || {
            let slot = &mut registration_slot;
            async move {
                let record = st.store.get(id).await.map_err(|e| {
                    warn!(channel = %id, error = %e, "context store lookup failed");
                    wire_error(
                        WireErrorName::UnexpectedError,
                        "context store lookup failed",
                        Some(id.to_string()),
                        None,
                    )
                })?;
                let Some(record) = record else {
                    return Ok(None);
                };

                let Some(registration) =
                    st.service.command(&record.channel.command_name).cloned()
                else {
                    return Err(wire_error(
                        WireErrorName::CommandNotFound,
                        format!("command not found: {}", record.channel.command_name),
                        Some(id.to_string()),
                        None,
                    ));
                };

                let context = Arc::new(ServiceContext::restore(
                    st.sender.clone(),
                    registration.definition.clone(),
                    st.service.profiles().clone(),
                    record.channel,
                    st.context_options.clone(),
                    record.state,
                ));
                *slot = Some(registration);
                Ok(Some(context))
            }
        })
        .await?;

    let Some((context, installed)) = resolved else {
        return Err(wire_error(
            WireErrorName::SessionNotFound,
            format!("no session for channel {id}"),
            Some(id.to_string()),
            None,
        ));
    };
    // The installer re-enters the handler; a racing caller that received
    // the already-installed instance must not spawn a second one.
    if installed {
        if let Some(registration) = registration_slot {
            st.runner.spawn(context.clone(), registration.handler);
            debug!(channel = %id, "suspended context restored");
        }
    }
    Ok(context)
}
