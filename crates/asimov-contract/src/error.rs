//! Protocol and transport error taxonomy, plus the HTTP wire error body.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// One structured schema violation, kept alongside the human-readable
/// message so callers can surface `childErrors` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaViolation {
    /// JSON pointer into the offending instance.
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Errors raised by the protocol core.
///
/// The enum is `Clone` so a single failure can be fanned out to every
/// consumer parked on a context queue.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("invalid message: {message}")]
    InvalidMessage {
        message: String,
        child_errors: Vec<SchemaViolation>,
    },

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("required config profile missing: {0}")]
    MissingConfigProfile(String),

    #[error("unknown config profile: {0}")]
    UnknownConfigProfile(String),

    #[error("invalid config profile {profile}")]
    InvalidConfigProfile {
        profile: String,
        errors: Vec<SchemaViolation>,
    },

    #[error("config profile not required by command: {0}")]
    ProfileNotRequired(String),

    #[error("unknown input type: {0}")]
    UnknownInputType(String),

    #[error("invalid input {input_type}")]
    InvalidInput {
        input_type: String,
        errors: Vec<SchemaViolation>,
    },

    #[error("unknown output type: {0}")]
    UnknownOutputType(String),

    #[error("invalid output {output_type}")]
    InvalidOutput {
        output_type: String,
        errors: Vec<SchemaViolation>,
    },

    #[error("timed out waiting for input of type {0}")]
    InputTimeout(String),

    #[error("timed out waiting for user confirmation")]
    ConfirmationTimeout,

    #[error("timed out waiting for payment authorization")]
    PaymentTimeout,

    #[error("payment rejected{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    PaymentRejected { reason: Option<String> },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("sending message on channel {channel_id} failed after {retries} tries")]
    SendMessageFailed {
        channel_id: String,
        retries: u32,
        #[source]
        cause: Arc<TransportError>,
    },

    #[error("context has not been invoked")]
    NotInvoked,

    #[error("context is not active")]
    NotActive,

    #[error("context is already disposed")]
    AlreadyDisposed,

    #[error("invocation was cancelled")]
    Cancelled,

    #[error("message buffer is full")]
    MessageBufferFull,

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl ProtocolError {
    /// Build an `InvalidMessage` without structured violations.
    pub fn invalid_message(message: impl Into<String>) -> Self {
        ProtocolError::InvalidMessage {
            message: message.into(),
            child_errors: Vec::new(),
        }
    }

    /// Stable name of this error kind, used when reporting a handler
    /// failure back to the peer.
    pub fn error_name(&self) -> &'static str {
        match self {
            ProtocolError::InvalidMessage { .. } => "InvalidMessage",
            ProtocolError::UnexpectedMessage(_) => "UnexpectedMessage",
            ProtocolError::MissingConfigProfile(_) => "MissingConfigProfile",
            ProtocolError::UnknownConfigProfile(_) => "UnknownConfigProfile",
            ProtocolError::InvalidConfigProfile { .. } => "InvalidConfigProfile",
            ProtocolError::ProfileNotRequired(_) => "ProfileNotRequired",
            ProtocolError::UnknownInputType(_) => "UnknownInputType",
            ProtocolError::InvalidInput { .. } => "InvalidInput",
            ProtocolError::UnknownOutputType(_) => "UnknownOutputType",
            ProtocolError::InvalidOutput { .. } => "InvalidOutput",
            ProtocolError::InputTimeout(_) => "InputTimeout",
            ProtocolError::ConfirmationTimeout => "ConfirmationTimeout",
            ProtocolError::PaymentTimeout => "PaymentTimeout",
            ProtocolError::PaymentRejected { .. } => "PaymentRejected",
            ProtocolError::Transport(_) => "MessageTransport",
            ProtocolError::SendMessageFailed { .. } => "SendMessageFailed",
            ProtocolError::NotInvoked => "NotInvoked",
            ProtocolError::NotActive => "NotActive",
            ProtocolError::AlreadyDisposed => "AlreadyDisposed",
            ProtocolError::Cancelled => "Cancelled",
            ProtocolError::MessageBufferFull => "MessageBufferFull",
            ProtocolError::Serialization(_) => "SerializationError",
        }
    }

    /// Structured violations carried by this error, if any.
    pub fn child_errors(&self) -> &[SchemaViolation] {
        match self {
            ProtocolError::InvalidMessage { child_errors, .. } => child_errors,
            ProtocolError::InvalidConfigProfile { errors, .. } => errors,
            ProtocolError::InvalidInput { errors, .. } => errors,
            ProtocolError::InvalidOutput { errors, .. } => errors,
            _ => &[],
        }
    }
}

/// A failure at the HTTP transport layer.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// No HTTP response was obtained (connect failure, timeout, reset).
    #[error("transport failure: {0}")]
    Network(String),

    /// The peer answered with a non-success status.
    #[error("peer returned status {status}")]
    Status {
        status: u16,
        body: Option<HttpErrorBody>,
    },

    /// The request could not be constructed or encoded.
    #[error("malformed request: {0}")]
    Malformed(String),
}

impl TransportError {
    /// The §4.I retry rule: no response or 5xx retries, 4xx is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Status { status, .. } => *status >= 500,
            TransportError::Malformed(_) => false,
        }
    }

    /// The decoded wire error body, when the peer supplied one.
    pub fn error_body(&self) -> Option<&HttpErrorBody> {
        match self {
            TransportError::Status { body, .. } => body.as_ref(),
            _ => None,
        }
    }
}

/// The defined wire error names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireErrorName {
    InvalidRequest,
    VersionNotSupported,
    Unauthorized,
    Forbidden,
    MessageBufferFull,
    SessionNotFound,
    CommandNotFound,
    UnexpectedError,
}

impl WireErrorName {
    /// The HTTP status conventionally paired with this error name.
    pub fn http_status(self) -> u16 {
        match self {
            WireErrorName::InvalidRequest | WireErrorName::VersionNotSupported => 400,
            WireErrorName::Unauthorized => 401,
            WireErrorName::Forbidden => 403,
            WireErrorName::SessionNotFound | WireErrorName::CommandNotFound => 404,
            WireErrorName::MessageBufferFull => 429,
            WireErrorName::UnexpectedError => 500,
        }
    }
}

/// Nested cause carried in verbose error bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// The JSON error body returned by either half-channel endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpErrorBody {
    pub http_status: u16,
    pub error_name: WireErrorName,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_channel_id: Option<String>,
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested_error: Option<NestedError>,
}

impl HttpErrorBody {
    pub fn new(error_name: WireErrorName, message: impl Into<String>) -> Self {
        Self {
            http_status: error_name.http_status(),
            error_name,
            message: message.into(),
            details: None,
            service_channel_id: None,
            client_channel_id: None,
            date: Utc::now(),
            nested_error: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub fn with_channel_ids(
        mut self,
        service_channel_id: Option<String>,
        client_channel_id: Option<String>,
    ) -> Self {
        self.service_channel_id = service_channel_id;
        self.client_channel_id = client_channel_id;
        self
    }

    #[must_use]
    pub fn with_nested_error(mut self, nested: NestedError) -> Self {
        self.nested_error = Some(nested);
        self
    }
}
