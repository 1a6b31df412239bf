//! Persistence contract for suspended service contexts.

use crate::channel::Channel;
use crate::message::{InputEntry, Message};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Lifecycle status of a service context.
///
/// Transitions are monotonic except `Suspended → Active` on restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextStatus {
    Initialized,
    Active,
    Suspended,
    Cancelled,
    Finished,
}

impl ContextStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ContextStatus::Cancelled | ContextStatus::Finished)
    }
}

/// Snapshot of a service context, suitable for suspend/resume.
///
/// Queue fields hold the items buffered at serialization time; consumers
/// are never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedContext {
    pub status: ContextStatus,
    pub config_profiles: HashMap<String, Value>,
    pub state: Value,
    #[serde(default)]
    pub message_queue: Vec<Message>,
    #[serde(default)]
    pub input_queue: Vec<InputEntry>,
}

/// Persisted record: the channel plus the serialized context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredContext {
    pub channel: Channel,
    pub state: SerializedContext,
}

/// Store failures.
#[derive(Debug, Error)]
pub enum ContextStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Key is unsafe for the backend (path traversal, control chars).
    #[error("invalid context key: {0}")]
    InvalidKey(String),
}

/// Persistence contract consumed by the execution runner.
///
/// `get` after `store` with no intervening `delete` returns the record
/// byte-for-byte equivalent; `delete` is idempotent.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn store(&self, key: &str, record: &StoredContext) -> Result<(), ContextStoreError>;

    async fn get(&self, key: &str) -> Result<Option<StoredContext>, ContextStoreError>;

    async fn delete(&self, key: &str) -> Result<(), ContextStoreError>;
}
