use asimov_contract::{ContextStore, ContextStoreError, StoredContext};
use async_trait::async_trait;
use std::collections::HashMap;

/// In-memory storage for testing and local development.
#[derive(Default)]
pub struct MemoryStore {
    entries: tokio::sync::RwLock<HashMap<String, StoredContext>>,
}

impl MemoryStore {
    /// Create a new in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ContextStore for MemoryStore {
    async fn store(&self, key: &str, record: &StoredContext) -> Result<(), ContextStoreError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoredContext>, ContextStoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), ContextStoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asimov_contract::{Channel, ContextStatus, SerializedContext};
    use serde_json::json;

    fn record() -> StoredContext {
        StoredContext {
            channel: Channel {
                protocol_version: "1.0".to_string(),
                command_name: "greet".to_string(),
                client_channel_id: "c1".to_string(),
                client_channel_url: "http://a.test/channel".to_string(),
                client_channel_token: "ct".to_string(),
                service_channel_id: "s1".to_string(),
                service_channel_url: "http://s.test/channel".to_string(),
                service_channel_token: "st".to_string(),
            },
            state: SerializedContext {
                status: ContextStatus::Suspended,
                config_profiles: Default::default(),
                state: json!({"stage": "collect"}),
                message_queue: vec![],
                input_queue: vec![],
            },
        }
    }

    #[tokio::test]
    async fn get_after_store_returns_equivalent_record() {
        let store = MemoryStore::new();
        store.store("s1", &record()).await.unwrap();
        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(
            serde_json::to_value(&loaded).unwrap(),
            serde_json::to_value(record()).unwrap()
        );
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryStore::new();
        store.store("s1", &record()).await.unwrap();
        store.delete("s1").await.unwrap();
        store.delete("s1").await.unwrap();
        assert!(store.get("s1").await.unwrap().is_none());
    }
}
