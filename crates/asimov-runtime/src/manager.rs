//! Service-wide registry of live contexts.

use crate::context::ServiceContext;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Concurrent map from service channel ID to the live context.
///
/// At most one live context exists per service channel ID; the transport
/// routes exclusively through this map.
#[derive(Default)]
pub struct ContextManager {
    entries: RwLock<HashMap<String, Arc<ServiceContext>>>,
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, context: Arc<ServiceContext>) {
        let key = context.channel().service_channel_id.clone();
        self.entries.write().await.insert(key, context);
    }

    pub async fn get(&self, service_channel_id: &str) -> Option<Arc<ServiceContext>> {
        self.entries.read().await.get(service_channel_id).cloned()
    }

    pub async fn remove(&self, service_channel_id: &str) -> Option<Arc<ServiceContext>> {
        self.entries.write().await.remove(service_channel_id)
    }

    /// Fetch the live context for a channel, or install the one produced
    /// by `restore`.
    ///
    /// The write lock is held across the miss check, `restore`, and the
    /// insert, so concurrent callers racing on the same channel observe a
    /// single context: the loser gets the winner's instance and `restore`
    /// runs at most once. Returns the context plus whether this call
    /// installed it (the installer is responsible for starting its
    /// handler); `Ok(None)` when `restore` found nothing.
    pub async fn get_or_restore<F, Fut, E>(
        &self,
        service_channel_id: &str,
        restore: F,
    ) -> Result<Option<(Arc<ServiceContext>, bool)>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Arc<ServiceContext>>, E>>,
    {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(service_channel_id) {
            return Ok(Some((existing.clone(), false)));
        }
        let Some(context) = restore().await? else {
            return Ok(None);
        };
        entries.insert(service_channel_id.to_string(), context.clone());
        Ok(Some((context, true)))
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asimov_contract::{Channel, CommandDefinition, Message, MessageSender, TransportError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct NullSender;

    #[async_trait]
    impl MessageSender for NullSender {
        async fn send(&self, _c: &Channel, _m: &Message) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn context(service_channel_id: &str) -> Arc<ServiceContext> {
        Arc::new(ServiceContext::new(
            Arc::new(NullSender),
            Arc::new(CommandDefinition::new("greet")),
            Default::default(),
            Channel {
                protocol_version: "1.0".to_string(),
                command_name: "greet".to_string(),
                client_channel_id: "c1".to_string(),
                client_channel_url: "http://a.test/channel/c1".to_string(),
                client_channel_token: "ct".to_string(),
                service_channel_id: service_channel_id.to_string(),
                service_channel_url: format!("http://s.test/channel/{service_channel_id}"),
                service_channel_token: "st".to_string(),
            },
            Default::default(),
        ))
    }

    #[tokio::test]
    async fn get_or_restore_installs_exactly_once() {
        let manager = ContextManager::new();

        let (first, installed) = manager
            .get_or_restore("s1", || async {
                Ok::<_, ()>(Some(context("s1")))
            })
            .await
            .unwrap()
            .expect("restore produced a context");
        assert!(installed);

        // A second caller must get the installed instance back and its
        // restore closure must never run.
        let restore_ran = Arc::new(AtomicBool::new(false));
        let flag = restore_ran.clone();
        let (second, installed) = manager
            .get_or_restore("s1", || async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, ()>(Some(context("s1")))
            })
            .await
            .unwrap()
            .expect("live context resolved");
        assert!(!installed);
        assert!(!restore_ran.load(Ordering::SeqCst));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn get_or_restore_reports_a_clean_miss() {
        let manager = ContextManager::new();
        let resolved = manager
            .get_or_restore("absent", || async { Ok::<_, ()>(None) })
            .await
            .unwrap();
        assert!(resolved.is_none());
        assert!(manager.is_empty().await);
    }
}
