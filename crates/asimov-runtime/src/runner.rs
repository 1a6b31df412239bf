//! Drives a command handler against a service context and settles the
//! context afterwards: suspended contexts are persisted, everything else
//! is finished, deleted from the store, and disposed.

use crate::context::ServiceContext;
use crate::manager::ContextManager;
use crate::observer::{NoopServiceObserver, ServiceObserver};
use asimov_contract::{ContextStatus, ContextStore, ProtocolError, StoredContext};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::warn;

/// A handler failure reported back to the peer as a `Return` error item.
#[derive(Debug, Clone, Error)]
#[error("{name}: {message}")]
pub struct HandlerError {
    pub name: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<ProtocolError> for HandlerError {
    fn from(e: ProtocolError) -> Self {
        Self {
            name: e.error_name().to_string(),
            message: e.to_string(),
        }
    }
}

/// Business logic of one command.
///
/// The handler is serial by contract: it owns its context for the whole
/// invocation and yields only at the context's suspension points.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn run(&self, ctx: Arc<ServiceContext>) -> Result<(), HandlerError>;
}

/// Launches handlers and settles their contexts on termination.
pub struct ExecutionRunner {
    store: Arc<dyn ContextStore>,
    manager: Arc<ContextManager>,
    observer: Arc<dyn ServiceObserver>,
}

impl ExecutionRunner {
    pub fn new(store: Arc<dyn ContextStore>, manager: Arc<ContextManager>) -> Self {
        Self {
            store,
            manager,
            observer: Arc::new(NoopServiceObserver),
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ServiceObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Run `handler` against `ctx` in its own task.
    pub fn spawn(
        &self,
        ctx: Arc<ServiceContext>,
        handler: Arc<dyn CommandHandler>,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let manager = self.manager.clone();
        let observer = self.observer.clone();
        tokio::spawn(async move {
            let outcome = handler.run(ctx.clone()).await;
            let key = ctx.channel().service_channel_id.clone();

            match outcome {
                Ok(()) => {
                    if ctx.status() == ContextStatus::Suspended {
                        let record = StoredContext {
                            channel: ctx.channel().clone(),
                            state: ctx.serialize(),
                        };
                        if let Err(e) = store.store(&key, &record).await {
                            warn!(channel = %key, error = %e, "failed to persist suspended context");
                        }
                        manager.remove(&key).await;
                        ctx.dispose();
                        return;
                    }
                    if ctx.status() != ContextStatus::Finished {
                        if let Err(e) = ctx.finish().await {
                            warn!(channel = %key, error = %e, "finish after handler completion failed");
                        }
                    }
                    if let Err(e) = store.delete(&key).await {
                        warn!(channel = %key, error = %e, "failed to delete stored context");
                    }
                    manager.remove(&key).await;
                    ctx.dispose();
                }
                Err(error) => {
                    warn!(channel = %key, error = %error, "command handler failed");
                    ctx.return_error(&error.name, &error.message, None);
                    if ctx.status() != ContextStatus::Finished {
                        // Fails when the context was cancelled underneath
                        // the handler; the error item is dropped with the
                        // rest of the buffer in that case.
                        let _ = ctx.finish().await;
                    }
                    if let Err(e) = store.delete(&key).await {
                        warn!(channel = %key, error = %e, "failed to delete stored context");
                    }
                    manager.remove(&key).await;
                    ctx.dispose();
                    observer.on_error(ctx.channel(), &error);
                }
            }
        })
    }
}
