//! Observability hooks.
//!
//! Contexts and the execution runner report lifecycle events through these
//! traits; the no-op defaults make instrumentation strictly opt-in.

use asimov_contract::{Channel, Message, ProtocolError};

/// Per-context event sink.
pub trait ContextObserver: Send + Sync {
    /// Any message that arrived on the half-channel, before dispatch.
    fn on_incoming_message(&self, _message: &Message) {}
    /// A message admitted into the context's queues.
    fn on_message(&self, _message: &Message) {}
    /// A message successfully sent to the peer.
    fn on_outgoing_message(&self, _message: &Message) {}
    fn on_cancel(&self) {}
    fn on_suspend(&self) {}
    fn on_finish(&self) {}
    /// A `Return` with `close = true` went out.
    fn on_close(&self) {}
    fn on_dispose(&self) {}
    fn on_error(&self, _error: &ProtocolError) {}
}

/// Default observer: ignores everything.
pub struct NoopObserver;

impl ContextObserver for NoopObserver {}

/// Service-level event sink used by the execution runner.
pub trait ServiceObserver: Send + Sync {
    /// A handler failed; the context has already been torn down.
    fn on_error(&self, _channel: &Channel, _error: &crate::runner::HandlerError) {}
}

/// Default service observer: ignores everything.
pub struct NoopServiceObserver;

impl ServiceObserver for NoopServiceObserver {}
