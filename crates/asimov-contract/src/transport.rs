//! The send-function seam between a context and its transport.

use crate::channel::Channel;
use crate::error::TransportError;
use crate::message::Message;
use async_trait::async_trait;

/// Delivers one protocol message to the peer's half-channel.
///
/// The service-side implementation posts to the client half; the agent-side
/// implementation posts to the service half. Contexts never know which.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, channel: &Channel, message: &Message) -> Result<(), TransportError>;
}
