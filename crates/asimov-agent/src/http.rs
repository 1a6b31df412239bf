//! Reqwest-backed message sender for the agent side.

use asimov_contract::{
    Channel, HttpErrorBody, Message, MessageSender, TransportError, HEADER_PROTOCOL_VERSION,
    HEADER_SERVICE_CHANNEL_ID,
};
use async_trait::async_trait;
use std::time::Duration;

/// Posts messages to the service half-channel.
///
/// Retryability follows the transport contract: no response or 5xx is
/// retryable, 4xx is terminal. Error bodies are decoded when present so
/// the caller sees the typed wire error.
pub struct HttpMessageSender {
    client: reqwest::Client,
}

impl Default for HttpMessageSender {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpMessageSender {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MessageSender for HttpMessageSender {
    async fn send(&self, channel: &Channel, message: &Message) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&channel.service_channel_url)
            .header(HEADER_PROTOCOL_VERSION, &channel.protocol_version)
            .header(HEADER_SERVICE_CHANNEL_ID, &channel.service_channel_id)
            .bearer_auth(&channel.service_channel_token)
            .json(message)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status().as_u16();
        let body = response.json::<HttpErrorBody>().await.ok();
        Err(TransportError::Status { status, body })
    }
}
