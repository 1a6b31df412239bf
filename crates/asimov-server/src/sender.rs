//! Reqwest-backed message sender for the service side.

use asimov_contract::{
    Channel, HttpErrorBody, Message, MessageSender, TransportError, HEADER_CLIENT_CHANNEL_ID,
    HEADER_PROTOCOL_VERSION,
};
use async_trait::async_trait;
use std::time::Duration;

/// Posts messages to the client half-channel hosted by the agent.
pub struct ClientChannelSender {
    client: reqwest::Client,
}

impl Default for ClientChannelSender {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientChannelSender {
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
impl MessageSender for ClientChannelSender {
    async fn send(&self, channel: &Channel, message: &Message) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&channel.client_channel_url)
            .header(HEADER_PROTOCOL_VERSION, &channel.protocol_version)
            .header(HEADER_CLIENT_CHANNEL_ID, &channel.client_channel_id)
            .bearer_auth(&channel.client_channel_token)
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
