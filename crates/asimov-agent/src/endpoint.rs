//! The invoke handshake against a remote service.

use crate::context::{ClientContext, RetryOptions};
use crate::host::AgentChannelHost;
use crate::http::HttpMessageSender;
use asimov_contract::{
    Channel, HttpErrorBody, InputEntry, Message, ProtocolError, ServiceManifest, TransportError,
    UserConfirmation, HEADER_CLIENT_CHANNEL_ID, HEADER_CLIENT_CHANNEL_TOKEN,
    HEADER_CLIENT_CHANNEL_URL, HEADER_PROTOCOL_VERSION, HEADER_SERVICE_CHANNEL_ID,
    HEADER_SERVICE_CHANNEL_TOKEN, HEADER_SERVICE_CHANNEL_URL, PROTOCOL_VERSION,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Payload of an outgoing `Invoke`.
#[derive(Debug, Clone, Default)]
pub struct InvokeRequest {
    config_profiles: HashMap<String, Value>,
    inputs: Vec<InputEntry>,
    user_confirmation: Option<UserConfirmation>,
}

impl InvokeRequest {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config_profile(mut self, name: impl Into<String>, value: Value) -> Self {
        self.config_profiles.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_input(mut self, input_type: impl Into<String>, value: Value) -> Self {
        self.inputs.push(InputEntry::new(input_type, value));
        self
    }

    #[must_use]
    pub fn with_user_confirmation(mut self, confirmed_by: impl Into<String>) -> Self {
        self.user_confirmation = Some(UserConfirmation {
            confirmed_by: confirmed_by.into(),
        });
        self
    }

    fn into_message(self) -> Message {
        Message::Invoke {
            config_profiles: self.config_profiles,
            inputs: self.inputs,
            user_confirmation: self.user_confirmation,
        }
    }
}

/// A remote service, addressed by its base URL.
pub struct ServiceEndpoint {
    base_url: String,
    http: reqwest::Client,
    sender: Arc<HttpMessageSender>,
    retry: RetryOptions,
}

impl ServiceEndpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::new();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            sender: Arc::new(HttpMessageSender::with_client(http.clone())),
            http,
            retry: RetryOptions::default(),
        }
    }

    #[must_use]
    pub fn with_retry_options(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Fetch and decode the service manifest.
    pub async fn manifest(&self) -> Result<ServiceManifest, TransportError> {
        let response = self
            .http
            .get(format!("{}/manifest.json", self.base_url))
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.json::<HttpErrorBody>().await.ok();
            return Err(TransportError::Status { status, body });
        }
        response
            .json::<ServiceManifest>()
            .await
            .map_err(|e| TransportError::Malformed(e.to_string()))
    }

    /// Invoke a command: allocate the client half-channel, POST the
    /// `Invoke`, and build the client context from the service coordinates
    /// returned in the 204 response headers.
    pub async fn invoke(
        &self,
        host: &Arc<AgentChannelHost>,
        command: &str,
        request: InvokeRequest,
    ) -> Result<Arc<ClientContext>, ProtocolError> {
        let (client_id, client_url, client_token) = host.allocate_half_channel();

        let response = self
            .http
            .post(format!("{}/invoke/{}", self.base_url, command))
            .header(HEADER_PROTOCOL_VERSION, PROTOCOL_VERSION)
            .header(HEADER_CLIENT_CHANNEL_ID, &client_id)
            .header(HEADER_CLIENT_CHANNEL_URL, &client_url)
            .header(HEADER_CLIENT_CHANNEL_TOKEN, &client_token)
            .json(&request.into_message())
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.json::<HttpErrorBody>().await.ok();
            return Err(TransportError::Status { status, body }.into());
        }

        let channel = Channel {
            protocol_version: PROTOCOL_VERSION.to_string(),
            command_name: command.to_string(),
            client_channel_id: client_id,
            client_channel_url: client_url,
            client_channel_token: client_token,
            service_channel_id: required_header(&response, HEADER_SERVICE_CHANNEL_ID)?,
            service_channel_url: required_header(&response, HEADER_SERVICE_CHANNEL_URL)?,
            service_channel_token: required_header(&response, HEADER_SERVICE_CHANNEL_TOKEN)?,
        };

        let context = Arc::new(ClientContext::new(
            channel,
            self.sender.clone(),
            self.retry.clone(),
        ));
        host.register(context.clone()).await;
        Ok(context)
    }
}

fn required_header(response: &reqwest::Response, name: &str) -> Result<String, ProtocolError> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            TransportError::Malformed(format!("invoke response is missing {name}")).into()
        })
}
