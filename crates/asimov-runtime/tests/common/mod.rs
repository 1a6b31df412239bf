use asimov_contract::{
    Channel, CommandDefinition, ConfigProfileDefinition, IoTypeDescriptor, Message, MessageSender,
    ProfileScope, TransportError,
};
use asimov_runtime::{ServiceContext, ServiceContextOptions};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Captures outgoing messages; can be switched into a failing mode.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<Message>>,
    fail: AtomicBool,
}

impl RecordingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    /// Poll until a sent message satisfies `predicate`.
    pub async fn wait_for_sent<F>(&self, predicate: F) -> Message
    where
        F: Fn(&Message) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(found) = self.sent().into_iter().find(|m| predicate(m)) {
                return found;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected message was never sent"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, _channel: &Channel, message: &Message) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Network("injected failure".to_string()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

pub fn test_channel(command_name: &str) -> Channel {
    Channel {
        protocol_version: "1.0".to_string(),
        command_name: command_name.to_string(),
        client_channel_id: "client-1".to_string(),
        client_channel_url: "http://agent.test/channel".to_string(),
        client_channel_token: "client-token".to_string(),
        service_channel_id: "service-1".to_string(),
        service_channel_url: "http://service.test/channel".to_string(),
        service_channel_token: "service-token".to_string(),
    }
}

pub fn greet_command() -> Arc<CommandDefinition> {
    Arc::new(
        CommandDefinition::new("greet")
            .with_description("en", "Greet a user")
            .with_input_type(
                "name",
                IoTypeDescriptor::new("The name to greet").with_schema(json!({"type": "string"})),
            )
            .unwrap()
            .with_output_type(
                "Greetings",
                IoTypeDescriptor::new("The greeting").with_schema(json!({"type": "string"})),
            )
            .unwrap(),
    )
}

pub fn billing_profile() -> Arc<ConfigProfileDefinition> {
    Arc::new(
        ConfigProfileDefinition::new(
            "billing",
            ProfileScope::Organization,
            "http://service.test/setup",
            "Billing account binding",
        )
        .with_schema(json!({
            "type": "object",
            "properties": { "account": { "type": "string" } },
            "required": ["account"]
        }))
        .unwrap(),
    )
}

pub fn make_context(sender: Arc<RecordingSender>) -> Arc<ServiceContext> {
    make_context_with(sender, greet_command(), HashMap::new(), Default::default())
}

pub fn make_context_with(
    sender: Arc<RecordingSender>,
    command: Arc<CommandDefinition>,
    profiles: HashMap<String, Arc<ConfigProfileDefinition>>,
    options: ServiceContextOptions,
) -> Arc<ServiceContext> {
    let name = command.name().to_string();
    Arc::new(ServiceContext::new(
        sender,
        command,
        profiles,
        test_channel(&name),
        options,
    ))
}

pub fn invoke_with_name(name: &str) -> Message {
    Message::Invoke {
        config_profiles: HashMap::new(),
        inputs: vec![asimov_contract::InputEntry::new("name", json!(name))],
        user_confirmation: None,
    }
}

pub fn empty_invoke() -> Message {
    Message::Invoke {
        config_profiles: HashMap::new(),
        inputs: vec![],
        user_confirmation: None,
    }
}
