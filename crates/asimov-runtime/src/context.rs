//! The per-invocation service context.
//!
//! Interleaves handler-authored logic with incoming messages through two
//! physically separate queues: provided inputs are demultiplexed into the
//! input buffer on arrival, everything else flows through the message
//! queue. Correlated upcalls wait on the message queue with a per-reqId
//! predicate; `get_inputs` waits on the input buffer with a per-type
//! predicate.

use crate::observer::{ContextObserver, NoopObserver};
use crate::queue::{AsyncQueue, Wait};
use asimov_contract::{
    generate_req_id, Channel, CommandDefinition, ConfigProfileDefinition, ContextStatus,
    InputEntry, Message, MessageSender, PaymentAuthorization, ProtocolError, ReturnItem,
    SchemaViolation, SerializedContext, UserConfirmation,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Options for payment upcalls.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub amount: u64,
    pub currency: String,
    pub description: String,
    /// Overrides the context default when set.
    pub accepted_payment_schemas: Option<Vec<String>>,
}

impl PaymentRequest {
    pub fn new(amount: u64, currency: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
            description: description.into(),
            accepted_payment_schemas: None,
        }
    }

    #[must_use]
    pub fn with_accepted_payment_schemas(mut self, schemas: Vec<String>) -> Self {
        self.accepted_payment_schemas = Some(schemas);
        self
    }
}

/// Construction options for a [`ServiceContext`].
#[derive(Debug, Clone)]
pub struct ServiceContextOptions {
    /// Check `return_data` payloads against declared output schemas.
    pub validate_return_types: bool,
    /// Admission bound across both queues; exceeding it rejects the
    /// incoming message with `MessageBufferFull`.
    pub max_queued_messages: usize,
    /// Default schemas offered by `request_payment`.
    pub accepted_payment_schemas: Vec<String>,
    /// Default timeout for upcall waits.
    pub upcall_timeout: Duration,
}

impl Default for ServiceContextOptions {
    fn default() -> Self {
        Self {
            validate_return_types: true,
            max_queued_messages: 1024,
            accepted_payment_schemas: Vec::new(),
            upcall_timeout: Duration::from_secs(300),
        }
    }
}

/// Service-side per-invocation state.
pub struct ServiceContext {
    channel: Channel,
    command: Arc<CommandDefinition>,
    profiles: HashMap<String, Arc<ConfigProfileDefinition>>,
    options: ServiceContextOptions,
    sender: Arc<dyn MessageSender>,
    observer: Arc<dyn ContextObserver>,
    status: Mutex<ContextStatus>,
    state: Mutex<Value>,
    config_profiles: Mutex<HashMap<String, Value>>,
    message_queue: AsyncQueue<Message>,
    input_queue: AsyncQueue<InputEntry>,
    return_buffer: Mutex<Vec<ReturnItem>>,
    return_seq: AtomicU64,
}

impl ServiceContext {
    /// Create a fresh context awaiting its Invoke.
    pub fn new(
        sender: Arc<dyn MessageSender>,
        command: Arc<CommandDefinition>,
        profiles: HashMap<String, Arc<ConfigProfileDefinition>>,
        channel: Channel,
        options: ServiceContextOptions,
    ) -> Self {
        Self {
            channel,
            command,
            profiles,
            options,
            sender,
            observer: Arc::new(NoopObserver),
            status: Mutex::new(ContextStatus::Initialized),
            state: Mutex::new(Value::Null),
            config_profiles: Mutex::new(HashMap::new()),
            message_queue: AsyncQueue::new(),
            input_queue: AsyncQueue::new(),
            return_buffer: Mutex::new(Vec::new()),
            return_seq: AtomicU64::new(0),
        }
    }

    /// Rebuild a context from a stored snapshot.
    ///
    /// A suspended snapshot resumes as Active so the handler's state
    /// machine continues where it left off; buffered queue items are
    /// re-seeded in order.
    pub fn restore(
        sender: Arc<dyn MessageSender>,
        command: Arc<CommandDefinition>,
        profiles: HashMap<String, Arc<ConfigProfileDefinition>>,
        channel: Channel,
        options: ServiceContextOptions,
        snapshot: SerializedContext,
    ) -> Self {
        let status = match snapshot.status {
            ContextStatus::Suspended => ContextStatus::Active,
            other => other,
        };
        let ctx = Self::new(sender, command, profiles, channel, options);
        *ctx.lock_status() = status;
        *ctx.state.lock().unwrap_or_else(|p| p.into_inner()) = snapshot.state;
        *ctx.config_profiles.lock().unwrap_or_else(|p| p.into_inner()) = snapshot.config_profiles;
        ctx.message_queue.seed(snapshot.message_queue);
        ctx.input_queue.seed(snapshot.input_queue);
        ctx
    }

    /// Replace the no-op observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ContextObserver>) -> Self {
        self.observer = observer;
        self
    }

    fn lock_status(&self) -> MutexGuard<'_, ContextStatus> {
        self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_return_buffer(&self) -> MutexGuard<'_, Vec<ReturnItem>> {
        self.return_buffer.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn command(&self) -> &CommandDefinition {
        &self.command
    }

    pub fn status(&self) -> ContextStatus {
        *self.lock_status()
    }

    // -----------------------------------------------------------------
    // Incoming dispatch
    // -----------------------------------------------------------------

    /// Route one incoming message.
    ///
    /// Resolves before any handler-visible effect of the message is
    /// observed, so the transport can answer without waiting on handler
    /// logic. Validation failures leave the context untouched.
    pub async fn handle_incoming(&self, message: Message) -> Result<(), ProtocolError> {
        self.observer.on_incoming_message(&message);
        let status = self.status();
        match (status, message) {
            (ContextStatus::Initialized, Message::Invoke { config_profiles, inputs, user_confirmation }) => {
                self.accept_invoke(config_profiles, inputs, user_confirmation)?;
            }
            (ContextStatus::Initialized, other) => {
                return Err(ProtocolError::UnexpectedMessage(format!(
                    "context not invoked, cannot accept {}",
                    other.tag()
                )));
            }
            (ContextStatus::Active, Message::Invoke { .. }) => {
                return Err(ProtocolError::UnexpectedMessage(
                    "command already invoked".to_string(),
                ));
            }
            (ContextStatus::Active, Message::ProvideInput { inputs, seq }) => {
                self.admit(inputs.len())?;
                // Fail fast across the whole list: nothing is admitted
                // unless every entry validates.
                for entry in &inputs {
                    self.command.validate_input(&entry.input_type, &entry.value)?;
                }
                let note = Message::ProvideInput {
                    inputs: inputs.clone(),
                    seq,
                };
                for entry in inputs {
                    self.input_queue.push(entry);
                }
                self.observer.on_message(&note);
            }
            (
                ContextStatus::Active,
                message @ (Message::ProvideUserConfirmation { .. }
                | Message::AuthorizePayment { .. }
                | Message::RejectPayment { .. }),
            ) => {
                self.admit(1)?;
                self.observer.on_message(&message);
                self.message_queue.push(message);
            }
            (ContextStatus::Active, Message::Cancel) => {
                self.enter_cancelled();
                return Ok(());
            }
            (ContextStatus::Active, other) => {
                return Err(ProtocolError::UnexpectedMessage(format!(
                    "service cannot accept {}",
                    other.tag()
                )));
            }
            (_, _) => return Err(ProtocolError::NotActive),
        }

        // A previous flush may have failed and restored its batch; retry
        // while the context is still active.
        if self.status() == ContextStatus::Active && !self.lock_return_buffer().is_empty() {
            self.flush_return_buffer(false).await?;
        }
        Ok(())
    }

    fn admit(&self, incoming: usize) -> Result<(), ProtocolError> {
        let queued = self.message_queue.len() + self.input_queue.len();
        if queued + incoming > self.options.max_queued_messages {
            return Err(ProtocolError::MessageBufferFull);
        }
        Ok(())
    }

    fn accept_invoke(
        &self,
        supplied_profiles: HashMap<String, Value>,
        inputs: Vec<InputEntry>,
        user_confirmation: Option<UserConfirmation>,
    ) -> Result<(), ProtocolError> {
        let mut child_errors = Vec::new();

        for name in self.command.required_config_profiles() {
            match supplied_profiles.get(name) {
                None => child_errors.push(SchemaViolation {
                    path: format!("/configProfiles/{name}"),
                    message: format!("required config profile missing: {name}"),
                }),
                Some(value) => {
                    if let Some(profile) = self.profiles.get(name) {
                        if let Err(e) = profile.validate(value) {
                            child_errors.extend(e.child_errors().iter().cloned().map(|v| {
                                SchemaViolation {
                                    path: format!("/configProfiles/{name}{}", v.path),
                                    message: v.message,
                                }
                            }));
                        }
                    }
                }
            }
        }
        for name in supplied_profiles.keys() {
            if !self.profiles.contains_key(name) && !self.command.requires_config_profile(name) {
                child_errors.push(SchemaViolation {
                    path: format!("/configProfiles/{name}"),
                    message: format!("unknown config profile: {name}"),
                });
            }
        }

        for (idx, entry) in inputs.iter().enumerate() {
            if let Err(e) = self.command.validate_input(&entry.input_type, &entry.value) {
                if e.child_errors().is_empty() {
                    child_errors.push(SchemaViolation {
                        path: format!("/inputs/{idx}"),
                        message: e.to_string(),
                    });
                } else {
                    child_errors.extend(e.child_errors().iter().cloned().map(|v| {
                        SchemaViolation {
                            path: format!("/inputs/{idx}/value{}", v.path),
                            message: v.message,
                        }
                    }));
                }
            }
        }

        if !child_errors.is_empty() {
            return Err(ProtocolError::InvalidMessage {
                message: "Invoke validation failed".to_string(),
                child_errors,
            });
        }

        *self.config_profiles.lock().unwrap_or_else(|p| p.into_inner()) = supplied_profiles;
        *self.lock_status() = ContextStatus::Active;
        for entry in inputs {
            self.input_queue.push(entry);
        }
        if let Some(confirmation) = user_confirmation {
            // Standing confirmation: consumable once by the first matching
            // confirmation wait, addressed by the empty reqId.
            self.message_queue.push(Message::ProvideUserConfirmation {
                req_id: String::new(),
                confirmed_by: confirmation.confirmed_by,
            });
        }
        Ok(())
    }

    fn enter_cancelled(&self) {
        *self.lock_status() = ContextStatus::Cancelled;
        self.input_queue.flush(Some(ProtocolError::Cancelled));
        self.message_queue.flush(Some(ProtocolError::Cancelled));
        // Unflushed returns are dropped on cancellation.
        self.lock_return_buffer().clear();
        self.observer.on_cancel();
    }

    // -----------------------------------------------------------------
    // Outbound path
    // -----------------------------------------------------------------

    async fn send_message(&self, message: &Message) -> Result<(), ProtocolError> {
        if self.status() != ContextStatus::Active {
            return Err(ProtocolError::NotActive);
        }
        self.sender.send(&self.channel, message).await?;
        self.observer.on_outgoing_message(message);
        Ok(())
    }

    /// Flush the return buffer as one `Return` batch.
    ///
    /// Double-buffered: the batch is swapped out before sending; on
    /// transport failure it is spliced back in front of anything buffered
    /// meanwhile, preserving item order.
    async fn flush_return_buffer(&self, close: bool) -> Result<(), ProtocolError> {
        let batch = std::mem::take(&mut *self.lock_return_buffer());
        if batch.is_empty() && !close {
            return Ok(());
        }
        let message = Message::Return {
            items: batch.clone(),
            close,
            seq: Some(self.return_seq.fetch_add(1, Ordering::SeqCst)),
        };
        match self.send_message(&message).await {
            Ok(()) => {
                if close {
                    self.observer.on_close();
                }
                Ok(())
            }
            Err(e) => {
                let mut buffer = self.lock_return_buffer();
                let mut restored = batch;
                restored.append(&mut buffer);
                *buffer = restored;
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------
    // Handler-visible API
    // -----------------------------------------------------------------

    /// Collect `count` inputs of `input_type`, demanding more from the
    /// agent when the buffer runs dry. Uses the configured upcall timeout.
    pub async fn get_inputs<T: DeserializeOwned>(
        &self,
        input_type: &str,
        count: usize,
    ) -> Result<Vec<T>, ProtocolError> {
        self.get_inputs_with_timeout(input_type, count, self.options.upcall_timeout)
            .await
    }

    /// Like [`Self::get_inputs`] with an explicit timeout.
    ///
    /// Buffered inputs are drained without any outbound traffic. When the
    /// buffer has nothing of the requested type, a `RequestInput` for the
    /// remaining count is sent; the first demand waits indefinitely (an
    /// agent may take arbitrary time to respond), later demands are bounded
    /// by the timeout and fail with `InputTimeout`.
    pub async fn get_inputs_with_timeout<T: DeserializeOwned>(
        &self,
        input_type: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<T>, ProtocolError> {
        if !self.command.has_input_type(input_type) {
            return Err(ProtocolError::UnknownInputType(input_type.to_string()));
        }
        let mut collected = Vec::with_capacity(count);
        let mut first_demand = true;
        while collected.len() < count {
            if let Some(entry) = self
                .input_queue
                .wait_for(input_predicate(input_type), Wait::Immediate)
                .await?
            {
                collected.push(decode(entry.value)?);
                continue;
            }

            let remaining = (count - collected.len()) as u32;
            let demand = self
                .command
                .input_type(input_type)
                .ok_or_else(|| ProtocolError::UnknownInputType(input_type.to_string()))?
                .demand(remaining);
            self.send_message(&Message::RequestInput {
                inputs: BTreeMap::from([(input_type.to_string(), demand)]),
            })
            .await?;

            let wait = if first_demand {
                Wait::Forever
            } else {
                Wait::For(timeout)
            };
            first_demand = false;
            match self
                .input_queue
                .wait_for(input_predicate(input_type), wait)
                .await?
            {
                Some(entry) => collected.push(decode(entry.value)?),
                None => return Err(ProtocolError::InputTimeout(input_type.to_string())),
            }
        }
        Ok(collected)
    }

    /// Ask the agent's user to confirm an action. Uses the configured
    /// upcall timeout.
    pub async fn request_user_confirmation(
        &self,
        reason: Option<&str>,
    ) -> Result<UserConfirmation, ProtocolError> {
        self.request_user_confirmation_with_timeout(reason, self.options.upcall_timeout)
            .await
    }

    /// Like [`Self::request_user_confirmation`] with an explicit timeout.
    ///
    /// The wait also accepts a standing confirmation carried by the Invoke
    /// (empty reqId), consuming it exactly once.
    pub async fn request_user_confirmation_with_timeout(
        &self,
        reason: Option<&str>,
        timeout: Duration,
    ) -> Result<UserConfirmation, ProtocolError> {
        let req_id = generate_req_id();
        self.send_message(&Message::RequestUserConfirmation {
            req_id: req_id.clone(),
            reason: reason.map(str::to_string),
        })
        .await?;

        let expected = req_id;
        let reply = self
            .message_queue
            .wait_for(
                move |m| match m {
                    Message::ProvideUserConfirmation { req_id, .. } => {
                        *req_id == expected || req_id.is_empty()
                    }
                    _ => false,
                },
                Wait::For(timeout),
            )
            .await?;
        match reply {
            Some(Message::ProvideUserConfirmation { confirmed_by, .. }) => {
                Ok(UserConfirmation { confirmed_by })
            }
            Some(other) => Err(ProtocolError::UnexpectedMessage(other.tag().to_string())),
            None => Err(ProtocolError::ConfirmationTimeout),
        }
    }

    /// Request payment authorization. Uses the configured upcall timeout.
    pub async fn request_payment(
        &self,
        request: PaymentRequest,
    ) -> Result<PaymentAuthorization, ProtocolError> {
        self.request_payment_with_timeout(request, self.options.upcall_timeout)
            .await
    }

    /// Like [`Self::request_payment`] with an explicit timeout.
    pub async fn request_payment_with_timeout(
        &self,
        request: PaymentRequest,
        timeout: Duration,
    ) -> Result<PaymentAuthorization, ProtocolError> {
        let req_id = generate_req_id();
        let schemas = request
            .accepted_payment_schemas
            .unwrap_or_else(|| self.options.accepted_payment_schemas.clone());
        self.send_message(&Message::RequestPayment {
            req_id: req_id.clone(),
            accepted_payment_schemas: schemas,
            amount: request.amount,
            currency: request.currency.clone(),
            description: request.description.clone(),
        })
        .await?;

        let expected = req_id;
        let reply = self
            .message_queue
            .wait_for(
                move |m| match m {
                    Message::AuthorizePayment { req_id, .. }
                    | Message::RejectPayment { req_id, .. } => *req_id == expected,
                    _ => false,
                },
                Wait::For(timeout),
            )
            .await?;
        match reply {
            Some(Message::AuthorizePayment {
                payment_id,
                payment_schema,
                currency,
                token,
                payment_data,
                ..
            }) => Ok(PaymentAuthorization {
                payment_id,
                payment_schema,
                // The cap is the requested amount, not the authorize
                // message's amount.
                max_amount: request.amount,
                currency,
                token,
                payment_data,
            }),
            Some(Message::RejectPayment { reason, .. }) => {
                Err(ProtocolError::PaymentRejected { reason })
            }
            Some(other) => Err(ProtocolError::UnexpectedMessage(other.tag().to_string())),
            None => Err(ProtocolError::PaymentTimeout),
        }
    }

    /// Buffer one output for the next `Return` flush.
    pub fn return_data<T: Serialize>(
        &self,
        output_type: &str,
        data: T,
        summary: Option<&str>,
    ) -> Result<(), ProtocolError> {
        let value = serde_json::to_value(data)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        if self.options.validate_return_types {
            self.command.validate_output(output_type, &value)?;
        }
        self.lock_return_buffer().push(ReturnItem::Output {
            output_type: output_type.to_string(),
            data: value,
            summary: summary.map(str::to_string),
        });
        Ok(())
    }

    /// Buffer one error for the next `Return` flush. No schema check.
    pub fn return_error(&self, error_name: &str, description: &str, data: Option<Value>) {
        self.lock_return_buffer().push(ReturnItem::Error {
            error_name: error_name.to_string(),
            description: description.to_string(),
            data,
        });
    }

    /// Flush the return buffer with `close = true` and finish the context.
    pub async fn finish(&self) -> Result<(), ProtocolError> {
        if self.status() != ContextStatus::Active {
            return Err(ProtocolError::NotActive);
        }
        self.flush_return_buffer(true).await?;
        *self.lock_status() = ContextStatus::Finished;
        self.observer.on_finish();
        Ok(())
    }

    /// Flush pending returns (without closing) and suspend the context.
    /// The execution runner serializes and disposes it afterwards.
    pub async fn suspend(&self) -> Result<(), ProtocolError> {
        if self.status() != ContextStatus::Active {
            return Err(ProtocolError::NotActive);
        }
        if !self.lock_return_buffer().is_empty() {
            self.flush_return_buffer(false).await?;
        }
        *self.lock_status() = ContextStatus::Suspended;
        self.observer.on_suspend();
        Ok(())
    }

    /// Read a config profile stored at Invoke.
    ///
    /// Fails with `ProfileNotRequired` when the command does not declare
    /// the profile.
    pub fn get_config_profile<T: DeserializeOwned>(&self, name: &str) -> Result<T, ProtocolError> {
        if !self.command.requires_config_profile(name) {
            return Err(ProtocolError::ProfileNotRequired(name.to_string()));
        }
        let value = self
            .config_profiles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| ProtocolError::MissingConfigProfile(name.to_string()))?;
        decode(value)
    }

    /// Replace the user-chosen state value carried across suspensions.
    pub fn set_state<T: Serialize>(&self, state: &T) -> Result<(), ProtocolError> {
        let value = serde_json::to_value(state)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = value;
        Ok(())
    }

    /// Read the user-chosen state value.
    pub fn state<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let value = self.state.lock().unwrap_or_else(|p| p.into_inner()).clone();
        decode(value)
    }

    /// Raw state value, for callers that keep it opaque.
    pub fn state_value(&self) -> Value {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    // -----------------------------------------------------------------
    // Serialization and teardown
    // -----------------------------------------------------------------

    /// Snapshot the context for the store.
    pub fn serialize(&self) -> SerializedContext {
        SerializedContext {
            status: self.status(),
            config_profiles: self
                .config_profiles
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone(),
            state: self.state_value(),
            message_queue: self.message_queue.snapshot(),
            input_queue: self.input_queue.snapshot(),
        }
    }

    /// Release queue waiters and emit the dispose event. Idempotent.
    pub fn dispose(&self) {
        self.message_queue.close();
        self.input_queue.close();
        self.observer.on_dispose();
    }
}

fn input_predicate(input_type: &str) -> impl Fn(&InputEntry) -> bool + Send + 'static {
    let wanted = input_type.to_string();
    move |entry: &InputEntry| entry.input_type == wanted
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}
