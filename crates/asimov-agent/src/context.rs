//! The agent-side per-invocation context.

use asimov_contract::{
    Channel, InputEntry, Message, MessageSender, ProtocolError,
};
use asimov_runtime::{AsyncQueue, ContextObserver, NoopObserver, Wait};
use futures::Stream;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Lifecycle of a client context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Invoked,
    Cancelled,
    Finished,
}

/// Exponential backoff with jitter for outgoing sends.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub tries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_jitter: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            tries: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 1.5,
            max_jitter: Duration::from_millis(100),
        }
    }
}

/// Agent-side state for one invocation: the channel, an incoming queue,
/// and a retrying send path.
pub struct ClientContext {
    channel: Channel,
    status: Mutex<ClientStatus>,
    queue: AsyncQueue<Message>,
    sender: Arc<dyn MessageSender>,
    retry: RetryOptions,
    observer: Arc<dyn ContextObserver>,
    provide_seq: AtomicU64,
}

impl ClientContext {
    pub fn new(channel: Channel, sender: Arc<dyn MessageSender>, retry: RetryOptions) -> Self {
        Self {
            channel,
            status: Mutex::new(ClientStatus::Invoked),
            queue: AsyncQueue::new(),
            sender,
            retry,
            observer: Arc::new(NoopObserver),
            provide_seq: AtomicU64::new(0),
        }
    }

    /// Replace the no-op observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ContextObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn status(&self) -> ClientStatus {
        *self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_status(&self, status: ClientStatus) {
        *self.status.lock().unwrap_or_else(|p| p.into_inner()) = status;
    }

    /// Enqueue a message arriving on the client half-channel.
    ///
    /// A `Return` with `close = true` transitions to Finished: pending
    /// waiters complete empty, already-buffered messages stay drainable.
    pub fn handle_incoming_message(&self, message: Message) -> Result<(), ProtocolError> {
        if self.status() != ClientStatus::Invoked {
            return Err(ProtocolError::NotInvoked);
        }
        self.observer.on_incoming_message(&message);
        let closing = message.is_closing_return();
        self.queue.push(message);
        if closing {
            self.set_status(ClientStatus::Finished);
            self.queue.close();
            self.observer.on_close();
        }
        Ok(())
    }

    /// Await the next message.
    ///
    /// Returns `Ok(None)` on timeout or when the invocation has ended and
    /// the buffer is drained.
    pub async fn get_message(&self, wait: Wait) -> Result<Option<Message>, ProtocolError> {
        if self.status() != ClientStatus::Invoked {
            // Only drain what was buffered before the end of the invocation.
            return self.queue.wait_for(|_| true, Wait::Immediate).await;
        }
        self.queue.wait_for(|_| true, wait).await
    }

    /// Lazy, single-shot, finite sequence of incoming messages.
    ///
    /// Yields until the invocation ends (closing return, cancel, or queue
    /// error), then terminates cleanly.
    pub fn messages(&self) -> impl Stream<Item = Message> + '_ {
        async_stream::stream! {
            loop {
                match self.get_message(Wait::Forever).await {
                    Ok(Some(message)) => {
                        let closing = message.is_closing_return();
                        yield message;
                        if closing {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
        }
    }

    /// Supply inputs the service asked for (or volunteered ones).
    pub async fn provide_inputs(&self, inputs: Vec<InputEntry>) -> Result<(), ProtocolError> {
        let message = Message::ProvideInput {
            inputs,
            seq: Some(self.provide_seq.fetch_add(1, Ordering::SeqCst)),
        };
        self.send_message(&message).await
    }

    /// Answer a `RequestUserConfirmation` upcall.
    pub async fn provide_user_confirmation(
        &self,
        request: &Message,
        confirmed_by: &str,
    ) -> Result<(), ProtocolError> {
        let Message::RequestUserConfirmation { req_id, .. } = request else {
            return Err(ProtocolError::UnexpectedMessage(format!(
                "expected requestUserConfirmation, got {}",
                request.tag()
            )));
        };
        let message = Message::ProvideUserConfirmation {
            req_id: req_id.clone(),
            confirmed_by: confirmed_by.to_string(),
        };
        self.send_message(&message).await
    }

    /// Authorize a `RequestPayment` upcall.
    ///
    /// Amount and currency are echoed from the request.
    pub async fn authorize_payment(
        &self,
        request: &Message,
        payment_schema: &str,
        payment_id: &str,
        token: &str,
    ) -> Result<(), ProtocolError> {
        let Message::RequestPayment {
            req_id,
            amount,
            currency,
            ..
        } = request
        else {
            return Err(ProtocolError::UnexpectedMessage(format!(
                "expected requestPayment, got {}",
                request.tag()
            )));
        };
        let message = Message::AuthorizePayment {
            req_id: req_id.clone(),
            payment_id: payment_id.to_string(),
            payment_schema: payment_schema.to_string(),
            amount: *amount,
            currency: currency.clone(),
            token: token.to_string(),
            payment_data: None,
        };
        self.send_message(&message).await
    }

    /// Decline a `RequestPayment` upcall.
    pub async fn reject_payment(
        &self,
        request: &Message,
        reason: Option<&str>,
    ) -> Result<(), ProtocolError> {
        let Message::RequestPayment { req_id, .. } = request else {
            return Err(ProtocolError::UnexpectedMessage(format!(
                "expected requestPayment, got {}",
                request.tag()
            )));
        };
        let message = Message::RejectPayment {
            req_id: req_id.clone(),
            reason: reason.map(str::to_string),
        };
        self.send_message(&message).await
    }

    /// Abort the invocation. Subsequent sends fail with `NotInvoked`.
    pub async fn cancel(&self) -> Result<(), ProtocolError> {
        self.send_message(&Message::Cancel).await?;
        self.set_status(ClientStatus::Cancelled);
        self.queue.flush(Some(ProtocolError::Cancelled));
        self.observer.on_cancel();
        Ok(())
    }

    /// Release queue waiters. Idempotent.
    pub fn dispose(&self) {
        self.queue.close();
        self.observer.on_dispose();
    }

    /// Send with bounded retry: exponential backoff plus jitter, retrying
    /// only transport errors classified as retryable.
    pub async fn send_message(&self, message: &Message) -> Result<(), ProtocolError> {
        if self.status() != ClientStatus::Invoked {
            return Err(ProtocolError::NotInvoked);
        }
        let mut attempt = 0;
        let mut delay = self.retry.base_delay;
        loop {
            attempt += 1;
            match self.sender.send(&self.channel, message).await {
                Ok(()) => {
                    self.observer.on_outgoing_message(message);
                    return Ok(());
                }
                Err(cause) if cause.is_retryable() && attempt < self.retry.tries => {
                    let max_jitter = self.retry.max_jitter.as_millis() as u64;
                    let jitter =
                        Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter));
                    tokio::time::sleep(delay + jitter).await;
                    delay = delay.mul_f64(self.retry.multiplier);
                }
                Err(cause) => {
                    return Err(ProtocolError::SendMessageFailed {
                        channel_id: self.channel.client_channel_id.clone(),
                        retries: attempt,
                        cause: Arc::new(cause),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asimov_contract::{ReturnItem, TransportError};
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    /// Fails the first `failures` sends, then records successes.
    struct FlakySender {
        failures: AtomicU32,
        terminal: bool,
        sent: Mutex<Vec<Message>>,
    }

    impl FlakySender {
        fn new(failures: u32, terminal: bool) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(failures),
                terminal,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageSender for FlakySender {
        async fn send(&self, _c: &Channel, m: &Message) -> Result<(), TransportError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(if self.terminal {
                    TransportError::Status {
                        status: 403,
                        body: None,
                    }
                } else {
                    TransportError::Network("connection reset".to_string())
                });
            }
            self.sent.lock().unwrap().push(m.clone());
            Ok(())
        }
    }

    fn channel() -> Channel {
        Channel {
            protocol_version: "1.0".to_string(),
            command_name: "greet".to_string(),
            client_channel_id: "c1".to_string(),
            client_channel_url: "http://a.test/channel/c1".to_string(),
            client_channel_token: "ct".to_string(),
            service_channel_id: "s1".to_string(),
            service_channel_url: "http://s.test/channel/s1".to_string(),
            service_channel_token: "st".to_string(),
        }
    }

    fn fast_retry() -> RetryOptions {
        RetryOptions {
            tries: 3,
            base_delay: Duration::from_millis(1),
            multiplier: 1.5,
            max_jitter: Duration::from_millis(1),
        }
    }

    fn closing_return() -> Message {
        Message::Return {
            items: vec![ReturnItem::Output {
                output_type: "Greetings".to_string(),
                data: json!("Hello!"),
                summary: None,
            }],
            close: true,
            seq: None,
        }
    }

    #[tokio::test]
    async fn retryable_failures_are_retried_until_success() {
        let sender = FlakySender::new(2, false);
        let ctx = ClientContext::new(channel(), sender.clone(), fast_retry());
        ctx.provide_inputs(vec![InputEntry::new("name", json!("John"))])
            .await
            .unwrap();
        assert_eq!(sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn retries_exhaust_into_send_message_failed() {
        let sender = FlakySender::new(5, false);
        let ctx = ClientContext::new(channel(), sender.clone(), fast_retry());
        let err = ctx
            .provide_inputs(vec![InputEntry::new("name", json!("John"))])
            .await
            .unwrap_err();
        match err {
            ProtocolError::SendMessageFailed { retries, .. } => assert_eq!(retries, 3),
            other => panic!("unexpected error: {other}"),
        }
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn terminal_failures_are_not_retried() {
        let sender = FlakySender::new(5, true);
        let ctx = ClientContext::new(channel(), sender.clone(), fast_retry());
        let err = ctx
            .provide_inputs(vec![InputEntry::new("name", json!("John"))])
            .await
            .unwrap_err();
        match err {
            ProtocolError::SendMessageFailed { retries, cause, .. } => {
                assert_eq!(retries, 1);
                assert!(!cause.is_retryable());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn closing_return_finishes_and_drains() {
        let ctx = ClientContext::new(channel(), FlakySender::new(0, false), fast_retry());
        ctx.handle_incoming_message(closing_return()).unwrap();
        assert_eq!(ctx.status(), ClientStatus::Finished);

        // The buffered closing return is still drainable once.
        let drained = ctx.get_message(Wait::Forever).await.unwrap();
        assert!(matches!(drained, Some(Message::Return { close: true, .. })));
        let after = ctx.get_message(Wait::Forever).await.unwrap();
        assert!(after.is_none());

        // Sends now fail.
        assert!(matches!(
            ctx.provide_inputs(vec![]).await.unwrap_err(),
            ProtocolError::NotInvoked
        ));
    }

    #[tokio::test]
    async fn message_stream_is_finite_and_single_shot() {
        let ctx = Arc::new(ClientContext::new(
            channel(),
            FlakySender::new(0, false),
            fast_retry(),
        ));
        ctx.handle_incoming_message(Message::RequestUserConfirmation {
            req_id: "r1".to_string(),
            reason: Some("Test".to_string()),
        })
        .unwrap();
        ctx.handle_incoming_message(closing_return()).unwrap();

        let collected: Vec<Message> = ctx.messages().collect().await;
        assert_eq!(collected.len(), 2);
        assert!(collected[1].is_closing_return());

        // Second pass yields nothing.
        let again: Vec<Message> = ctx.messages().collect().await;
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn cancel_sends_cancel_and_blocks_further_sends() {
        let sender = FlakySender::new(0, false);
        let ctx = ClientContext::new(channel(), sender.clone(), fast_retry());
        ctx.cancel().await.unwrap();
        assert_eq!(ctx.status(), ClientStatus::Cancelled);
        assert!(matches!(sender.sent()[0], Message::Cancel));
        assert!(matches!(
            ctx.cancel().await.unwrap_err(),
            ProtocolError::NotInvoked
        ));
    }

    #[tokio::test]
    async fn upcall_replies_echo_the_request_correlation() {
        let sender = FlakySender::new(0, false);
        let ctx = ClientContext::new(channel(), sender.clone(), fast_retry());

        let confirmation_req = Message::RequestUserConfirmation {
            req_id: "r-7".to_string(),
            reason: None,
        };
        ctx.provide_user_confirmation(&confirmation_req, "test")
            .await
            .unwrap();

        let payment_req = Message::RequestPayment {
            req_id: "p-9".to_string(),
            accepted_payment_schemas: vec!["test+jwt".to_string()],
            amount: 1000,
            currency: "TST".to_string(),
            description: "Test payment".to_string(),
        };
        ctx.authorize_payment(&payment_req, "test+jwt", "abc123", "token")
            .await
            .unwrap();

        let sent = sender.sent();
        match &sent[0] {
            Message::ProvideUserConfirmation { req_id, confirmed_by } => {
                assert_eq!(req_id, "r-7");
                assert_eq!(confirmed_by, "test");
            }
            other => panic!("unexpected message: {}", other.tag()),
        }
        match &sent[1] {
            Message::AuthorizePayment {
                req_id,
                payment_id,
                payment_schema,
                amount,
                currency,
                ..
            } => {
                assert_eq!(req_id, "p-9");
                assert_eq!(payment_id, "abc123");
                assert_eq!(payment_schema, "test+jwt");
                assert_eq!(*amount, 1000);
                assert_eq!(currency, "TST");
            }
            other => panic!("unexpected message: {}", other.tag()),
        }

        // Mismatched request variants are rejected.
        assert!(ctx
            .provide_user_confirmation(&payment_req, "test")
            .await
            .is_err());
    }
}
