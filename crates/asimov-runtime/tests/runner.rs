mod common;

use asimov_contract::{ContextStatus, ContextStore, Message, ProtocolError, ReturnItem};
use asimov_runtime::{
    CommandHandler, ContextManager, ExecutionRunner, HandlerError, ServiceContext,
};
use asimov_store_adapters::MemoryStore;
use async_trait::async_trait;
use common::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

struct GreetHandler;

#[async_trait]
impl CommandHandler for GreetHandler {
    async fn run(&self, ctx: Arc<ServiceContext>) -> Result<(), HandlerError> {
        let names: Vec<String> = ctx.get_inputs("name", 1).await?;
        ctx.set_state(&json!({"name": names[0]}))?;
        ctx.return_data("Greetings", format!("Hello, {}!", names[0]), None)?;
        // No explicit finish: the runner settles the context.
        Ok(())
    }
}

struct SuspendingHandler;

#[async_trait]
impl CommandHandler for SuspendingHandler {
    async fn run(&self, ctx: Arc<ServiceContext>) -> Result<(), HandlerError> {
        ctx.set_state(&json!({"stage": "waiting"}))?;
        ctx.suspend().await?;
        Ok(())
    }
}

struct FailingHandler;

#[async_trait]
impl CommandHandler for FailingHandler {
    async fn run(&self, _ctx: Arc<ServiceContext>) -> Result<(), HandlerError> {
        Err(HandlerError::new("GreeterBroken", "the greeter exploded"))
    }
}

fn runner_fixture() -> (Arc<MemoryStore>, Arc<ContextManager>, ExecutionRunner) {
    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(ContextManager::new());
    let runner = ExecutionRunner::new(store.clone(), manager.clone());
    (store, manager, runner)
}

#[tokio::test]
async fn runner_finishes_contexts_the_handler_left_active() {
    let (store, manager, runner) = runner_fixture();
    let sender = RecordingSender::new();
    let ctx = make_context(sender.clone());
    manager.add(ctx.clone()).await;

    ctx.handle_incoming(invoke_with_name("John")).await.unwrap();
    runner.spawn(ctx.clone(), Arc::new(GreetHandler)).await.unwrap();

    assert_eq!(ctx.status(), ContextStatus::Finished);
    assert!(manager.is_empty().await);
    assert!(store.get("service-1").await.unwrap().is_none());

    let closing = sender
        .sent()
        .into_iter()
        .find(Message::is_closing_return)
        .expect("closing return");
    match closing {
        Message::Return { items, .. } => assert_eq!(
            items,
            vec![ReturnItem::Output {
                output_type: "Greetings".to_string(),
                data: json!("Hello, John!"),
                summary: None,
            }]
        ),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn runner_persists_suspended_contexts() {
    let (store, manager, runner) = runner_fixture();
    let sender = RecordingSender::new();
    let ctx = make_context(sender);
    manager.add(ctx.clone()).await;

    ctx.handle_incoming(empty_invoke()).await.unwrap();
    runner
        .spawn(ctx.clone(), Arc::new(SuspendingHandler))
        .await
        .unwrap();

    assert!(manager.is_empty().await);
    let record = store
        .get("service-1")
        .await
        .unwrap()
        .expect("suspended context must be stored");
    assert_eq!(record.state.status, ContextStatus::Suspended);
    assert_eq!(record.state.state, json!({"stage": "waiting"}));
    assert_eq!(record.channel.command_name, "greet");
}

#[tokio::test]
async fn suspended_context_resumes_from_the_stored_snapshot() {
    let (store, manager, runner) = runner_fixture();
    let sender = RecordingSender::new();
    let ctx = make_context(sender.clone());
    manager.add(ctx.clone()).await;
    ctx.handle_incoming(empty_invoke()).await.unwrap();
    runner
        .spawn(ctx.clone(), Arc::new(SuspendingHandler))
        .await
        .unwrap();

    let record = store.get("service-1").await.unwrap().unwrap();
    let restored = Arc::new(ServiceContext::restore(
        sender.clone(),
        greet_command(),
        HashMap::new(),
        record.channel,
        Default::default(),
        record.state,
    ));
    manager.add(restored.clone()).await;

    let handle = runner.spawn(restored.clone(), Arc::new(GreetHandler));
    restored
        .handle_incoming(Message::ProvideInput {
            inputs: vec![asimov_contract::InputEntry::new("name", json!("Ada"))],
            seq: None,
        })
        .await
        .unwrap();
    handle.await.unwrap();

    assert_eq!(restored.status(), ContextStatus::Finished);
    assert!(store.get("service-1").await.unwrap().is_none());
}

#[tokio::test]
async fn handler_failure_becomes_an_error_return_and_close() {
    let (store, manager, runner) = runner_fixture();
    let sender = RecordingSender::new();
    let ctx = make_context(sender.clone());
    manager.add(ctx.clone()).await;

    ctx.handle_incoming(empty_invoke()).await.unwrap();
    runner
        .spawn(ctx.clone(), Arc::new(FailingHandler))
        .await
        .unwrap();

    assert_eq!(ctx.status(), ContextStatus::Finished);
    assert!(manager.is_empty().await);
    assert!(store.get("service-1").await.unwrap().is_none());

    let closing = sender
        .sent()
        .into_iter()
        .find(Message::is_closing_return)
        .expect("closing return");
    match closing {
        Message::Return { items, .. } => assert_eq!(
            items,
            vec![ReturnItem::Error {
                error_name: "GreeterBroken".to_string(),
                description: "the greeter exploded".to_string(),
                data: None,
            }]
        ),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn cancelled_context_emits_no_further_messages() {
    let (_store, manager, runner) = runner_fixture();
    let sender = RecordingSender::new();
    let ctx = make_context(sender.clone());
    manager.add(ctx.clone()).await;

    struct WaitsForConfirmation;
    #[async_trait]
    impl CommandHandler for WaitsForConfirmation {
        async fn run(&self, ctx: Arc<ServiceContext>) -> Result<(), HandlerError> {
            ctx.request_user_confirmation(Some("test")).await?;
            ctx.return_data("Greetings", "never sent", None)?;
            Ok(())
        }
    }

    ctx.handle_incoming(empty_invoke()).await.unwrap();
    let handle = runner.spawn(ctx.clone(), Arc::new(WaitsForConfirmation));
    sender
        .wait_for_sent(|m| matches!(m, Message::RequestUserConfirmation { .. }))
        .await;
    ctx.handle_incoming(Message::Cancel).await.unwrap();
    handle.await.unwrap();

    assert_eq!(ctx.status(), ContextStatus::Cancelled);
    // The pending wait failed with the cancel error; nothing further went
    // out, in particular no closing return.
    assert!(!sender.sent().iter().any(Message::is_closing_return));
}

#[tokio::test]
async fn protocol_errors_map_into_handler_failures() {
    let err: HandlerError = ProtocolError::ConfirmationTimeout.into();
    assert_eq!(err.name, "ConfirmationTimeout");
    let err: HandlerError = ProtocolError::Cancelled.into();
    assert_eq!(err.name, "Cancelled");
}
