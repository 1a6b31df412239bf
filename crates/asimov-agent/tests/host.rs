//! The agent-hosted client half-channel router.

use asimov_agent::{AgentChannelHost, ClientContext, ClientStatus, RetryOptions};
use asimov_contract::{Channel, Message, MessageSender, ReturnItem, TransportError};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

struct NullSender;

#[async_trait]
impl MessageSender for NullSender {
    async fn send(&self, _c: &Channel, _m: &Message) -> Result<(), TransportError> {
        Ok(())
    }
}

async fn registered_context(host: &Arc<AgentChannelHost>) -> Arc<ClientContext> {
    let (id, url, token) = host.allocate_half_channel();
    let channel = Channel {
        protocol_version: "1.0".to_string(),
        command_name: "greet".to_string(),
        client_channel_id: id,
        client_channel_url: url,
        client_channel_token: token,
        service_channel_id: "s1".to_string(),
        service_channel_url: "http://service.test/channel/s1".to_string(),
        service_channel_token: "st".to_string(),
    };
    let context = Arc::new(ClientContext::new(
        channel,
        Arc::new(NullSender),
        RetryOptions::default(),
    ));
    host.register(context.clone()).await;
    context
}

fn post(uri: &str, token: Option<&str>, body: &Message) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn closing_return() -> Message {
    Message::Return {
        items: vec![ReturnItem::Output {
            output_type: "Greetings".to_string(),
            data: json!("Hello, John!"),
            summary: None,
        }],
        close: true,
        seq: Some(0),
    }
}

#[tokio::test]
async fn closing_return_is_routed_and_deregisters_the_channel() {
    let host = AgentChannelHost::new("http://agent.test").unwrap();
    let context = registered_context(&host).await;
    let app = host.router();
    let id = context.channel().client_channel_id.clone();
    let token = context.channel().client_channel_token.clone();
    assert_eq!(
        context.channel().client_channel_url,
        format!("http://agent.test/channel/{id}")
    );

    let response = app
        .clone()
        .oneshot(post(
            &format!("/channel/{id}"),
            Some(&token),
            &closing_return(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(context.status(), ClientStatus::Finished);
    assert!(host.get(&id).await.is_none());
}

#[tokio::test]
async fn headers_only_routing_reaches_the_same_context() {
    let host = AgentChannelHost::new("http://agent.test").unwrap();
    let context = registered_context(&host).await;
    let app = host.router();
    let id = context.channel().client_channel_id.clone();
    let token = context.channel().client_channel_token.clone();

    let request = Request::builder()
        .method("POST")
        .uri("/channel")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header("x-asmv-client-channel-id", &id)
        .body(Body::from(
            serde_json::to_vec(&Message::RequestUserConfirmation {
                req_id: "r1".to_string(),
                reason: None,
            })
            .unwrap(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(host.get(&id).await.is_some());
}

#[tokio::test]
async fn bad_credentials_and_bad_payloads_are_rejected() {
    let host = AgentChannelHost::new("http://agent.test").unwrap();
    let context = registered_context(&host).await;
    let app = host.router();
    let id = context.channel().client_channel_id.clone();
    let token = context.channel().client_channel_token.clone();

    let response = app
        .clone()
        .oneshot(post(&format!("/channel/{id}"), None, &closing_return()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(post(
            &format!("/channel/{id}"),
            Some("wrong"),
            &closing_return(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(post(
            "/channel/unknown-id",
            Some(&token),
            &closing_return(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // An Invoke never belongs on a client channel.
    let response = app
        .clone()
        .oneshot(post(
            &format!("/channel/{id}"),
            Some(&token),
            &Message::Invoke {
                config_profiles: HashMap::new(),
                inputs: vec![],
                user_confirmation: None,
            },
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
