//! End-to-end tests against live Postgres, Redis and RabbitMQ.
//!
//! All tests here are ignored by default; run them with
//! `cargo test -- --ignored` after `docker-compose up -d`.

mod test_utils;

use chrono::Utc;
use serial_test::serial;
use std::time::Duration;

use courier_server::dto::{
    PersistenceUpdate, RegisterConsumerRequest, RegisterProducerRequest, SendMessageRequest,
};
use courier_server::error::AppError;
use courier_server::models::{retention_expiry, RetainedMessage};
use courier_server::service::{consumer, producer};
use test_utils::{live_context, project_token, unique_username};

const PASSWORD: &str = "s3cretpass";

fn consumer_request(strategy: &str, queue: &str, exchange: &str) -> RegisterConsumerRequest {
    RegisterConsumerRequest {
        username: unique_username(),
        password: PASSWORD.to_string(),
        persistence_time: 0,
        broker: "rabbitmq".to_string(),
        strategy: strategy.to_string(),
        queue: queue.to_string(),
        exchange: Some(exchange.to_string()),
        routing_key: None,
        headers: None,
    }
}

fn producer_request(strategy: &str, queue: &str, exchange: &str) -> RegisterProducerRequest {
    RegisterProducerRequest {
        username: unique_username(),
        password: PASSWORD.to_string(),
        broker: "rabbitmq".to_string(),
        strategy: strategy.to_string(),
        exchange: Some(exchange.to_string()),
        queue: Some(queue.to_string()),
        routing_key: None,
        headers: None,
    }
}

fn send_request(data: &str) -> SendMessageRequest {
    SendMessageRequest {
        data: data.to_string(),
        strategy: None,
        exchange: None,
        queue: None,
        routing_key: None,
        headers: None,
    }
}

/// Scenario: a `direct` consumer with no routing key attaches fine, the
/// binding key defaulting to the queue name.
#[tokio::test]
#[serial]
#[ignore = "requires running Postgres, Redis and RabbitMQ"]
async fn direct_consumer_attaches_without_a_routing_key() {
    let ctx = live_context().await;
    let token = project_token(&ctx, "project-a");
    let suffix = unique_username();

    let dto = consumer::register(
        &ctx,
        consumer_request("direct", &format!("q-{suffix}"), &format!("ex-{suffix}")),
        &token,
    )
    .await
    .unwrap();

    let (_rx, _guard) = consumer::connect(&ctx, &dto.id, &token).await.unwrap();
    assert!(ctx.sessions.is_open(&dto.id));

    consumer::disconnect(&ctx, &dto.id, &token).await.unwrap();
    assert!(!ctx.sessions.is_open(&dto.id));
    // Disconnecting again must be a no-op, not an error.
    consumer::disconnect(&ctx, &dto.id, &token).await.unwrap();
}

/// Scenario: registering a `topic` consumer without a routing key fails at
/// registration time, before any topology is declared.
#[tokio::test]
#[serial]
#[ignore = "requires running Postgres, Redis and RabbitMQ"]
async fn topic_registration_without_a_key_fails_fast() {
    let ctx = live_context().await;
    let token = project_token(&ctx, "project-a");
    let suffix = unique_username();

    let err = consumer::register(
        &ctx,
        consumer_request("topic", &format!("q-{suffix}"), &format!("ex-{suffix}")),
        &token,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::IncompatibleStrategy(_)));
}

/// Scenario: a fanout producer sends without any routing key; topology is
/// declared on first send and reused afterwards.
#[tokio::test]
#[serial]
#[ignore = "requires running Postgres, Redis and RabbitMQ"]
async fn fanout_send_needs_no_routing_key() {
    let ctx = live_context().await;
    let token = project_token(&ctx, "project-a");
    let suffix = unique_username();

    let dto = producer::register(
        &ctx,
        producer_request("fanout", &format!("q-{suffix}"), &format!("ex-{suffix}")),
        &token,
    )
    .await
    .unwrap();

    let first = producer::send(&ctx, &dto.id, send_request("one"), &token)
        .await
        .unwrap();
    let second = producer::send(&ctx, &dto.id, send_request("two"), &token)
        .await
        .unwrap();
    assert_ne!(first, second, "every send gets a fresh message id");
}

/// Scenario: a topology name declared `direct` can never be redeclared
/// `fanout`.
#[tokio::test]
#[serial]
#[ignore = "requires running Postgres, Redis and RabbitMQ"]
async fn conflicting_redeclaration_is_rejected() {
    let ctx = live_context().await;
    let token = project_token(&ctx, "project-a");
    let suffix = unique_username();
    let queue = format!("orders-{suffix}");
    let exchange = format!("orders-ex-{suffix}");

    let direct = producer::register(&ctx, producer_request("direct", &queue, &exchange), &token)
        .await
        .unwrap();
    producer::send(&ctx, &direct.id, send_request("ok"), &token)
        .await
        .unwrap();

    let fanout = producer::register(&ctx, producer_request("fanout", &queue, &exchange), &token)
        .await
        .unwrap();
    let err = producer::send(&ctx, &fanout.id, send_request("conflict"), &token)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::TopologyConflict(_)));
}

/// A valid token for another project must never reach a resource it does
/// not own.
#[tokio::test]
#[serial]
#[ignore = "requires running Postgres, Redis and RabbitMQ"]
async fn foreign_project_token_is_unauthorized() {
    let ctx = live_context().await;
    let owner = project_token(&ctx, "project-1");
    let intruder = project_token(&ctx, "project-2");
    let suffix = unique_username();

    let dto = consumer::register(
        &ctx,
        consumer_request("direct", &format!("q-{suffix}"), &format!("ex-{suffix}")),
        &owner,
    )
    .await
    .unwrap();

    assert!(matches!(
        consumer::get(&ctx, &dto.id, &intruder).await,
        Err(AppError::Unauthorized(_))
    ));
    assert!(matches!(
        consumer::set_persistence_time(
            &ctx,
            &dto.id,
            PersistenceUpdate {
                persistence_time: 1000
            },
            &intruder
        )
        .await,
        Err(AppError::Unauthorized(_))
    ));
    assert!(matches!(
        consumer::delete(&ctx, &dto.id, &intruder).await,
        Err(AppError::Unauthorized(_))
    ));

    // The owner still can.
    assert!(consumer::get(&ctx, &dto.id, &owner).await.is_ok());
}

/// Full pipeline: producer publish, broker delivery, retention store, live
/// push to the open session.
#[tokio::test]
#[serial]
#[ignore = "requires running Postgres, Redis and RabbitMQ"]
async fn delivery_reaches_the_session_and_the_store() {
    let ctx = live_context().await;
    let token = project_token(&ctx, "project-a");
    let suffix = unique_username();
    let queue = format!("q-{suffix}");
    let exchange = format!("ex-{suffix}");

    let mut consumer_req = consumer_request("direct", &queue, &exchange);
    consumer_req.persistence_time = 60_000;
    let consumer_dto = consumer::register(&ctx, consumer_req, &token).await.unwrap();
    let (mut rx, _guard) = consumer::connect(&ctx, &consumer_dto.id, &token)
        .await
        .unwrap();

    let producer_dto = producer::register(
        &ctx,
        producer_request("direct", &queue, &exchange),
        &token,
    )
    .await
    .unwrap();
    let message_id = producer::send(&ctx, &producer_dto.id, send_request("hello"), &token)
        .await
        .unwrap();

    let pushed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no message pushed within 5s")
        .expect("push channel closed");
    assert_eq!(pushed.message_id, message_id);
    assert_eq!(pushed.data, "hello");
    assert_eq!(pushed.queue, queue);
    assert!(pushed.expire_at.is_some());

    // Retained copy is poll-able and deletable.
    let listed = consumer::get_messages(&ctx, &consumer_dto.id, &token)
        .await
        .unwrap();
    assert!(listed.iter().any(|m| m.message_id == message_id));
    consumer::delete_message(&ctx, &consumer_dto.id, &message_id, &token)
        .await
        .unwrap();
    assert!(matches!(
        consumer::get_message(&ctx, &consumer_dto.id, &message_id, &token).await,
        Err(AppError::MessageNotFound(_))
    ));
}

/// Messages without retention are never written to the store.
#[tokio::test]
#[serial]
#[ignore = "requires running Postgres, Redis and RabbitMQ"]
async fn zero_retention_messages_are_not_persisted() {
    let ctx = live_context().await;

    let message = RetainedMessage {
        message_id: unique_username(),
        consumer_id: unique_username(),
        data: "ephemeral".to_string(),
        queue: "q".to_string(),
        expire_at: retention_expiry(Utc::now(), 0),
    };
    ctx.store.persist(&message).await.unwrap();

    assert!(ctx
        .store
        .list(&message.consumer_id)
        .await
        .unwrap()
        .is_empty());
    assert!(matches!(
        ctx.store.get(&message.consumer_id, &message.message_id).await,
        Err(AppError::MessageNotFound(_))
    ));
}
