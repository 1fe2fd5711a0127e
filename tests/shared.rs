#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Behavior, MockFactory, Recorder, settle};
use socket_lifecycle::error::Kind;
use socket_lifecycle::ws::config::Options;
use socket_lifecycle::ws::error::TransportError;
use socket_lifecycle::ws::{Delivery, Endpoint, SharedConnectionRegistry};
use socket_lifecycle::{Client, EndpointKey, Message, ReadyState};
use tokio::time::sleep;

const ENDPOINT: &str = "mock://shared";

fn shared() -> Options {
    Options::default().shared()
}

#[tokio::test(start_paused = true)]
async fn subscribers_share_one_physical_connection() {
    let factory = MockFactory::new(Behavior::AutoOpen);
    let client = Client::new(factory.clone());
    let first = Recorder::new();
    let second = Recorder::new();

    let a = client.open(ENDPOINT, first.attach(shared())).unwrap();
    let b = client.open(ENDPOINT, second.attach(shared())).unwrap();
    settle().await;

    assert_eq!(factory.connects(), 1);
    assert_eq!(client.registry().subscriber_count(ENDPOINT), Some(2));
    assert_eq!(a.state(), ReadyState::Open);
    assert_eq!(b.state(), ReadyState::Open);

    factory.last().message("tick");
    settle().await;

    assert_eq!(first.events(), vec!["open", "message:tick"]);
    assert_eq!(second.events(), vec!["open", "message:tick"]);
}

#[tokio::test(start_paused = true)]
async fn last_leave_closes_the_connection() {
    let factory = MockFactory::new(Behavior::AutoOpen);
    let client = Client::new(factory.clone());

    let a = client.open(ENDPOINT, shared()).unwrap();
    let b = client.open(ENDPOINT, shared()).unwrap();
    settle().await;
    let connection = factory.last();

    a.dispose();
    settle().await;

    assert_eq!(connection.close_calls(), 0);
    assert_eq!(b.state(), ReadyState::Open);
    assert_eq!(client.registry().subscriber_count(ENDPOINT), Some(1));

    drop(b);
    settle().await;

    assert_eq!(connection.close_calls(), 1);
    assert!(client.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn late_joiner_sees_the_live_state() {
    let factory = MockFactory::new(Behavior::Manual);
    let client = Client::new(factory.clone());
    let late = Recorder::new();

    let _a = client.open(ENDPOINT, shared()).unwrap();
    settle().await;
    factory.last().open();
    settle().await;

    let b = client.open(ENDPOINT, late.attach(shared())).unwrap();

    // Reported immediately, without passing through a callback
    assert_eq!(b.state(), ReadyState::Open);
    assert!(late.events().is_empty());
    assert_eq!(b.send("hello", false).unwrap(), Delivery::Sent);
    assert_eq!(factory.last().sent(), vec![Message::from("hello")]);
}

#[tokio::test(start_paused = true)]
async fn each_subscriber_flushes_its_own_queue() {
    let factory = MockFactory::new(Behavior::Manual);
    let client = Client::new(factory.clone());

    let a = client.open(ENDPOINT, shared()).unwrap();
    let b = client.open(ENDPOINT, shared()).unwrap();
    a.send("from a", true).unwrap();
    b.send("from b", true).unwrap();
    settle().await;

    factory.last().open();
    settle().await;

    let mut sent = factory.last().sent();
    sent.sort_by(|x, y| x.as_bytes().cmp(y.as_bytes()));
    assert_eq!(sent, vec![Message::from("from a"), "from b".into()]);
}

#[tokio::test(start_paused = true)]
async fn one_reconnect_drives_every_voting_subscriber() {
    let factory = MockFactory::new(Behavior::FailOpen);
    let client = Client::new(factory.clone());
    let short = Recorder::new();
    let long = Recorder::new();

    let a = client
        .open(
            ENDPOINT,
            short.attach(
                shared()
                    .reconnect_attempts(1)
                    .reconnect_interval(Duration::from_millis(100))
                    .should_reconnect(|_| true),
            ),
        )
        .unwrap();
    let b = client
        .open(
            ENDPOINT,
            long.attach(
                shared()
                    .reconnect_attempts(3)
                    .reconnect_interval(Duration::from_millis(100))
                    .should_reconnect(|_| true),
            ),
        )
        .unwrap();

    sleep(Duration::from_secs(1)).await;

    // Initial connect plus one retry per attempt of the longest budget
    assert_eq!(factory.connects(), 4);
    assert_eq!(short.count("stop:1"), 1);
    assert_eq!(long.count("stop:3"), 1);
    assert_eq!(a.reconnect_attempts(), 1);
    assert_eq!(b.reconnect_attempts(), 3);
    assert_eq!(a.state(), ReadyState::Closed);
    assert_eq!(b.state(), ReadyState::Closed);
}

#[tokio::test(start_paused = true)]
async fn only_voting_subscribers_spend_budget() {
    let factory = MockFactory::new(Behavior::AutoOpen);
    let client = Client::new(factory.clone());

    let voter = client
        .open(
            ENDPOINT,
            shared()
                .reconnect_interval(Duration::from_millis(100))
                .should_reconnect(|_| true),
        )
        .unwrap();
    let bystander = client.open(ENDPOINT, shared()).unwrap();
    settle().await;

    factory.set_behavior(Behavior::FailOpen);
    factory.last().close(1006, "reset");
    sleep(Duration::from_millis(250)).await;

    assert_eq!(voter.reconnect_attempts(), 2);
    assert_eq!(bystander.reconnect_attempts(), 0);
    // Everyone observes the shared outcome
    assert_eq!(bystander.state(), ReadyState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn permanently_closed_connection_is_revived_by_a_new_join() {
    let factory = MockFactory::new(Behavior::Manual);
    let client = Client::new(factory.clone());

    let a = client.open(ENDPOINT, shared()).unwrap();
    settle().await;
    factory.last().open();
    settle().await;
    factory.last().close(1000, "bye");
    settle().await;
    assert_eq!(a.state(), ReadyState::Closed);

    let b = client.open(ENDPOINT, shared()).unwrap();
    settle().await;

    assert_eq!(factory.connects(), 2);
    assert_eq!(b.state(), ReadyState::Connecting);

    factory.last().open();
    settle().await;
    assert_eq!(a.state(), ReadyState::Open);
    assert_eq!(b.state(), ReadyState::Open);
}

#[tokio::test(start_paused = true)]
async fn clients_on_one_registry_share_connections() {
    let factory = MockFactory::new(Behavior::AutoOpen);
    let registry = Arc::new(SharedConnectionRegistry::new());
    let first = Client::with_registry(factory.clone(), Arc::clone(&registry));
    let second = Client::with_registry(factory.clone(), Arc::clone(&registry));

    let _a = first.open(ENDPOINT, shared()).unwrap();
    let _b = second.open(ENDPOINT, shared()).unwrap();
    let _private = second.open(ENDPOINT, Options::default()).unwrap();
    settle().await;

    assert_eq!(registry.len(), 1);
    assert_eq!(factory.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn dynamic_endpoint_joins_after_resolving() {
    let factory = MockFactory::new(Behavior::AutoOpen);
    let client = Client::new(factory.clone());
    let endpoint = Endpoint::dynamic(|| async {
        sleep(Duration::from_millis(50)).await;
        Ok::<_, socket_lifecycle::Error>(EndpointKey::from(ENDPOINT))
    });

    let dynamic = client.open(endpoint, shared()).unwrap();
    let fixed = client.open(ENDPOINT, shared()).unwrap();
    assert_eq!(dynamic.state(), ReadyState::Connecting);

    sleep(Duration::from_millis(100)).await;

    assert_eq!(factory.connects(), 1);
    assert_eq!(client.registry().subscriber_count(ENDPOINT), Some(2));
    assert_eq!(dynamic.state(), ReadyState::Open);
    assert_eq!(fixed.state(), ReadyState::Open);
}

#[tokio::test(start_paused = true)]
async fn failed_resolution_is_retried_then_reported() {
    let factory = MockFactory::new(Behavior::AutoOpen);
    let client = Client::new(factory.clone());
    let recorder = Recorder::new();
    let endpoint = Endpoint::dynamic(|| async { Err::<EndpointKey, _>(common::endpoint_error()) });

    let handle = client
        .open(
            endpoint,
            recorder.attach(
                shared()
                    .reconnect_attempts(2)
                    .reconnect_interval(Duration::from_millis(100)),
            ),
        )
        .unwrap();
    sleep(Duration::from_secs(1)).await;

    assert_eq!(recorder.count("error:"), 3);
    assert_eq!(recorder.count("stop:2"), 1);
    assert_eq!(handle.state(), ReadyState::Closed);
    assert_eq!(factory.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn reset_closes_every_connection() {
    let factory = MockFactory::new(Behavior::AutoOpen);
    let client = Client::new(factory.clone());

    let a = client.open("mock://one", shared()).unwrap();
    let b = client.open("mock://two", shared()).unwrap();
    settle().await;
    assert_eq!(client.registry().len(), 2);

    client.registry().reset();
    settle().await;

    assert!(client.registry().is_empty());
    assert_eq!(factory.connection(0).close_calls(), 1);
    assert_eq!(factory.connection(1).close_calls(), 1);
    assert_eq!(a.state(), ReadyState::Closed);
    assert_eq!(b.state(), ReadyState::Closed);
}

#[tokio::test(start_paused = true)]
async fn handles_cannot_reconnect_after_a_reset() {
    let factory = MockFactory::new(Behavior::AutoOpen);
    let client = Client::new(factory.clone());

    let handle = client.open(ENDPOINT, shared()).unwrap();
    settle().await;

    client.registry().reset();
    let error = handle.reconnect().unwrap_err();
    settle().await;

    assert_eq!(error.kind(), Kind::Transport);
    assert!(matches!(
        error.downcast_ref::<TransportError>(),
        Some(TransportError::ConnectionClosed)
    ));
    assert_eq!(factory.connects(), 1);
    assert_eq!(handle.state(), ReadyState::Closed);
}
