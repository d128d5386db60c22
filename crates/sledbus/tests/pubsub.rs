//! End-to-end pub/sub scenarios over a temporary store.
//!
//! These tests exercise the full path: publish → fan-out records → worker
//! lease → channel delivery → ack/nack → finalisation or redelivery. The
//! poll intervals are millisecond-scale so the suite stays fast; receive
//! timeouts are generous so slow machines do not flake.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use sledbus::{
    keys, Bus, InMemoryRegistry, InMemoryRegistryConfig, Message, PersistentRegistry,
    PersistentRegistryConfig, Publisher, PublisherConfig, ReceivedMessage, Registry, Subscriber,
    SubscriberConfig,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn temp_db() -> sled::Db {
    sled::Config::new()
        .temporary(true)
        .open()
        .expect("open temporary store")
}

fn memory_registry() -> Arc<dyn Registry> {
    Arc::new(InMemoryRegistry::new(InMemoryRegistryConfig::default()))
}

fn fast_config(name: &str, visibility_timeout: Duration) -> SubscriberConfig {
    SubscriberConfig {
        name: name.to_string(),
        receive_interval: Duration::from_millis(10),
        visibility_timeout,
        ..Default::default()
    }
}

async fn recv(messages: &mut mpsc::Receiver<ReceivedMessage>) -> ReceivedMessage {
    timeout(RECV_TIMEOUT, messages.recv())
        .await
        .expect("timed out waiting for message")
        .expect("delivery channel closed")
}

async fn assert_no_delivery(messages: &mut mpsc::Receiver<ReceivedMessage>, wait: Duration) {
    if let Ok(Some(msg)) = timeout(wait, messages.recv()).await {
        panic!("unexpected delivery of message {}", msg.uuid());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn immediate_delivery_then_ack_is_final() {
    let db = temp_db();
    let registry = memory_registry();

    let subscriber = Subscriber::new(
        &db,
        registry.clone(),
        fast_config("", Duration::from_millis(100)),
    );
    let mut messages = subscriber
        .subscribe(CancellationToken::new(), "topic")
        .expect("subscribe");

    let publisher = Publisher::new(&db, registry, PublisherConfig::default());
    let published = Message::new("p");
    publisher
        .publish("topic", std::slice::from_ref(&published))
        .expect("publish");

    let received = recv(&mut messages).await;
    assert_eq!(received.uuid(), published.uuid);
    assert_eq!(received.payload(), &published.payload);
    assert!(received.ack());

    // well past 2x the visibility timeout: an acked message never returns
    assert_no_delivery(&mut messages, Duration::from_millis(300)).await;

    let prefix = keys::encode_prefix("", "topic", "").expect("encode");
    assert_eq!(db.scan_prefix(&prefix).count(), 0);

    subscriber.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn delayed_message_is_delivered_after_immediate() {
    let db = temp_db();
    let registry = memory_registry();

    let subscriber = Subscriber::new(
        &db,
        registry.clone(),
        fast_config("", Duration::from_secs(5)),
    );
    let mut messages = subscriber
        .subscribe(CancellationToken::new(), "topic")
        .expect("subscribe");

    let publisher = Publisher::new(&db, registry, PublisherConfig::default());
    let delayed = Message::new("delayed").delayed_for(Duration::from_millis(300));
    let immediate = Message::new("immediate");

    let published_at = Instant::now();
    publisher
        .publish("topic", &[delayed.clone(), immediate.clone()])
        .expect("publish");

    // the later-published immediate message overtakes the delayed one
    let first = recv(&mut messages).await;
    assert_eq!(first.uuid(), immediate.uuid);
    first.ack();

    let second = recv(&mut messages).await;
    assert_eq!(second.uuid(), delayed.uuid);
    assert!(published_at.elapsed() >= Duration::from_millis(250));
    second.ack();

    subscriber.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn nacked_message_is_redelivered_after_visibility_timeout() {
    let db = temp_db();
    let registry = memory_registry();

    let visibility = Duration::from_millis(100);
    let subscriber = Subscriber::new(&db, registry.clone(), fast_config("", visibility));
    let mut messages = subscriber
        .subscribe(CancellationToken::new(), "topic")
        .expect("subscribe");

    let publisher = Publisher::new(&db, registry, PublisherConfig::default());
    let published = Message::new("p");
    let published_at = Instant::now();
    publisher
        .publish("topic", std::slice::from_ref(&published))
        .expect("publish");

    let first = recv(&mut messages).await;
    assert_eq!(first.uuid(), published.uuid);
    assert!(first.nack());

    // the lease expires at the original due time plus the visibility
    // timeout, so redelivery can never happen before publish + visibility
    let second = recv(&mut messages).await;
    assert_eq!(second.uuid(), published.uuid);
    assert!(published_at.elapsed() >= visibility);
    assert!(second.ack());

    assert_no_delivery(&mut messages, Duration::from_millis(300)).await;
    subscriber.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn fan_out_delivers_to_every_subscription() {
    let db = temp_db();
    let registry = memory_registry();

    let s1 = Subscriber::new(&db, registry.clone(), fast_config("s1", Duration::from_secs(1)));
    let s2 = Subscriber::new(&db, registry.clone(), fast_config("s2", Duration::from_secs(1)));
    let mut ch1 = s1.subscribe(CancellationToken::new(), "topic").expect("subscribe s1");
    let mut ch2 = s2.subscribe(CancellationToken::new(), "topic").expect("subscribe s2");

    let publisher = Publisher::new(&db, registry, PublisherConfig::default());
    let published = Message::new("payload");
    publisher
        .publish("topic", std::slice::from_ref(&published))
        .expect("publish");

    // both subscriptions receive their own copy, independently
    let m1 = recv(&mut ch1).await;
    let m2 = recv(&mut ch2).await;
    assert_eq!(m1.uuid(), published.uuid);
    assert_eq!(m2.uuid(), published.uuid);
    assert_eq!(m1.payload(), m2.payload());
    m1.ack();
    m2.ack();

    s1.close().await;
    s2.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn large_batch_arrives_in_publish_order_and_drains() {
    let db = temp_db();
    let registry = memory_registry();

    // default batch size (100) forces ten lease rounds for 1000 messages
    let subscriber = Subscriber::new(&db, registry.clone(), fast_config("", Duration::from_secs(5)));
    let mut messages = subscriber
        .subscribe(CancellationToken::new(), "topic")
        .expect("subscribe");

    let publisher = Publisher::new(&db, registry, PublisherConfig::default());
    let published: Vec<Message> = (0..1000)
        .map(|i| Message::new(format!("payload_{i}")))
        .collect();
    publisher.publish("topic", &published).expect("publish");

    for expected in &published {
        let received = recv(&mut messages).await;
        assert_eq!(received.uuid(), expected.uuid);
        assert!(received.ack());
    }

    // let the final ack deletion land, then the prefix must be empty
    tokio::time::sleep(Duration::from_millis(100)).await;
    let prefix = keys::encode_prefix("", "topic", "").expect("encode");
    assert_eq!(db.scan_prefix(&prefix).count(), 0);

    subscriber.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_to_empty_topic_fails() {
    let db = temp_db();
    let publisher = Publisher::new(&db, memory_registry(), PublisherConfig::default());

    let err = publisher
        .publish("", &[Message::new("p")])
        .expect_err("must fail");
    assert!(matches!(
        err,
        sledbus::Error::Codec(sledbus_core::Error::InvalidName(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_the_context_closes_the_channel() {
    let db = temp_db();
    let registry = memory_registry();

    let subscriber = Subscriber::new(&db, registry, fast_config("", Duration::from_secs(1)));
    let ctx = CancellationToken::new();
    let mut messages = subscriber.subscribe(ctx.clone(), "topic").expect("subscribe");

    ctx.cancel();

    let closed = timeout(RECV_TIMEOUT, messages.recv())
        .await
        .expect("worker should stop promptly");
    assert!(closed.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn closing_the_bus_drains_its_subscribers() {
    let db = temp_db();
    let bus = Bus::new(db, memory_registry());

    let subscriber = bus.subscriber(fast_config("", Duration::from_secs(1)));
    let mut messages = subscriber
        .subscribe(CancellationToken::new(), "topic")
        .expect("subscribe");

    let publisher = bus.publisher(PublisherConfig::default());
    let published = Message::new("p");
    publisher
        .publish("topic", std::slice::from_ref(&published))
        .expect("publish");

    let received = recv(&mut messages).await;
    assert_eq!(received.uuid(), published.uuid);
    received.ack();

    // close awaits the worker tasks, so the channel is closed by the time
    // it returns
    bus.close().await.expect("close");
    assert!(messages.recv().await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn persistent_registry_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bus");

    let published = Message::new("survives");

    // first process lifetime: register the subscription, publish, shut down
    {
        let db = sled::open(&path).expect("open store");
        let registry: Arc<dyn Registry> = Arc::new(PersistentRegistry::new(
            &db,
            PersistentRegistryConfig::default(),
        ));
        registry.register("topic", "worker").expect("register");

        let publisher = Publisher::new(&db, registry.clone(), PublisherConfig::default());
        publisher
            .publish("topic", std::slice::from_ref(&published))
            .expect("publish");

        registry.close().expect("close registry");
        db.flush().expect("flush");
    }

    // second process lifetime: same topic and name, the message is waiting
    let db = sled::open(&path).expect("reopen store");
    let registry: Arc<dyn Registry> = Arc::new(PersistentRegistry::new(
        &db,
        PersistentRegistryConfig::default(),
    ));

    let subscriber = Subscriber::new(
        &db,
        registry,
        SubscriberConfig {
            name: "worker".to_string(),
            receive_interval: Duration::from_millis(10),
            ..Default::default()
        },
    );
    let mut messages = subscriber
        .subscribe(CancellationToken::new(), "topic")
        .expect("subscribe");

    let received = recv(&mut messages).await;
    assert_eq!(received.uuid(), published.uuid);
    assert_eq!(received.payload(), &published.payload);
    received.ack();

    subscriber.close().await;
}
