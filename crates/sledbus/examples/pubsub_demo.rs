//! Pub/Sub Demo
//!
//! Publishes a few messages (one delayed) to a topic with a single
//! subscription and consumes them with acks.
//!
//! Run with:
//! ```bash
//! cargo run --package sledbus --example pubsub_demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use sledbus::{
    Bus, InMemoryRegistry, InMemoryRegistryConfig, Message, PublisherConfig, SubscriberConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    println!("\n🚌 sledbus Pub/Sub Example");
    println!("==========================\n");

    // Step 1: Open a throwaway store
    println!("📦 Step 1: Opening temporary sled store");
    let db = sled::Config::new().temporary(true).open()?;
    println!("   ✅ Store ready\n");

    // Step 2: Wire up the bus
    println!("🔌 Step 2: Creating bus with in-memory registry");
    let registry = Arc::new(InMemoryRegistry::new(InMemoryRegistryConfig::default()));
    let bus = Bus::new(db, registry);
    println!("   ✅ Bus ready\n");

    // Step 3: Subscribe before publishing (unsubscribed topics drop messages)
    println!("📬 Step 3: Subscribing to 'orders'");
    let subscriber = bus.subscriber(SubscriberConfig {
        receive_interval: Duration::from_millis(10),
        ..Default::default()
    });
    let mut messages = subscriber.subscribe(CancellationToken::new(), "orders")?;
    println!("   ✅ Subscription registered\n");

    // Step 4: Publish
    println!("🚀 Step 4: Publishing three messages (one delayed by 500ms)");
    let publisher = bus.publisher(PublisherConfig::default());
    publisher.publish(
        "orders",
        &[
            Message::new("order 1: two coffees").delayed_for(Duration::from_millis(500)),
            Message::new("order 2: a croissant"),
            Message::new("order 3: more coffee").with_metadata("priority", "high"),
        ],
    )?;
    println!("   ✅ Published\n");

    // Step 5: Consume; the delayed message arrives last
    println!("📥 Step 5: Consuming");
    for _ in 0..3 {
        let msg = timeout(Duration::from_secs(5), messages.recv())
            .await?
            .expect("delivery channel closed");
        println!(
            "   📨 {} (created {})",
            String::from_utf8_lossy(msg.payload()),
            msg.created().to_rfc3339(),
        );
        msg.ack();
    }

    subscriber.close().await;
    bus.close().await?;
    println!("\n✅ Done");
    Ok(())
}
