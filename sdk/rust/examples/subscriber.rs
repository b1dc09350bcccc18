//! Example: Run long-lived processors against several subscriptions

use std::sync::Arc;
use std::time::Duration;

use sailhouse::{ProcessingStats, Sailhouse, SubscriberOptions};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
struct Order {
    order_id: String,
}

#[tokio::main]
async fn main() -> sailhouse::Result<()> {
    let client = Sailhouse::from_env()?;
    let stats = Arc::new(ProcessingStats::new());

    let subscriber = client.subscriber(
        SubscriberOptions::new()
            .processors_per_subscription(2)
            .poll_interval(Duration::from_millis(500))
            .max_retries(3)
            .retry_delay(Duration::from_secs(1))
            .stats(stats.clone())
            .error_handler(|err| eprintln!("Error: {}", err)),
    );

    subscriber.register("orders", "billing", |event| async move {
        let order: Order = event.decode()?;
        println!("Billing order {}", order.order_id);
        Ok(())
    })?;

    subscriber.register("user-events", "welcome-email", |event| async move {
        println!("Sending welcome email for {}", event.id);
        Ok(())
    })?;

    let shutdown = CancellationToken::new();
    subscriber.start(&shutdown)?;
    println!("Processing... (Ctrl+C to exit)");

    let mut report = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => println!("{}", stats.snapshot()),
        }
    }

    subscriber.stop().await;
    println!("Stopped. {}", stats.snapshot());
    Ok(())
}
