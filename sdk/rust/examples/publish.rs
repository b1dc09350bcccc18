//! Example: Publish events to Sailhouse

use sailhouse::{Metadata, PublishOptions, Sailhouse, WaitEvent, WaitOptions};
use serde_json::json;

#[tokio::main]
async fn main() -> sailhouse::Result<()> {
    // Create client from SAILHOUSE_TOKEN environment variable
    let client = Sailhouse::from_env()?;

    // Publish an event with metadata
    let mut metadata = Metadata::new();
    metadata.insert("source".into(), json!("publish-example"));

    let response = client
        .publish(
            "orders",
            json!({
                "order_id": "ord_123",
                "customer": "john@example.com",
                "total": 99.99
            }),
            PublishOptions::new().metadata(metadata),
        )
        .await?;

    println!("Event published!");
    println!("  ID: {}", response.id);

    // Schedule one for later
    let send_at = chrono::Utc::now() + chrono::Duration::minutes(5);
    let scheduled = client
        .publish(
            "reminders",
            json!({"message": "checkout abandoned"}),
            PublishOptions::new().send_at(send_at),
        )
        .await?;
    println!("Scheduled {} for {}", scheduled.id, send_at);

    // Publish a group of events tracked together
    let instance = client
        .wait(
            "onboarding-flow",
            vec![
                WaitEvent::new("user-events", json!({"type": "user_created", "user_id": "user-123"})),
                WaitEvent::new(
                    "notification-events",
                    json!({"type": "email_notification", "template": "welcome_email"}),
                ),
            ],
            WaitOptions::new().ttl("5m"),
        )
        .await?;
    println!("Wait group {} in progress", instance);

    Ok(())
}
