//! # sailhouse
//!
//! Rust SDK for [Sailhouse](https://sailhouse.dev) - hosted pub/sub event delivery.
//!
//! ## Quick Start
//!
//! ```no_run
//! use sailhouse::{PublishOptions, Sailhouse};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> sailhouse::Result<()> {
//!     // Create client from environment
//!     let client = Sailhouse::from_env()?;
//!
//!     // Publish an event
//!     let response = client
//!         .publish("orders", json!({"order_id": "123"}), PublishOptions::new())
//!         .await?;
//!     println!("Published: {}", response.id);
//!
//!     // Pull one event and acknowledge it
//!     if let Some(event) = client.pull_event("orders", "billing").await? {
//!         println!("{}: {}", event.id, event.data);
//!         event.ack().await?;
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```no_run
//! use sailhouse::Sailhouse;
//! use std::time::Duration;
//!
//! // From environment (SAILHOUSE_TOKEN, optional SAILHOUSE_BASE_URL)
//! let client = Sailhouse::from_env()?;
//!
//! // Using builder
//! let client = Sailhouse::builder("your_token")
//!     .base_url("http://localhost:8080")
//!     .timeout(Duration::from_secs(10))
//!     .build()?;
//! # Ok::<(), sailhouse::SailhouseError>(())
//! ```
//!
//! ## Long-running processing
//!
//! [`Subscriber`] runs several concurrent processors per subscription with
//! bounded retries and graceful shutdown:
//!
//! ```no_run
//! use sailhouse::{Sailhouse, SubscriberOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> sailhouse::Result<()> {
//! let client = Sailhouse::from_env()?;
//! let subscriber = client.subscriber(SubscriberOptions::new().processors_per_subscription(2));
//!
//! subscriber.register("orders", "shipping", |event| async move {
//!     println!("shipping {}", event.id);
//!     Ok(())
//! })?;
//!
//! let shutdown = CancellationToken::new();
//! subscriber.start(&shutdown)?;
//! // ...
//! subscriber.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Push subscriptions
//!
//! ```
//! use sailhouse::{sign_push_payload, verify_push_subscription_signature};
//!
//! let body = r#"{"id":"evt_1","data":{}}"#;
//! let now = chrono::Utc::now().timestamp();
//! let header = sign_push_payload("whsec_secret", now, body).unwrap();
//!
//! assert!(verify_push_subscription_signature("whsec_secret", &header, body, None).is_ok());
//! ```

mod admin;
mod client;
mod error;
mod event;
mod push;
mod stream;
mod subscriber;
mod types;

pub use admin::{
    AdminClient, ComplexFilter, Filter, FilterCondition, RegisterPushSubscriptionOptions,
    RegisterResult,
};
pub use client::{Sailhouse, SailhouseBuilder, DEFAULT_BASE_URL};
pub use error::{HandlerError, Result, SailhouseError};
pub use event::Event;
pub use push::{
    parse_signature_header, sign_push_payload, verify_push_subscription_signature,
    verify_push_subscription_signature_safe, PushSubscriptionPayload, PushSubscriptionVerifier,
    SignatureComponents, VerificationError, VerificationErrorCode, VerificationOptions,
    DEFAULT_TOLERANCE_SECS, PUSH_SIGNATURE_HEADER,
};
pub use stream::EventStream;
pub use subscriber::{
    DeadLetterHandler, ErrorHandler, ProcessingStats, Registration, StatsSnapshot,
    SubscribeOptions, Subscriber, SubscriberError, SubscriberHandler, SubscriberOptions,
};
pub use types::{
    GetEventsOptions, GetEventsResponse, Metadata, PublishOptions, PublishResponse, WaitEvent,
    WaitOptions,
};
