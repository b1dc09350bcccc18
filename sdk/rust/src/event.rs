//! Events pulled or streamed from a subscription.

use std::fmt;

use serde::de::DeserializeOwned;

use crate::client::Sailhouse;
use crate::error::Result;
use crate::types::{EventResponse, Metadata};

/// An event delivered to a subscription.
///
/// Events are immutable once received. Acknowledging one is a call against
/// the service keyed by [`Event::id`]; it does not change the value in memory.
#[derive(Clone)]
#[non_exhaustive]
pub struct Event {
    /// Event ID, unique per delivery.
    pub id: String,
    /// Event payload.
    pub data: serde_json::Value,
    /// Metadata attached at publish time.
    pub metadata: Option<Metadata>,
    topic: String,
    subscription: String,
    client: Sailhouse,
}

impl Event {
    pub(crate) fn bind(
        response: EventResponse,
        topic: &str,
        subscription: &str,
        client: &Sailhouse,
    ) -> Self {
        Self {
            id: response.id,
            data: response.data,
            metadata: response.metadata,
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            client: client.clone(),
        }
    }

    /// Topic this event was delivered from.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Subscription this event was delivered to.
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Decode the payload into a typed value.
    ///
    /// ```no_run
    /// # use sailhouse::Event;
    /// #[derive(serde::Deserialize)]
    /// struct Order { order_id: String }
    ///
    /// # fn example(event: &Event) -> sailhouse::Result<()> {
    /// let order: Order = event.decode()?;
    /// println!("{}", order.order_id);
    /// # Ok(())
    /// # }
    /// ```
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Look up a single metadata value.
    pub fn metadata_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }

    /// Acknowledge the event so the service does not redeliver it.
    pub async fn ack(&self) -> Result<()> {
        self.client
            .acknowledge(&self.topic, &self.subscription, &self.id)
            .await
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("subscription", &self.subscription)
            .field("data", &self.data)
            .field("metadata", &self.metadata)
            .finish()
    }
}
