//! Data types for the Sailhouse SDK.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Free-form key/value metadata attached to an event.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Response from publishing an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct PublishResponse {
    /// Publish ID assigned by the service.
    pub id: String,
}

/// Options for publishing an event.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Deliver the event at this time instead of immediately.
    pub send_at: Option<DateTime<Utc>>,
    /// Metadata attached to the event.
    pub metadata: Option<Metadata>,
    /// Wait group instance the event belongs to.
    pub wait_group_instance_id: Option<String>,
}

impl PublishOptions {
    /// Create empty publish options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule the event for a future time.
    pub fn send_at(mut self, send_at: DateTime<Utc>) -> Self {
        self.send_at = Some(send_at);
        self
    }

    /// Attach metadata to the event.
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Tag the event with a wait group instance.
    pub fn wait_group_instance_id(mut self, id: impl Into<String>) -> Self {
        self.wait_group_instance_id = Some(id.into());
        self
    }
}

/// Options for listing events on a subscription.
#[derive(Debug, Clone, Default)]
pub struct GetEventsOptions {
    /// Maximum number of events to return.
    pub limit: Option<u32>,
    /// Number of events to skip.
    pub offset: Option<u32>,
    /// Only return events from this far back.
    pub time_window: Option<Duration>,
}

impl GetEventsOptions {
    /// Create empty list options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the page size.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the page offset.
    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Restrict the listing to a trailing time window.
    pub fn time_window(mut self, window: Duration) -> Self {
        self.time_window = Some(window);
        self
    }

    pub(crate) fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(limit) = self.limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(offset) = self.offset {
            query.push(("offset", offset.to_string()));
        }
        if let Some(window) = self.time_window {
            query.push(("time_window", format_duration(window)));
        }
        query
    }
}

/// A page of events returned by [`Sailhouse::get_events`](crate::Sailhouse::get_events).
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct GetEventsResponse {
    /// Events in this page, bound to the client for acknowledgement.
    pub events: Vec<Event>,
    /// Offset of the page.
    pub offset: u32,
    /// Page size used by the service.
    pub limit: u32,
}

/// One event published as part of a wait group.
#[derive(Debug, Clone)]
pub struct WaitEvent {
    /// Topic to publish to.
    pub topic: String,
    /// Event payload.
    pub body: serde_json::Value,
    /// Optional metadata.
    pub metadata: Option<Metadata>,
    /// Optional scheduled send time.
    pub send_at: Option<DateTime<Utc>>,
}

impl WaitEvent {
    /// Create a wait event for a topic.
    pub fn new(topic: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            body,
            metadata: None,
            send_at: None,
        }
    }

    /// Attach metadata.
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Schedule the event.
    pub fn send_at(mut self, send_at: DateTime<Utc>) -> Self {
        self.send_at = Some(send_at);
        self
    }
}

/// Options for creating a wait group instance.
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    /// How long the service keeps the wait group open, e.g. "5m".
    pub ttl: Option<String>,
}

impl WaitOptions {
    /// Create empty wait options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the wait group TTL.
    pub fn ttl(mut self, ttl: impl Into<String>) -> Self {
        self.ttl = Some(ttl.into());
        self
    }
}

// HTTP API types

#[derive(Debug, Serialize)]
pub(crate) struct PublishRequest<'a, T: Serialize> {
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<&'a Metadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_group_instance_id: Option<&'a str>,
}

impl<'a, T: Serialize> PublishRequest<'a, T> {
    pub(crate) fn new(data: T, options: &'a PublishOptions) -> Self {
        Self {
            data,
            send_at: options
                .send_at
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            metadata: options.metadata.as_ref(),
            wait_group_instance_id: options.wait_group_instance_id.as_deref(),
        }
    }
}

/// Event as it appears on the wire, before it is bound to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EventResponse {
    pub id: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventsPage {
    #[serde(default)]
    pub events: Vec<EventResponse>,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub limit: u32,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateWaitGroupRequest<'a> {
    pub topic: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WaitGroupInstanceResponse {
    pub wait_group_instance_id: String,
}

// WebSocket protocol messages

#[derive(Debug, Serialize)]
pub(crate) struct StreamAuthMessage<'a> {
    pub topic_slug: &'a str,
    pub subscription_slug: &'a str,
    pub token: &'a str,
}

/// Format a duration the way the service parses `time_window`
/// (`500ms`, `30s`, `5m0s`, `1h30m0s`).
pub(crate) fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let nanos = d.subsec_nanos();

    if secs == 0 {
        return match nanos {
            0 => "0s".to_string(),
            n if n % 1_000_000 == 0 => format!("{}ms", n / 1_000_000),
            n if n % 1_000 == 0 => format!("{}µs", n / 1_000),
            n => format!("{}ns", n),
        };
    }

    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    out.push_str(&seconds.to_string());
    if nanos > 0 {
        let frac = format!("{:09}", nanos);
        out.push('.');
        out.push_str(frac.trim_end_matches('0'));
    }
    out.push('s');
    out
}
