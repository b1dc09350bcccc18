//! Sailhouse client implementation.

use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use tracing::debug;

use crate::error::{Result, SailhouseError};
use crate::event::Event;
use crate::types::{
    CreateWaitGroupRequest, EventResponse, EventsPage, GetEventsOptions, GetEventsResponse,
    PublishOptions, PublishRequest, PublishResponse, WaitEvent, WaitGroupInstanceResponse,
    WaitOptions,
};

/// Default API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.sailhouse.dev";
const DEFAULT_TIMEOUT_SECS: u64 = 5;
const SOURCE_HEADER: &str = "x-source";
const SOURCE: &str = "sailhouse-rust";
const TOKEN_ENV_VAR: &str = "SAILHOUSE_TOKEN";
const LEGACY_TOKEN_ENV_VAR: &str = "SAILHOUSE_API_KEY";
const BASE_URL_ENV_VAR: &str = "SAILHOUSE_BASE_URL";

/// Builder for creating a Sailhouse client with custom options.
#[derive(Debug, Clone)]
pub struct SailhouseBuilder {
    token: String,
    base_url: String,
    timeout: Duration,
    http_client: Option<HttpClient>,
}

impl SailhouseBuilder {
    /// Create a new builder with the given token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            http_client: None,
        }
    }

    /// Set the API base URL.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the request timeout. Ignored when a custom HTTP client is supplied.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use a preconfigured HTTP client instead of building one.
    pub fn http_client(mut self, client: HttpClient) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Build the Sailhouse client.
    pub fn build(self) -> Result<Sailhouse> {
        if self.token.trim().is_empty() {
            return Err(SailhouseError::auth("token must not be empty"));
        }

        let http_client = match self.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(self.timeout)
                .build()
                .map_err(|e| SailhouseError::connection(e.to_string()))?,
        };

        Ok(Sailhouse {
            inner: Arc::new(SailhouseInner {
                token: self.token,
                base_url: self.base_url.trim_end_matches('/').to_string(),
                http_client,
            }),
        })
    }
}

/// Internal shared state for the client.
pub(crate) struct SailhouseInner {
    pub(crate) token: String,
    pub(crate) base_url: String,
    pub(crate) http_client: HttpClient,
}

/// The Sailhouse client.
///
/// Cloning is cheap; clones share one connection pool and can be used from
/// many tasks at once.
///
/// # Example
///
/// ```no_run
/// use sailhouse::{PublishOptions, Sailhouse};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> sailhouse::Result<()> {
///     let client = Sailhouse::from_env()?;
///
///     let response = client
///         .publish("orders", json!({"order_id": "123"}), PublishOptions::new())
///         .await?;
///     println!("Publish ID: {}", response.id);
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Sailhouse {
    pub(crate) inner: Arc<SailhouseInner>,
}

impl fmt::Debug for Sailhouse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sailhouse")
            .field("base_url", &self.inner.base_url)
            .finish_non_exhaustive()
    }
}

impl Sailhouse {
    /// Create a client with default options.
    pub fn new(token: impl Into<String>) -> Result<Self> {
        SailhouseBuilder::new(token).build()
    }

    /// Create a new client from environment variables.
    ///
    /// Reads the token from `SAILHOUSE_TOKEN` (or `SAILHOUSE_API_KEY`) and an
    /// optional base URL from `SAILHOUSE_BASE_URL`.
    pub fn from_env() -> Result<Self> {
        let token = env::var(TOKEN_ENV_VAR)
            .or_else(|_| env::var(LEGACY_TOKEN_ENV_VAR))
            .map_err(|_| {
                SailhouseError::auth(format!("{} environment variable not set", TOKEN_ENV_VAR))
            })?;

        let mut builder = SailhouseBuilder::new(token);
        if let Ok(base_url) = env::var(BASE_URL_ENV_VAR) {
            builder = builder.base_url(base_url);
        }
        builder.build()
    }

    /// Create a new builder with the given token.
    pub fn builder(token: impl Into<String>) -> SailhouseBuilder {
        SailhouseBuilder::new(token)
    }

    /// Get the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub(crate) fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.inner
            .http_client
            .request(method, url)
            .header(AUTHORIZATION, &self.inner.token)
            .header(SOURCE_HEADER, SOURCE)
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.inner.base_url, path)
    }

    /// Pull the next available event from a subscription.
    ///
    /// Returns `Ok(None)` when the subscription has nothing to deliver.
    pub async fn pull_event(&self, topic: &str, subscription: &str) -> Result<Option<Event>> {
        let path = format!("/topics/{}/subscriptions/{}/events/pull", topic, subscription);
        let response = self.request(Method::GET, &self.url(&path)).send().await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::OK => {
                let wire: EventResponse = response.json().await?;
                Ok(Some(Event::bind(wire, topic, subscription, self)))
            }
            _ => Err(error_from_response(&path, response).await),
        }
    }

    /// List events on a subscription.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use sailhouse::{GetEventsOptions, Sailhouse};
    /// # use std::time::Duration;
    /// # async fn example(client: Sailhouse) -> sailhouse::Result<()> {
    /// let page = client
    ///     .get_events(
    ///         "orders",
    ///         "billing",
    ///         GetEventsOptions::new().limit(50).time_window(Duration::from_secs(3600)),
    ///     )
    ///     .await?;
    /// for event in page.events {
    ///     println!("{}", event.id);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get_events(
        &self,
        topic: &str,
        subscription: &str,
        options: GetEventsOptions,
    ) -> Result<GetEventsResponse> {
        let path = format!("/topics/{}/subscriptions/{}/events", topic, subscription);
        let response = self
            .request(Method::GET, &self.url(&path))
            .query(&options.query())
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(error_from_response(&path, response).await);
        }

        let page: EventsPage = response.json().await?;
        Ok(GetEventsResponse {
            events: page
                .events
                .into_iter()
                .map(|e| Event::bind(e, topic, subscription, self))
                .collect(),
            offset: page.offset,
            limit: page.limit,
        })
    }

    /// Publish an event to a topic.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use sailhouse::{PublishOptions, Sailhouse};
    /// # use serde_json::json;
    /// # async fn example(client: Sailhouse) -> sailhouse::Result<()> {
    /// // Using json! macro
    /// client.publish("orders", json!({"order_id": "123"}), PublishOptions::new()).await?;
    ///
    /// // Or a struct, delivered in ten minutes
    /// #[derive(serde::Serialize)]
    /// struct Order { order_id: String }
    /// let later = chrono::Utc::now() + chrono::Duration::minutes(10);
    /// client
    ///     .publish("orders", Order { order_id: "123".into() }, PublishOptions::new().send_at(later))
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn publish<T: Serialize>(
        &self,
        topic: &str,
        data: T,
        options: PublishOptions,
    ) -> Result<PublishResponse> {
        let path = format!("/topics/{}/events", topic);
        let request = PublishRequest::new(data, &options);

        let response = self
            .request(Method::POST, &self.url(&path))
            .json(&request)
            .send()
            .await?;

        if response.status() != StatusCode::CREATED {
            return Err(error_from_response(&path, response).await);
        }

        let published: PublishResponse = response.json().await?;
        debug!(topic, id = %published.id, "published event");
        Ok(published)
    }

    /// Acknowledge an event by ID.
    ///
    /// Both `200 OK` and `204 No Content` count as success.
    pub async fn acknowledge(&self, topic: &str, subscription: &str, event_id: &str) -> Result<()> {
        let path = format!(
            "/topics/{}/subscriptions/{}/events/{}",
            topic, subscription, event_id
        );
        let response = self.request(Method::POST, &self.url(&path)).send().await?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            _ => Err(error_from_response(&path, response).await),
        }
    }

    /// Publish a group of events the service tracks as one wait group.
    ///
    /// Creates a wait group instance for `topic`, publishes every event tagged
    /// with it, then marks the instance in progress. Returns the instance ID.
    pub async fn wait(
        &self,
        topic: &str,
        events: Vec<WaitEvent>,
        options: WaitOptions,
    ) -> Result<String> {
        let path = "/waitgroups/instances";
        let response = self
            .request(Method::POST, &self.url(path))
            .json(&CreateWaitGroupRequest {
                topic,
                ttl: options.ttl.as_deref(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(path, response).await);
        }

        let instance: WaitGroupInstanceResponse = response.json().await?;
        let instance_id = instance.wait_group_instance_id;
        debug!(topic, %instance_id, events = events.len(), "created wait group");

        for event in events {
            let mut options = PublishOptions::new().wait_group_instance_id(&instance_id);
            options.metadata = event.metadata;
            options.send_at = event.send_at;
            self.publish(&event.topic, event.body, options).await?;
        }

        let path = format!("/waitgroups/instances/{}/events", instance_id);
        let response = self
            .request(Method::PUT, &self.url(&path))
            .json(&serde_json::json!({}))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(&path, response).await);
        }

        Ok(instance_id)
    }
}

/// Turn a non-success response into an error carrying its status and body.
pub(crate) async fn error_from_response(endpoint: &str, response: Response) -> SailhouseError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    if status == 401 {
        return SailhouseError::auth(message);
    }
    SailhouseError::api(status, endpoint, message)
}
