//! Administrative operations: registering push subscriptions.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::{error_from_response, Sailhouse};
use crate::error::Result;

/// Outcome of registering a push subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct RegisterResult {
    /// `created`, `updated` or `none`.
    pub outcome: String,
}

/// A single filter condition, e.g. `data.tier equals premium`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub path: String,
    pub condition: String,
    pub value: String,
}

impl FilterCondition {
    pub fn new(
        path: impl Into<String>,
        condition: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            condition: condition.into(),
            value: value.into(),
        }
    }
}

/// Several conditions joined by `and` / `or`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexFilter {
    pub filters: Vec<FilterCondition>,
    pub operator: String,
}

/// Filter applied to a push subscription.
///
/// Serializes as a bare boolean or as a `{filters, operator}` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    Enabled(bool),
    Complex(ComplexFilter),
}

impl Filter {
    /// A boolean filter.
    pub fn simple(enabled: bool) -> Self {
        Self::Enabled(enabled)
    }

    /// A filter with an explicit operator.
    pub fn complex(operator: impl Into<String>, conditions: Vec<FilterCondition>) -> Self {
        Self::Complex(ComplexFilter {
            filters: conditions,
            operator: operator.into(),
        })
    }

    /// Match when every condition holds.
    pub fn all(conditions: Vec<FilterCondition>) -> Self {
        Self::complex("and", conditions)
    }

    /// Match when any condition holds.
    pub fn any(conditions: Vec<FilterCondition>) -> Self {
        Self::complex("or", conditions)
    }
}

/// Optional settings for a push subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterPushSubscriptionOptions {
    /// Which events to deliver.
    pub filter: Option<Filter>,
    /// Delivery rate limit, e.g. `"10/1m"` or `"100/1h"`.
    pub rate_limit: Option<String>,
    /// Deduplication window, e.g. `"5m"`.
    pub deduplication: Option<String>,
}

impl RegisterPushSubscriptionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn rate_limit(mut self, rate_limit: impl Into<String>) -> Self {
        self.rate_limit = Some(rate_limit.into());
        self
    }

    pub fn deduplication(mut self, window: impl Into<String>) -> Self {
        self.deduplication = Some(window.into());
        self
    }
}

#[derive(Debug, Serialize)]
struct RegisterPushRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    endpoint: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<&'a Filter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rate_limit: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deduplication: Option<&'a str>,
}

impl<'a> RegisterPushRequest<'a> {
    fn new(endpoint: &'a str, options: Option<&'a RegisterPushSubscriptionOptions>) -> Self {
        Self {
            kind: "push",
            endpoint,
            filter: options.and_then(|o| o.filter.as_ref()),
            rate_limit: options.and_then(|o| o.rate_limit.as_deref()),
            deduplication: options.and_then(|o| o.deduplication.as_deref()),
        }
    }
}

/// Administrative client sharing a [`Sailhouse`] connection.
#[derive(Debug, Clone)]
pub struct AdminClient {
    client: Sailhouse,
}

impl AdminClient {
    pub fn new(client: Sailhouse) -> Self {
        Self { client }
    }

    /// Create or update a push subscription delivering to `endpoint`.
    ///
    /// ```no_run
    /// # use sailhouse::{AdminClient, Filter, FilterCondition, RegisterPushSubscriptionOptions, Sailhouse};
    /// # async fn example(client: Sailhouse) -> sailhouse::Result<()> {
    /// let admin = AdminClient::new(client);
    /// let options = RegisterPushSubscriptionOptions::new()
    ///     .filter(Filter::all(vec![
    ///         FilterCondition::new("user.tier", "equals", "premium"),
    ///         FilterCondition::new("order.amount", "greater_than", "100"),
    ///     ]))
    ///     .rate_limit("10/1m");
    /// let result = admin
    ///     .register_push_subscription("orders", "vip", "https://example.com/hook", Some(options))
    ///     .await?;
    /// println!("{}", result.outcome);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn register_push_subscription(
        &self,
        topic: &str,
        subscription: &str,
        endpoint: &str,
        options: Option<RegisterPushSubscriptionOptions>,
    ) -> Result<RegisterResult> {
        let path = format!("/topics/{}/subscriptions/{}", topic, subscription);
        let body = RegisterPushRequest::new(endpoint, options.as_ref());

        let response = self
            .client
            .request(Method::PUT, &self.client.url(&path))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(&path, response).await);
        }

        let result: RegisterResult = response.json().await?;
        debug!(topic, subscription, outcome = %result.outcome, "registered push subscription");
        Ok(result)
    }
}

impl Sailhouse {
    /// Administrative client sharing this connection.
    pub fn admin(&self) -> AdminClient {
        AdminClient::new(self.clone())
    }
}
