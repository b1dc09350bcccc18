//! Subcommand implementations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use sailhouse::{
    sign_push_payload, verify_push_subscription_signature, Event, Filter, GetEventsOptions,
    Metadata, ProcessingStats, PublishOptions, RegisterPushSubscriptionOptions, Sailhouse,
    SubscriberOptions, WaitEvent, WaitOptions,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// A `topic/subscription` pair given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub topic: String,
    pub subscription: String,
}

pub fn parse_target(s: &str) -> Result<Target, String> {
    match s.split_once('/') {
        Some((topic, subscription)) if !topic.is_empty() && !subscription.is_empty() => {
            Ok(Target {
                topic: topic.to_string(),
                subscription: subscription.to_string(),
            })
        }
        _ => Err(format!("expected <topic>/<subscription>, got '{}'", s)),
    }
}

/// Parse a `topic=<json>` wait group member.
pub fn parse_wait_event(s: &str) -> Result<WaitEvent, String> {
    let (topic, body) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <topic>=<json>, got '{}'", s))?;
    if topic.is_empty() {
        return Err(format!("missing topic in '{}'", s));
    }
    let body: Value = serde_json::from_str(body).map_err(|e| format!("invalid JSON for {}: {}", topic, e))?;
    Ok(WaitEvent::new(topic, body))
}

/// Parse a `--time-window` such as `30s`, `15m`, `2h` or `1d`.
pub fn parse_window(s: &str) -> Result<Duration, String> {
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in '{}' (use s, m, h or d)", s))?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid number in '{}'", s))?;
    let secs = match unit {
        "s" => value,
        "m" => value.saturating_mul(60),
        "h" => value.saturating_mul(3600),
        "d" => value.saturating_mul(86_400),
        other => return Err(format!("unknown unit '{}' (use s, m, h or d)", other)),
    };
    Ok(Duration::from_secs(secs))
}

fn parse_json(label: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{} is not valid JSON", label))
}

fn parse_metadata(raw: Option<&str>) -> Result<Option<Metadata>> {
    match raw {
        None => Ok(None),
        Some(raw) => match parse_json("--metadata", raw)? {
            Value::Object(map) => Ok(Some(map)),
            _ => bail!("--metadata must be a JSON object"),
        },
    }
}

fn print_event(event: &Event) {
    println!("{} {}", "●".cyan(), event.id.bold());
    println!("  {}", event.data);
    if let Some(metadata) = &event.metadata {
        println!("  {} {}", "metadata:".dimmed(), Value::Object(metadata.clone()));
    }
}

pub async fn publish(
    client: &Sailhouse,
    topic: &str,
    data: &str,
    metadata: Option<&str>,
    send_at: Option<&str>,
) -> Result<()> {
    let data = parse_json("event data", data)?;
    let mut options = PublishOptions::new();
    options.metadata = parse_metadata(metadata)?;
    if let Some(send_at) = send_at {
        let at = chrono::DateTime::parse_from_rfc3339(send_at)
            .context("--send-at must be an RFC 3339 timestamp")?;
        options = options.send_at(at.with_timezone(&chrono::Utc));
    }

    let response = client
        .publish(topic, data, options)
        .await
        .with_context(|| format!("failed to publish to {}", topic))?;
    println!("{} {} {}", "Published".green().bold(), topic, response.id.dimmed());
    Ok(())
}

pub async fn pull(client: &Sailhouse, topic: &str, subscription: &str, ack: bool) -> Result<()> {
    let event = client
        .pull_event(topic, subscription)
        .await
        .with_context(|| format!("failed to pull from {}/{}", topic, subscription))?;

    let Some(event) = event else {
        println!("{}", "No events available".dimmed());
        return Ok(());
    };

    print_event(&event);
    if ack {
        event.ack().await.context("failed to acknowledge event")?;
        println!("{}", "acknowledged".green());
    }
    Ok(())
}

pub async fn list(
    client: &Sailhouse,
    topic: &str,
    subscription: &str,
    options: GetEventsOptions,
) -> Result<()> {
    let page = client
        .get_events(topic, subscription, options)
        .await
        .with_context(|| format!("failed to list events on {}/{}", topic, subscription))?;

    if page.events.is_empty() {
        println!("{}", "No events".dimmed());
        return Ok(());
    }
    for event in &page.events {
        print_event(event);
    }
    println!(
        "{}",
        format!("{} events (offset {}, limit {})", page.events.len(), page.offset, page.limit).dimmed()
    );
    Ok(())
}

pub async fn ack(client: &Sailhouse, topic: &str, subscription: &str, id: &str) -> Result<()> {
    client
        .acknowledge(topic, subscription, id)
        .await
        .with_context(|| format!("failed to acknowledge {}", id))?;
    println!("{} {}", "Acknowledged".green().bold(), id);
    Ok(())
}

pub async fn wait(
    client: &Sailhouse,
    topic: &str,
    events: Vec<WaitEvent>,
    ttl: Option<String>,
) -> Result<()> {
    if events.is_empty() {
        bail!("a wait group needs at least one --event");
    }
    let count = events.len();
    let options = WaitOptions { ttl };
    let id = client
        .wait(topic, events, options)
        .await
        .context("failed to publish wait group")?;
    println!(
        "{} {} events in wait group {}",
        "Published".green().bold(),
        count,
        id.bold()
    );
    Ok(())
}

pub async fn stream(
    client: &Sailhouse,
    topic: &str,
    subscription: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let stream = client
        .stream_events(topic, subscription, shutdown)
        .await
        .with_context(|| format!("failed to open stream for {}/{}", topic, subscription))?;
    println!("{} {}/{}", "Streaming".bold(), topic, subscription);

    let (mut events, mut errors) = stream.into_channels();
    let mut errors_open = true;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            err = errors.recv(), if errors_open => match err {
                Some(err) => eprintln!("{} {}", "error:".red().bold(), err),
                None => errors_open = false,
            },
        }
    }
    println!("{}", "Stream closed".dimmed());
    Ok(())
}

pub async fn listen(
    client: &Sailhouse,
    targets: Vec<Target>,
    options: SubscriberOptions,
    shutdown: CancellationToken,
) -> Result<()> {
    let stats = Arc::new(ProcessingStats::new());
    let subscriber = client.subscriber(
        options
            .stats(stats.clone())
            .error_handler(|err| eprintln!("{} {}", "error:".red().bold(), err)),
    );

    for target in &targets {
        let label = format!("{}/{}", target.topic, target.subscription);
        subscriber.register(&target.topic, &target.subscription, move |event| {
            let label = label.clone();
            async move {
                println!("{} {} {}", label.cyan(), event.id.bold(), event.data);
                Ok(())
            }
        })?;
    }

    subscriber.start(&shutdown).context("failed to start subscriber")?;
    println!(
        "{} {} subscription(s), {} processor(s) each. Press Ctrl-C to stop.",
        "Listening on".bold(),
        targets.len(),
        subscriber.options().processors_per_subscription
    );

    shutdown.cancelled().await;
    subscriber.stop().await;
    println!("{} {}", "Stopped.".bold(), stats.snapshot());
    Ok(())
}

pub async fn register_push(
    client: &Sailhouse,
    topic: &str,
    subscription: &str,
    endpoint: &str,
    filter: Option<&str>,
    rate_limit: Option<String>,
    deduplication: Option<String>,
) -> Result<()> {
    let mut options = RegisterPushSubscriptionOptions::new();
    if let Some(raw) = filter {
        let filter: Filter = serde_json::from_str(raw)
            .context("--filter must be true/false or {\"filters\": [...], \"operator\": \"and\"}")?;
        options = options.filter(filter);
    }
    options.rate_limit = rate_limit;
    options.deduplication = deduplication;

    let result = client
        .admin()
        .register_push_subscription(topic, subscription, endpoint, Some(options))
        .await
        .with_context(|| format!("failed to register {}/{}", topic, subscription))?;
    println!(
        "{} {}/{} -> {} ({})",
        "Registered".green().bold(),
        topic,
        subscription,
        endpoint,
        result.outcome
    );
    Ok(())
}

pub fn sign(secret: &str, body: &str, timestamp: Option<i64>) -> Result<()> {
    let timestamp = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());
    let header = sign_push_payload(secret, timestamp, body).context("failed to sign payload")?;
    println!("{}", header);
    Ok(())
}

pub fn verify(secret: &str, header: &str, body: &str, tolerance: Option<i64>) -> Result<()> {
    let options = tolerance.map(sailhouse::VerificationOptions::with_tolerance);
    match verify_push_subscription_signature(secret, header, body, options) {
        Ok(()) => {
            println!("{}", "Signature valid".green().bold());
            Ok(())
        }
        Err(err) => bail!("signature rejected: {}", err),
    }
}
