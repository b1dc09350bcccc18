//! `sailhouse` - command-line client for Sailhouse topics and subscriptions.

mod commands;
mod config;
mod webhook;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use sailhouse::{GetEventsOptions, WaitEvent};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use commands::{parse_target, parse_wait_event, parse_window, Target};
use config::Connection;

#[derive(Parser)]
#[command(name = "sailhouse")]
#[command(about = "Publish, pull and stream Sailhouse events")]
#[command(version)]
struct Cli {
    /// API token
    #[arg(long, env = "SAILHOUSE_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    /// API base URL
    #[arg(long, env = "SAILHOUSE_BASE_URL", global = true)]
    base_url: Option<String>,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish an event to a topic
    Publish {
        topic: String,
        /// Event data as JSON
        data: String,
        /// Metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,
        /// Deliver at this RFC 3339 time
        #[arg(long)]
        send_at: Option<String>,
    },

    /// Pull the next event from a subscription
    Pull {
        topic: String,
        subscription: String,
        /// Acknowledge the event after printing it
        #[arg(long)]
        ack: bool,
    },

    /// List events on a subscription
    List {
        topic: String,
        subscription: String,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        offset: Option<u32>,
        /// Only events from this far back, e.g. 30m or 2h
        #[arg(long, value_parser = parse_window)]
        time_window: Option<Duration>,
    },

    /// Acknowledge an event
    Ack {
        topic: String,
        subscription: String,
        id: String,
    },

    /// Publish several events as one wait group
    Wait {
        /// Topic notified when the group completes
        topic: String,
        /// Member event as <topic>=<json>; repeatable
        #[arg(long = "event", value_parser = parse_wait_event)]
        events: Vec<WaitEvent>,
        /// Wait group TTL, e.g. 5m
        #[arg(long)]
        ttl: Option<String>,
    },

    /// Stream events over a WebSocket until Ctrl-C
    Stream { topic: String, subscription: String },

    /// Process subscriptions with concurrent processors until Ctrl-C
    Listen {
        /// <topic>/<subscription>; repeatable
        #[arg(required = true, value_parser = parse_target)]
        targets: Vec<Target>,
        /// Processors per subscription
        #[arg(long)]
        processors: Option<usize>,
        /// Retries after a failed attempt
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Create or update a push subscription
    RegisterPush {
        topic: String,
        subscription: String,
        endpoint: String,
        /// Filter as JSON: a boolean or {"filters": [...], "operator": "and"}
        #[arg(long)]
        filter: Option<String>,
        /// e.g. 10/1m
        #[arg(long)]
        rate_limit: Option<String>,
        /// Deduplication window, e.g. 5m
        #[arg(long)]
        deduplication: Option<String>,
    },

    /// Verify (or produce, with --sign) a push signature header
    Verify {
        #[arg(long, env = "SAILHOUSE_PUSH_SECRET", hide_env_values = true)]
        secret: String,
        /// Raw request body
        #[arg(long)]
        body: String,
        /// Signature header to check
        #[arg(long, required_unless_present = "sign")]
        header: Option<String>,
        /// Print a signature header for the body instead of verifying
        #[arg(long)]
        sign: bool,
        /// Signing timestamp for --sign (defaults to now)
        #[arg(long, requires = "sign")]
        timestamp: Option<i64>,
        /// Maximum signature age in seconds
        #[arg(long)]
        tolerance: Option<i64>,
    },

    /// Run a local receiver for push deliveries
    Webhook {
        #[arg(long, env = "SAILHOUSE_PUSH_SECRET", hide_env_values = true)]
        secret: String,
        #[arg(long, default_value_t = 8787)]
        port: u16,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Token cancelled on the first Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl-C, shutting down");
        }
        trigger.cancel();
    });
    token
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Signing and the local receiver never talk to the API.
    let command = match cli.command {
        Commands::Verify {
            secret,
            body,
            header,
            sign,
            timestamp,
            tolerance,
        } => {
            return match (sign, header) {
                (true, _) => commands::sign(&secret, &body, timestamp),
                (false, Some(header)) => commands::verify(&secret, &header, &body, tolerance),
                (false, None) => anyhow::bail!("--header is required unless --sign is given"),
            };
        }
        Commands::Webhook { secret, port } => {
            return webhook::serve(&secret, port, shutdown_token()).await;
        }
        command => command,
    };

    let file = config::load(cli.config.as_deref())?;
    let connection = Connection::resolve(cli.token, cli.base_url, &file)?;
    let client = connection.client()?;
    tracing::debug!(base_url = %connection.base_url, "using Sailhouse API");

    match command {
        Commands::Publish {
            topic,
            data,
            metadata,
            send_at,
        } => {
            commands::publish(&client, &topic, &data, metadata.as_deref(), send_at.as_deref())
                .await
        }
        Commands::Pull {
            topic,
            subscription,
            ack,
        } => commands::pull(&client, &topic, &subscription, ack).await,
        Commands::List {
            topic,
            subscription,
            limit,
            offset,
            time_window,
        } => {
            let options = GetEventsOptions {
                limit,
                offset,
                time_window,
            };
            commands::list(&client, &topic, &subscription, options).await
        }
        Commands::Ack {
            topic,
            subscription,
            id,
        } => commands::ack(&client, &topic, &subscription, &id).await,
        Commands::Wait { topic, events, ttl } => commands::wait(&client, &topic, events, ttl).await,
        Commands::Stream {
            topic,
            subscription,
        } => commands::stream(&client, &topic, &subscription, shutdown_token()).await,
        Commands::Listen {
            targets,
            processors,
            max_retries,
        } => {
            let options = file.listen.subscriber_options(processors, max_retries);
            commands::listen(&client, targets, options, shutdown_token()).await
        }
        Commands::RegisterPush {
            topic,
            subscription,
            endpoint,
            filter,
            rate_limit,
            deduplication,
        } => {
            commands::register_push(
                &client,
                &topic,
                &subscription,
                &endpoint,
                filter.as_deref(),
                rate_limit,
                deduplication,
            )
            .await
        }
        Commands::Verify { .. } | Commands::Webhook { .. } => {
            unreachable!("handled before connecting")
        }
    }
}
