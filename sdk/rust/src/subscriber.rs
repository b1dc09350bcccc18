//! Long-running subscription processing.
//!
//! A [`Subscriber`] owns a set of `(topic, subscription, handler)`
//! registrations. [`Subscriber::start`] spawns a fixed number of processors
//! per registration; each one pulls an event, runs the handler with bounded
//! retries and acknowledges the event. [`Subscriber::stop`] cancels every
//! processor and waits for all of them to exit.
//!
//! A subscriber runs once: `idle -> running -> stopped`.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::client::Sailhouse;
use crate::error::{HandlerError, Result, SailhouseError};
use crate::event::Event;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_SUBSCRIBE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Handler invoked for every pulled event. Returning `Err` asks for a retry.
pub type SubscriberHandler =
    Arc<dyn Fn(Event) -> BoxFuture<'static, std::result::Result<(), HandlerError>> + Send + Sync>;

/// Callback receiving every failure a processor cannot return to a caller.
///
/// Called from whichever processor hit the failure, possibly from several
/// at once.
pub type ErrorHandler = Arc<dyn Fn(SubscriberError) + Send + Sync>;

/// Hook receiving events whose handler failed on every attempt, before the
/// event is acknowledged.
pub type DeadLetterHandler = Arc<
    dyn Fn(Event, Arc<dyn std::error::Error + Send + Sync>) -> BoxFuture<'static, ()>
        + Send
        + Sync,
>;

/// A failure inside a running processor, reported through [`ErrorHandler`].
#[derive(Error, Debug, Clone)]
pub enum SubscriberError {
    #[error("processor {processor} failed to pull event from {topic}/{subscription}: {source}")]
    Pull {
        processor: usize,
        topic: String,
        subscription: String,
        source: Arc<SailhouseError>,
    },

    #[error("processor {processor} failed to process event {event_id} after {attempts} attempts: {source}")]
    Handler {
        processor: usize,
        topic: String,
        subscription: String,
        event_id: String,
        attempts: u32,
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    #[error("processor {processor} failed to acknowledge event {event_id}: {source}")]
    Ack {
        processor: usize,
        topic: String,
        subscription: String,
        event_id: String,
        /// The handler had exhausted its attempts before this acknowledge.
        after_failure: bool,
        source: Arc<SailhouseError>,
    },
}

impl SubscriberError {
    /// Topic of the registration that failed.
    pub fn topic(&self) -> &str {
        match self {
            Self::Pull { topic, .. } | Self::Handler { topic, .. } | Self::Ack { topic, .. } => {
                topic
            }
        }
    }

    /// Subscription of the registration that failed.
    pub fn subscription(&self) -> &str {
        match self {
            Self::Pull { subscription, .. }
            | Self::Handler { subscription, .. }
            | Self::Ack { subscription, .. } => subscription,
        }
    }
}

/// Thread-safe counters a subscriber updates as it works.
///
/// Share one instance between the subscriber options and whatever reports on
/// it.
#[derive(Debug, Default)]
pub struct ProcessingStats {
    events_processed: AtomicU64,
    handler_failures: AtomicU64,
    terminal_failures: AtomicU64,
    ack_failures: AtomicU64,
    pull_failures: AtomicU64,
}

/// Point-in-time copy of [`ProcessingStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Events whose handler eventually succeeded.
    pub events_processed: u64,
    /// Failed handler invocations, counting each attempt.
    pub handler_failures: u64,
    /// Events that failed on every attempt.
    pub terminal_failures: u64,
    pub ack_failures: u64,
    pub pull_failures: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed: {}, handler failures: {}, gave up: {}, ack failures: {}, pull failures: {}",
            self.events_processed,
            self.handler_failures,
            self.terminal_failures,
            self.ack_failures,
            self.pull_failures
        )
    }
}

impl ProcessingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            terminal_failures: self.terminal_failures.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            pull_failures: self.pull_failures.load(Ordering::Relaxed),
        }
    }

    fn record(&self, counter: Counter) {
        let counter = match counter {
            Counter::Processed => &self.events_processed,
            Counter::HandlerFailure => &self.handler_failures,
            Counter::TerminalFailure => &self.terminal_failures,
            Counter::AckFailure => &self.ack_failures,
            Counter::PullFailure => &self.pull_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
enum Counter {
    Processed,
    HandlerFailure,
    TerminalFailure,
    AckFailure,
    PullFailure,
}

/// Configuration for a [`Subscriber`].
#[derive(Clone)]
pub struct SubscriberOptions {
    /// Concurrent processors per registration (default 1; 0 is treated as 1).
    pub processors_per_subscription: usize,
    /// Wait between polls when no event is available (default 1s).
    pub poll_interval: Duration,
    /// Retries after the first failed attempt (default 3; 0 means a single attempt).
    pub max_retries: u32,
    /// Wait between attempts (default 1s).
    pub retry_delay: Duration,
    /// Receives processor failures. Without one they are only logged.
    pub error_handler: Option<ErrorHandler>,
    /// Receives events that failed on every attempt.
    pub dead_letter: Option<DeadLetterHandler>,
    /// Counters updated while processing.
    pub stats: Option<Arc<ProcessingStats>>,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            processors_per_subscription: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            error_handler: None,
            dead_letter: None,
            stats: None,
        }
    }
}

impl fmt::Debug for SubscriberOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberOptions")
            .field("processors_per_subscription", &self.processors_per_subscription)
            .field("poll_interval", &self.poll_interval)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("error_handler", &self.error_handler.is_some())
            .field("dead_letter", &self.dead_letter.is_some())
            .field("stats", &self.stats.is_some())
            .finish()
    }
}

impl SubscriberOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processors_per_subscription(mut self, processors: usize) -> Self {
        self.processors_per_subscription = processors;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(SubscriberError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn dead_letter<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Event, Arc<dyn std::error::Error + Send + Sync>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.dead_letter = Some(Arc::new(move |event, err| Box::pin(hook(event, err))));
        self
    }

    pub fn stats(mut self, stats: Arc<ProcessingStats>) -> Self {
        self.stats = Some(stats);
        self
    }
}

/// A registered `(topic, subscription, handler)` triple.
#[derive(Clone)]
pub struct Registration {
    pub topic: String,
    pub subscription: String,
    handler: SubscriberHandler,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("topic", &self.topic)
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

fn boxed_handler<F, Fut>(handler: F) -> SubscriberHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(handler(event)))
}

enum RunState {
    Idle,
    Running(CancellationToken),
    Stopped,
}

struct State {
    registrations: Vec<Registration>,
    run: RunState,
}

/// Runs concurrent processors for a set of subscriptions.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use sailhouse::{Sailhouse, SubscriberOptions};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> sailhouse::Result<()> {
/// let client = Sailhouse::from_env()?;
/// let subscriber = client.subscriber(
///     SubscriberOptions::new()
///         .processors_per_subscription(4)
///         .max_retries(2)
///         .retry_delay(Duration::from_millis(500))
///         .error_handler(|err| eprintln!("{err}")),
/// );
///
/// subscriber.register("orders", "billing", |event| async move {
///     println!("billing {}", event.id);
///     Ok(())
/// })?;
///
/// subscriber.start(&CancellationToken::new())?;
/// tokio::signal::ctrl_c().await.ok();
/// subscriber.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Subscriber {
    client: Sailhouse,
    options: Arc<SubscriberOptions>,
    state: Mutex<State>,
    tracker: TaskTracker,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("options", &self.options)
            .field("running", &self.is_running())
            .field("active_workers", &self.active_workers())
            .finish()
    }
}

impl Subscriber {
    /// Create a subscriber. Registrations are added with [`Subscriber::register`].
    pub fn new(client: Sailhouse, mut options: SubscriberOptions) -> Self {
        options.processors_per_subscription = options.processors_per_subscription.max(1);
        Self {
            client,
            options: Arc::new(options),
            state: Mutex::new(State {
                registrations: Vec::new(),
                run: RunState::Idle,
            }),
            tracker: TaskTracker::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Options in effect.
    pub fn options(&self) -> &SubscriberOptions {
        &self.options
    }

    /// Register a handler for a topic/subscription pair.
    ///
    /// Fails with [`SailhouseError::RegistrationClosed`] once the subscriber
    /// has been started.
    pub fn register<F, Fut>(&self, topic: &str, subscription: &str, handler: F) -> Result<()>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let mut state = self.state();
        if !matches!(state.run, RunState::Idle) {
            return Err(SailhouseError::RegistrationClosed {
                topic: topic.to_string(),
                subscription: subscription.to_string(),
            });
        }

        state.registrations.push(Registration {
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            handler: boxed_handler(handler),
        });
        Ok(())
    }

    /// Copy of the current registrations.
    pub fn registrations(&self) -> Vec<Registration> {
        self.state().registrations.clone()
    }

    /// Spawn the processors and return immediately.
    ///
    /// Processors stop when [`Subscriber::stop`] is called or `cancel` fires.
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let mut state = self.state();

        match &state.run {
            RunState::Running(token) if !token.is_cancelled() => {
                return Err(SailhouseError::AlreadyRunning)
            }
            RunState::Running(_) | RunState::Stopped => return Err(SailhouseError::Stopped),
            RunState::Idle => {}
        }

        if state.registrations.is_empty() {
            return Err(SailhouseError::NoSubscriptions);
        }

        let token = cancel.child_token();
        for registration in &state.registrations {
            for processor in 0..self.options.processors_per_subscription {
                let worker = Worker {
                    client: self.client.clone(),
                    registration: registration.clone(),
                    processor,
                    options: self.options.clone(),
                    cancel: token.clone(),
                    exit_on_pull_error: false,
                };
                self.tracker.spawn(worker.run());
            }
        }

        info!(
            registrations = state.registrations.len(),
            processors = self.options.processors_per_subscription,
            "subscriber started"
        );
        state.run = RunState::Running(token);
        Ok(())
    }

    /// Cancel every processor and wait until all of them have exited.
    ///
    /// Does nothing if the subscriber was never started. Safe to call more
    /// than once and from any task.
    pub async fn stop(&self) {
        {
            let mut state = self.state();
            match std::mem::replace(&mut state.run, RunState::Stopped) {
                RunState::Idle => {
                    state.run = RunState::Idle;
                    return;
                }
                RunState::Running(token) => {
                    token.cancel();
                    info!("subscriber stopping");
                }
                RunState::Stopped => {}
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Whether processors are running. Turns false as soon as `stop` begins
    /// or the token passed to `start` is cancelled.
    pub fn is_running(&self) -> bool {
        matches!(&self.state().run, RunState::Running(token) if !token.is_cancelled())
    }

    /// Number of spawned processors that have not exited yet.
    pub fn active_workers(&self) -> usize {
        self.tracker.len()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let RunState::Running(token) = &self.state().run {
            token.cancel();
        }
    }
}

/// Options for [`Sailhouse::subscribe`].
#[derive(Clone)]
pub struct SubscribeOptions {
    /// Wait between polls when no event is available (default 5s).
    pub poll_interval: Duration,
    /// Receives pull, handler and acknowledge failures.
    pub on_error: Option<ErrorHandler>,
    /// Stop polling after the first pull failure.
    pub exit_on_error: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_SUBSCRIBE_POLL_INTERVAL,
            on_error: None,
            exit_on_error: false,
        }
    }
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(SubscriberError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    pub fn exit_on_error(mut self, exit: bool) -> Self {
        self.exit_on_error = exit;
        self
    }
}

impl Sailhouse {
    /// Create a [`Subscriber`] backed by this client.
    pub fn subscriber(&self, options: SubscriberOptions) -> Subscriber {
        Subscriber::new(self.clone(), options)
    }

    /// Poll one subscription in the background with a single processor.
    ///
    /// Each event gets one handler attempt and is acknowledged afterwards.
    /// The task ends when `cancel` fires, or on the first pull failure if
    /// `exit_on_error` is set.
    pub fn subscribe<F, Fut>(
        &self,
        topic: &str,
        subscription: &str,
        handler: F,
        options: SubscribeOptions,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let worker = Worker {
            client: self.clone(),
            registration: Registration {
                topic: topic.to_string(),
                subscription: subscription.to_string(),
                handler: boxed_handler(handler),
            },
            processor: 0,
            options: Arc::new(SubscriberOptions {
                poll_interval: options.poll_interval,
                max_retries: 0,
                error_handler: options.on_error,
                ..SubscriberOptions::default()
            }),
            cancel,
            exit_on_pull_error: options.exit_on_error,
        };
        tokio::spawn(worker.run())
    }
}

struct Worker {
    client: Sailhouse,
    registration: Registration,
    processor: usize,
    options: Arc<SubscriberOptions>,
    cancel: CancellationToken,
    exit_on_pull_error: bool,
}

impl Worker {
    async fn run(self) {
        let topic = self.registration.topic.as_str();
        let subscription = self.registration.subscription.as_str();
        debug!(topic, subscription, processor = self.processor, "processor started");

        while !self.cancel.is_cancelled() {
            let pulled = tokio::select! {
                _ = self.cancel.cancelled() => break,
                pulled = self.client.pull_event(topic, subscription) => pulled,
            };

            match pulled {
                Ok(Some(event)) => self.process(event).await,
                Ok(None) => {
                    self.pause(self.options.poll_interval).await;
                }
                Err(err) => {
                    self.record(Counter::PullFailure);
                    self.report(SubscriberError::Pull {
                        processor: self.processor,
                        topic: topic.to_string(),
                        subscription: subscription.to_string(),
                        source: Arc::new(err),
                    });
                    if self.exit_on_pull_error {
                        break;
                    }
                    self.pause(self.options.poll_interval).await;
                }
            }
        }

        debug!(topic, subscription, processor = self.processor, "processor exited");
    }

    async fn process(&self, event: Event) {
        let attempts = self.options.max_retries.saturating_add(1);

        for attempt in 1..=attempts {
            if self.cancel.is_cancelled() {
                return;
            }

            let err = match (self.registration.handler)(event.clone()).await {
                Ok(()) => {
                    self.record(Counter::Processed);
                    self.acknowledge(&event, false).await;
                    return;
                }
                Err(err) => err,
            };
            self.record(Counter::HandlerFailure);

            if attempt < attempts {
                debug!(event_id = %event.id, attempt, error = %err, "handler failed, retrying");
                if !self.pause(self.options.retry_delay).await {
                    return;
                }
                continue;
            }

            let source: Arc<dyn std::error::Error + Send + Sync> = Arc::from(err);
            self.record(Counter::TerminalFailure);
            self.report(SubscriberError::Handler {
                processor: self.processor,
                topic: self.registration.topic.clone(),
                subscription: self.registration.subscription.clone(),
                event_id: event.id.clone(),
                attempts,
                source: source.clone(),
            });

            if let Some(dead_letter) = &self.options.dead_letter {
                dead_letter(event.clone(), source).await;
            }

            // No redelivery for events that exhausted their attempts.
            self.acknowledge(&event, true).await;
        }
    }

    async fn acknowledge(&self, event: &Event, after_failure: bool) {
        match event.ack().await {
            Ok(()) => debug!(event_id = %event.id, "acknowledged event"),
            Err(err) => {
                self.record(Counter::AckFailure);
                self.report(SubscriberError::Ack {
                    processor: self.processor,
                    topic: self.registration.topic.clone(),
                    subscription: self.registration.subscription.clone(),
                    event_id: event.id.clone(),
                    after_failure,
                    source: Arc::new(err),
                });
            }
        }
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn report(&self, err: SubscriberError) {
        warn!(error = %err, "subscriber error");
        if let Some(handler) = &self.options.error_handler {
            handler(err);
        }
    }

    fn record(&self, counter: Counter) {
        if let Some(stats) = &self.options.stats {
            stats.record(counter);
        }
    }
}
