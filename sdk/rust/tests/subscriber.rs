mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::StatusCode;
use common::{event, wait_for, MockServer};
use sailhouse::{
    HandlerError, ProcessingStats, SailhouseError, SubscribeOptions, SubscriberError,
    SubscriberOptions,
};
use serde_json::json;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn fast_options() -> SubscriberOptions {
    SubscriberOptions::new()
        .poll_interval(Duration::from_millis(20))
        .retry_delay(Duration::from_millis(10))
}

fn failure(message: &str) -> HandlerError {
    message.into()
}

/// Collects everything passed to an error callback.
#[derive(Clone, Default)]
struct Errors(Arc<Mutex<Vec<SubscriberError>>>);

impl Errors {
    fn push(&self, err: SubscriberError) {
        self.0.lock().unwrap().push(err);
    }

    fn all(&self) -> Vec<SubscriberError> {
        self.0.lock().unwrap().clone()
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn processes_and_acknowledges_queued_events() {
    let server = MockServer::start().await;
    for id in ["evt_1", "evt_2", "evt_3"] {
        server.push_event("orders", "billing", event(id, json!({"id": id})));
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscriber = server.client().subscriber(fast_options());
    let recorded = seen.clone();
    subscriber
        .register("orders", "billing", move |event| {
            let recorded = recorded.clone();
            async move {
                recorded.lock().unwrap().push(event.id.clone());
                Ok(())
            }
        })
        .unwrap();

    subscriber.start(&CancellationToken::new()).unwrap();
    assert!(subscriber.is_running());

    assert!(wait_for(WAIT, || server.acks("orders", "billing").len() == 3).await);
    subscriber.stop().await;

    assert_eq!(*seen.lock().unwrap(), vec!["evt_1", "evt_2", "evt_3"]);
    assert_eq!(server.acks("orders", "billing"), vec!["evt_1", "evt_2", "evt_3"]);
    assert!(!subscriber.is_running());
    assert_eq!(subscriber.active_workers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spawns_processors_for_every_registration() {
    let server = MockServer::start().await;
    let subscriber = server
        .client()
        .subscriber(fast_options().processors_per_subscription(3));
    subscriber.register("orders", "billing", |_| async { Ok(()) }).unwrap();
    subscriber.register("users", "welcome", |_| async { Ok(()) }).unwrap();

    subscriber.start(&CancellationToken::new()).unwrap();
    assert_eq!(subscriber.active_workers(), 6);

    timeout(WAIT, subscriber.stop()).await.expect("stop hung");
    assert_eq!(subscriber.active_workers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retries_until_the_handler_succeeds() {
    let server = MockServer::start().await;
    server.push_event("orders", "billing", event("evt_1", json!({})));

    let calls = Arc::new(AtomicUsize::new(0));
    let errors = Errors::default();
    let stats = Arc::new(ProcessingStats::new());
    let sink = errors.clone();
    let subscriber = server.client().subscriber(
        fast_options()
            .max_retries(2)
            .stats(stats.clone())
            .error_handler(move |err| sink.push(err)),
    );

    let counter = calls.clone();
    subscriber
        .register("orders", "billing", move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(failure("transient failure"));
                }
                Ok(())
            }
        })
        .unwrap();

    subscriber.start(&CancellationToken::new()).unwrap();
    assert!(wait_for(WAIT, || server.acks("orders", "billing").len() == 1).await);
    subscriber.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(errors.len(), 0);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.events_processed, 1);
    assert_eq!(snapshot.handler_failures, 2);
    assert_eq!(snapshot.terminal_failures, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gives_up_after_max_retries_and_acknowledges() {
    let server = MockServer::start().await;
    server.push_event("orders", "billing", event("evt_1", json!({})));

    let calls = Arc::new(AtomicUsize::new(0));
    let errors = Errors::default();
    let sink = errors.clone();
    let subscriber = server
        .client()
        .subscriber(fast_options().max_retries(3).error_handler(move |err| sink.push(err)));

    let counter = calls.clone();
    subscriber
        .register("orders", "billing", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(failure("permanent failure"))
            }
        })
        .unwrap();

    subscriber.start(&CancellationToken::new()).unwrap();
    assert!(wait_for(WAIT, || server.acks("orders", "billing").len() == 1).await);
    subscriber.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    let errors = errors.all();
    assert_eq!(errors.len(), 1);
    match &errors[0] {
        SubscriberError::Handler {
            event_id,
            attempts,
            source,
            ..
        } => {
            assert_eq!(event_id, "evt_1");
            assert_eq!(*attempts, 4);
            assert_eq!(source.to_string(), "permanent failure");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_retries_means_a_single_attempt() {
    let server = MockServer::start().await;
    server.push_event("orders", "billing", event("evt_1", json!({})));

    let calls = Arc::new(AtomicUsize::new(0));
    let errors = Errors::default();
    let sink = errors.clone();
    let subscriber = server
        .client()
        .subscriber(fast_options().max_retries(0).error_handler(move |err| sink.push(err)));

    let counter = calls.clone();
    subscriber
        .register("orders", "billing", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(failure("nope"))
            }
        })
        .unwrap();

    subscriber.start(&CancellationToken::new()).unwrap();
    assert!(wait_for(WAIT, || server.acks("orders", "billing").len() == 1).await);
    subscriber.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors.all()[0],
        SubscriberError::Handler { attempts: 1, .. }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dead_letter_hook_sees_exhausted_events_before_ack() {
    let server = MockServer::start().await;
    server.push_event("orders", "billing", event("evt_dead", json!({"n": 1})));

    let dead = Arc::new(Mutex::new(Vec::new()));
    let sink = dead.clone();
    let subscriber = server.client().subscriber(fast_options().max_retries(1).dead_letter(
        move |event, err| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push((event.id.clone(), err.to_string()));
            }
        },
    ));
    subscriber
        .register("orders", "billing", |_| async { Err(failure("broken")) })
        .unwrap();

    subscriber.start(&CancellationToken::new()).unwrap();
    assert!(wait_for(WAIT, || server.acks("orders", "billing").len() == 1).await);
    subscriber.stop().await;

    assert_eq!(
        *dead.lock().unwrap(),
        vec![("evt_dead".to_string(), "broken".to_string())]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn external_cancellation_stops_processors() {
    let server = MockServer::start().await;
    let subscriber = server
        .client()
        .subscriber(fast_options().processors_per_subscription(2));
    subscriber.register("orders", "billing", |_| async { Ok(()) }).unwrap();

    let shutdown = CancellationToken::new();
    subscriber.start(&shutdown).unwrap();
    assert!(subscriber.is_running());

    shutdown.cancel();
    assert!(!subscriber.is_running());
    assert!(wait_for(WAIT, || subscriber.active_workers() == 0).await);

    timeout(WAIT, subscriber.stop()).await.expect("stop hung");
    assert!(!subscriber.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn registration_is_closed_once_started() {
    let server = MockServer::start().await;
    let subscriber = server.client().subscriber(fast_options());
    subscriber.register("orders", "billing", |_| async { Ok(()) }).unwrap();
    subscriber.start(&CancellationToken::new()).unwrap();

    let err = subscriber
        .register("orders", "late", |_| async { Ok(()) })
        .unwrap_err();
    assert!(matches!(
        err,
        SailhouseError::RegistrationClosed { ref subscription, .. } if subscription == "late"
    ));
    assert_eq!(subscriber.registrations().len(), 1);

    subscriber.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_is_rejected_while_running_and_after_stop() {
    let server = MockServer::start().await;
    let subscriber = server.client().subscriber(fast_options());
    subscriber.register("orders", "billing", |_| async { Ok(()) }).unwrap();

    let shutdown = CancellationToken::new();
    subscriber.start(&shutdown).unwrap();
    assert!(matches!(
        subscriber.start(&shutdown),
        Err(SailhouseError::AlreadyRunning)
    ));
    assert_eq!(subscriber.active_workers(), 1);

    subscriber.stop().await;
    assert!(matches!(
        subscriber.start(&shutdown),
        Err(SailhouseError::Stopped)
    ));
    assert_eq!(subscriber.active_workers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pull_failures_are_reported_and_polling_continues() {
    let server = MockServer::start().await;
    server.fail_next_pulls(2);
    server.push_event("orders", "billing", event("evt_1", json!({})));

    let errors = Errors::default();
    let sink = errors.clone();
    let subscriber = server
        .client()
        .subscriber(fast_options().error_handler(move |err| sink.push(err)));
    subscriber.register("orders", "billing", |_| async { Ok(()) }).unwrap();

    subscriber.start(&CancellationToken::new()).unwrap();
    assert!(wait_for(WAIT, || server.acks("orders", "billing").len() == 1).await);
    subscriber.stop().await;

    let errors = errors.all();
    assert_eq!(errors.len(), 2);
    for err in &errors {
        assert_eq!(err.topic(), "orders");
        assert_eq!(err.subscription(), "billing");
        match err {
            SubscriberError::Pull { source, .. } => assert_eq!(source.status(), Some(500)),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ack_failures_are_reported_without_stopping_the_processor() {
    let server = MockServer::start().await;
    server.set_ack_status(StatusCode::INTERNAL_SERVER_ERROR);
    server.push_event("orders", "billing", event("evt_1", json!({})));

    let errors = Errors::default();
    let stats = Arc::new(ProcessingStats::new());
    let sink = errors.clone();
    let subscriber = server.client().subscriber(
        fast_options()
            .stats(stats.clone())
            .error_handler(move |err| sink.push(err)),
    );
    subscriber.register("orders", "billing", |_| async { Ok(()) }).unwrap();

    subscriber.start(&CancellationToken::new()).unwrap();
    assert!(wait_for(WAIT, || errors.len() == 1).await);

    // Still polling after the failed acknowledgement.
    let pulls = server.pull_count();
    assert!(wait_for(WAIT, || server.pull_count() > pulls).await);
    assert!(subscriber.is_running());
    subscriber.stop().await;

    match &errors.all()[0] {
        SubscriberError::Ack {
            event_id,
            after_failure,
            ..
        } => {
            assert_eq!(event_id, "evt_1");
            assert!(!after_failure);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(stats.snapshot().ack_failures, 1);
    assert_eq!(stats.snapshot().events_processed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_interrupts_a_pending_retry_delay() {
    let server = MockServer::start().await;
    server.push_event("orders", "billing", event("evt_1", json!({})));

    let calls = Arc::new(AtomicUsize::new(0));
    let subscriber = server
        .client()
        .subscriber(fast_options().retry_delay(Duration::from_secs(60)));
    let counter = calls.clone();
    subscriber
        .register("orders", "billing", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(failure("slow failure"))
            }
        })
        .unwrap();

    subscriber.start(&CancellationToken::new()).unwrap();
    assert!(wait_for(WAIT, || calls.load(Ordering::SeqCst) == 1).await);

    timeout(Duration::from_secs(1), subscriber.stop())
        .await
        .expect("stop waited for the retry delay");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(server.acks("orders", "billing").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_stops_all_return() {
    let server = MockServer::start().await;
    let subscriber = server
        .client()
        .subscriber(fast_options().processors_per_subscription(2));
    subscriber.register("orders", "billing", |_| async { Ok(()) }).unwrap();
    subscriber.start(&CancellationToken::new()).unwrap();

    timeout(WAIT, async {
        tokio::join!(subscriber.stop(), subscriber.stop(), subscriber.stop());
    })
    .await
    .expect("concurrent stops hung");
    assert_eq!(subscriber.active_workers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscribe_helper_processes_until_cancelled() {
    let server = MockServer::start().await;
    server.push_event("orders", "audit", event("evt_1", json!({})));
    server.push_event("orders", "audit", event("evt_2", json!({})));

    let cancel = CancellationToken::new();
    let handle = server.client().subscribe(
        "orders",
        "audit",
        |_| async { Ok(()) },
        SubscribeOptions::new().poll_interval(Duration::from_millis(20)),
        cancel.clone(),
    );

    assert!(wait_for(WAIT, || server.acks("orders", "audit").len() == 2).await);
    cancel.cancel();
    timeout(WAIT, handle)
        .await
        .expect("subscribe task did not exit")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscribe_helper_acknowledges_after_a_failed_attempt() {
    let server = MockServer::start().await;
    server.push_event("orders", "audit", event("evt_1", json!({})));

    let errors = Errors::default();
    let sink = errors.clone();
    let cancel = CancellationToken::new();
    let handle = server.client().subscribe(
        "orders",
        "audit",
        |_| async { Err(failure("bad payload")) },
        SubscribeOptions::new()
            .poll_interval(Duration::from_millis(20))
            .on_error(move |err| sink.push(err)),
        cancel.clone(),
    );

    assert!(wait_for(WAIT, || server.acks("orders", "audit").len() == 1).await);
    cancel.cancel();
    timeout(WAIT, handle).await.unwrap().unwrap();

    assert!(matches!(
        errors.all()[0],
        SubscriberError::Handler { attempts: 1, .. }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscribe_helper_can_exit_on_pull_error() {
    let server = MockServer::start().await;
    server.fail_next_pulls(1);

    let errors = Errors::default();
    let sink = errors.clone();
    let handle = server.client().subscribe(
        "orders",
        "audit",
        |_| async { Ok(()) },
        SubscribeOptions::new()
            .poll_interval(Duration::from_millis(20))
            .exit_on_error(true)
            .on_error(move |err| sink.push(err)),
        CancellationToken::new(),
    );

    timeout(WAIT, handle)
        .await
        .expect("subscribe task kept polling")
        .unwrap();
    assert_eq!(server.pull_count(), 1);
    assert_eq!(errors.len(), 1);
}
