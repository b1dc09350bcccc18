//! In-process mock of the Sailhouse API for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use sailhouse::Sailhouse;
use serde_json::{json, Value};
use tokio::net::TcpListener;

pub const TOKEN: &str = "test-token";

/// A request the mock received.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
    pub source: Option<String>,
    pub body: Value,
}

#[derive(Default)]
pub struct MockState {
    queues: Mutex<HashMap<(String, String), VecDeque<Value>>>,
    acks: Mutex<Vec<(String, String, String)>>,
    requests: Mutex<Vec<RecordedRequest>>,
    pulls: AtomicUsize,
    failing_pulls: AtomicUsize,
    ack_status: Mutex<Option<StatusCode>>,
    publish_status: Mutex<Option<StatusCode>>,
    stream_messages: Mutex<Vec<String>>,
    stream_auth: Mutex<Option<Value>>,
    close_stream_after_send: Mutex<bool>,
}

pub struct MockServer {
    pub base_url: String,
    state: Arc<MockState>,
}

impl MockServer {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/events/stream", get(stream_handler))
            .fallback(api_handler)
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
        }
    }

    pub fn client(&self) -> Sailhouse {
        Sailhouse::builder(TOKEN)
            .base_url(&self.base_url)
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    /// Queue an event for `GET .../events/pull` and list calls.
    pub fn push_event(&self, topic: &str, subscription: &str, event: Value) {
        self.state
            .queues
            .lock()
            .unwrap()
            .entry((topic.to_string(), subscription.to_string()))
            .or_default()
            .push_back(event);
    }

    pub fn queued(&self, topic: &str, subscription: &str) -> usize {
        self.state
            .queues
            .lock()
            .unwrap()
            .get(&(topic.to_string(), subscription.to_string()))
            .map_or(0, VecDeque::len)
    }

    /// Event IDs acknowledged for a topic/subscription, in order.
    pub fn acks(&self, topic: &str, subscription: &str) -> Vec<String> {
        self.state
            .acks
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, s, _)| t == topic && s == subscription)
            .map(|(_, _, id)| id.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, method: Method, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path == path)
            .collect()
    }

    pub fn pull_count(&self) -> usize {
        self.state.pulls.load(Ordering::SeqCst)
    }

    /// Answer the next `n` pulls with a 500.
    pub fn fail_next_pulls(&self, n: usize) {
        self.state.failing_pulls.store(n, Ordering::SeqCst);
    }

    pub fn set_ack_status(&self, status: StatusCode) {
        *self.state.ack_status.lock().unwrap() = Some(status);
    }

    pub fn set_publish_status(&self, status: StatusCode) {
        *self.state.publish_status.lock().unwrap() = Some(status);
    }

    /// Raw text frames sent to every stream client after its auth message.
    pub fn set_stream_messages(&self, messages: Vec<String>, close_after: bool) {
        *self.state.stream_messages.lock().unwrap() = messages;
        *self.state.close_stream_after_send.lock().unwrap() = close_after;
    }

    pub fn stream_auth(&self) -> Option<Value> {
        self.state.stream_auth.lock().unwrap().clone()
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn event(id: &str, data: Value) -> Value {
    json!({ "id": id, "data": data })
}

async fn api_handler(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    state.requests.lock().unwrap().push(RecordedRequest {
        method: method.clone(),
        path: path.clone(),
        query: uri.query().map(str::to_string),
        authorization: header("authorization"),
        source: header("x-source"),
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
    });

    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

    match (method.as_str(), segments.as_slice()) {
        ("GET", ["topics", topic, "subscriptions", sub, "events", "pull"]) => {
            state.pulls.fetch_add(1, Ordering::SeqCst);
            let failing = state.failing_pulls.load(Ordering::SeqCst);
            if failing > 0 {
                state.failing_pulls.store(failing - 1, Ordering::SeqCst);
                return (StatusCode::INTERNAL_SERVER_ERROR, "pull exploded").into_response();
            }
            let next = state
                .queues
                .lock()
                .unwrap()
                .get_mut(&(topic.to_string(), sub.to_string()))
                .and_then(VecDeque::pop_front);
            match next {
                Some(event) => Json(event).into_response(),
                None => StatusCode::NO_CONTENT.into_response(),
            }
        }
        ("GET", ["topics", topic, "subscriptions", sub, "events"]) => {
            let events: Vec<Value> = state
                .queues
                .lock()
                .unwrap()
                .get(&(topic.to_string(), sub.to_string()))
                .map(|q| q.iter().cloned().collect())
                .unwrap_or_default();
            Json(json!({ "events": events, "offset": 0, "limit": 100 })).into_response()
        }
        ("POST", ["topics", topic, "subscriptions", sub, "events", id]) => {
            if let Some(status) = *state.ack_status.lock().unwrap() {
                return (status, "ack rejected").into_response();
            }
            state
                .acks
                .lock()
                .unwrap()
                .push((topic.to_string(), sub.to_string(), id.to_string()));
            StatusCode::OK.into_response()
        }
        ("POST", ["topics", _topic, "events"]) => {
            if let Some(status) = *state.publish_status.lock().unwrap() {
                return (status, "publish rejected").into_response();
            }
            let n = state.requests.lock().unwrap().len();
            (StatusCode::CREATED, Json(json!({ "id": format!("pub_{}", n) }))).into_response()
        }
        ("PUT", ["topics", _topic, "subscriptions", _sub]) => {
            Json(json!({ "outcome": "created" })).into_response()
        }
        ("POST", ["waitgroups", "instances"]) => {
            (StatusCode::CREATED, Json(json!({ "wait_group_instance_id": "wg_123" }))).into_response()
        }
        ("PUT", ["waitgroups", "instances", _id, "events"]) => StatusCode::OK.into_response(),
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no handler for {}", path) })),
        )
            .into_response(),
    }
}

async fn stream_handler(State(state): State<Arc<MockState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_stream(socket, state))
}

async fn serve_stream(mut socket: WebSocket, state: Arc<MockState>) {
    if let Some(Ok(Message::Text(auth))) = socket.recv().await {
        *state.stream_auth.lock().unwrap() = serde_json::from_str(auth.as_str()).ok();
    }

    let messages = state.stream_messages.lock().unwrap().clone();
    for message in messages {
        if socket.send(Message::Text(message.into())).await.is_err() {
            return;
        }
    }

    if *state.close_stream_after_send.lock().unwrap() {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    // Hold the connection until the client goes away.
    while let Some(Ok(msg)) = socket.recv().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }
}
