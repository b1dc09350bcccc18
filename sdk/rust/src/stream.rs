//! WebSocket streaming delivery.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::client::Sailhouse;
use crate::error::{Result, SailhouseError};
use crate::event::Event;
use crate::types::{EventResponse, StreamAuthMessage};

const STREAM_PATH: &str = "/events/stream";
const CHANNEL_CAPACITY: usize = 100;

/// Events delivered over a persistent WebSocket connection.
///
/// Events and errors arrive on separate channels. Both close when the
/// connection ends or the cancellation token passed to
/// [`Sailhouse::stream_events`] fires. The type also implements
/// `futures::Stream<Item = Result<Event>>`, yielding pending errors first.
///
/// Errors are advisory: when nobody drains the error channel and it fills
/// up, further errors are dropped rather than holding back events.
pub struct EventStream {
    events: mpsc::Receiver<Event>,
    errors: mpsc::Receiver<SailhouseError>,
    errors_closed: bool,
}

impl EventStream {
    /// Split into the raw event and error receivers.
    pub fn into_channels(self) -> (mpsc::Receiver<Event>, mpsc::Receiver<SailhouseError>) {
        (self.events, self.errors)
    }

    /// Receive the next event, discarding any errors queued meanwhile.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            tokio::select! {
                biased;
                event = self.events.recv() => return event,
                err = self.errors.recv(), if !self.errors_closed => match err {
                    Some(err) => debug!(error = %err, "skipping stream error"),
                    None => self.errors_closed = true,
                },
            }
        }
    }

    /// Receive the next error, if any.
    pub async fn next_error(&mut self) -> Option<SailhouseError> {
        self.errors.recv().await
    }
}

impl Stream for EventStream {
    type Item = Result<Event>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let errors_closed = match self.errors.poll_recv(cx) {
            Poll::Ready(Some(err)) => return Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => true,
            Poll::Pending => false,
        };

        match self.events.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(None) if errors_closed => Poll::Ready(None),
            _ => Poll::Pending,
        }
    }
}

/// Derive the WebSocket endpoint from the HTTP base URL.
pub(crate) fn stream_url(base_url: &str) -> Result<Url> {
    let mut url = Url::parse(base_url)?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| SailhouseError::websocket(format!("cannot stream from {}", base_url)))?;
    let path = format!("{}{}", url.path().trim_end_matches('/'), STREAM_PATH);
    url.set_path(&path);
    Ok(url)
}

impl Sailhouse {
    /// Stream events from a subscription over a WebSocket.
    ///
    /// Connection and handshake failures are returned directly. After that,
    /// read and decode failures are delivered on the error channel; a read
    /// failure, a close from the server or cancellation ends the stream.
    /// Dropping the error receiver does not affect event delivery.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use sailhouse::Sailhouse;
    /// # use futures::StreamExt;
    /// # use tokio_util::sync::CancellationToken;
    /// # async fn example(client: Sailhouse) -> sailhouse::Result<()> {
    /// let cancel = CancellationToken::new();
    /// let mut stream = client.stream_events("orders", "audit", cancel.clone()).await?;
    ///
    /// while let Some(event) = stream.next().await {
    ///     let event = event?;
    ///     println!("{}: {}", event.id, event.data);
    ///     event.ack().await?;
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn stream_events(
        &self,
        topic: &str,
        subscription: &str,
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        let url = stream_url(self.base_url())?;

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SailhouseError::websocket(format!("connection failed: {}", e)))?;

        let (mut write, mut read) = ws_stream.split();

        let auth = serde_json::to_string(&StreamAuthMessage {
            topic_slug: topic,
            subscription_slug: subscription,
            token: &self.inner.token,
        })?;
        write
            .send(Message::Text(auth))
            .await
            .map_err(|e| SailhouseError::websocket(format!("failed to send auth message: {}", e)))?;

        let (event_tx, event_rx) = mpsc::channel::<Event>(CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel::<SailhouseError>(CHANNEL_CAPACITY);

        let client = self.clone();
        let topic = topic.to_string();
        let subscription = subscription.to_string();

        tokio::spawn(async move {
            let mut error_tx = Some(error_tx);
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = read.next() => msg,
                };

                let payload = match msg {
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Binary(bytes))) => bytes,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        report(
                            &mut error_tx,
                            SailhouseError::websocket(format!("failed to read message: {}", e)),
                        );
                        break;
                    }
                };

                match serde_json::from_slice::<EventResponse>(&payload) {
                    Ok(wire) => {
                        let event = Event::bind(wire, &topic, &subscription, &client);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            sent = event_tx.send(event) => if sent.is_err() { break },
                        }
                    }
                    Err(e) => report(&mut error_tx, SailhouseError::Serialization(e)),
                }
            }

            if cancel.is_cancelled() {
                let _ = write.send(Message::Close(None)).await;
            }
            debug!(%topic, %subscription, "event stream closed");
        });

        Ok(EventStream {
            events: event_rx,
            errors: error_rx,
            errors_closed: false,
        })
    }
}

/// Queue an error without waiting. Errors are dropped when the channel is
/// full, and the sender is discarded once the receiver is gone.
fn report(error_tx: &mut Option<mpsc::Sender<SailhouseError>>, err: SailhouseError) {
    let Some(tx) = error_tx else {
        return;
    };
    match tx.try_send(err) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(err)) => {
            debug!(error = %err, "error channel full, dropping stream error");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => *error_tx = None,
    }
}
