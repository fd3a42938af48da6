//! # Live Query Client
//!
//! Client side of a live query. A [`LiveSubscription`] owns one background
//! task that drives the [`ClientState`] machine:
//!
//! - connect, send the subscription body, stream frames
//! - on a terminal close (rejection, failed upgrade) deliver the error and stop
//! - on any other close wait the fixed reconnect delay and replay the same body
//!
//! Unsubscribing or dropping the subscription sets the finished flag, which
//! suppresses reconnection and closes the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use super::errors::{CloseReason, LiveQueryError, LiveQueryResult};
use super::protocol::{LiveHandshake, LiveMessage};
use super::state::{ClientEvent, ClientState};
use crate::query::DocumentQuery;

/// Default delay between reconnection attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

/// Default number of undelivered frames buffered per subscription
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Connects live queries to a server
#[derive(Debug, Clone)]
pub struct LiveQueryClient {
    url: String,
    reconnect_delay: Duration,
    channel_capacity: usize,
    secret: Option<String>,
    session_token: Option<String>,
}

impl LiveQueryClient {
    /// Client for a `ws://` or `wss://` endpoint
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            secret: None,
            session_token: None,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Elevated-mode secret sent with every subscription
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Session token sent with every subscription
    pub fn with_session(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn handshake(&self, query: DocumentQuery) -> LiveHandshake {
        LiveHandshake {
            query,
            secret: self.secret.clone(),
            session_token: self.session_token.clone(),
        }
    }

    /// Start a reconnecting subscription. Must be called inside a tokio
    /// runtime.
    pub fn subscribe(&self, query: DocumentQuery) -> LiveSubscription {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let (state_tx, state_rx) = watch::channel(ClientState::Connecting);
        let control = Arc::new(Control::default());

        let task = match self.handshake(query).to_text() {
            Ok(body) => {
                let driver = Driver {
                    url: self.url.clone(),
                    body,
                    reconnect_delay: self.reconnect_delay,
                    tx,
                    state: state_tx,
                    control: Arc::clone(&control),
                };
                Some(tokio::spawn(driver.run()))
            }
            Err(e) => {
                // channel has room for one item right after creation
                let _ = tx.try_send(Err(e));
                state_tx.send_replace(ClientState::Closed);
                None
            }
        };

        LiveSubscription {
            rx,
            state: state_rx,
            control,
            task,
        }
    }

    /// Connect, wait for exactly one frame and close. Never retries.
    pub async fn once(&self, query: DocumentQuery) -> LiveQueryResult<LiveMessage> {
        let body = self.handshake(query).to_text()?;
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(connect_error)?;
        let (mut sink, mut source) = ws.split();

        sink.send(Message::Text(body))
            .await
            .map_err(|e| LiveQueryError::Connection(e.to_string()))?;

        let result = loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => {
                    break LiveMessage::from_text(&text).and_then(|message| match message.error {
                        Some(body) => Err(LiveQueryError::Stream(body.message)),
                        None => Ok(message),
                    });
                }
                Some(Ok(Message::Close(frame))) => break Err(close_error(frame)),
                Some(Ok(_)) => continue,
                Some(Err(e)) => break Err(LiveQueryError::Connection(e.to_string())),
                None => break Err(LiveQueryError::Disconnected("connection lost".to_string())),
            }
        };

        let _ = sink.send(Message::Close(None)).await;
        result
    }
}

fn connect_error(e: WsError) -> LiveQueryError {
    match e {
        WsError::Http(response) => {
            LiveQueryError::HandshakeFailed(format!("upgrade rejected: {}", response.status()))
        }
        other => LiveQueryError::Connection(other.to_string()),
    }
}

fn close_error(frame: Option<CloseFrame<'static>>) -> LiveQueryError {
    let Some(frame) = frame else {
        return LiveQueryError::Disconnected("closed without reason".to_string());
    };
    match CloseReason::from_close(u16::from(frame.code), &frame.reason) {
        Some(reason) => LiveQueryError::Rejected(reason),
        None => LiveQueryError::Disconnected(frame.reason.to_string()),
    }
}

/// Cancellation shared between a subscription and its task
#[derive(Debug, Default)]
struct Control {
    finished: AtomicBool,
    cancel: Notify,
}

impl Control {
    fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.cancel.notify_one();
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// How one connection attempt ended
enum Attempt {
    Cancelled,
    Retry(String),
    Terminal(LiveQueryError),
}

struct Driver {
    url: String,
    body: String,
    reconnect_delay: Duration,
    tx: mpsc::Sender<LiveQueryResult<LiveMessage>>,
    state: watch::Sender<ClientState>,
    control: Arc<Control>,
}

impl Driver {
    fn transition(&self, event: ClientEvent) {
        self.state.send_if_modified(|state| match state.next(event) {
            Some(next) => {
                *state = next;
                true
            }
            None => false,
        });
    }

    async fn run(self) {
        loop {
            if self.control.is_finished() {
                break;
            }

            match self.attempt().await {
                Attempt::Cancelled => break,
                Attempt::Terminal(error) => {
                    warn!(url = %self.url, error = %error, "live query subscription ended");
                    self.transition(ClientEvent::Dropped { terminal: true });
                    let _ = self.tx.send(Err(error)).await;
                    break;
                }
                Attempt::Retry(reason) => {
                    self.transition(ClientEvent::Dropped { terminal: false });
                    info!(
                        url = %self.url,
                        reason = %reason,
                        delay_ms = self.reconnect_delay.as_millis() as u64,
                        "live query reconnecting"
                    );
                    tokio::select! {
                        _ = self.control.cancel.notified() => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                    self.transition(ClientEvent::RetryElapsed);
                }
            }
        }

        self.transition(ClientEvent::Cancelled);
        debug!(url = %self.url, "live query task finished");
    }

    async fn attempt(&self) -> Attempt {
        let connected = tokio::select! {
            _ = self.control.cancel.notified() => return Attempt::Cancelled,
            connected = connect_async(self.url.as_str()) => connected,
        };
        let ws = match connected {
            Ok((ws, _)) => ws,
            Err(e) => {
                return match connect_error(e) {
                    e @ LiveQueryError::HandshakeFailed(_) => Attempt::Terminal(e),
                    e => Attempt::Retry(e.to_string()),
                };
            }
        };
        self.transition(ClientEvent::Opened);

        let (mut sink, mut source) = ws.split();
        if let Err(e) = sink.send(Message::Text(self.body.clone())).await {
            return Attempt::Retry(e.to_string());
        }
        self.transition(ClientEvent::HandshakeSent);

        loop {
            tokio::select! {
                _ = self.control.cancel.notified() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Attempt::Cancelled;
                }

                frame = source.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => match LiveMessage::from_text(&text) {
                            Ok(message) => {
                                if self.tx.send(Ok(message)).await.is_err() {
                                    let _ = sink.send(Message::Close(None)).await;
                                    return Attempt::Cancelled;
                                }
                            }
                            Err(e) => warn!(url = %self.url, error = %e, "dropping malformed frame"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            return match close_error(frame) {
                                LiveQueryError::Rejected(reason) if reason.is_terminal() => {
                                    Attempt::Terminal(LiveQueryError::Rejected(reason))
                                }
                                other => Attempt::Retry(other.to_string()),
                            };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Attempt::Retry(e.to_string()),
                        None => return Attempt::Retry("connection lost".to_string()),
                    }
                }
            }
        }
    }
}

/// Handle to a running subscription
#[derive(Debug)]
pub struct LiveSubscription {
    rx: mpsc::Receiver<LiveQueryResult<LiveMessage>>,
    state: watch::Receiver<ClientState>,
    control: Arc<Control>,
    task: Option<JoinHandle<()>>,
}

impl LiveSubscription {
    /// Next frame. A terminal rejection arrives once as `Err`; `None`
    /// after the subscription has closed.
    pub async fn next(&mut self) -> Option<LiveQueryResult<LiveMessage>> {
        self.rx.recv().await
    }

    /// Current connection state
    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Wait until the subscription reaches `target`. Returns `false` if it
    /// closed first.
    pub async fn wait_for(&mut self, target: ClientState) -> bool {
        match self
            .state
            .wait_for(|state| *state == target || state.is_closed())
            .await
        {
            Ok(state) => *state == target,
            Err(_) => target == ClientState::Closed,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.control.is_finished()
    }

    /// Stop reconnecting, close the socket and wait for the task to end
    pub async fn unsubscribe(mut self) {
        self.control.finish();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        self.control.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::LiveEvent;
    use tokio::net::TcpListener;

    fn query() -> DocumentQuery {
        let mut query = DocumentQuery::new("Post");
        query.event = Some(LiveEvent::Insert);
        query
    }

    #[test]
    fn test_close_frame_classification() {
        let rejected = close_error(Some(CloseFrame {
            code: 1008u16.into(),
            reason: "Invalid session".into(),
        }));
        assert_eq!(rejected, LiveQueryError::Rejected(CloseReason::InvalidSession));
        assert!(rejected.is_terminal());

        let retry = close_error(Some(CloseFrame {
            code: 1008u16.into(),
            reason: "stream closed".into(),
        }));
        assert!(!retry.is_terminal());

        let normal = close_error(Some(CloseFrame {
            code: 1000u16.into(),
            reason: "bye".into(),
        }));
        assert_eq!(normal, LiveQueryError::Disconnected("bye".into()));
        assert!(!close_error(None).is_terminal());
    }

    #[tokio::test]
    async fn test_refused_connection_retries_until_unsubscribed() {
        // bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = LiveQueryClient::new(format!("ws://{}", addr))
            .with_reconnect_delay(Duration::from_millis(10));
        let mut subscription = client.subscribe(query());

        assert!(subscription.wait_for(ClientState::Reconnecting).await);
        assert!(!subscription.is_finished());

        subscription.unsubscribe().await;
    }

    #[tokio::test]
    async fn test_drop_stops_reconnecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = LiveQueryClient::new(format!("ws://{}", addr))
            .with_reconnect_delay(Duration::from_millis(10));
        let mut subscription = client.subscribe(query());
        assert!(subscription.wait_for(ClientState::Reconnecting).await);

        let mut state = subscription.state.clone();
        drop(subscription);
        let closed = tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| s.is_closed()))
            .await
            .expect("task kept running");
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn test_once_does_not_retry_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = LiveQueryClient::new(format!("ws://{}", addr));
        let err = client.once(query()).await.unwrap_err();
        assert_eq!(err.code(), "LIVE_CONNECTION");
    }
}
