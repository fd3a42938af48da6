//! # Live Query Server
//!
//! WebSocket endpoint for live queries. Each connection carries exactly one
//! subscription:
//!
//! 1. The client sends the subscription body as its first text frame
//! 2. The server checks secret, session, collection and method, closing with
//!    a policy-violation reason on failure
//! 3. Changes stream as JSON frames until the feed ends, which closes the
//!    socket with `"stream closed"`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use subtle::ConstantTimeEq;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::engine::{LiveFeed, LiveQueryEngine};
use super::errors::{CloseReason, LiveQueryError, LiveQueryResult};
use super::protocol::{LiveHandshake, LiveMessage};
use crate::query::{validate_collection_name, ErrorBody, Method};

/// Grace period for the peer to acknowledge a close frame
const CLOSE_GRACE: Duration = Duration::from_millis(500);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Live query server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveServerConfig {
    /// Bind address
    pub bind_addr: String,

    /// Secret that grants elevated subscriptions without a session
    pub api_secret: Option<String>,
}

impl Default for LiveServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1338".to_string(),
            api_secret: None,
        }
    }
}

/// WebSocket server for live queries
pub struct LiveQueryServer {
    config: Arc<LiveServerConfig>,
    engine: Arc<LiveQueryEngine>,
    shutdown_tx: watch::Sender<bool>,
}

impl LiveQueryServer {
    pub fn new(config: LiveServerConfig, engine: Arc<LiveQueryEngine>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            engine,
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> LiveQueryResult<()> {
        let addr: SocketAddr = self.config.bind_addr.parse().map_err(|e| {
            LiveQueryError::Bind(self.config.bind_addr.clone(), format!("{}", e))
        })?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LiveQueryError::Bind(addr.to_string(), e.to_string()))?;

        self.serve(listener).await
    }

    /// Serve an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> LiveQueryResult<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "live query server listening");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let engine = Arc::clone(&self.engine);
                            let config = Arc::clone(&self.config);
                            let shutdown = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, peer, engine, config, shutdown).await
                                {
                                    warn!(peer = %peer, error = %e, "live query connection failed");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                        }
                    }
                }

                _ = shutdown_rx.changed() => {
                    info!("live query server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Stop accepting and close every open subscription
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Feed read that owns the feed while in flight, so a change already taken
/// from the stream survives other `select!` branches winning
type Pull = BoxFuture<'static, (LiveFeed, Option<LiveQueryResult<LiveMessage>>)>;

fn pull(mut feed: LiveFeed) -> Pull {
    async move {
        let message = feed.next_message().await;
        (feed, message)
    }
    .boxed()
}

/// One turn of the streaming loop
enum Step {
    Pulled(LiveFeed, Option<LiveQueryResult<LiveMessage>>),
    /// `Some(true)` for a frame that keeps the connection open
    Incoming(Option<bool>),
    Shutdown,
}

/// How a streaming subscription ended
enum Exit {
    /// Feed ended, failed or the server is stopping
    StreamClosed,
    /// Peer closed or the socket broke
    ClientGone,
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<LiveQueryEngine>,
    config: Arc<LiveServerConfig>,
    mut shutdown: watch::Receiver<bool>,
) -> LiveQueryResult<()> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| LiveQueryError::HandshakeFailed(e.to_string()))?;
    let (mut sink, mut source) = ws.split();

    let connection_id = Uuid::new_v4();
    debug!(connection = %connection_id, peer = %peer, "live query connection accepted");

    let text = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Binary(_))) => {
                finish(sink, source, CloseReason::InvalidQuery).await;
                return Ok(());
            }
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(LiveQueryError::Connection(e.to_string())),
        }
    };

    let handshake = match LiveHandshake::from_text(&text) {
        Ok(handshake) => handshake,
        Err(e) => {
            warn!(connection = %connection_id, error = %e, "unreadable subscription body");
            finish(sink, source, CloseReason::InvalidQuery).await;
            return Ok(());
        }
    };

    if let Err(reason) = authorize(&engine, &config, &handshake).await {
        info!(
            connection = %connection_id,
            collection = %handshake.query.collection,
            reason = %reason,
            "live query rejected"
        );
        finish(sink, source, reason).await;
        return Ok(());
    }

    let collection = handshake.query.collection.clone();
    let feed = match engine.open(handshake.query).await {
        Ok(feed) => feed,
        Err(e) => {
            error!(connection = %connection_id, collection = %collection, error = %e, "failed to open feed");
            send_failure(&mut sink, &e).await;
            finish(sink, source, CloseReason::StreamClosed).await;
            return Err(e);
        }
    };
    info!(
        connection = %connection_id,
        collection = %collection,
        event = feed.event().as_str(),
        "live query subscribed"
    );

    let mut pending = pull(feed);
    let (exit, feed) = loop {
        let step = tokio::select! {
            (feed, message) = &mut pending => Step::Pulled(feed, message),
            incoming = source.next() => Step::Incoming(incoming.map(|frame| keeps_open(&frame))),
            _ = shutdown.changed() => Step::Shutdown,
        };

        match step {
            Step::Pulled(feed, Some(Ok(message))) => {
                let text = match message.to_text() {
                    Ok(text) => text,
                    Err(e) => {
                        error!(connection = %connection_id, error = %e, "failed to encode message");
                        pending = pull(feed);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(connection = %connection_id, error = %e, "send failed");
                    break (Exit::ClientGone, Some(feed));
                }
                pending = pull(feed);
            }
            Step::Pulled(feed, Some(Err(e))) => {
                send_failure(&mut sink, &e).await;
                break (Exit::StreamClosed, Some(feed));
            }
            Step::Pulled(feed, None) => break (Exit::StreamClosed, Some(feed)),
            Step::Incoming(Some(true)) => {}
            Step::Incoming(_) => break (Exit::ClientGone, None),
            Step::Shutdown => break (Exit::StreamClosed, None),
        }
    };

    // an unfinished pull still owns the feed
    drop(pending);
    if let Some(mut feed) = feed {
        feed.close();
    }
    if let Exit::StreamClosed = exit {
        finish(sink, source, CloseReason::StreamClosed).await;
    }
    info!(connection = %connection_id, collection = %collection, "live query subscription closed");
    Ok(())
}

fn keeps_open(frame: &Result<Message, WsError>) -> bool {
    matches!(frame, Ok(message) if !message.is_close())
}

/// Check credentials and the subscription shape
async fn authorize(
    engine: &LiveQueryEngine,
    config: &LiveServerConfig,
    handshake: &LiveHandshake,
) -> Result<(), CloseReason> {
    let query = &handshake.query;

    let elevated = match &handshake.secret {
        Some(secret) if secret_matches(config.api_secret.as_deref(), secret) => true,
        Some(_) => return Err(CloseReason::InvalidSecret),
        None if query.unlock => return Err(CloseReason::InvalidSecret),
        None => false,
    };

    if !elevated {
        let token = handshake
            .session_token
            .as_deref()
            .ok_or(CloseReason::InvalidSession)?;
        match engine.executor().find_session(token).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err(CloseReason::InvalidSession),
            Err(e) => {
                warn!(error = %e, "session lookup failed");
                return Err(CloseReason::InvalidSession);
            }
        }
    }

    if validate_collection_name(&query.collection).is_err()
        || (!query.unlock && engine.executor().is_reserved(&query.collection))
    {
        return Err(CloseReason::CollectionNotAllowed);
    }

    let method_ok = matches!(query.method, None | Some(Method::Find));
    if !method_ok || query.event.is_none() || !query.pipeline.is_empty() {
        return Err(CloseReason::InvalidQueryMethod);
    }

    Ok(())
}

fn secret_matches(expected: Option<&str>, given: &str) -> bool {
    expected.is_some_and(|expected| bool::from(expected.as_bytes().ct_eq(given.as_bytes())))
}

async fn send_failure(sink: &mut WsSink, error: &LiveQueryError) {
    let body = ErrorBody {
        code: error.code().to_string(),
        message: error.to_string(),
    };
    if let Ok(text) = LiveMessage::failure(body).to_text() {
        let _ = sink.send(Message::Text(text)).await;
    }
}

/// Send a policy-violation close frame and wait briefly for the peer
async fn finish(mut sink: WsSink, mut source: WsSource, reason: CloseReason) {
    let frame = CloseFrame {
        code: CloseCode::from(reason.close_code()),
        reason: reason.as_str().to_string().into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "close frame not delivered");
        return;
    }

    let _ = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(_)) = source.next().await {}
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_comparison() {
        assert!(secret_matches(Some("s3cret"), "s3cret"));
        assert!(!secret_matches(Some("s3cret"), "s3cre"));
        assert!(!secret_matches(Some("s3cret"), "other!"));
        assert!(!secret_matches(None, ""));
    }

    #[test]
    fn test_control_frames_keep_connection_open() {
        assert!(keeps_open(&Ok(Message::Ping(vec![1]))));
        assert!(keeps_open(&Ok(Message::Text("{}".into()))));
        assert!(!keeps_open(&Ok(Message::Close(None))));
        assert!(!keeps_open(&Err(WsError::ConnectionClosed)));
    }

    #[test]
    fn test_default_config() {
        let config = LiveServerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:1338");
        assert!(config.api_secret.is_none());
    }
}
