use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::{protocol::Message, Error as WsError};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::backoff::BackoffPolicy;
use super::messages::{subscribe_batches, SubscriptionArg, PING};
use crate::config::FeedConfig;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Errors that end a single feed connection
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("WebSocket connection failed: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("Subscription encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Connection timeout")]
    Timeout,

    #[error("Heartbeat failed: {0}")]
    Heartbeat(String),

    #[error("No frames received for {0:?}")]
    Idle(Duration),

    #[error("Stream ended unexpectedly")]
    StreamEnded,
}

/// Consumer of one feed subscription
pub trait FeedHandler: Send + Sync {
    /// Items to subscribe to each time the connection (re)opens
    fn subscriptions(&self) -> Vec<SubscriptionArg>;

    /// Called for every inbound text frame, in arrival order
    fn on_message(&self, text: &str);
}

/// How a single connection attempt ended
enum SessionEnd {
    Shutdown,
    Failed {
        error: FeedError,
        uptime: Option<Duration>,
    },
}

/// Supervises one logical push-feed subscription
///
/// `run` reconnects forever with exponential backoff; only the shutdown
/// signal ends it.
pub struct FeedConnectionManager {
    name: String,
    url: String,
    config: FeedConfig,
}

impl FeedConnectionManager {
    pub fn new(name: impl Into<String>, url: impl Into<String>, config: FeedConfig) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            config,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect and keep reconnecting until `shutdown` fires
    pub async fn run<H: FeedHandler>(&self, handler: Arc<H>, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = BackoffPolicy::from_config(&self.config);

        loop {
            match self.run_connection(handler.as_ref(), &mut shutdown).await {
                SessionEnd::Shutdown => {
                    tracing::info!(feed = %self.name, "Feed shutdown");
                    return;
                }
                SessionEnd::Failed { error, uptime } => {
                    if let Some(up) = uptime {
                        if up >= self.config.min_stable() {
                            tracing::info!(
                                feed = %self.name,
                                "Connection was stable for {:.1}s, resetting delay",
                                up.as_secs_f64()
                            );
                        }
                    }
                    let delay = backoff.next_delay(uptime);
                    tracing::warn!(
                        feed = %self.name,
                        "Feed connection failed: {}. Retrying in {:?}...",
                        error,
                        delay
                    );

                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.recv() => {
                            tracing::info!(feed = %self.name, "Feed shutdown during reconnect delay");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One connection lifetime: connect, subscribe, pump frames
    async fn run_connection<H: FeedHandler>(
        &self,
        handler: &H,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        tracing::info!(feed = %self.name, "Connecting to {}", self.url);

        let ws_stream = match timeout(self.config.connect_timeout(), connect_async(self.url.as_str())).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                return SessionEnd::Failed {
                    error: FeedError::Connection(e.to_string()),
                    uptime: None,
                }
            }
            Err(_) => {
                return SessionEnd::Failed {
                    error: FeedError::Timeout,
                    uptime: None,
                }
            }
        };

        let opened_at = Instant::now();
        tracing::info!(feed = %self.name, "Feed WebSocket opened");

        let (sink, mut stream) = ws_stream.split();
        let sink = Arc::new(Mutex::new(sink));

        let failed = |error: FeedError| SessionEnd::Failed {
            error,
            uptime: Some(opened_at.elapsed()),
        };

        if let Err(e) = self.subscribe(&sink, handler).await {
            return failed(e);
        }

        let mut heartbeat = spawn_heartbeat(sink.clone(), self.config.heartbeat_interval());
        let idle = self.config.idle_timeout();

        let end = loop {
            tokio::select! {
                frame = timeout(idle, stream.next()) => match frame {
                    Ok(Some(Ok(Message::Text(text)))) => handler.on_message(&text),
                    Ok(Some(Ok(Message::Ping(payload)))) => {
                        if let Err(e) = sink.lock().await.send(Message::Pong(payload)).await {
                            break failed(e.into());
                        }
                    }
                    Ok(Some(Ok(Message::Close(frame)))) => {
                        tracing::warn!(feed = %self.name, "WebSocket closed: {:?}", frame);
                        break failed(FeedError::StreamEnded);
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => break failed(e.into()),
                    Ok(None) => break failed(FeedError::StreamEnded),
                    Err(_) => break failed(FeedError::Idle(idle)),
                },
                result = &mut heartbeat => {
                    let reason = match result {
                        Ok(e) => e.to_string(),
                        Err(join) => join.to_string(),
                    };
                    break failed(FeedError::Heartbeat(reason));
                }
                _ = shutdown.recv() => {
                    let _ = sink.lock().await.send(Message::Close(None)).await;
                    break SessionEnd::Shutdown;
                }
            }
        };

        heartbeat.abort();
        end
    }

    /// Send subscription batches, pausing between them for the feed's rate limit
    async fn subscribe<H: FeedHandler>(&self, sink: &Mutex<WsSink>, handler: &H) -> Result<(), FeedError> {
        let args = handler.subscriptions();
        if args.is_empty() {
            tracing::error!(feed = %self.name, "No symbols to subscribe!");
            return Ok(());
        }

        let batches = subscribe_batches(&args, self.config.subscribe_batch_size)?;
        let batch_count = batches.len();

        for (i, batch) in batches.into_iter().enumerate() {
            sink.lock().await.send(Message::Text(batch)).await?;
            if i + 1 < batch_count {
                sleep(self.config.subscribe_batch_pause()).await;
            }
        }

        tracing::info!(
            feed = %self.name,
            "Subscribed to {} items in {} batches",
            args.len(),
            batch_count
        );
        Ok(())
    }
}

/// Send a text ping every `interval`; resolves with the first send error
fn spawn_heartbeat<S>(sink: Arc<Mutex<S>>, interval: Duration) -> JoinHandle<WsError>
where
    S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            sleep(interval).await;
            if let Err(e) = sink.lock().await.send(Message::Text(PING.to_string())).await {
                return e;
            }
            tracing::debug!("Heartbeat ping sent");
        }
    })
}
