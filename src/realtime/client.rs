//! Realtime event client - persistent WebSocket with reconnect/backoff
//!
//! The vendor authenticates the socket through the subprotocol header: the
//! raw access token is offered as the only subprotocol. The server also
//! checks `Origin` against its own web client.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{ORIGIN, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::frame::decode_frame;
use crate::came::TokenSource;
use crate::models::PhaseEvent;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Invoked inline for every decoded status update. Must not block.
pub type EventCallback = Arc<dyn Fn(PhaseEvent) + Send + Sync>;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Backoff,
    Stopped,
}

/// Exponential reconnect delay: 1s, 2s, 4s ... capped at 30s
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            current: INITIAL_BACKOFF,
        }
    }
}

impl Backoff {
    pub fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
    }

    /// Delay to wait now; doubles the next one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(MAX_BACKOFF);
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }
}

struct Connection {
    ws_url: String,
    origin: String,
    connect_timeout: Duration,
    tokens: Arc<dyn TokenSource>,
    on_event: EventCallback,
    state: watch::Sender<ConnectionState>,
}

pub struct EventClient {
    conn: Arc<Connection>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventClient {
    pub fn new(
        ws_url: &str,
        origin: &str,
        connect_timeout: Duration,
        tokens: Arc<dyn TokenSource>,
        on_event: EventCallback,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Stopped);
        Self {
            conn: Arc::new(Connection {
                ws_url: ws_url.to_string(),
                origin: origin.to_string(),
                connect_timeout,
                tokens,
                on_event,
                state,
            }),
            task: Mutex::new(None),
        }
    }

    /// Launch the connection loop. No-op while it is already running.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        tracing::info!("[Realtime] Starting event client for {}", self.conn.ws_url);
        let conn = self.conn.clone();
        *task = Some(tokio::spawn(async move { conn.run().await }));
    }

    /// Cancel the loop (including any pending backoff) and wait for it to end
    pub async fn stop(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::error!("[Realtime] Event task failed: {}", e),
            }
            tracing::info!("[Realtime] Event client stopped");
        }
        self.conn.state.send_replace(ConnectionState::Stopped);
    }

    pub fn state(&self) -> ConnectionState {
        *self.conn.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.conn.state.subscribe()
    }
}

impl Connection {
    async fn run(&self) {
        let mut backoff = Backoff::default();

        loop {
            self.state.send_replace(ConnectionState::Connecting);

            match self.connect().await {
                Ok(stream) => {
                    backoff.reset();
                    self.state.send_replace(ConnectionState::Connected);
                    tracing::info!("[Realtime] Connected");
                    self.read_frames(stream).await;
                }
                Err(e) => {
                    tracing::warn!("[Realtime] Connect failed: {}", e);
                }
            }

            self.state.send_replace(ConnectionState::Backoff);
            let delay = backoff.next_delay();
            tracing::info!("[Realtime] Reconnecting in {}s", delay.as_secs());
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect(&self) -> anyhow::Result<WsStream> {
        let token = self.tokens.access_token().await?;
        let url = build_ws_url(&self.ws_url)?;

        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_str(&token)?);
        headers.insert(ORIGIN, HeaderValue::from_str(&self.origin)?);

        let result = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| anyhow::anyhow!("handshake timed out"))?;

        match result {
            Ok((stream, _response)) => Ok(stream),
            Err(WsError::Http(response)) if response.status() == StatusCode::UNAUTHORIZED => {
                // Next attempt must re-authenticate
                self.tokens.invalidate().await;
                Err(anyhow::anyhow!("handshake rejected with 401"))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read until the server closes or the socket fails
    async fn read_frames(&self, mut stream: WsStream) {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => self.handle_text(&text),
                Ok(Message::Close(frame)) => {
                    tracing::info!("[Realtime] Server closed connection: {:?}", frame);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("[Realtime] Read error: {}", e);
                    return;
                }
            }
        }
        tracing::info!("[Realtime] Stream ended");
    }

    fn handle_text(&self, text: &str) {
        match decode_frame(text) {
            Ok(Some(event)) => {
                tracing::debug!(
                    "[Realtime] Status update: phase={} percent={:?}",
                    event.phase,
                    event.percent
                );
                (self.on_event)(event);
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("[Realtime] Dropping frame: {}", e),
        }
    }
}

/// Normalize to ws/wss and append `language=en-US`
fn build_ws_url(raw: &str) -> anyhow::Result<Url> {
    let ws = if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if raw.starts_with("ws://") || raw.starts_with("wss://") {
        raw.to_string()
    } else {
        anyhow::bail!("unsupported WebSocket URL: {}", raw);
    };

    let mut url = Url::parse(&ws)?;
    url.query_pairs_mut().append_pair("language", "en-US");
    Ok(url)
}
