//! Push-channel connection lifecycle and listener dispatch.
//!
//! `EventChannel` keeps at most one live websocket connection per session.
//! A background worker owns the socket: it joins the user namespace,
//! answers pings, classifies inbound event frames, and fans them out to
//! every registered listener. Any transport failure marks the connection
//! dead silently; the next `subscribe` observes that and reconnects.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::api::{ApiError, SimpliSafeClient};
use crate::stream::proto::{
    classify_event_code, connect_frame, parse_frame, AlarmEvent, EventDisposition, Frame,
    PING_FRAME, PONG_FRAME,
};

/// Production origin for the push channel.
pub const PUSH_ENDPOINT: &str = "wss://api.simplisafe.com";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECTING: u8 = 0;
const CONNECTED: u8 = 1;
const DEAD: u8 = 2;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Listener = Box<dyn Fn(Option<AlarmEvent>, &Value) + Send>;

struct ChannelConnection {
    state: Arc<AtomicU8>,
    listeners: Arc<Mutex<Vec<Listener>>>,
    // Dropping the sender tells the worker to close the socket.
    _shutdown: oneshot::Sender<()>,
}

/// Realtime event subscription handle; holds 0 or 1 live connection.
pub struct EventChannel {
    endpoint_override: Option<String>,
    handshake_timeout: Duration,
    conn: Option<ChannelConnection>,
}

impl EventChannel {
    /// Creates a channel against the production push endpoint.
    pub fn new() -> Self {
        Self {
            endpoint_override: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            conn: None,
        }
    }

    /// Sets an explicit push-channel origin override.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_override = Some(endpoint.into().trim_end_matches('/').to_string());
        self
    }

    /// Overrides the deadline covering connect and the open/join handshake.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Registers a listener, establishing the connection if none is live.
    ///
    /// The connection is bound to the user id and access token current at
    /// establishment time. Listeners receive the semantic tag (when the
    /// event code has one) together with the full raw payload. Connection
    /// failures after this call are not surfaced; they show up as
    /// [`is_connected`](Self::is_connected) turning false, and a later
    /// `subscribe` re-establishes the channel.
    pub async fn subscribe<F>(
        &mut self,
        api: &mut SimpliSafeClient,
        listener: F,
    ) -> Result<(), ApiError>
    where
        F: Fn(Option<AlarmEvent>, &Value) + Send + 'static,
    {
        let live = self
            .conn
            .as_ref()
            .is_some_and(|conn| conn.state.load(Ordering::SeqCst) != DEAD);

        if !live {
            let user_id = api.user_id().await?;
            let access_token = api
                .access_token()
                .ok_or(ApiError::NotAuthenticated)?
                .to_string();
            self.conn = Some(self.open_connection(user_id, access_token));
        }

        if let Some(conn) = self.conn.as_ref() {
            conn.listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(Box::new(listener));
        }
        Ok(())
    }

    /// True iff a connection exists and its handshake completed without the
    /// worker having died since.
    pub fn is_connected(&self) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|conn| conn.state.load(Ordering::SeqCst) == CONNECTED)
    }

    /// Closes and discards the connection; a no-op when none exists.
    pub fn unsubscribe(&mut self) {
        self.conn = None;
    }

    fn open_connection(&self, user_id: u64, access_token: String) -> ChannelConnection {
        let namespace = format!("/v1/user/{user_id}");
        let origin = self
            .endpoint_override
            .clone()
            .unwrap_or_else(|| PUSH_ENDPOINT.to_string());
        let url = format!(
            "{origin}/socket.io/?ns={namespace}&accessToken={access_token}&EIO=3&transport=websocket"
        );

        let state = Arc::new(AtomicU8::new(CONNECTING));
        let listeners: Arc<Mutex<Vec<Listener>>> = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(channel_worker(
            url,
            namespace,
            self.handshake_timeout,
            Arc::clone(&state),
            Arc::clone(&listeners),
            shutdown_rx,
        ));

        ChannelConnection {
            state,
            listeners,
            _shutdown: shutdown_tx,
        }
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

async fn channel_worker(
    url: String,
    namespace: String,
    handshake_timeout: Duration,
    state: Arc<AtomicU8>,
    listeners: Arc<Mutex<Vec<Listener>>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    // The whole establishment phase runs under one deadline and can be
    // abandoned by `unsubscribe`; a vendor that upgrades the socket but
    // never opens the channel must not pin the connection in limbo.
    let handshake = async {
        let (mut socket, _) = connect_async(url.as_str()).await.ok()?;
        join_namespace(&mut socket, &namespace).await.then_some(socket)
    };
    let mut socket = tokio::select! {
        _ = &mut shutdown_rx => {
            state.store(DEAD, Ordering::SeqCst);
            return;
        }
        outcome = tokio::time::timeout(handshake_timeout, handshake) => match outcome {
            Ok(Some(socket)) => socket,
            Ok(None) | Err(_) => {
                state.store(DEAD, Ordering::SeqCst);
                debug!(event = "push_channel_handshake_failed", %namespace);
                return;
            }
        }
    };
    state.store(CONNECTED, Ordering::SeqCst);
    debug!(event = "push_channel_connected", %namespace);

    let start = tokio::time::Instant::now() + HEARTBEAT_INTERVAL;
    let mut heartbeat = tokio::time::interval_at(start, HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                let _ = socket.close(None).await;
                break;
            }
            _ = heartbeat.tick() => {
                if socket.send(Message::Text(PING_FRAME.to_string())).await.is_err() {
                    break;
                }
            }
            frame = socket.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match parse_frame(&text, &namespace) {
                        Frame::Event(payload) => dispatch_event(&listeners, payload),
                        Frame::Ping => {
                            if socket.send(Message::Text(PONG_FRAME.to_string())).await.is_err() {
                                break;
                            }
                        }
                        Frame::Disconnect => break,
                        Frame::Open | Frame::Pong | Frame::NamespaceAck | Frame::Ignored => {}
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.store(DEAD, Ordering::SeqCst);
    debug!(event = "push_channel_closed", %namespace);
}

/// Waits for the engine.io open frame, then joins the user namespace.
async fn join_namespace(socket: &mut Socket, namespace: &str) -> bool {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => match parse_frame(&text, namespace) {
                Frame::Open => {
                    return socket
                        .send(Message::Text(connect_frame(namespace)))
                        .await
                        .is_ok();
                }
                Frame::Ping => {
                    if socket
                        .send(Message::Text(PONG_FRAME.to_string()))
                        .await
                        .is_err()
                    {
                        return false;
                    }
                }
                _ => {}
            },
            Some(Ok(Message::Ping(payload))) => {
                if socket.send(Message::Pong(payload)).await.is_err() {
                    return false;
                }
            }
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return false,
        }
    }
}

fn dispatch_event(listeners: &Mutex<Vec<Listener>>, payload: Value) {
    let code = payload.get("eventCid").and_then(Value::as_i64);
    let tag = match code.map(classify_event_code) {
        Some(EventDisposition::Suppressed) => return,
        Some(EventDisposition::Tagged(tag)) => Some(tag),
        Some(EventDisposition::Untagged) | None => None,
    };

    // A listener that panicked mid-dispatch poisons the registry; keep
    // delivering to everyone still registered.
    let listeners = listeners
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    for listener in listeners.iter() {
        listener(tag, &payload);
    }
}
