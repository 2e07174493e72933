//! Authenticated realtime channel over websocket

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use papaya::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type LifecycleHook = Arc<dyn Fn() + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&str) + Send + Sync>;
type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Connection states surfaced to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

/// Lifecycle hooks invoked from the channel's driver task.
#[derive(Clone, Default)]
pub struct RealtimeHooks {
    on_connect: Option<LifecycleHook>,
    on_disconnect: Option<LifecycleHook>,
    on_error: Option<ErrorHook>,
}

impl RealtimeHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    pub fn on_disconnect(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

/// Configuration for the realtime channel.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Websocket server URL, typically [`crate::ApiClientConfig::realtime_url`].
    pub url: String,
    /// Bearer token carried as connection-time credentials. Without one the
    /// channel never dials.
    pub token: Option<String>,
    /// Fixed delay between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Reconnection attempt budget before the channel rests at `Errored`.
    pub max_reconnect_attempts: u32,
}

impl RealtimeConfig {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
        }
    }
}

/// Wire shape of realtime events, both directions.
#[derive(Debug, Serialize, Deserialize)]
struct EventFrame {
    event: String,
    data: Value,
}

struct StateCell {
    state: ChannelState,
    last_error: Option<String>,
}

struct Shared {
    config: RealtimeConfig,
    state: Mutex<StateCell>,
    handlers: HashMap<String, EventHandler>,
    hooks: RealtimeHooks,
}

impl Shared {
    fn cell(&self) -> MutexGuard<'_, StateCell> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_connected(&self) {
        let mut cell = self.cell();
        cell.state = ChannelState::Connected;
        cell.last_error = None;
        drop(cell);

        info!(url = %self.config.url, "Realtime channel connected");
        if let Some(hook) = &self.hooks.on_connect {
            hook();
        }
    }

    fn on_disconnected(&self) {
        self.cell().state = ChannelState::Disconnected;

        info!("Realtime channel disconnected");
        if let Some(hook) = &self.hooks.on_disconnect {
            hook();
        }
    }

    fn on_error(&self, reason: String) {
        let mut cell = self.cell();
        cell.state = ChannelState::Errored;
        cell.last_error = Some(reason.clone());
        drop(cell);

        warn!(reason = %reason, "Realtime channel error");
        if let Some(hook) = &self.hooks.on_error {
            hook(&reason);
        }
    }

    fn on_exhausted(&self, attempts: u32) {
        let mut cell = self.cell();
        cell.state = ChannelState::Errored;
        if cell.last_error.is_none() {
            cell.last_error = Some(format!("gave up after {attempts} reconnect attempts"));
        }
    }
}

/// Single authenticated socket connection with pub/sub event registration.
///
/// One instance per mounted consumer; dropping the handle (or calling
/// [`RealtimeChannel::disconnect`]) is the only teardown path, and the
/// channel never reconnects afterwards.
pub struct RealtimeChannel {
    shared: Arc<Shared>,
    driver: Option<tokio::task::JoinHandle<()>>,
    outbound_tx: mpsc::UnboundedSender<EventFrame>,
    shutdown_tx: watch::Sender<bool>,
}

impl RealtimeChannel {
    /// Opens the channel. Without a token the handle is created in a
    /// permanent `Disconnected` state and never dials the server.
    pub fn connect(config: RealtimeConfig, hooks: RealtimeHooks) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let has_token = config.token.is_some();
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(StateCell {
                state: ChannelState::Disconnected,
                last_error: None,
            }),
            handlers: HashMap::new(),
            hooks,
        });

        let driver = if has_token {
            let shared = Arc::clone(&shared);
            Some(tokio::spawn(run_driver(shared, outbound_rx, shutdown_rx)))
        } else {
            debug!("No session token, realtime channel stays disconnected");
            None
        };

        Self {
            shared,
            driver,
            outbound_tx,
            shutdown_tx,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.shared.cell().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.cell().last_error.clone()
    }

    /// Sends an event frame if currently connected. While not connected the
    /// event is dropped, not queued.
    pub fn emit(&self, event: &str, data: Value) {
        if self.state() != ChannelState::Connected {
            debug!(event, "Dropping emit while not connected");
            return;
        }

        let _ = self.outbound_tx.send(EventFrame {
            event: event.to_string(),
            data,
        });
    }

    /// Registers `handler` for inbound frames named `event`, replacing any
    /// previous handler. Registration while disconnected is inert until a
    /// connection exists.
    pub fn on(&self, event: &str, handler: impl Fn(Value) + Send + Sync + 'static) {
        self.shared
            .handlers
            .pin()
            .insert(event.to_string(), Arc::new(handler));
    }

    /// Drops the handler registered for `event`.
    pub fn off(&self, event: &str) {
        self.shared.handlers.pin().remove(event);
    }

    /// Tears the connection down from any state. The channel does not
    /// reconnect after this.
    pub async fn disconnect(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
        self.shared.cell().state = ChannelState::Disconnected;
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        if let Some(driver) = &self.driver {
            driver.abort();
        }
    }
}

/// Why an established connection ended.
enum Closed {
    Shutdown,
    Dropped,
    Errored(String),
}

async fn run_driver(
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<EventFrame>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let Some(token) = shared.config.token.clone() else {
        return;
    };
    let mut attempts: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        shared.cell().state = ChannelState::Connecting;
        debug!(url = %shared.config.url, "Dialing realtime server");

        let socket = tokio::select! {
            result = open_socket(&shared.config.url, &token) => result,
            _ = shutdown_rx.changed() => break,
        };

        match socket {
            Ok(socket) => {
                attempts = 0;
                shared.on_connected();

                match drive_connection(&shared, socket, &mut outbound_rx, &mut shutdown_rx).await {
                    Closed::Shutdown => break,
                    Closed::Dropped => shared.on_disconnected(),
                    Closed::Errored(reason) => shared.on_error(reason),
                }
            }
            Err(e) => shared.on_error(e.to_string()),
        }

        attempts += 1;
        if attempts >= shared.config.max_reconnect_attempts {
            warn!(attempts, "Realtime reconnect budget exhausted");
            shared.on_exhausted(attempts);
            break;
        }

        // Fixed delay, not exponential backoff.
        tokio::select! {
            _ = tokio::time::sleep(shared.config.reconnect_delay) => {}
            _ = shutdown_rx.changed() => break,
        }
    }
}

/// Websocket upgrade with the bearer token as connection-time credentials.
async fn open_socket(url: &str, token: &str) -> Result<Socket, WsError> {
    let mut request = url.into_client_request()?;
    let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| WsError::HttpFormat(e.into()))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (socket, _response) = connect_async(request).await?;
    Ok(socket)
}

/// Pumps the established connection: outbound frames from the emit queue,
/// inbound frames to the registered handlers.
async fn drive_connection(
    shared: &Shared,
    socket: Socket,
    outbound_rx: &mut mpsc::UnboundedReceiver<EventFrame>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Closed {
    let (mut sink, mut source) = socket.split();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return Closed::Shutdown,
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    return Closed::Shutdown;
                };
                match serde_json::to_string(&frame) {
                    Ok(json) => {
                        debug!(event = %frame.event, "Sending realtime event");
                        if let Err(e) = sink.send(Message::Text(json)).await {
                            return Closed::Errored(e.to_string());
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize realtime event"),
                }
            }
            message = source.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => dispatch(shared, &text),
                    Some(Ok(Message::Binary(data))) => {
                        debug!(len = data.len(), "Ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = sink.send(Message::Pong(payload)).await {
                            return Closed::Errored(e.to_string());
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "Server closed realtime connection");
                        return Closed::Dropped;
                    }
                    Some(Ok(Message::Frame(_))) => warn!("Received raw frame (unexpected)"),
                    Some(Err(e)) => return Closed::Errored(e.to_string()),
                    None => return Closed::Dropped,
                }
            }
        }
    }
}

fn dispatch(shared: &Shared, text: &str) {
    match serde_json::from_str::<EventFrame>(text) {
        Ok(frame) => {
            let handler = shared.handlers.pin().get(&frame.event).cloned();
            match handler {
                Some(handler) => handler(frame.data),
                None => debug!(event = %frame.event, "No handler registered for event"),
            }
        }
        Err(e) => warn!(error = %e, text, "Failed to decode realtime frame"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RealtimeConfig::new("ws://localhost:5000", Some("t".to_string()));
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.max_reconnect_attempts, 5);
    }

    #[tokio::test]
    async fn test_no_token_never_connects() {
        let config = RealtimeConfig::new("ws://127.0.0.1:1", None);
        let mut channel = RealtimeChannel::connect(config, RealtimeHooks::new());

        assert_eq!(channel.state(), ChannelState::Disconnected);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert_eq!(channel.last_error(), None);

        channel.disconnect().await;
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn test_emit_while_disconnected_is_dropped() {
        let config = RealtimeConfig::new("ws://127.0.0.1:1", None);
        let channel = RealtimeChannel::connect(config, RealtimeHooks::new());

        channel.emit("chat:message", json!({"body": "hello"}));
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_registered_handler() {
        let config = RealtimeConfig::new("ws://127.0.0.1:1", None);
        let channel = RealtimeChannel::connect(config, RealtimeHooks::new());

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.on("chat:message", move |data| {
            let _ = tx.send(data);
        });

        dispatch(&channel.shared, r#"{"event":"chat:message","data":{"body":"hi"}}"#);
        assert_eq!(rx.recv().await.unwrap(), json!({"body": "hi"}));

        channel.off("chat:message");
        dispatch(&channel.shared, r#"{"event":"chat:message","data":{"body":"again"}}"#);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_malformed_frame_is_ignored() {
        let shared = Shared {
            config: RealtimeConfig::new("ws://127.0.0.1:1", None),
            state: Mutex::new(StateCell {
                state: ChannelState::Disconnected,
                last_error: None,
            }),
            handlers: HashMap::new(),
            hooks: RealtimeHooks::new(),
        };

        dispatch(&shared, "not json at all");
    }
}
