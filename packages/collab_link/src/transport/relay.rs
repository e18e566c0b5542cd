//! Message-relay transport.
//!
//! For callers that cannot open sockets themselves (sandboxed extension
//! content scripts and the like). Frames travel over a [`RelayPort`] to a
//! privileged [`RelayHost`], which owns the real socket and streams its
//! events back. Every connect attempt gets a fresh connection id; events
//! carrying a retired id are dropped on arrival.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CloseEvent, Transport, TransportEvents, WebSocketTransport};
use crate::error::TransportError;
use crate::listeners::Subscription;
use crate::protocol::ABNORMAL_CLOSURE;

/// Caller → host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayRequest {
    Connect { id: u64, url: String },
    Send { id: u64, frame: String },
    Disconnect { id: u64 },
}

/// Host → caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayEvent {
    Opened { id: u64 },
    ConnectFailed { id: u64, message: String },
    Message { id: u64, frame: String },
    Closed { id: u64, code: u16, reason: String },
    Error { id: u64, message: String },
}

impl RelayEvent {
    pub fn id(&self) -> u64 {
        match self {
            Self::Opened { id }
            | Self::ConnectFailed { id, .. }
            | Self::Message { id, .. }
            | Self::Closed { id, .. }
            | Self::Error { id, .. } => *id,
        }
    }
}

/// The unprivileged side of a relay channel.
pub struct RelayPort {
    pub requests: mpsc::UnboundedSender<RelayRequest>,
    pub events: mpsc::UnboundedReceiver<RelayEvent>,
}

/// The privileged side of a relay channel.
pub struct RelayEndpoint {
    pub requests: mpsc::UnboundedReceiver<RelayRequest>,
    pub events: mpsc::UnboundedSender<RelayEvent>,
}

/// Create a connected port/endpoint pair.
pub fn relay_channel() -> (RelayPort, RelayEndpoint) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (
        RelayPort {
            requests: request_tx,
            events: event_rx,
        },
        RelayEndpoint {
            requests: request_rx,
            events: event_tx,
        },
    )
}

type PendingOpen = (u64, oneshot::Sender<Result<(), TransportError>>);

struct RelayState {
    events: TransportEvents,
    /// Connection id of the live attempt, 0 when idle.
    current: AtomicU64,
    connected: AtomicBool,
    pending_open: Mutex<Option<PendingOpen>>,
}

impl RelayState {
    fn take_pending(&self) -> Option<PendingOpen> {
        self.pending_open
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn resolve_pending(&self, id: u64, result: Result<(), TransportError>) {
        let mut pending = self
            .pending_open
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if matches!(pending.as_ref(), Some((pending_id, _)) if *pending_id == id) {
            if let Some((_, tx)) = pending.take() {
                let _ = tx.send(result);
            }
        }
    }
}

/// Transport that proxies frames through a [`RelayHost`].
pub struct RelayTransport {
    state: Arc<RelayState>,
    requests: mpsc::UnboundedSender<RelayRequest>,
    next_id: AtomicU64,
    pump: JoinHandle<()>,
}

impl RelayTransport {
    pub fn new(port: RelayPort) -> Self {
        let state = Arc::new(RelayState {
            events: TransportEvents::default(),
            current: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            pending_open: Mutex::new(None),
        });
        let pump = tokio::spawn(pump_events(port.events, state.clone()));
        Self {
            state,
            requests: port.requests,
            next_id: AtomicU64::new(1),
            pump,
        }
    }

    fn retire(&self) {
        let previous = self.state.current.swap(0, Ordering::SeqCst);
        self.state.connected.store(false, Ordering::SeqCst);
        // Dropping the sender resolves a waiting connect as cancelled
        self.state.take_pending();
        if previous != 0 {
            let _ = self
                .requests
                .send(RelayRequest::Disconnect { id: previous });
        }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn connect(&self, url: &str) -> Result<(), TransportError> {
        self.retire();

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        *self
            .state
            .pending_open
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some((id, tx));
        self.state.current.store(id, Ordering::SeqCst);

        debug!(id, url = %url, "Requesting relayed connection");
        if self
            .requests
            .send(RelayRequest::Connect {
                id,
                url: url.to_string(),
            })
            .is_err()
        {
            self.state.current.store(0, Ordering::SeqCst);
            self.state.take_pending();
            return Err(TransportError::Relay("relay host is gone".into()));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Cancelled),
        }
    }

    async fn disconnect(&self) {
        self.retire();
    }

    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let id = self.state.current.load(Ordering::SeqCst);
        self.requests
            .send(RelayRequest::Send { id, frame })
            .map_err(|_| TransportError::Relay("relay host is gone".into()))
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    fn abort(&self) {
        self.retire();
    }

    fn events(&self) -> &TransportEvents {
        &self.state.events
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.retire();
        self.pump.abort();
    }
}

async fn pump_events(mut events: mpsc::UnboundedReceiver<RelayEvent>, state: Arc<RelayState>) {
    while let Some(event) = events.recv().await {
        let id = event.id();
        if id != state.current.load(Ordering::SeqCst) {
            debug!(id, "Dropping event for retired relay connection");
            continue;
        }

        match event {
            RelayEvent::Opened { id } => {
                state.connected.store(true, Ordering::SeqCst);
                state.events.open.emit(&());
                state.resolve_pending(id, Ok(()));
            }
            RelayEvent::ConnectFailed { id, message } => {
                state.resolve_pending(id, Err(TransportError::Connect(message)));
            }
            RelayEvent::Message { frame, .. } => state.events.message.emit(&frame),
            RelayEvent::Closed { code, reason, .. } => {
                state.connected.store(false, Ordering::SeqCst);
                state.events.close.emit(&CloseEvent { code, reason });
            }
            RelayEvent::Error { message, .. } => {
                state.events.error.emit(&TransportError::Relay(message));
            }
        }
    }

    // The host dropped its end of the channel
    let id = state.current.load(Ordering::SeqCst);
    if id != 0 {
        state.resolve_pending(id, Err(TransportError::Relay("relay host is gone".into())));
        if state.connected.swap(false, Ordering::SeqCst) {
            warn!(id, "Relay host went away with an open connection");
            let lost = TransportError::Relay("relay host is gone".into());
            state.events.error.emit(&lost);
            state
                .events
                .close
                .emit(&CloseEvent::new(ABNORMAL_CLOSURE, lost.to_string()));
        }
    }
}

struct HostedSocket {
    transport: Arc<WebSocketTransport>,
    connecting: JoinHandle<()>,
    _wiring: Vec<Subscription>,
}

/// The privileged intermediary: opens real sockets on request and streams
/// their events back over the relay channel.
pub struct RelayHost {
    events: mpsc::UnboundedSender<RelayEvent>,
    sockets: HashMap<u64, HostedSocket>,
}

impl RelayHost {
    /// Serve `endpoint` until the caller's port is dropped.
    pub fn spawn(endpoint: RelayEndpoint) -> JoinHandle<()> {
        let RelayEndpoint { requests, events } = endpoint;
        let host = RelayHost {
            events,
            sockets: HashMap::new(),
        };
        tokio::spawn(host.run(requests))
    }

    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<RelayRequest>) {
        info!("Relay host started");
        while let Some(request) = requests.recv().await {
            match request {
                RelayRequest::Connect { id, url } => self.open(id, url),
                RelayRequest::Send { id, frame } => self.forward(id, frame).await,
                RelayRequest::Disconnect { id } => self.close(id).await,
            }
        }

        let ids: Vec<u64> = self.sockets.keys().copied().collect();
        for id in ids {
            self.close(id).await;
        }
        info!("Relay host stopped");
    }

    fn open(&mut self, id: u64, url: String) {
        debug!(id, url = %url, "Relay opening socket");
        let transport = Arc::new(WebSocketTransport::new());
        let wiring = wire_socket(transport.as_ref(), id, &self.events);

        let events = self.events.clone();
        let socket = transport.clone();
        let connecting = tokio::spawn(async move {
            match socket.connect(&url).await {
                Ok(()) | Err(TransportError::Cancelled) => {}
                Err(e) => {
                    let _ = events.send(RelayEvent::ConnectFailed {
                        id,
                        message: e.to_string(),
                    });
                }
            }
        });

        self.sockets.insert(
            id,
            HostedSocket {
                transport,
                connecting,
                _wiring: wiring,
            },
        );
    }

    async fn forward(&self, id: u64, frame: String) {
        match self.sockets.get(&id) {
            Some(socket) => {
                if let Err(e) = socket.transport.send(frame).await {
                    warn!(id, error = %e, "Relay could not forward frame");
                }
            }
            None => debug!(id, "Relay dropping frame for unknown connection"),
        }
    }

    async fn close(&mut self, id: u64) {
        if let Some(socket) = self.sockets.remove(&id) {
            debug!(id, "Relay closing socket");
            socket.connecting.abort();
            socket.transport.disconnect().await;
        }
    }
}

fn wire_socket(
    transport: &WebSocketTransport,
    id: u64,
    events: &mpsc::UnboundedSender<RelayEvent>,
) -> Vec<Subscription> {
    let on_open = events.clone();
    let on_message = events.clone();
    let on_close = events.clone();
    let on_error = events.clone();
    vec![
        transport.on_open(Arc::new(move |_: &()| {
            let _ = on_open.send(RelayEvent::Opened { id });
        })),
        transport.on_message(Arc::new(move |frame: &String| {
            let _ = on_message.send(RelayEvent::Message {
                id,
                frame: frame.clone(),
            });
        })),
        transport.on_close(Arc::new(move |close: &CloseEvent| {
            let _ = on_close.send(RelayEvent::Closed {
                id,
                code: close.code,
                reason: close.reason.clone(),
            });
        })),
        transport.on_error(Arc::new(move |err: &TransportError| {
            let _ = on_error.send(RelayEvent::Error {
                id,
                message: err.to_string(),
            });
        })),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    async fn next_request(endpoint: &mut RelayEndpoint) -> RelayRequest {
        tokio::time::timeout(WAIT, endpoint.requests.recv())
            .await
            .expect("timed out waiting for relay request")
            .expect("relay port closed")
    }

    fn record_messages(transport: &RelayTransport) -> (Subscription, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = transport.on_message(Arc::new(move |frame: &String| {
            let _ = tx.send(frame.clone());
        }));
        (sub, rx)
    }

    #[test]
    fn requests_are_tagged_by_kind() {
        let json = serde_json::to_value(RelayRequest::Connect {
            id: 3,
            url: "wss://host/ws/sessions/s1".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "kind": "connect", "id": 3, "url": "wss://host/ws/sessions/s1" })
        );
    }

    #[tokio::test]
    async fn relays_frames_both_ways() {
        let (port, mut endpoint) = relay_channel();
        let transport = Arc::new(RelayTransport::new(port));
        let (_messages_sub, mut messages) = record_messages(&transport);

        let connecting = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.connect("wss://host/ws/conversations/c1").await })
        };

        let RelayRequest::Connect { id, url } = next_request(&mut endpoint).await else {
            panic!("expected connect request");
        };
        assert_eq!(url, "wss://host/ws/conversations/c1");
        endpoint.events.send(RelayEvent::Opened { id }).unwrap();

        connecting.await.unwrap().unwrap();
        assert!(transport.is_connected());

        transport.send("hello".into()).await.unwrap();
        assert_eq!(
            next_request(&mut endpoint).await,
            RelayRequest::Send {
                id,
                frame: "hello".into()
            }
        );

        endpoint
            .events
            .send(RelayEvent::Message {
                id,
                frame: "from host".into(),
            })
            .unwrap();
        let received = tokio::time::timeout(WAIT, messages.recv()).await.unwrap();
        assert_eq!(received.as_deref(), Some("from host"));

        endpoint
            .events
            .send(RelayEvent::Closed {
                id,
                code: 1000,
                reason: String::new(),
            })
            .unwrap();
        tokio::time::timeout(WAIT, async {
            while transport.is_connected() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn connect_failure_is_returned() {
        let (port, mut endpoint) = relay_channel();
        let transport = Arc::new(RelayTransport::new(port));

        let connecting = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.connect("wss://nowhere").await })
        };
        let RelayRequest::Connect { id, .. } = next_request(&mut endpoint).await else {
            panic!("expected connect request");
        };
        endpoint
            .events
            .send(RelayEvent::ConnectFailed {
                id,
                message: "refused".into(),
            })
            .unwrap();

        assert_eq!(
            connecting.await.unwrap(),
            Err(TransportError::Connect("refused".into()))
        );
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_connect_and_retires_id() {
        let (port, mut endpoint) = relay_channel();
        let transport = Arc::new(RelayTransport::new(port));
        let (_messages_sub, mut messages) = record_messages(&transport);

        let connecting = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.connect("wss://slow").await })
        };
        let RelayRequest::Connect { id, .. } = next_request(&mut endpoint).await else {
            panic!("expected connect request");
        };

        transport.disconnect().await;
        assert_eq!(connecting.await.unwrap(), Err(TransportError::Cancelled));
        assert_eq!(
            next_request(&mut endpoint).await,
            RelayRequest::Disconnect { id }
        );

        // Late events for the retired id never surface
        endpoint.events.send(RelayEvent::Opened { id }).unwrap();
        endpoint
            .events
            .send(RelayEvent::Message {
                id,
                frame: "late".into(),
            })
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(100), messages.recv())
                .await
                .is_err()
        );
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn send_requires_open_connection() {
        let (port, _endpoint) = relay_channel();
        let transport = RelayTransport::new(port);
        assert_eq!(
            transport.send("x".into()).await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn host_going_away_drops_the_link_into_reconnect() {
        use crate::config::ConnectionConfig;
        use crate::connection::{ConnectionManager, ConnectionState};
        use crate::token::StaticToken;

        let (port, mut endpoint) = relay_channel();
        let transport = Arc::new(RelayTransport::new(port));
        let (close_tx, mut closes) = mpsc::unbounded_channel();
        let _closes = transport.on_close(Arc::new(move |close: &CloseEvent| {
            let _ = close_tx.send(close.code);
        }));
        let manager = ConnectionManager::new(
            ConnectionConfig::default(),
            transport.clone(),
            Arc::new(StaticToken::none()),
        );

        let host = tokio::spawn(async move {
            let RelayRequest::Connect { id, .. } = next_request(&mut endpoint).await else {
                panic!("expected connect request");
            };
            endpoint.events.send(RelayEvent::Opened { id }).unwrap();
            endpoint
        });
        manager.connect("wss://host/ws/sessions/s1").await.unwrap();
        assert_eq!(manager.connection_state(), ConnectionState::Connected);

        drop(host.await.unwrap());

        let closed = tokio::time::timeout(WAIT, closes.recv()).await.unwrap();
        assert_eq!(closed, Some(ABNORMAL_CLOSURE));
        assert!(!transport.is_connected());

        let mut state = manager.watch_state();
        tokio::time::timeout(
            WAIT,
            state.wait_for(|state| *state == ConnectionState::Reconnecting),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(manager.reconnect_attempts(), 1);
    }
}
