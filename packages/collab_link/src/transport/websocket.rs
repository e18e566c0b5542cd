//! Socket transport over `tokio-tungstenite`.
//!
//! Single responsibility: open a WebSocket, move text frames in both
//! directions and report open/close/error. No knowledge of the envelope
//! format, authentication or reconnection.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{CloseEvent, Transport, TransportEvents};
use crate::error::TransportError;
use crate::protocol::{ABNORMAL_CLOSURE, NO_STATUS};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Upper bound on the close handshake when disconnecting.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

static CRYPTO_PROVIDER: Once = Once::new();

/// `wss://` handshakes need a process-wide rustls provider. An embedding
/// application that installed its own keeps it.
fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("rustls crypto provider already installed");
        }
    });
}

struct Shared {
    connected: AtomicBool,
    /// Bumped by every disconnect; a reader or connect holding an older
    /// value is stale and must stay silent.
    epoch: AtomicU64,
    reader: Mutex<Option<CancellationToken>>,
}

impl Shared {
    fn take_reader(&self) -> Option<CancellationToken> {
        self.reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }
}

/// Standard socket-based transport.
pub struct WebSocketTransport {
    events: TransportEvents,
    shared: Arc<Shared>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self {
            events: TransportEvents::default(),
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                reader: Mutex::new(None),
            }),
            sink: tokio::sync::Mutex::new(None),
        }
    }

    /// Mark the current socket dead and stop its reader.
    fn retire(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);
        if let Some(cancel) = self.shared.take_reader() {
            cancel.cancel();
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<(), TransportError> {
        self.disconnect().await;
        let epoch = self.shared.epoch.load(Ordering::SeqCst);

        debug!(url = %url, "Connecting WebSocket");
        install_crypto_provider();
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (sink, stream) = ws.split();
        let cancel = CancellationToken::new();
        {
            let mut slot = self.sink.lock().await;
            if !self.shared.is_current(epoch) {
                debug!(url = %url, "Connect superseded by disconnect");
                return Err(TransportError::Cancelled);
            }
            *slot = Some(sink);
            *self
                .shared
                .reader
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(cancel.clone());
            self.shared.connected.store(true, Ordering::SeqCst);
        }

        debug!(url = %url, "WebSocket connected");
        self.events.open.emit(&());

        tokio::spawn(read_loop(
            stream,
            self.events.clone(),
            self.shared.clone(),
            epoch,
            cancel,
        ));
        Ok(())
    }

    async fn disconnect(&self) {
        self.retire();

        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: Utf8Bytes::from_static("client disconnect"),
            };
            match tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(Some(frame)))).await
            {
                Ok(Ok(())) => debug!("Sent close frame"),
                Ok(Err(e)) => debug!(error = %e, "Close frame not delivered"),
                Err(_) => debug!("Timed out sending close frame"),
            }
        }
    }

    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let mut slot = self.sink.lock().await;
        let sink = slot.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::Socket(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn abort(&self) {
        self.retire();
        if let Ok(mut slot) = self.sink.try_lock() {
            slot.take();
        }
    }

    fn events(&self) -> &TransportEvents {
        &self.events
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.retire();
    }
}

/// Reader task: one per open socket.
async fn read_loop(
    mut stream: WsSource,
    events: TransportEvents,
    shared: Arc<Shared>,
    epoch: u64,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.next() => next,
        };

        if !shared.is_current(epoch) {
            return;
        }

        match next {
            Some(Ok(Message::Text(text))) => events.message.emit(&text.to_string()),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => events.message.emit(&text),
                Err(_) => warn!(len = data.len(), "Dropping non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Close(frame))) => {
                let close = frame
                    .map(|f| CloseEvent::new(u16::from(f.code), f.reason.to_string()))
                    .unwrap_or_else(|| CloseEvent::new(NO_STATUS, ""));
                debug!(code = close.code, reason = %close.reason, "Server closed WebSocket");
                shared.connected.store(false, Ordering::SeqCst);
                events.close.emit(&close);

                // Keep polling briefly so tungstenite can flush its close reply.
                let drain = async { while let Some(Ok(_)) = stream.next().await {} };
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::timeout(CLOSE_TIMEOUT, drain) => {}
                }
                return;
            }
            // Pings are answered by tungstenite
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket error");
                shared.connected.store(false, Ordering::SeqCst);
                events.error.emit(&TransportError::Socket(e.to_string()));
                events
                    .close
                    .emit(&CloseEvent::new(ABNORMAL_CLOSURE, e.to_string()));
                return;
            }
            None => {
                debug!("WebSocket stream ended");
                shared.connected.store(false, Ordering::SeqCst);
                events
                    .close
                    .emit(&CloseEvent::new(ABNORMAL_CLOSURE, "stream ended"));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_before_connect_fails_fast() {
        let transport = WebSocketTransport::new();
        assert!(!transport.is_connected());
        assert_eq!(
            transport.send("{}".into()).await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let transport = WebSocketTransport::new();
        transport.disconnect().await;
        transport.disconnect().await;
        transport.abort();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn connect_to_closed_port_reports_error_without_events() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = WebSocketTransport::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_close = fired.clone();
        let _close = transport.on_close(Arc::new(move |_: &CloseEvent| {
            fired_close.store(true, Ordering::SeqCst);
        }));

        let result = transport.connect(&format!("ws://{addr}/ws")).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
        assert!(!transport.is_connected());
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn wss_connect_starts_a_tls_handshake() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let first_byte = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.read_u8().await.unwrap()
        });

        // The server hangs up after one byte, so the handshake itself fails.
        let transport = WebSocketTransport::new();
        let result = transport
            .connect(&format!("wss://{addr}/ws/conversations/abc123"))
            .await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
        assert!(!transport.is_connected());

        // 0x16 opens a TLS handshake record (ClientHello).
        assert_eq!(first_byte.await.unwrap(), 0x16);
    }
}
