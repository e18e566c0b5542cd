//! Transport adapters.
//!
//! A [`Transport`] owns one bidirectional text-frame channel at a time and
//! reports what happens on it through four event registries. The
//! connection state machine only ever sees `Arc<dyn Transport>`; which
//! adapter backs it is decided once, when the transport is built.
//!
//! | Adapter              | Used when                                          |
//! |----------------------|----------------------------------------------------|
//! | `WebSocketTransport` | the caller can open sockets itself                 |
//! | `RelayTransport`     | frames must be proxied through a privileged host   |
//!
//! # Event contract
//!
//! - A failed `connect` is reported only through its `Result`; no close or
//!   error event fires for an attempt that never opened.
//! - `open` fires before `connect` resolves and before any `message`.
//! - A socket failure fires `error` and then `close` with code 1006.
//! - After `disconnect` or `abort` returns, no further event fires.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::TransportKind;
use crate::error::TransportError;
use crate::listeners::{Listener, ListenerRegistry, Subscription};

mod relay;
mod websocket;

pub use relay::{
    RelayEndpoint, RelayEvent, RelayHost, RelayPort, RelayRequest, RelayTransport, relay_channel,
};
pub use websocket::WebSocketTransport;

/// Close notification: the close code and optional reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
}

impl CloseEvent {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// The four event registries every adapter exposes.
#[derive(Clone, Default)]
pub struct TransportEvents {
    pub open: ListenerRegistry<()>,
    pub message: ListenerRegistry<String>,
    pub close: ListenerRegistry<CloseEvent>,
    pub error: ListenerRegistry<TransportError>,
}

/// Capability interface over a bidirectional socket primitive.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the channel. Resolves once open. Any previous channel is
    /// disconnected first.
    async fn connect(&self, url: &str) -> Result<(), TransportError>;

    /// Idempotent. Cancels an in-flight connect.
    async fn disconnect(&self);

    /// Transmit one text frame. Fails with `NotConnected` unless open.
    async fn send(&self, frame: String) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Tear down immediately, without a close handshake.
    fn abort(&self);

    fn events(&self) -> &TransportEvents;

    fn on_open(&self, listener: Listener<()>) -> Subscription {
        self.events().open.add(listener)
    }

    fn on_message(&self, listener: Listener<String>) -> Subscription {
        self.events().message.add(listener)
    }

    fn on_close(&self, listener: Listener<CloseEvent>) -> Subscription {
        self.events().close.add(listener)
    }

    fn on_error(&self, listener: Listener<TransportError>) -> Subscription {
        self.events().error.add(listener)
    }
}

impl TransportKind {
    /// Build the adapter for this strategy.
    ///
    /// `Relay` requires the caller's side of a relay channel; without one
    /// the relay strategy cannot be built.
    pub fn build(self, relay: Option<RelayPort>) -> Result<Arc<dyn Transport>, TransportError> {
        match (self, relay) {
            (TransportKind::WebSocket, _) => Ok(Arc::new(WebSocketTransport::new())),
            (TransportKind::Relay, Some(port)) => Ok(Arc::new(RelayTransport::new(port))),
            (TransportKind::Relay, None) => {
                Err(TransportError::Relay("no relay port supplied".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_selects_strategy() {
        let ws = TransportKind::WebSocket.build(None).unwrap();
        assert!(!ws.is_connected());

        let (port, _endpoint) = relay_channel();
        let relay = TransportKind::Relay.build(Some(port)).unwrap();
        assert!(!relay.is_connected());

        assert!(matches!(
            TransportKind::Relay.build(None),
            Err(TransportError::Relay(_))
        ));
    }
}
