//! Connection state machine.
//!
//! [`ConnectionManager`] owns one transport and drives it through
//! connect, authenticate, keepalive and reconnect. Consumers observe it
//! through two listener registries and the current [`ConnectionState`];
//! only the manager's actor ever changes that state.

mod actor;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::ConnectionConfig;
use crate::error::LinkError;
use crate::listeners::{ListenerRegistry, Subscription};
use crate::protocol::WsMessage;
use crate::token::TokenProvider;
use crate::transport::Transport;

use actor::{Actor, ActorParts, Command};

/// Lifecycle of one logical connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// The last attempt failed. Either a reconnect is scheduled, or
    /// retries are exhausted and only a new `connect` leaves this state.
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a connection actor.
///
/// Create one per view that needs a live connection and drop it when the
/// view goes away: dropping aborts the transport, cancels every timer and
/// removes all listeners before returning. A listener already executing on
/// the actor's worker finishes; no listener starts after the drop.
pub struct ConnectionManager {
    sender: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    attempts: Arc<AtomicU32>,
    messages: ListenerRegistry<WsMessage>,
    state_listeners: ListenerRegistry<ConnectionState>,
    transport: Arc<dyn Transport>,
    actor: JoinHandle<()>,
}

impl ConnectionManager {
    /// Spawn the actor. Must be called from within a tokio runtime.
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let (sender, commands) = mpsc::channel(32);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let attempts = Arc::new(AtomicU32::new(0));
        let messages = ListenerRegistry::new();
        let state_listeners = ListenerRegistry::new();

        let actor = Actor::new(
            ActorParts {
                config,
                transport: transport.clone(),
                tokens,
                state: state_tx,
                attempts: attempts.clone(),
                messages: messages.clone(),
                state_listeners: state_listeners.clone(),
            },
            commands,
        );

        Self {
            sender,
            state,
            attempts,
            messages,
            state_listeners,
            transport,
            actor: tokio::spawn(actor.run()),
        }
    }

    /// Bind to `url`, tearing down any previous connection first.
    ///
    /// Resolves once the transport opens. If this first attempt fails the
    /// error is returned here and reconnects continue in the background.
    /// Returns [`LinkError::Cancelled`] if `disconnect` or another
    /// `connect` intervenes.
    pub async fn connect(&self, url: &str) -> Result<(), LinkError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Connect {
                url: url.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| LinkError::Shutdown)?;
        rx.await.map_err(|_| LinkError::Shutdown)?
    }

    /// Cancel any attempt or pending reconnect and close the transport.
    /// No listener fires after this returns until the next `connect`.
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Disconnect { respond_to: tx })
            .await
            .map_err(|_| LinkError::Shutdown)?;
        rx.await.map_err(|_| LinkError::Shutdown)
    }

    /// Encode and transmit one envelope. Fails fast with
    /// [`LinkError::NotConnected`] outside `Connected`; nothing is queued.
    pub async fn send_message(&self, message: &WsMessage) -> Result<(), LinkError> {
        if self.connection_state() != ConnectionState::Connected {
            return Err(LinkError::NotConnected);
        }
        let frame = message.to_json()?;

        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Send {
                frame,
                respond_to: tx,
            })
            .await
            .map_err(|_| LinkError::Shutdown)?;
        rx.await.map_err(|_| LinkError::Shutdown)?
    }

    /// Called in registration order for every inbound envelope. Listeners
    /// stay registered across reconnects.
    pub fn add_message_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&WsMessage) + Send + Sync + 'static,
    {
        self.messages.add(Arc::new(listener))
    }

    /// Called in registration order on every state transition.
    pub fn add_state_change_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.state_listeners.add(Arc::new(listener))
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// A receiver that observes every published state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.actor.abort();
        self.transport.abort();
        self.messages.close();
        self.state_listeners.close();
    }
}
