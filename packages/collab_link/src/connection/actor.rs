//! The connection actor.
//!
//! One task per `ConnectionManager`. It is the only writer of the
//! connection state, the reconnect counter and every timer; commands from
//! the handle and events from the transport are both funnelled into its
//! select loop, so no two transitions ever race.

use futures::future::BoxFuture;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};

use super::ConnectionState;
use crate::config::{ConnectionConfig, MAX_KEEPALIVE_INTERVAL};
use crate::error::{LinkError, TransportError};
use crate::listeners::{ListenerRegistry, Subscription};
use crate::protocol::{NORMAL_CLOSURE, WsMessage};
use crate::token::TokenProvider;
use crate::transport::{CloseEvent, Transport};

pub(super) enum Command {
    Connect {
        url: String,
        respond_to: oneshot::Sender<Result<(), LinkError>>,
    },
    Disconnect {
        respond_to: oneshot::Sender<()>,
    },
    Send {
        frame: String,
        respond_to: oneshot::Sender<Result<(), LinkError>>,
    },
}

/// A transport event tagged with the attempt that produced it.
enum LinkEvent {
    Open,
    Message(String),
    Close(CloseEvent),
    Error(TransportError),
}

type Tagged = (u64, LinkEvent);

pub(super) struct Actor {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenProvider>,
    state: watch::Sender<ConnectionState>,
    attempts: Arc<AtomicU32>,
    messages: ListenerRegistry<WsMessage>,
    state_listeners: ListenerRegistry<ConnectionState>,

    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<Tagged>,
    events: mpsc::UnboundedReceiver<Tagged>,

    url: Option<String>,
    /// Incremented by every attempt and every teardown. Transport events
    /// tagged with an older value are discarded.
    generation: u64,
    wiring: Vec<Subscription>,
    waiter: Option<oneshot::Sender<Result<(), LinkError>>>,

    pending_connect: Option<BoxFuture<'static, Result<(), TransportError>>>,
    pending_auth: Option<BoxFuture<'static, Option<String>>>,
    keepalive: Option<Interval>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
}

/// Shared handles the manager keeps a second reference to.
pub(super) struct ActorParts {
    pub config: ConnectionConfig,
    pub transport: Arc<dyn Transport>,
    pub tokens: Arc<dyn TokenProvider>,
    pub state: watch::Sender<ConnectionState>,
    pub attempts: Arc<AtomicU32>,
    pub messages: ListenerRegistry<WsMessage>,
    pub state_listeners: ListenerRegistry<ConnectionState>,
}

impl Actor {
    pub(super) fn new(parts: ActorParts, commands: mpsc::Receiver<Command>) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            config: parts.config,
            transport: parts.transport,
            tokens: parts.tokens,
            state: parts.state,
            attempts: parts.attempts,
            messages: parts.messages,
            state_listeners: parts.state_listeners,
            commands,
            events_tx,
            events,
            url: None,
            generation: 0,
            wiring: Vec::new(),
            waiter: None,
            pending_connect: None,
            pending_auth: None,
            keepalive: None,
            reconnect_timer: None,
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some((generation, event)) = self.events.recv() => {
                    self.handle_event(generation, event).await;
                }
                result = poll_slot(&mut self.pending_connect) => {
                    self.pending_connect = None;
                    self.handle_connect_result(result).await;
                }
                token = poll_slot(&mut self.pending_auth) => {
                    self.pending_auth = None;
                    self.authenticate(token).await;
                }
                () = next_tick(&mut self.keepalive) => self.send_ping().await,
                () = poll_timer(&mut self.reconnect_timer) => {
                    self.reconnect_timer = None;
                    self.reconnect();
                }
            }
        }

        debug!("Connection handle dropped, stopping actor");
        self.reconnect_timer = None;
        self.retire_attempt().await;
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Publish a transition. Re-entering the current state is not a
    /// transition and notifies nobody.
    fn set_state(&self, next: ConnectionState) {
        let previous = self.current_state();
        if previous == next {
            return;
        }
        debug!(from = %previous, to = %next, "Connection state change");
        self.state.send_replace(next);
        self.state_listeners.emit(&next);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { url, respond_to } => self.connect(url, respond_to).await,
            Command::Disconnect { respond_to } => {
                self.disconnect().await;
                let _ = respond_to.send(());
            }
            Command::Send { frame, respond_to } => {
                let _ = respond_to.send(self.send(frame).await);
            }
        }
    }

    async fn connect(&mut self, url: String, respond_to: oneshot::Sender<Result<(), LinkError>>) {
        if let Some(superseded) = self.waiter.take() {
            let _ = superseded.send(Err(LinkError::Cancelled));
        }

        // Rebinding tears the previous attempt down without announcing
        // Disconnected; the next state is Connecting either way.
        self.reconnect_timer = None;
        self.retire_attempt().await;
        self.attempts.store(0, Ordering::SeqCst);

        info!(url = %url, "Connecting");
        self.url = Some(url);
        self.waiter = Some(respond_to);
        self.set_state(ConnectionState::Connecting);
        self.begin_attempt();
    }

    async fn disconnect(&mut self) {
        self.reconnect_timer = None;
        self.retire_attempt().await;
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(Err(LinkError::Cancelled));
        }
        if let Some(url) = self.url.take() {
            info!(url = %url, "Disconnected");
        }
        self.set_state(ConnectionState::Disconnected);
        self.attempts.store(0, Ordering::SeqCst);
    }

    async fn send(&mut self, frame: String) -> Result<(), LinkError> {
        if self.current_state() != ConnectionState::Connected || !self.transport.is_connected() {
            return Err(LinkError::NotConnected);
        }
        self.transport.send(frame).await.map_err(LinkError::from)
    }

    /// Wire the transport for a fresh attempt and start connecting.
    fn begin_attempt(&mut self) {
        let Some(url) = self.url.clone() else {
            return;
        };

        self.generation += 1;
        self.wiring = self.wire(self.generation);

        let transport = self.transport.clone();
        self.pending_connect = Some(Box::pin(async move { transport.connect(&url).await }));
    }

    fn wire(&self, generation: u64) -> Vec<Subscription> {
        let open = self.events_tx.clone();
        let message = self.events_tx.clone();
        let close = self.events_tx.clone();
        let error = self.events_tx.clone();
        vec![
            self.transport.on_open(Arc::new(move |_: &()| {
                let _ = open.send((generation, LinkEvent::Open));
            })),
            self.transport.on_message(Arc::new(move |frame: &String| {
                let _ = message.send((generation, LinkEvent::Message(frame.clone())));
            })),
            self.transport.on_close(Arc::new(move |event: &CloseEvent| {
                let _ = close.send((generation, LinkEvent::Close(event.clone())));
            })),
            self.transport.on_error(Arc::new(move |err: &TransportError| {
                let _ = error.send((generation, LinkEvent::Error(err.clone())));
            })),
        ]
    }

    /// Tear down whatever the current attempt left behind and make every
    /// event it may still produce stale.
    async fn retire_attempt(&mut self) {
        self.generation += 1;
        self.wiring.clear();
        self.pending_connect = None;
        self.leave_connected();
        self.transport.disconnect().await;
    }

    /// Stop everything that only runs while `Connected`.
    fn leave_connected(&mut self) {
        self.keepalive = None;
        self.pending_auth = None;
    }

    async fn handle_connect_result(&mut self, result: Result<(), TransportError>) {
        match result {
            Ok(()) => self.opened(),
            Err(err) => self.attempt_failed(err).await,
        }
    }

    async fn handle_event(&mut self, generation: u64, event: LinkEvent) {
        if generation != self.generation {
            debug!(generation, current = self.generation, "Discarding stale transport event");
            return;
        }

        match (self.current_state(), event) {
            (ConnectionState::Connecting, LinkEvent::Open) => self.opened(),
            (_, LinkEvent::Message(frame)) => self.deliver(&frame),
            (ConnectionState::Connected, LinkEvent::Close(close)) => self.closed(close).await,
            (ConnectionState::Connected, LinkEvent::Error(err)) => {
                warn!(error = %err, "Transport error while connected");
                self.retire_attempt().await;
                self.set_state(ConnectionState::Error);
                self.schedule_reconnect();
            }
            (ConnectionState::Connecting, LinkEvent::Error(err)) => {
                self.attempt_failed(err).await;
            }
            (ConnectionState::Connecting, LinkEvent::Close(close)) => {
                let reason = format!("closed before open ({})", close.code);
                self.attempt_failed(TransportError::Connect(reason)).await;
            }
            (state, _) => debug!(state = %state, "Ignoring transport event"),
        }
    }

    fn opened(&mut self) {
        if self.current_state() != ConnectionState::Connecting {
            return;
        }
        self.pending_connect = None;
        self.attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);

        let period = self.config.keepalive_interval.min(MAX_KEEPALIVE_INTERVAL);
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.keepalive = Some(keepalive);

        let tokens = self.tokens.clone();
        self.pending_auth = Some(Box::pin(async move { tokens.token().await }));

        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(Ok(()));
        }
    }

    async fn attempt_failed(&mut self, err: TransportError) {
        warn!(
            url = self.url.as_deref().unwrap_or_default(),
            error = %err,
            "Connect attempt failed"
        );
        self.retire_attempt().await;
        self.set_state(ConnectionState::Error);
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(Err(err.into()));
        }
        self.schedule_reconnect();
    }

    async fn closed(&mut self, close: CloseEvent) {
        self.retire_attempt().await;
        if close.code == NORMAL_CLOSURE {
            info!(reason = %close.reason, "Connection closed normally");
            self.set_state(ConnectionState::Disconnected);
        } else {
            warn!(code = close.code, reason = %close.reason, "Connection lost");
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        let made = self.attempts.load(Ordering::SeqCst);
        if !self.config.reconnect.allows(made) {
            warn!(attempts = made, "Reconnect attempts exhausted, giving up");
            self.set_state(ConnectionState::Error);
            return;
        }

        let attempt = made + 1;
        self.attempts.store(attempt, Ordering::SeqCst);
        let delay = self.config.reconnect.delay_for(attempt);
        info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.set_state(ConnectionState::Reconnecting);
        self.reconnect_timer = Some(Box::pin(tokio::time::sleep(delay)));
    }

    fn reconnect(&mut self) {
        if self.url.is_none() {
            return;
        }
        debug!(attempt = self.attempts.load(Ordering::SeqCst), "Reconnecting");
        self.set_state(ConnectionState::Connecting);
        self.begin_attempt();
    }

    fn deliver(&self, frame: &str) {
        match WsMessage::from_json(frame) {
            Ok(message) => self.messages.emit(&message),
            Err(e) => warn!(error = %e, len = frame.len(), "Dropping malformed frame"),
        }
    }

    async fn authenticate(&mut self, token: Option<String>) {
        let Some(token) = token else {
            debug!("No access token, continuing unauthenticated");
            return;
        };
        if self.current_state() != ConnectionState::Connected {
            return;
        }
        self.send_control(WsMessage::authenticate(token)).await;
    }

    async fn send_ping(&mut self) {
        if self.current_state() == ConnectionState::Connected {
            self.send_control(WsMessage::Ping).await;
        }
    }

    /// Fire-and-forget frames the actor originates itself.
    async fn send_control(&mut self, message: WsMessage) {
        let kind = message.kind();
        let frame = match message.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind, error = %e, "Failed to encode frame");
                return;
            }
        };
        if let Err(e) = self.transport.send(frame).await {
            warn!(kind, error = %e, "Failed to send frame");
        }
    }
}

/// Resolve an optional future, staying pending while the slot is empty.
async fn poll_slot<T>(slot: &mut Option<BoxFuture<'static, T>>) -> T {
    match slot.as_mut() {
        Some(future) => future.await,
        None => pending().await,
    }
}

async fn next_tick(slot: &mut Option<Interval>) {
    match slot.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn poll_timer(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

