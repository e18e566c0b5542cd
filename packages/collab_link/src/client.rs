//! The view-model facing client: target URLs plus envelope builders over a
//! [`ConnectionManager`].

use std::sync::Arc;
use tokio::sync::watch;

use crate::config::{ConnectionConfig, LinkFileConfig};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::LinkError;
use crate::listeners::Subscription;
use crate::protocol::{Position, WsMessage};
use crate::target::{BaseUrl, Target};
use crate::token::TokenProvider;
use crate::transport::{RelayPort, Transport};

pub struct RealtimeClient {
    base: BaseUrl,
    manager: ConnectionManager,
}

impl RealtimeClient {
    pub fn new(
        base: BaseUrl,
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            base,
            manager: ConnectionManager::new(config, transport, tokens),
        }
    }

    /// Build from file configuration. `relay` is required when the
    /// configured transport is `relay` and ignored otherwise.
    pub fn from_config(
        fc: &LinkFileConfig,
        tokens: Arc<dyn TokenProvider>,
        relay: Option<RelayPort>,
    ) -> Result<Self, LinkError> {
        let base = BaseUrl::parse(&fc.link.base_url)?;
        let transport = fc.link.transport.build(relay)?;
        Ok(Self::new(
            base,
            ConnectionConfig::from_file(fc),
            transport,
            tokens,
        ))
    }

    pub fn base_url(&self) -> &BaseUrl {
        &self.base
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub async fn connect_to(&self, target: &Target) -> Result<(), LinkError> {
        self.manager.connect(&self.base.url_for(target)).await
    }

    pub async fn connect_to_conversation(&self, conversation_id: &str) -> Result<(), LinkError> {
        self.connect_to(&Target::conversation(conversation_id)?)
            .await
    }

    pub async fn connect_to_session(&self, session_id: &str) -> Result<(), LinkError> {
        self.connect_to(&Target::session(session_id)?).await
    }

    pub async fn disconnect(&self) -> Result<(), LinkError> {
        self.manager.disconnect().await
    }

    pub async fn send_message(&self, message: &WsMessage) -> Result<(), LinkError> {
        self.manager.send_message(message).await
    }

    pub async fn send_user_message(&self, content: &str) -> Result<(), LinkError> {
        self.send_message(&WsMessage::user_message(content)).await
    }

    /// Post to the session side-chat, optionally as a reply.
    pub async fn send_chat_message(
        &self,
        content: &str,
        parent_id: Option<&str>,
    ) -> Result<(), LinkError> {
        self.send_message(&WsMessage::chat_message(
            content,
            parent_id.map(str::to_string),
        ))
        .await
    }

    pub async fn send_cursor_position(&self, position: Position) -> Result<(), LinkError> {
        self.send_message(&WsMessage::cursor_position(position))
            .await
    }

    pub fn add_message_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&WsMessage) + Send + Sync + 'static,
    {
        self.manager.add_message_listener(listener)
    }

    pub fn add_state_change_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.manager.add_state_change_listener(listener)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.connection_state()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.manager.reconnect_attempts()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.watch_state()
    }
}
