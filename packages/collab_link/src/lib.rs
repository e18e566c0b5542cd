//! Collab Link - real-time connection manager for conversations and
//! collaborative sessions.
//!
//! One [`ConnectionManager`] owns one logical connection: it connects a
//! [`Transport`], authenticates with the current access token, keeps the
//! link alive with periodic pings and reconnects with exponential backoff
//! when the link drops. [`RealtimeClient`] adds conversation/session URLs
//! and the outbound envelope builders on top.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use collab_link::{BaseUrl, ConnectionConfig, RealtimeClient, StaticToken, WebSocketTransport};
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = RealtimeClient::new(
//!         BaseUrl::parse("wss://collab.example.com").unwrap(),
//!         ConnectionConfig::default(),
//!         Arc::new(WebSocketTransport::new()),
//!         Arc::new(StaticToken::new("access-token")),
//!     );
//!
//!     let _messages = client.add_message_listener(|msg| println!("{}", msg.kind()));
//!     client.connect_to_conversation("abc123").await.unwrap();
//!     client.send_user_message("hello").await.unwrap();
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod feed;
pub mod listeners;
pub mod protocol;
pub mod target;
pub mod token;
pub mod transport;

#[cfg(test)]
mod testing;

pub use backoff::ReconnectPolicy;
pub use client::RealtimeClient;
pub use config::{ConnectionConfig, LinkFileConfig, TransportKind, load_config};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{LinkError, TransportError};
pub use feed::{FeedSnapshot, SessionFeed, TranscriptEntry};
pub use listeners::{Listener, ListenerRegistry, Subscription};
pub use protocol::{Position, WsMessage};
pub use target::{BaseUrl, Target};
pub use token::{SharedToken, StaticToken, TokenProvider};
pub use transport::{
    CloseEvent, RelayEndpoint, RelayHost, RelayPort, RelayTransport, Transport,
    WebSocketTransport, relay_channel,
};
