//! Access-token seam owned by the authentication subsystem.

use async_trait::async_trait;
use std::sync::RwLock;

/// Supplies the current access token for the `authenticate` frame.
///
/// Called once on every successful open. `None` means the connection
/// proceeds unauthenticated.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Option<String>;
}

/// A fixed token, or none at all.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl From<Option<String>> for StaticToken {
    fn from(token: Option<String>) -> Self {
        Self(token)
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// A token the auth layer replaces after each refresh. The next open
/// authenticates with whatever value is current at that moment.
#[derive(Debug, Default)]
pub struct SharedToken {
    current: RwLock<Option<String>>,
}

impl SharedToken {
    pub fn new(token: Option<String>) -> Self {
        Self {
            current: RwLock::new(token),
        }
    }

    pub fn set(&self, token: Option<String>) {
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token;
    }
}

#[async_trait]
impl TokenProvider for SharedToken {
    async fn token(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
