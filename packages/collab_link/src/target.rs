//! Conversation and session endpoints.

use std::fmt;

use crate::error::LinkError;

/// A validated WebSocket base URL with no trailing slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseUrl(String);

impl BaseUrl {
    pub fn parse(raw: &str) -> Result<Self, LinkError> {
        let trimmed = raw.trim().trim_end_matches('/');
        let rest = trimmed
            .strip_prefix("wss://")
            .or_else(|| trimmed.strip_prefix("ws://"))
            .ok_or_else(|| LinkError::InvalidUrl(format!("{raw}: expected ws:// or wss://")))?;
        if rest.is_empty() {
            return Err(LinkError::InvalidUrl(format!("{raw}: missing host")));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn url_for(&self, target: &Target) -> String {
        format!("{}{}", self.0, target.path())
    }
}

impl fmt::Display for BaseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The resource a connection is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Conversation(String),
    Session(String),
}

impl Target {
    pub fn conversation(id: impl Into<String>) -> Result<Self, LinkError> {
        Ok(Self::Conversation(non_empty(id.into(), "conversation")?))
    }

    pub fn session(id: impl Into<String>) -> Result<Self, LinkError> {
        Ok(Self::Session(non_empty(id.into(), "session")?))
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Conversation(id) | Self::Session(id) => id,
        }
    }

    pub fn path(&self) -> String {
        match self {
            Self::Conversation(id) => format!("/ws/conversations/{id}"),
            Self::Session(id) => format!("/ws/sessions/{id}"),
        }
    }
}

fn non_empty(id: String, kind: &str) -> Result<String, LinkError> {
    if id.trim().is_empty() {
        return Err(LinkError::InvalidTarget(format!("empty {kind} id")));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slashes_are_stripped() {
        let base = BaseUrl::parse("wss://host//").unwrap();
        assert_eq!(base.as_str(), "wss://host");
        assert_eq!(
            base.url_for(&Target::conversation("abc123").unwrap()),
            "wss://host/ws/conversations/abc123"
        );
        assert_eq!(
            base.url_for(&Target::session("s-9").unwrap()),
            "wss://host/ws/sessions/s-9"
        );
    }

    #[test]
    fn base_path_is_kept() {
        let base = BaseUrl::parse("ws://127.0.0.1:3000/api/").unwrap();
        assert_eq!(
            base.url_for(&Target::session("x").unwrap()),
            "ws://127.0.0.1:3000/api/ws/sessions/x"
        );
    }

    #[test]
    fn rejects_non_websocket_schemes() {
        assert!(matches!(
            BaseUrl::parse("https://host"),
            Err(LinkError::InvalidUrl(_))
        ));
        assert!(matches!(BaseUrl::parse("wss://"), Err(LinkError::InvalidUrl(_))));
    }

    #[test]
    fn rejects_empty_ids() {
        assert!(matches!(
            Target::conversation(""),
            Err(LinkError::InvalidTarget(_))
        ));
        assert!(matches!(Target::session("  "), Err(LinkError::InvalidTarget(_))));
    }
}
