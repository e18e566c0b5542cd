//! Wire protocol types.
//!
//! Every frame is a JSON object tagged by `type`. Outbound envelopes are
//! built by the client; inbound ones carry the payload shapes broadcast by
//! the conversation and session streaming endpoints.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Graceful close. No reconnect follows it.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close frame without a status code.
pub const NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// A point on the shared canvas or editor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Envelope for every frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    Authenticate {
        token: String,
    },

    /// A message addressed to the conversation's agent.
    UserMessage {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
    },

    /// Agent output. The payload is forwarded verbatim.
    AiMessage {
        #[serde(default)]
        message: Value,
    },

    /// Side-chat between session participants. Outbound frames carry
    /// `content`/`parent_id`; the server broadcasts the stored `message`.
    ChatMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<ChatEntry>,
    },

    CursorPosition {
        position: Position,
        /// Set by the server on broadcast.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },

    StatusUpdate {
        #[serde(flatten)]
        payload: Map<String, Value>,
    },

    ParticipantJoined {
        participant: Participant,
    },

    ParticipantLeft {
        user_id: String,
    },

    Ping,

    Pong,

    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl WsMessage {
    pub fn authenticate(token: impl Into<String>) -> Self {
        Self::Authenticate {
            token: token.into(),
        }
    }

    pub fn user_message(content: impl Into<String>) -> Self {
        Self::UserMessage {
            content: content.into(),
            parent_id: None,
        }
    }

    pub fn chat_message(content: impl Into<String>, parent_id: Option<String>) -> Self {
        Self::ChatMessage {
            content: Some(content.into()),
            parent_id,
            message: None,
        }
    }

    pub fn cursor_position(position: Position) -> Self {
        Self::CursorPosition {
            position,
            user_id: None,
        }
    }

    /// The `type` discriminant as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::UserMessage { .. } => "user_message",
            Self::AiMessage { .. } => "ai_message",
            Self::ChatMessage { .. } => "chat_message",
            Self::CursorPosition { .. } => "cursor_position",
            Self::StatusUpdate { .. } => "status_update",
            Self::ParticipantJoined { .. } => "participant_joined",
            Self::ParticipantLeft { .. } => "participant_left",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// A stored side-chat message as broadcast by the session stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub created_at: String,
    #[serde(default)]
    pub edited_at: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub created_at: String,
    #[serde(default)]
    pub edited_at: Option<String>,
    #[serde(default)]
    pub start_index: Option<u64>,
    #[serde(default)]
    pub end_index: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Owner,
    Collaborator,
    Viewer,
    Moderator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub user_id: String,
    pub role: ParticipantRole,
    #[serde(default)]
    pub joined_at: Option<String>,
    #[serde(default)]
    pub last_active_at: Option<String>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub settings: ParticipantSettings,
}

impl Participant {
    /// Name to show for this participant.
    pub fn display_name(&self) -> &str {
        self.settings
            .display_name
            .as_deref()
            .unwrap_or(&self.user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantSettings {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
    #[serde(default = "default_true")]
    pub show_presence: bool,
    #[serde(default)]
    pub muted_chat: bool,
}

impl Default for ParticipantSettings {
    fn default() -> Self {
        Self {
            display_name: None,
            color: None,
            notifications_enabled: true,
            show_presence: true,
            muted_chat: false,
        }
    }
}

fn default_true() -> bool {
    true
}
