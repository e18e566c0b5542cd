//! Folding the inbound stream into view state.
//!
//! A [`SessionFeed`] is what a chat or participant view holds: it
//! subscribes to a manager's two registries and keeps a [`FeedSnapshot`]
//! current. Rendering the snapshot is the view's business.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::connection::{ConnectionManager, ConnectionState};
use crate::listeners::Subscription;
use crate::protocol::{ChatEntry, Participant, Position, WsMessage};

/// One line of the conversation transcript.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEntry {
    User {
        content: String,
        parent_id: Option<String>,
    },
    Ai(Value),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedSnapshot {
    pub state: ConnectionState,
    pub transcript: Vec<TranscriptEntry>,
    /// Side-chat in arrival order, one entry per message id.
    pub chat: Vec<ChatEntry>,
    /// Keyed by user id.
    pub participants: BTreeMap<String, Participant>,
    /// Keyed by user id.
    pub cursors: BTreeMap<String, Position>,
    /// Fields of every `status_update` merged, latest value wins.
    pub status: Map<String, Value>,
    pub last_error: Option<String>,
}

impl FeedSnapshot {
    pub fn apply(&mut self, message: &WsMessage) {
        match message {
            WsMessage::UserMessage { content, parent_id } => {
                self.transcript.push(TranscriptEntry::User {
                    content: content.clone(),
                    parent_id: parent_id.clone(),
                });
            }
            WsMessage::AiMessage { message } => {
                self.transcript.push(TranscriptEntry::Ai(message.clone()));
            }
            WsMessage::ChatMessage {
                message: Some(entry),
                ..
            } => self.upsert_chat(entry),
            WsMessage::CursorPosition {
                position,
                user_id: Some(user_id),
            } => {
                self.cursors.insert(user_id.clone(), *position);
            }
            WsMessage::StatusUpdate { payload } => {
                for (key, value) in payload {
                    self.status.insert(key.clone(), value.clone());
                }
            }
            WsMessage::ParticipantJoined { participant } => {
                self.participants
                    .insert(participant.user_id.clone(), participant.clone());
            }
            WsMessage::ParticipantLeft { user_id } => {
                self.participants.remove(user_id);
                self.cursors.remove(user_id);
            }
            WsMessage::Error { message, code } => {
                self.last_error = Some(
                    message
                        .clone()
                        .or_else(|| code.clone())
                        .unwrap_or_else(|| "unknown error".to_string()),
                );
            }
            _ => {}
        }
    }

    /// Every (re)connect replays recent history, so a known id replaces
    /// the stored entry in place.
    fn upsert_chat(&mut self, entry: &ChatEntry) {
        match self.chat.iter_mut().find(|existing| existing.id == entry.id) {
            Some(existing) => *existing = entry.clone(),
            None => self.chat.push(entry.clone()),
        }
    }

    pub fn replies_to(&self, parent_id: &str) -> impl Iterator<Item = &ChatEntry> {
        self.chat
            .iter()
            .filter(move |entry| entry.parent_id.as_deref() == Some(parent_id))
    }
}

fn lock(snapshot: &Mutex<FeedSnapshot>) -> MutexGuard<'_, FeedSnapshot> {
    snapshot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Live view state bound to one connection manager.
pub struct SessionFeed {
    snapshot: Arc<Mutex<FeedSnapshot>>,
    _subscriptions: [Subscription; 2],
}

impl SessionFeed {
    pub fn attach(manager: &ConnectionManager) -> Self {
        let snapshot = Arc::new(Mutex::new(FeedSnapshot {
            state: manager.connection_state(),
            ..FeedSnapshot::default()
        }));

        let on_message = snapshot.clone();
        let on_state = snapshot.clone();
        let subscriptions = [
            manager.add_message_listener(move |message| lock(&on_message).apply(message)),
            manager.add_state_change_listener(move |state| {
                let mut snapshot = lock(&on_state);
                snapshot.state = *state;
                if *state == ConnectionState::Connected {
                    snapshot.last_error = None;
                }
            }),
        ];

        Self {
            snapshot,
            _subscriptions: subscriptions,
        }
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        lock(&self.snapshot).clone()
    }

    /// Stop following the manager. Equivalent to dropping the feed.
    pub fn detach(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::protocol::ParticipantRole;
    use crate::testing::MockTransport;
    use crate::token::StaticToken;
    use std::time::Duration;

    fn chat(id: &str, content: &str, parent_id: Option<&str>) -> WsMessage {
        WsMessage::from_json(
            &serde_json::json!({
                "type": "chat_message",
                "message": {
                    "id": id,
                    "user_id": "u-1",
                    "content": content,
                    "created_at": "2024-05-01T10:00:00Z",
                    "parent_id": parent_id,
                }
            })
            .to_string(),
        )
        .unwrap()
    }

    fn joined(user_id: &str) -> WsMessage {
        WsMessage::ParticipantJoined {
            participant: Participant {
                id: format!("p-{user_id}"),
                user_id: user_id.into(),
                role: ParticipantRole::Collaborator,
                joined_at: None,
                last_active_at: None,
                is_online: true,
                settings: Default::default(),
            },
        }
    }

    #[test]
    fn replayed_chat_is_deduplicated() {
        let mut feed = FeedSnapshot::default();
        feed.apply(&chat("m-1", "first", None));
        feed.apply(&chat("m-2", "reply", Some("m-1")));
        // Reconnect replay, with an edit to m-1
        feed.apply(&chat("m-1", "first (edited)", None));
        feed.apply(&chat("m-2", "reply", Some("m-1")));

        let contents: Vec<&str> = feed.chat.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["first (edited)", "reply"]);
        assert_eq!(feed.replies_to("m-1").count(), 1);
    }

    #[test]
    fn leaving_removes_participant_and_cursor() {
        let mut feed = FeedSnapshot::default();
        feed.apply(&joined("u-1"));
        feed.apply(&joined("u-2"));
        feed.apply(&WsMessage::CursorPosition {
            position: Position { x: 1.0, y: 2.0 },
            user_id: Some("u-2".into()),
        });
        assert_eq!(feed.cursors.len(), 1);

        feed.apply(&WsMessage::ParticipantLeft {
            user_id: "u-2".into(),
        });
        assert_eq!(feed.participants.keys().collect::<Vec<_>>(), vec!["u-1"]);
        assert!(feed.cursors.is_empty());
    }

    #[test]
    fn transcript_status_and_errors() {
        let mut feed = FeedSnapshot::default();
        feed.apply(&WsMessage::user_message("hello"));
        feed.apply(&WsMessage::AiMessage {
            message: serde_json::json!({ "content": "hi there" }),
        });
        feed.apply(&WsMessage::from_json(r#"{"type":"status_update","agent_state":"running"}"#).unwrap());
        feed.apply(&WsMessage::Error {
            message: None,
            code: Some("unauthorized".into()),
        });
        feed.apply(&WsMessage::Pong);

        assert_eq!(feed.transcript.len(), 2);
        assert_eq!(feed.status["agent_state"], "running");
        assert_eq!(feed.last_error.as_deref(), Some("unauthorized"));
    }

    #[tokio::test(start_paused = true)]
    async fn feed_follows_manager_until_detached() {
        let mock = Arc::new(MockTransport::new());
        let manager = ConnectionManager::new(
            ConnectionConfig::default(),
            mock.clone(),
            Arc::new(StaticToken::none()),
        );
        let feed = SessionFeed::attach(&manager);
        assert_eq!(feed.snapshot().state, ConnectionState::Disconnected);

        manager.connect("wss://host/ws/sessions/s1").await.unwrap();
        mock.server_send(&chat("m-1", "hi", None).to_json().unwrap());
        tokio::time::sleep(Duration::from_millis(1)).await;

        let snapshot = feed.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Connected);
        assert_eq!(snapshot.chat.len(), 1);

        manager.disconnect().await.unwrap();
        assert_eq!(feed.snapshot().state, ConnectionState::Disconnected);
        feed.detach();
    }
}
