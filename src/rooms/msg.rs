use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::ChatId;
use crate::error::ChatResult;

/// A chat message as it travels over the socket, in both directions.
///
/// `chat_id` is accepted from the client but never trusted: the read pump
/// overwrites it with the room the connection is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFrame {
    #[serde(default)]
    pub chat_id: ChatId,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub content: String,
}

impl ChatFrame {
    /// Parse a data frame. Control frames are the caller's business.
    pub fn decode(message: &Message) -> ChatResult<Self> {
        let frame = match message {
            Message::Text(text) => serde_json::from_str(text.as_str())?,
            other => serde_json::from_slice(&other.clone().into_data())?,
        };
        Ok(frame)
    }

    pub fn encode(&self) -> ChatResult<Message> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }

    /// Bind the frame to the connection's room.
    pub fn stamped(self, chat_id: ChatId) -> Self {
        Self { chat_id, ..self }
    }
}

/// A message about to be appended to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub content: String,
    pub is_read: bool,
    pub created_at: OffsetDateTime,
}

impl NewMessage {
    pub fn from_frame(frame: &ChatFrame, is_read: bool) -> Self {
        Self {
            chat_id: frame.chat_id,
            sender_id: frame.sender_id,
            receiver_id: frame.receiver_id,
            content: frame.content.clone(),
            is_read,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// A persisted message row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StoredMessage {
    pub id: i64,
    pub chat_id: ChatId,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub content: String,
    pub is_read: bool,
    pub created_at: OffsetDateTime,
}
