pub mod client;
pub mod hub;
pub mod msg;
mod ws;

use axum::{Router, routing::get};

use crate::AppState;

/// Conversation id. Identifies a room and keys stored messages.
pub type ChatId = i64;

pub use ws::{CHAT_FULL_NOTICE, Presence};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws/{chat_id}/{username}", get(ws::chat_ws))
        .route("/chats/{chat_id}/presence", get(ws::presence))
        .route("/chats/{chat_id}/messages", get(ws::history))
}
