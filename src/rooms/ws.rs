use std::sync::Arc;

use axum::{
    Json, debug_handler,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    response::IntoResponse,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use super::ChatId;
use super::client::Client;
use super::hub::HubHandle;
use super::msg::StoredMessage;
use crate::error::{ChatError, ChatResult};
use crate::store::MessageStore;
use crate::tasks::{ReadMessages, Task, TaskDispatcher};
use crate::{AppResult, AppState};

/// Sent to a connection that arrives when both seats are taken.
pub const CHAT_FULL_NOTICE: &str = "chat is full";

#[debug_handler(state = crate::AppState)]
pub async fn chat_ws(
    Path((chat_id, username)): Path<(ChatId, String)>,
    State(state): State<AppState>,

    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_connection(socket, state, chat_id, username))
}

async fn serve_connection(socket: WebSocket, state: AppState, chat_id: ChatId, identity: String) {
    let (client, registration) = Client::new(
        &state.hub,
        chat_id,
        identity.clone(),
        state.config.outbound_queue,
    );
    let conn_id = client.conn_id();

    match state.hub.register(registration).await {
        Ok(()) => {}
        Err(ChatError::CapacityExceeded { .. }) => {
            reject_full(socket).await;
            return;
        }
        Err(err) => {
            error!(chat_id, client = %identity, "Failed to register client: {}", err);
            return;
        }
    }

    let (sink, stream) = socket.split();
    let (read_pump, write_pump) = client.into_pumps(state);
    let mut writer = tokio::spawn(write_pump.run(sink));
    let mut reader = tokio::spawn(read_pump.run(stream));

    tokio::select! {
        result = &mut reader => {
            log_exit("read", chat_id, &identity, result);
            // Unregistering closed the queue, so the writer finishes on its own.
            log_exit("write", chat_id, &identity, writer.await);
        }
        result = &mut writer => {
            reader.abort();
            log_exit("write", chat_id, &identity, result);
        }
    }
    debug!(chat_id, client = %identity, %conn_id, "Connection closed");
}

/// Accept the transport, explain, and hang up. No client state is created.
async fn reject_full(mut socket: WebSocket) {
    let _ = socket.send(Message::Text(CHAT_FULL_NOTICE.into())).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: CHAT_FULL_NOTICE.into(),
        })))
        .await;
}

fn log_exit(
    pump: &str,
    chat_id: ChatId,
    identity: &str,
    result: Result<ChatResult<()>, JoinError>,
) {
    match result {
        Ok(Ok(())) => debug!(chat_id, client = %identity, pump, "Pump finished"),
        Ok(Err(err)) => info!(chat_id, client = %identity, pump, "Pump stopped: {}", err),
        Err(err) if err.is_cancelled() => {}
        Err(err) => warn!(chat_id, client = %identity, pump, "Pump panicked: {}", err),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Presence {
    pub chat_id: ChatId,
    pub members: Vec<String>,
}

#[debug_handler(state = crate::AppState)]
pub async fn presence(
    Path(chat_id): Path<ChatId>,
    State(hub): State<HubHandle>,
) -> AppResult<Json<Presence>> {
    let members = hub.members(chat_id).await?;
    Ok(Json(Presence { chat_id, members }))
}

#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub chat_id: ChatId,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub content: String,
    pub is_read: bool,
    pub created_at: String,
}

impl TryFrom<StoredMessage> for HistoryEntry {
    type Error = time::error::Format;

    fn try_from(message: StoredMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            created_at: message.created_at.format(&Rfc3339)?,
            id: message.id,
            chat_id: message.chat_id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            content: message.content,
            is_read: message.is_read,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    /// Participant opening the history; their peer's messages become read.
    pub reader_id: Option<i64>,
}

#[debug_handler(state = crate::AppState)]
pub async fn history(
    Path(chat_id): Path<ChatId>,
    Query(query): Query<HistoryQuery>,
    State(store): State<Arc<dyn MessageStore>>,
    State(tasks): State<Arc<dyn TaskDispatcher>>,
) -> AppResult<Json<Vec<HistoryEntry>>> {
    let messages = store.messages(chat_id).await?;

    if let (Some(reader_id), Some(last)) = (query.reader_id, messages.last()) {
        if last.sender_id != reader_id {
            let task = Task::ReadMessages(ReadMessages {
                chat_id,
                user_id: last.sender_id,
            });
            if let Err(err) = tasks.enqueue(task) {
                warn!(chat_id, reader_id, "Failed to enqueue read receipt: {}", err);
            }
        }
    }

    let entries = messages
        .into_iter()
        .map(HistoryEntry::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(entries))
}
