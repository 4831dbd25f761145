//! Failure modes of a live chat connection.

use thiserror::Error;

use crate::rooms::ChatId;
use crate::store::StoreError;

/// Result type for hub and pump operations.
pub type ChatResult<T> = Result<T, ChatError>;

/// Why a connection was refused or torn down.
///
/// Every variant is terminal for the client it concerns: once a pump sees one
/// of these, the client unregisters and the peer is expected to reconnect.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Transport read or write failed.
    #[error("connection error: {0}")]
    Connection(#[from] axum::Error),

    /// Inbound frame was not a valid chat message.
    #[error("malformed frame: {0}")]
    Protocol(#[from] serde_json::Error),

    /// A frame claimed a different sender than the connection is bound to.
    #[error("frame claims sender {claimed} but connection is bound to {bound}")]
    SenderMismatch { bound: i64, claimed: i64 },

    /// The room already holds two participants.
    #[error("chat {chat_id} is full")]
    CapacityExceeded { chat_id: ChatId },

    /// The message could not be stored, so it was not delivered.
    #[error("failed to persist message: {0}")]
    Persistence(#[from] StoreError),

    /// The hub loop is no longer running.
    #[error("connection hub is closed")]
    HubClosed,
}
