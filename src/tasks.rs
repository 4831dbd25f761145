//! Out-of-band notification pipeline.
//!
//! Tasks are fire-and-forget: the chat path enqueues and moves on, and a
//! worker applies them against the message store in the background.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::rooms::ChatId;
use crate::store::{MessageStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Task {
    /// Mark everything `user_id` sent in `chat_id` as read.
    #[serde(rename = "messages:reader")]
    ReadMessages(ReadMessages),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadMessages {
    pub chat_id: ChatId,
    /// Sender of the messages being marked read.
    pub user_id: i64,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("task queue is full")]
    QueueFull,

    #[error("task queue is closed")]
    Closed,
}

pub trait TaskDispatcher: Send + Sync {
    fn enqueue(&self, task: Task) -> Result<(), DispatchError>;
}

/// In-process dispatcher backed by a bounded channel.
#[derive(Debug, Clone)]
pub struct QueueDispatcher {
    tx: mpsc::Sender<Task>,
}

impl QueueDispatcher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Task>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl TaskDispatcher for QueueDispatcher {
    fn enqueue(&self, task: Task) -> Result<(), DispatchError> {
        self.tx.try_send(task).map_err(|err| match err {
            TrySendError::Full(_) => DispatchError::QueueFull,
            TrySendError::Closed(_) => DispatchError::Closed,
        })
    }
}

/// Drain the queue until every dispatcher is dropped.
pub async fn run_worker(mut queue: mpsc::Receiver<Task>, store: Arc<dyn MessageStore>) {
    info!("task worker started");
    while let Some(task) = queue.recv().await {
        if let Err(err) = handle(&task, store.as_ref()).await {
            warn!(?task, "Task failed: {}", err);
        }
    }
    info!("task worker stopped");
}

async fn handle(task: &Task, store: &dyn MessageStore) -> Result<(), StoreError> {
    match task {
        Task::ReadMessages(ReadMessages { chat_id, user_id }) => {
            let marked = store.mark_read(*chat_id, *user_id).await?;
            debug!(chat_id, user_id, marked, "Marked messages read");
        }
    }
    Ok(())
}
