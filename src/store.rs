//! Durable message storage.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use thiserror::Error;
use tracing::debug;

use crate::rooms::ChatId;
use crate::rooms::msg::{NewMessage, StoredMessage};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Append-only log of chat messages, keyed by chat.
///
/// The only mutation besides `append` is flipping read flags, which belongs to
/// the notification worker, never to the hub.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, message: &NewMessage) -> Result<StoredMessage, StoreError>;

    /// Most recently appended message in a chat.
    async fn last_message(&self, chat_id: ChatId) -> Result<Option<StoredMessage>, StoreError>;

    /// Mark every unread message `sender_id` sent in `chat_id` as read.
    /// Returns the number of messages changed.
    async fn mark_read(&self, chat_id: ChatId, sender_id: i64) -> Result<u64, StoreError>;

    /// Full history of a chat, oldest first.
    async fn messages(&self, chat_id: ChatId) -> Result<Vec<StoredMessage>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database, for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // One connection that never idles out, or the database vanishes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn append(&self, message: &NewMessage) -> Result<StoredMessage, StoreError> {
        let stored = sqlx::query_as::<_, StoredMessage>(
            r#"
            INSERT INTO messages (chat_id, sender_id, receiver_id, content, is_read, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id, chat_id, sender_id, receiver_id, content, is_read, created_at
            "#,
        )
        .bind(message.chat_id)
        .bind(message.sender_id)
        .bind(message.receiver_id)
        .bind(&message.content)
        .bind(message.is_read)
        .bind(message.created_at)
        .fetch_one(&self.pool)
        .await?;

        debug!(chat_id = stored.chat_id, message_id = stored.id, "Message stored");
        Ok(stored)
    }

    async fn last_message(&self, chat_id: ChatId) -> Result<Option<StoredMessage>, StoreError> {
        let last = sqlx::query_as(
            r#"
            SELECT id, chat_id, sender_id, receiver_id, content, is_read, created_at
            FROM messages
            WHERE chat_id = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(last)
    }

    async fn mark_read(&self, chat_id: ChatId, sender_id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE messages SET is_read = 1 WHERE chat_id = ? AND sender_id = ? AND is_read = 0",
        )
        .bind(chat_id)
        .bind(sender_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn messages(&self, chat_id: ChatId) -> Result<Vec<StoredMessage>, StoreError> {
        let messages = sqlx::query_as(
            r#"
            SELECT id, chat_id, sender_id, receiver_id, content, is_read, created_at
            FROM messages
            WHERE chat_id = ?
            ORDER BY id
            "#,
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }
}
