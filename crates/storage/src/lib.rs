#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use parley_core::RpcLog;

pub mod postgres;

pub use postgres::{insert_rpc_log, PostgresStorage};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("chat not found")]
    ChatNotFound,
    #[error("block relationship not found")]
    BlockNotFound,
    #[error("corrupt retry queue entry: {0}")]
    CorruptRetryEntry(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("migration error: {0}")]
    Migration(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(error: sqlx::Error) -> Self {
        StorageError::Database(error.to_string())
    }
}

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// One retry-queue entry, keyed by the envelope signature. The envelope is
/// stored whole so a later sweep can replay it without consulting `rpc_log`
/// (the log row may not exist when the original apply failed mid-transaction).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    pub sig: String,
    pub envelope: RpcLog,
    pub error_text: String,
    pub error_count: i32,
    pub last_attempt: DateTime<Utc>,
}

/// Condensed failure row for operational inspection (status endpoint).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FailedRpc {
    pub sig: String,
    pub error_text: String,
    pub error_count: i32,
    pub last_attempt: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ChatRow {
    pub chat_id: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub last_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ChatMemberRow {
    pub chat_id: String,
    pub user_id: i32,
    pub invited_by_user_id: i32,
    pub invite_code: String,
    pub created_at: DateTime<Utc>,
    pub cleared_history_at: Option<DateTime<Utc>>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub unread_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ChatMessageRow {
    pub message_id: String,
    pub chat_id: String,
    pub user_id: i32,
    pub created_at: DateTime<Utc>,
    pub ciphertext: String,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ReactionRow {
    pub user_id: i32,
    pub message_id: String,
    pub reaction: String,
    pub updated_at: DateTime<Utc>,
}

/// Connects with `DATABASE_URL` and applies migrations; the standalone
/// migration binary's entry point.
pub async fn migrate() -> Result<(), StorageError> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| StorageError::Migration("DATABASE_URL must be set".to_string()))?;
    let pool = sqlx::PgPool::connect(&database_url)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
    migrate_with_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate_with_pool(pool: &sqlx::PgPool) -> Result<(), StorageError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|error| StorageError::Migration(error.to_string()))?;
    tracing::debug!("database migrations applied");
    Ok(())
}
