use chrono::Utc;
use parley_core::RpcLog;
use sqlx::postgres::PgPoolOptions;

use super::PostgresStorage;
use crate::{ChatMemberRow, ChatRow, ReactionRow};

/// Connects to `DATABASE_URL` with a fresh schema per test for full isolation
/// when running in parallel. Tests call this and return early when no
/// database is configured.
pub(crate) async fn test_storage() -> Option<PostgresStorage> {
    let database_url = match std::env::var("DATABASE_URL") {
        Ok(value) => value,
        Err(_) => return None,
    };

    let schema = format!("test_{}", uuid::Uuid::new_v4().simple());
    let mut opts: sqlx::postgres::PgConnectOptions =
        database_url.parse().expect("parse DATABASE_URL");
    opts = opts.options([("search_path", schema.as_str())]);
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect_with(opts)
        .await
        .expect("connect test database");
    sqlx::query(&format!("CREATE SCHEMA \"{schema}\""))
        .execute(&pool)
        .await
        .expect("create test schema");

    crate::migrate_with_pool(&pool)
        .await
        .expect("apply migrations");
    Some(PostgresStorage::from_pool(pool))
}

pub(crate) fn test_envelope(sig: &str, user_id: i32, rpc: &str) -> RpcLog {
    RpcLog {
        relayed_by: "https://node-a.example.com".to_string(),
        relayed_at: Utc::now(),
        applied_at: None,
        from_wallet: format!("0xwallet{user_id}"),
        rpc: rpc.to_string(),
        sig: sig.to_string(),
    }
}

pub(crate) async fn create_user(storage: &PostgresStorage, user_id: i32, wallet: &str) {
    sqlx::query("INSERT INTO users (user_id, wallet) VALUES ($1, lower($2))")
        .bind(user_id)
        .bind(wallet)
        .execute(storage.pool())
        .await
        .expect("create user");
}

pub(crate) async fn create_follow(storage: &PostgresStorage, follower: i32, followee: i32) {
    sqlx::query("INSERT INTO follows (follower_user_id, followee_user_id) VALUES ($1, $2)")
        .bind(follower)
        .bind(followee)
        .execute(storage.pool())
        .await
        .expect("create follow");
}

pub(crate) async fn create_tip(storage: &PostgresStorage, sender: i32, receiver: i32) {
    sqlx::query("INSERT INTO user_tips (sender_user_id, receiver_user_id) VALUES ($1, $2)")
        .bind(sender)
        .bind(receiver)
        .execute(storage.pool())
        .await
        .expect("create tip");
}

pub(crate) async fn count_where(storage: &PostgresStorage, query: &str) -> i64 {
    sqlx::query_scalar(query)
        .fetch_one(storage.pool())
        .await
        .expect("count query")
}

pub(crate) async fn count_where_one(storage: &PostgresStorage, query: &str, bind: &str) -> i64 {
    sqlx::query_scalar(query)
        .bind(bind)
        .fetch_one(storage.pool())
        .await
        .expect("count query")
}

pub(crate) async fn chat_row(storage: &PostgresStorage, chat_id: &str) -> Option<ChatRow> {
    sqlx::query_as("SELECT chat_id, created_at, last_message_at, last_message FROM chat WHERE chat_id = $1")
        .bind(chat_id)
        .fetch_optional(storage.pool())
        .await
        .expect("chat row")
}

pub(crate) async fn member_row(
    storage: &PostgresStorage,
    chat_id: &str,
    user_id: i32,
) -> Option<ChatMemberRow> {
    sqlx::query_as(
        r#"
        SELECT chat_id, user_id, invited_by_user_id, invite_code, created_at,
               cleared_history_at, last_active_at, unread_count
        FROM chat_member
        WHERE chat_id = $1 AND user_id = $2
        "#,
    )
    .bind(chat_id)
    .bind(user_id)
    .fetch_optional(storage.pool())
    .await
    .expect("member row")
}

pub(crate) async fn reaction_row(
    storage: &PostgresStorage,
    user_id: i32,
    message_id: &str,
) -> Option<ReactionRow> {
    sqlx::query_as(
        r#"
        SELECT user_id, message_id, reaction, updated_at
        FROM chat_message_reactions
        WHERE user_id = $1 AND message_id = $2
        "#,
    )
    .bind(user_id)
    .bind(message_id)
    .fetch_optional(storage.pool())
    .await
    .expect("reaction row")
}

pub(crate) async fn permit_value(storage: &PostgresStorage, user_id: i32) -> Option<String> {
    sqlx::query_scalar("SELECT permits FROM chat_permissions WHERE user_id = $1")
        .bind(user_id)
        .fetch_optional(storage.pool())
        .await
        .expect("permit value")
}
