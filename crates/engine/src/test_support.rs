use chrono::Utc;
use k256::ecdsa::SigningKey;
use parley_auth::WalletKey;
use parley_core::{dm_chat_id, RpcLog};
use parley_storage::PostgresStorage;
use rand_core::OsRng;
use sqlx::postgres::PgPoolOptions;

use crate::{RateLimiter, RpcProcessor, Validator};

/// Connects to `DATABASE_URL` with a fresh schema per test. Tests call this
/// and return early when no database is configured.
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

    parley_storage::migrate_with_pool(&pool)
        .await
        .expect("apply migrations");
    Some(PostgresStorage::from_pool(pool))
}

pub(crate) fn test_processor(storage: &PostgresStorage) -> RpcProcessor {
    let validator = Validator::new(storage.clone(), RateLimiter::new());
    RpcProcessor::new(storage.clone(), validator)
}

/// A registered user with a real signing key, so envelopes built here pass
/// signer recovery for real.
pub(crate) struct TestUser {
    pub user_id: i32,
    pub key: WalletKey,
}

impl TestUser {
    pub async fn create(storage: &PostgresStorage, user_id: i32) -> Self {
        let key = WalletKey::new(SigningKey::random(&mut OsRng));
        sqlx::query("INSERT INTO users (user_id, wallet) VALUES ($1, $2)")
            .bind(user_id)
            .bind(key.wallet())
            .execute(storage.pool())
            .await
            .expect("create user");
        Self { user_id, key }
    }

    /// A key pair with no users row behind it.
    pub fn unregistered() -> Self {
        Self {
            user_id: 0,
            key: WalletKey::new(SigningKey::random(&mut OsRng)),
        }
    }

    pub fn envelope(&self, rpc: &str) -> RpcLog {
        let sig = self.key.sign(rpc.as_bytes()).expect("sign");
        RpcLog {
            relayed_by: "https://node-a.example.com".to_string(),
            relayed_at: Utc::now(),
            applied_at: None,
            from_wallet: self.key.wallet().to_string(),
            rpc: rpc.to_string(),
            sig,
        }
    }
}

/// A chat.create payload between two users. The invite code is fresh each
/// call so repeated creates carry distinct signatures.
pub(crate) fn create_rpc(a: &TestUser, b: &TestUser) -> String {
    let chat_id = dm_chat_id(a.user_id, b.user_id);
    let code = uuid::Uuid::new_v4().simple().to_string();
    format!(
        r#"{{"method":"chat.create","params":{{"chat_id":"{chat_id}","invites":[{{"user_id":{},"invite_code":"{code}"}},{{"user_id":{},"invite_code":"{code}"}}]}}}}"#,
        a.user_id, b.user_id
    )
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
