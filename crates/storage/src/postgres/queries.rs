//! Read-side queries consumed by the validator. All are pure reads against
//! latest committed state; rate-limit windows are recomputed from the domain
//! tables on every call rather than tracked in memory, which survives process
//! restarts and multi-process races.

use chrono::{DateTime, Utc};
use parley_core::Permit;

use super::PostgresStorage;
use crate::StorageError;

impl PostgresStorage {
    pub async fn is_chat_member(&self, chat_id: &str, user_id: i32) -> Result<bool, StorageError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM chat_member WHERE chat_id = $1 AND user_id = $2)",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    pub async fn chat_member_count(&self, chat_id: &str) -> Result<i64, StorageError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chat_member WHERE chat_id = $1")
                .bind(chat_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn other_chat_members(
        &self,
        chat_id: &str,
        user_id: i32,
    ) -> Result<Vec<i32>, StorageError> {
        let members = sqlx::query_scalar(
            "SELECT user_id FROM chat_member WHERE chat_id = $1 AND user_id <> $2",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    pub async fn message_exists_in_chat(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> Result<bool, StorageError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM chat_message WHERE message_id = $1 AND chat_id = $2)",
        )
        .bind(message_id)
        .bind(chat_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// True when either user has blocked the other.
    pub async fn block_exists_between(&self, a: i32, b: i32) -> Result<bool, StorageError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM chat_blocked_users
                WHERE (blocker_user_id = $1 AND blockee_user_id = $2)
                   OR (blocker_user_id = $2 AND blockee_user_id = $1)
            )
            "#,
        )
        .bind(a)
        .bind(b)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    pub async fn block_exists(
        &self,
        blocker_user_id: i32,
        blockee_user_id: i32,
    ) -> Result<bool, StorageError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM chat_blocked_users
                WHERE blocker_user_id = $1 AND blockee_user_id = $2
            )
            "#,
        )
        .bind(blocker_user_id)
        .bind(blockee_user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// A user's inbox permit, or None when they have never set one (which
    /// callers treat as allow-all).
    pub async fn permit_for(&self, user_id: i32) -> Result<Option<Permit>, StorageError> {
        let permits: Option<String> =
            sqlx::query_scalar("SELECT permits FROM chat_permissions WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(permits.as_deref().map(|value| match value {
            "none" => Permit::None,
            "followees" => Permit::Followees,
            "tippers" => Permit::Tippers,
            _ => Permit::All,
        }))
    }

    pub async fn follows(&self, follower: i32, followee: i32) -> Result<bool, StorageError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM follows
                WHERE follower_user_id = $1 AND followee_user_id = $2
            )
            "#,
        )
        .bind(follower)
        .bind(followee)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    pub async fn has_tipped(&self, sender: i32, receiver: i32) -> Result<bool, StorageError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM user_tips
                WHERE sender_user_id = $1 AND receiver_user_id = $2
            )
            "#,
        )
        .bind(sender)
        .bind(receiver)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    pub async fn is_banned(&self, user_id: i32) -> Result<bool, StorageError> {
        let banned: Option<bool> =
            sqlx::query_scalar("SELECT is_banned FROM chat_ban WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(banned.unwrap_or(false))
    }

    /// Largest number of chats any one of the given users joined inside the
    /// window. The new-chat limit applies to every invited member, so the
    /// caller checks the maximum against the limit.
    pub async fn max_new_chats_in_window(
        &self,
        user_ids: &[i32],
        since: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let max: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(n) FROM (
                SELECT COUNT(*) AS n
                FROM chat_member
                WHERE user_id = ANY($1) AND created_at > $2
                GROUP BY user_id
            ) counts
            "#,
        )
        .bind(user_ids)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(max.unwrap_or(0))
    }

    pub async fn messages_sent_in_window(
        &self,
        user_id: i32,
        since: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chat_message WHERE user_id = $1 AND created_at > $2",
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// The heaviest single conversation inside the window, which is what the
    /// per-recipient limit bounds.
    pub async fn max_messages_per_chat_in_window(
        &self,
        user_id: i32,
        since: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let max: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(n) FROM (
                SELECT COUNT(*) AS n
                FROM chat_message
                WHERE user_id = $1 AND created_at > $2
                GROUP BY chat_id
            ) counts
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(max.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use parley_core::{dm_chat_id, ChatInvite};

    use super::super::chats;
    use super::super::test_support::*;
    use super::*;

    async fn seed_chat(storage: &PostgresStorage, a: i32, b: i32) -> String {
        let chat_id = dm_chat_id(a, b);
        let invites = vec![
            ChatInvite {
                user_id: a,
                invite_code: "x".to_string(),
            },
            ChatInvite {
                user_id: b,
                invite_code: "x".to_string(),
            },
        ];
        let mut tx = storage.begin().await.expect("begin");
        chats::chat_create(&mut tx, a, Utc::now() - Duration::minutes(10), &chat_id, &invites)
            .await
            .expect("create");
        tx.commit().await.expect("commit");
        chat_id
    }

    #[tokio::test]
    async fn membership_and_message_lookups() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let chat_id = seed_chat(&storage, 1, 2).await;

        assert!(storage.is_chat_member(&chat_id, 1).await.expect("member"));
        assert!(!storage.is_chat_member(&chat_id, 3).await.expect("member"));
        assert_eq!(storage.chat_member_count(&chat_id).await.expect("count"), 2);
        assert_eq!(
            storage
                .other_chat_members(&chat_id, 1)
                .await
                .expect("others"),
            vec![2]
        );

        let mut tx = storage.begin().await.expect("begin");
        chats::chat_message(&mut tx, 1, Utc::now(), &chat_id, "m1", "hi")
            .await
            .expect("message");
        tx.commit().await.expect("commit");
        assert!(storage
            .message_exists_in_chat(&chat_id, "m1")
            .await
            .expect("exists"));
        assert!(!storage
            .message_exists_in_chat("9:9", "m1")
            .await
            .expect("exists"));
    }

    #[tokio::test]
    async fn permit_parsing_defaults() {
        let Some(storage) = test_storage().await else {
            return;
        };
        assert_eq!(storage.permit_for(1).await.expect("permit"), None);

        let mut tx = storage.begin().await.expect("begin");
        chats::chat_permit(&mut tx, 1, Utc::now(), Permit::Tippers)
            .await
            .expect("permit");
        tx.commit().await.expect("commit");
        assert_eq!(
            storage.permit_for(1).await.expect("permit"),
            Some(Permit::Tippers)
        );
    }

    #[tokio::test]
    async fn social_graph_lookups() {
        let Some(storage) = test_storage().await else {
            return;
        };
        create_follow(&storage, 1, 2).await;
        create_tip(&storage, 2, 1).await;

        assert!(storage.follows(1, 2).await.expect("follows"));
        assert!(!storage.follows(2, 1).await.expect("follows"));
        assert!(storage.has_tipped(2, 1).await.expect("tipped"));
        assert!(!storage.has_tipped(1, 2).await.expect("tipped"));

        let mut tx = storage.begin().await.expect("begin");
        chats::chat_block(&mut tx, 1, Utc::now(), 2).await.expect("block");
        tx.commit().await.expect("commit");
        assert!(storage.block_exists(1, 2).await.expect("block"));
        assert!(!storage.block_exists(2, 1).await.expect("block"));
        assert!(storage.block_exists_between(2, 1).await.expect("between"));
        assert!(!storage.block_exists_between(2, 3).await.expect("between"));
    }

    #[tokio::test]
    async fn rate_window_aggregates() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let since = Utc::now() - Duration::hours(1);
        let chat_a = seed_chat(&storage, 1, 2).await;
        let chat_b = seed_chat(&storage, 1, 3).await;

        let mut tx = storage.begin().await.expect("begin");
        for (i, chat) in [&chat_a, &chat_a, &chat_b].iter().enumerate() {
            chats::chat_message(&mut tx, 1, Utc::now(), chat, &format!("m{i}"), "hi")
                .await
                .expect("message");
        }
        tx.commit().await.expect("commit");

        assert_eq!(
            storage
                .messages_sent_in_window(1, since)
                .await
                .expect("sent"),
            3
        );
        assert_eq!(
            storage
                .max_messages_per_chat_in_window(1, since)
                .await
                .expect("per chat"),
            2
        );
        // User 1 is in two chats; user 2 in one; user 4 in none.
        assert_eq!(
            storage
                .max_new_chats_in_window(&[1, 2], since)
                .await
                .expect("chats"),
            2
        );
        assert_eq!(
            storage
                .max_new_chats_in_window(&[4], since)
                .await
                .expect("chats"),
            0
        );
        // Outside the window nothing counts.
        assert_eq!(
            storage
                .messages_sent_in_window(1, Utc::now() + Duration::hours(1))
                .await
                .expect("sent"),
            0
        );
    }
}
