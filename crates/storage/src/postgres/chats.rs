//! Conflict-resolution handlers.
//!
//! Each handler runs inside the apply transaction and encodes one method's
//! last-write-wins merge rule against existing rows. The direction is
//! per-field, not global: chat creation time and member invite metadata are
//! earliest-wins (the first valid invite is canonical), reactions, permits
//! and bans are strict latest-wins, read/delete are unconditional, and block
//! is insert-or-ignore. Every handler is safe to apply twice and in any
//! arrival order.

use chrono::{DateTime, Utc};
use parley_core::{blast_message_id, ChatInvite, Permit};
use sqlx::{Postgres, Transaction};

use crate::StorageError;

pub async fn chat_create(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i32,
    ts: DateTime<Utc>,
    chat_id: &str,
    invites: &[ChatInvite],
) -> Result<(), StorageError> {
    // Earliest-wins: a chat's canonical creation is whichever invite carried
    // the earliest logical time.
    sqlx::query(
        r#"
        INSERT INTO chat (chat_id, created_at, last_message_at)
        VALUES ($1, $2, $2)
        ON CONFLICT (chat_id) DO UPDATE SET
            created_at = excluded.created_at,
            last_message_at = excluded.last_message_at
        WHERE chat.created_at > excluded.created_at
        "#,
    )
    .bind(chat_id)
    .bind(ts)
    .execute(tx.as_mut())
    .await?;

    for invite in invites {
        sqlx::query(
            r#"
            INSERT INTO chat_member (chat_id, user_id, invited_by_user_id, invite_code, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (chat_id, user_id) DO UPDATE SET
                invited_by_user_id = excluded.invited_by_user_id,
                invite_code = excluded.invite_code,
                created_at = excluded.created_at
            WHERE chat_member.created_at > excluded.created_at
            "#,
        )
        .bind(chat_id)
        .bind(invite.user_id)
        .bind(user_id)
        .bind(&invite.invite_code)
        .bind(ts)
        .execute(tx.as_mut())
        .await?;
    }
    Ok(())
}

/// Clears history for the caller's own membership only; the other member's
/// view of the chat is untouched.
pub async fn chat_delete(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i32,
    ts: DateTime<Utc>,
    chat_id: &str,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        UPDATE chat_member
        SET cleared_history_at = $3, last_active_at = $3, unread_count = 0
        WHERE chat_id = $1 AND user_id = $2
        "#,
    )
    .bind(chat_id)
    .bind(user_id)
    .bind(ts)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

pub async fn chat_message(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i32,
    ts: DateTime<Utc>,
    chat_id: &str,
    message_id: &str,
    ciphertext: &str,
) -> Result<(), StorageError> {
    // Message ids are caller-chosen and globally unique; a collision is a
    // storage-level no-op.
    sqlx::query(
        r#"
        INSERT INTO chat_message (message_id, chat_id, user_id, created_at, ciphertext)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (message_id) DO NOTHING
        "#,
    )
    .bind(message_id)
    .bind(chat_id)
    .bind(user_id)
    .bind(ts)
    .bind(ciphertext)
    .execute(tx.as_mut())
    .await?;

    bump_chat_preview(tx, chat_id, ts, ciphertext).await?;

    // The sender has obviously seen the chat up to their own message.
    chat_read(tx, user_id, ts, chat_id).await?;

    // Members who were last active before this message gain an unread.
    sqlx::query(
        r#"
        UPDATE chat_member
        SET unread_count = unread_count + 1
        WHERE chat_id = $1
          AND user_id <> $2
          AND (last_active_at IS NULL OR last_active_at < $3)
        "#,
    )
    .bind(chat_id)
    .bind(user_id)
    .bind(ts)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

pub async fn chat_react(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i32,
    ts: DateTime<Utc>,
    message_id: &str,
    reaction: Option<&str>,
) -> Result<(), StorageError> {
    match reaction {
        Some(reaction) => {
            sqlx::query(
                r#"
                INSERT INTO chat_message_reactions (user_id, message_id, reaction, updated_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (user_id, message_id) DO UPDATE SET
                    reaction = excluded.reaction,
                    updated_at = excluded.updated_at
                WHERE chat_message_reactions.updated_at < excluded.updated_at
                "#,
            )
            .bind(user_id)
            .bind(message_id)
            .bind(reaction)
            .bind(ts)
            .execute(tx.as_mut())
            .await?;
        }
        None => {
            // A removal cannot undo a reaction applied later.
            sqlx::query(
                r#"
                DELETE FROM chat_message_reactions
                WHERE user_id = $1 AND message_id = $2 AND updated_at < $3
                "#,
            )
            .bind(user_id)
            .bind(message_id)
            .bind(ts)
            .execute(tx.as_mut())
            .await?;
        }
    }
    Ok(())
}

pub async fn chat_read(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i32,
    ts: DateTime<Utc>,
    chat_id: &str,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        UPDATE chat_member
        SET unread_count = 0, last_active_at = $3
        WHERE chat_id = $1 AND user_id = $2
        "#,
    )
    .bind(chat_id)
    .bind(user_id)
    .bind(ts)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

pub async fn chat_permit(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i32,
    ts: DateTime<Utc>,
    permit: Permit,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO chat_permissions (user_id, permits, updated_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (user_id) DO UPDATE SET
            permits = excluded.permits,
            updated_at = excluded.updated_at
        WHERE chat_permissions.updated_at < excluded.updated_at
        "#,
    )
    .bind(user_id)
    .bind(permit.as_str())
    .bind(ts)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

/// Blocking is monotonic: the first block wins and repeats are ignored.
pub async fn chat_block(
    tx: &mut Transaction<'_, Postgres>,
    blocker_user_id: i32,
    ts: DateTime<Utc>,
    blockee_user_id: i32,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO chat_blocked_users (blocker_user_id, blockee_user_id, created_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (blocker_user_id, blockee_user_id) DO NOTHING
        "#,
    )
    .bind(blocker_user_id)
    .bind(blockee_user_id)
    .bind(ts)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

/// A block created after the unblock was issued survives it.
pub async fn chat_unblock(
    tx: &mut Transaction<'_, Postgres>,
    blocker_user_id: i32,
    ts: DateTime<Utc>,
    blockee_user_id: i32,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        DELETE FROM chat_blocked_users
        WHERE blocker_user_id = $1 AND blockee_user_id = $2 AND created_at < $3
        "#,
    )
    .bind(blocker_user_id)
    .bind(blockee_user_id)
    .bind(ts)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

pub async fn chat_ban(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i32,
    ts: DateTime<Utc>,
    is_banned: bool,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO chat_ban (user_id, is_banned, updated_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (user_id) DO UPDATE SET
            is_banned = excluded.is_banned,
            updated_at = excluded.updated_at
        WHERE chat_ban.updated_at < excluded.updated_at
        "#,
    )
    .bind(user_id)
    .bind(is_banned)
    .bind(ts)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

/// Fans one blast out to a chat, membership pair, and message per follower of
/// the sender, all derived with deterministic ids inside the caller's
/// transaction. The blast row itself is the idempotence key: when it already
/// exists the whole fan-out is skipped, so re-applying the same blast id
/// never produces additional rows.
pub async fn chat_blast(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i32,
    ts: DateTime<Utc>,
    blast_id: &str,
    message: &str,
) -> Result<(), StorageError> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO chat_blast (blast_id, from_user_id, message, created_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (blast_id) DO NOTHING
        "#,
    )
    .bind(blast_id)
    .bind(user_id)
    .bind(message)
    .bind(ts)
    .execute(tx.as_mut())
    .await?;
    if inserted.rows_affected() == 0 {
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO chat (chat_id, created_at, last_message_at, last_message)
        SELECT least(f.follower_user_id, $1)::text || ':' || greatest(f.follower_user_id, $1)::text,
               $2, $2, $3
        FROM follows f
        WHERE f.followee_user_id = $1
        ON CONFLICT (chat_id) DO UPDATE SET
            last_message_at = excluded.last_message_at,
            last_message = excluded.last_message
        WHERE chat.last_message_at <= excluded.last_message_at
        "#,
    )
    .bind(user_id)
    .bind(ts)
    .bind(message)
    .execute(tx.as_mut())
    .await?;

    // Membership rows for both sides of every derived chat. The blast id
    // doubles as the invite code so the rows trace back to their origin.
    sqlx::query(
        r#"
        WITH targets AS (
            SELECT f.follower_user_id AS member_id,
                   least(f.follower_user_id, $1)::text || ':' || greatest(f.follower_user_id, $1)::text AS chat_id
            FROM follows f
            WHERE f.followee_user_id = $1
        )
        INSERT INTO chat_member (chat_id, user_id, invited_by_user_id, invite_code, created_at)
        SELECT chat_id, member_id, $1, $2, $3 FROM targets
        UNION ALL
        SELECT chat_id, $1, $1, $2, $3 FROM targets
        ON CONFLICT (chat_id, user_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(blast_id)
    .bind(ts)
    .execute(tx.as_mut())
    .await?;

    sqlx::query(
        r#"
        WITH targets AS (
            SELECT least(f.follower_user_id, $1)::text || ':' || greatest(f.follower_user_id, $1)::text AS chat_id
            FROM follows f
            WHERE f.followee_user_id = $1
        )
        INSERT INTO chat_message (message_id, chat_id, user_id, created_at, ciphertext)
        SELECT $2 || ':' || chat_id, chat_id, $1, $3, $4 FROM targets
        ON CONFLICT (message_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(blast_id)
    .bind(ts)
    .bind(message)
    .execute(tx.as_mut())
    .await?;

    sqlx::query(
        r#"
        WITH targets AS (
            SELECT f.follower_user_id AS member_id,
                   least(f.follower_user_id, $1)::text || ':' || greatest(f.follower_user_id, $1)::text AS chat_id
            FROM follows f
            WHERE f.followee_user_id = $1
        )
        UPDATE chat_member m
        SET unread_count = m.unread_count + 1
        FROM targets t
        WHERE m.chat_id = t.chat_id
          AND m.user_id = t.member_id
          AND (m.last_active_at IS NULL OR m.last_active_at < $2)
        "#,
    )
    .bind(user_id)
    .bind(ts)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

async fn bump_chat_preview(
    tx: &mut Transaction<'_, Postgres>,
    chat_id: &str,
    ts: DateTime<Utc>,
    ciphertext: &str,
) -> Result<(), StorageError> {
    // Latest-wins: an older message arriving late never regresses the
    // denormalized preview.
    sqlx::query(
        r#"
        UPDATE chat
        SET last_message_at = $2, last_message = $3
        WHERE chat_id = $1 AND last_message_at <= $2
        "#,
    )
    .bind(chat_id)
    .bind(ts)
    .bind(ciphertext)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}
