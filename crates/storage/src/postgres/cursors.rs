use chrono::{DateTime, Utc};

use super::PostgresStorage;
use crate::StorageError;

impl PostgresStorage {
    /// Watermark of the last envelope successfully pulled from a peer, or
    /// None when that peer has never been swept.
    pub async fn pull_cursor(
        &self,
        relayed_by: &str,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let cursor = sqlx::query_scalar("SELECT relayed_at FROM rpc_cursor WHERE relayed_by = $1")
            .bind(relayed_by)
            .fetch_optional(&self.pool)
            .await?;
        Ok(cursor)
    }

    /// Advances a peer's cursor. The GREATEST guard keeps advancement
    /// monotonic even if sweeps race or a peer replays an old batch.
    pub async fn upsert_pull_cursor(
        &self,
        relayed_by: &str,
        relayed_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO rpc_cursor (relayed_by, relayed_at)
            VALUES ($1, $2)
            ON CONFLICT (relayed_by) DO UPDATE SET
                relayed_at = GREATEST(rpc_cursor.relayed_at, excluded.relayed_at)
            "#,
        )
        .bind(relayed_by)
        .bind(relayed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
