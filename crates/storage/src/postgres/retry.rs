use parley_core::RpcLog;

use super::PostgresStorage;
use crate::{FailedRpc, RetryEntry, StorageError};

#[derive(sqlx::FromRow)]
struct RetryRow {
    sig: String,
    rpc_log_json: serde_json::Value,
    error_text: String,
    error_count: i32,
    last_attempt: chrono::DateTime<chrono::Utc>,
}

impl PostgresStorage {
    /// Records a transient apply failure. First failure inserts the entry;
    /// repeats bump the count, overwrite the error text, and refresh the
    /// attempt time.
    pub async fn record_failure(
        &self,
        envelope: &RpcLog,
        error_text: &str,
    ) -> Result<(), StorageError> {
        let envelope_json = serde_json::to_value(envelope)
            .map_err(|e| StorageError::CorruptRetryEntry(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO rpc_error (sig, rpc_log_json, error_text, error_count, last_attempt)
            VALUES ($1, $2, $3, 1, now())
            ON CONFLICT (sig) DO UPDATE SET
                error_text = excluded.error_text,
                error_count = rpc_error.error_count + 1,
                last_attempt = now()
            "#,
        )
        .bind(&envelope.sig)
        .bind(envelope_json)
        .bind(error_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes a retry entry after a successful (or permanently skipped)
    /// re-apply. Missing entries are fine; the apply may have succeeded on
    /// the first attempt.
    pub async fn clear_failure(&self, sig: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM rpc_error WHERE sig = $1")
            .bind(sig)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Entries still eligible for retry, oldest failure first. Entries at or
    /// above the attempt ceiling stay in the table for inspection but are
    /// never returned here.
    pub async fn retryable_failures(
        &self,
        max_attempts: i32,
    ) -> Result<Vec<RetryEntry>, StorageError> {
        let rows: Vec<RetryRow> = sqlx::query_as(
            r#"
            SELECT sig, rpc_log_json, error_text, error_count, last_attempt
            FROM rpc_error
            WHERE error_count < $1
            ORDER BY last_attempt ASC
            "#,
        )
        .bind(max_attempts)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let envelope: RpcLog = serde_json::from_value(row.rpc_log_json)
                    .map_err(|e| StorageError::CorruptRetryEntry(e.to_string()))?;
                Ok(RetryEntry {
                    sig: row.sig,
                    envelope,
                    error_text: row.error_text,
                    error_count: row.error_count,
                    last_attempt: row.last_attempt,
                })
            })
            .collect()
    }

    pub async fn recent_failures(&self, limit: i64) -> Result<Vec<FailedRpc>, StorageError> {
        let rows: Vec<RetryRow> = sqlx::query_as(
            r#"
            SELECT sig, rpc_log_json, error_text, error_count, last_attempt
            FROM rpc_error
            ORDER BY last_attempt DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| FailedRpc {
                sig: row.sig,
                error_text: row.error_text,
                error_count: row.error_count,
                last_attempt: row.last_attempt,
            })
            .collect())
    }
}
