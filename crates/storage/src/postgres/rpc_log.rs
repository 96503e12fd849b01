use chrono::{DateTime, Utc};
use parley_core::RpcLog;
use sqlx::{Postgres, Transaction};

use super::PostgresStorage;
use crate::StorageError;

#[derive(sqlx::FromRow)]
struct RpcLogRow {
    sig: String,
    rpc: String,
    from_wallet: String,
    relayed_by: String,
    relayed_at: DateTime<Utc>,
    applied_at: DateTime<Utc>,
}

impl From<RpcLogRow> for RpcLog {
    fn from(row: RpcLogRow) -> Self {
        RpcLog {
            relayed_by: row.relayed_by,
            relayed_at: row.relayed_at,
            applied_at: Some(row.applied_at),
            from_wallet: row.from_wallet,
            rpc: row.rpc,
            sig: row.sig,
        }
    }
}

impl PostgresStorage {
    /// Fast-path duplicate check used before opening an apply transaction.
    pub async fn rpc_log_exists(&self, sig: &str) -> Result<bool, StorageError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM rpc_log WHERE sig = $1)")
                .bind(sig)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    /// Envelopes applied locally after the cursor, oldest first. This is the
    /// payload of the bulk pull endpoint.
    pub async fn rpc_log_after(
        &self,
        after: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RpcLog>, StorageError> {
        let rows: Vec<RpcLogRow> = sqlx::query_as(
            r#"
            SELECT sig, rpc, from_wallet, relayed_by, relayed_at, applied_at
            FROM rpc_log
            WHERE applied_at > $1
            ORDER BY applied_at ASC
            LIMIT $2
            "#,
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RpcLog::from).collect())
    }

    pub async fn rpc_log_count(&self) -> Result<i64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rpc_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Idempotent insert inside the apply transaction. Returns false when the
/// signature was already logged, meaning a concurrent apply won the race and
/// the caller should treat the whole apply as an already-done success.
pub async fn insert_rpc_log(
    tx: &mut Transaction<'_, Postgres>,
    envelope: &RpcLog,
) -> Result<bool, StorageError> {
    let result = sqlx::query(
        r#"
        INSERT INTO rpc_log (sig, rpc, from_wallet, relayed_by, relayed_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (sig) DO NOTHING
        "#,
    )
    .bind(&envelope.sig)
    .bind(&envelope.rpc)
    .bind(&envelope.from_wallet)
    .bind(&envelope.relayed_by)
    .bind(envelope.relayed_at)
    .execute(tx.as_mut())
    .await?;
    Ok(result.rows_affected() == 1)
}
