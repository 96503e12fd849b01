use super::PostgresStorage;
use crate::StorageError;

impl PostgresStorage {
    /// Resolves a wallet address to its internal user id. Wallets are stored
    /// lowercase; comparison is case-insensitive to tolerate checksummed
    /// input.
    pub async fn user_id_for_wallet(&self, wallet: &str) -> Result<Option<i32>, StorageError> {
        let user_id = sqlx::query_scalar("SELECT user_id FROM users WHERE wallet = lower($1)")
            .bind(wallet)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user_id)
    }
}
