use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parley_auth::{AuthError, WalletKey};
use parley_core::{ProtocolError, RpcLog, WireFormat, MSGPACK_QUERY_FLAG, NONCE_HEADER, SIG_HEADER};
use parley_storage::{PostgresStorage, StorageError};

use crate::peer::PeerConfig;
use crate::processor::{ApplyOutcome, RpcProcessor};

/// Most envelopes pulled from one peer per sweep; matches the bulk
/// endpoint's own page size.
const PULL_LIMIT: usize = 10_000;

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Duration,
    /// Retry ceiling; entries that have failed this many times are left in
    /// the table for inspection but never retried again.
    pub max_attempts: i32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_attempts: 30,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum SweepError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Decode(#[from] ProtocolError),
}

/// The anti-entropy loop. Each tick pulls every peer's log from our cursor
/// forward, then replays the local retry queue. Pull is the backstop for
/// pushes lost to downtime or full outboxes; together they make delivery
/// eventually complete.
pub struct Sweeper {
    storage: PostgresStorage,
    processor: RpcProcessor,
    key: Arc<WalletKey>,
    peers: Vec<PeerConfig>,
    http: reqwest::Client,
    config: SweepConfig,
}

impl Sweeper {
    pub fn new(
        storage: PostgresStorage,
        processor: RpcProcessor,
        key: Arc<WalletKey>,
        peers: Vec<PeerConfig>,
        http: reqwest::Client,
        config: SweepConfig,
    ) -> Self {
        Self {
            storage,
            processor,
            key,
            peers,
            http,
            config,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    /// One full pass: pull from every peer, then drain the retry queue. Each
    /// peer fails independently; one unreachable node never stalls the rest.
    pub async fn sweep(&self) {
        for peer in &self.peers {
            if let Err(error) = self.pull_from(peer).await {
                tracing::warn!(peer = %peer.host, %error, "pull failed");
            }
        }
        if let Err(error) = self.retry_failures().await {
            tracing::warn!(%error, "retry pass failed");
        }
    }

    async fn pull_from(&self, peer: &PeerConfig) -> Result<(), SweepError> {
        let cursor = self
            .storage
            .pull_cursor(&peer.host)
            .await?
            .unwrap_or(DateTime::UNIX_EPOCH);

        let nonce = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let sig = self.key.sign(nonce.as_bytes())?;
        let bytes = self
            .http
            .get(format!("{}/comms/rpc/bulk", peer.host))
            .query(&[
                ("after", cursor.to_rfc3339_opts(SecondsFormat::Nanos, true)),
                (MSGPACK_QUERY_FLAG, "t".to_string()),
            ])
            .header(NONCE_HEADER, &nonce)
            .header(SIG_HEADER, sig)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let batch = RpcLog::decode_batch(&bytes, WireFormat::Msgpack)?;
        let pulled = batch.len();

        // The cursor tracks the peer's applied_at watermark. It advances past
        // failed envelopes too; the retry queue owns those from here on.
        let mut watermark = cursor;
        for envelope in batch.into_iter().take(PULL_LIMIT) {
            if let Err(error) = self.processor.apply(&envelope).await {
                self.storage
                    .record_failure(&envelope, &error.to_string())
                    .await?;
            }
            if let Some(applied_at) = envelope.applied_at {
                watermark = watermark.max(applied_at);
            }
        }
        if watermark > cursor {
            self.storage.upsert_pull_cursor(&peer.host, watermark).await?;
        }
        if pulled > 0 {
            tracing::debug!(peer = %peer.host, pulled, "pull complete");
        }
        Ok(())
    }

    /// Replays queued failures oldest first. Success and permanent skips both
    /// clear the entry; only transient errors keep it queued.
    pub async fn retry_failures(&self) -> Result<(), StorageError> {
        for entry in self
            .storage
            .retryable_failures(self.config.max_attempts)
            .await?
        {
            match self.processor.apply(&entry.envelope).await {
                Ok(ApplyOutcome::Applied | ApplyOutcome::AlreadyApplied) => {
                    self.storage.clear_failure(&entry.sig).await?;
                }
                Ok(ApplyOutcome::Skipped(reason)) => {
                    tracing::warn!(sig = %entry.sig, %reason, "dropping unretryable entry");
                    self.storage.clear_failure(&entry.sig).await?;
                }
                Err(error) => {
                    self.storage
                        .record_failure(&entry.envelope, &error.to_string())
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k256::ecdsa::SigningKey;
    use rand_core::OsRng;

    use super::*;
    use crate::test_support::*;

    fn test_sweeper(storage: &PostgresStorage) -> Sweeper {
        Sweeper::new(
            storage.clone(),
            test_processor(storage),
            Arc::new(WalletKey::new(SigningKey::random(&mut OsRng))),
            Vec::new(),
            reqwest::Client::new(),
            SweepConfig::default(),
        )
    }

    #[tokio::test]
    async fn retry_applies_queued_envelope_and_clears_it() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let sweeper = test_sweeper(&storage);
        let alice = TestUser::create(&storage, 1).await;

        // A valid envelope that failed transiently on first delivery.
        let envelope = alice.envelope(r#"{"method":"chat.permit","params":{"permit":"all"}}"#);
        storage
            .record_failure(&envelope, "connection reset")
            .await
            .expect("record");

        sweeper.retry_failures().await.expect("retry");

        assert!(storage
            .retryable_failures(30)
            .await
            .expect("retryable")
            .is_empty());
        assert!(storage
            .rpc_log_exists(&envelope.sig)
            .await
            .expect("exists"));
    }

    #[tokio::test]
    async fn retry_discards_permanently_invalid_entries() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let sweeper = test_sweeper(&storage);
        let stranger = TestUser::unregistered();

        let envelope = stranger.envelope(r#"{"method":"chat.permit","params":{"permit":"all"}}"#);
        storage
            .record_failure(&envelope, "connection reset")
            .await
            .expect("record");

        sweeper.retry_failures().await.expect("retry");

        // Skipped, cleared, and never logged.
        assert!(storage
            .recent_failures(10)
            .await
            .expect("recent")
            .is_empty());
        assert!(!storage
            .rpc_log_exists(&envelope.sig)
            .await
            .expect("exists"));
    }
}
