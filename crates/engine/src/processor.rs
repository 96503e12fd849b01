use parley_auth::recover_wallet;
use parley_core::{RpcLog, RpcMethod};
use parley_storage::postgres::chats;
use parley_storage::{insert_rpc_log, PostgresStorage, StorageError};
use sqlx::{Postgres, Transaction};

use crate::notify::Notifier;
use crate::validator::{ValidateError, ValidationFailure, Validator};
use crate::EngineError;

/// Why an envelope was dropped without being applied. Skips are terminal:
/// every peer evaluating the same envelope reaches the same verdict, so there
/// is nothing to retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    BadSignature(String),
    /// The signature recovers to a wallet other than `from_wallet`.
    SignerMismatch,
    /// The recovered wallet does not map to a known user.
    UnknownSigner,
    Undecodable(String),
    Rejected(ValidationFailure),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::BadSignature(detail) => write!(f, "bad signature: {detail}"),
            SkipReason::SignerMismatch => write!(f, "signature recovers to a different wallet"),
            SkipReason::UnknownSigner => write!(f, "signer wallet is not a known user"),
            SkipReason::Undecodable(detail) => write!(f, "undecodable payload: {detail}"),
            SkipReason::Rejected(failure) => write!(f, "rejected: {failure}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The signature is already in the log, either from an earlier delivery
    /// or from a concurrent apply that won the insert race.
    AlreadyApplied,
    Skipped(SkipReason),
}

/// The validate-and-apply pipeline. Every envelope, whatever path it arrived
/// by, goes through [`RpcProcessor::apply`] exactly once per node.
#[derive(Clone)]
pub struct RpcProcessor {
    storage: PostgresStorage,
    validator: Validator,
}

impl RpcProcessor {
    pub fn new(storage: PostgresStorage, validator: Validator) -> Self {
        Self { storage, validator }
    }

    pub fn storage(&self) -> &PostgresStorage {
        &self.storage
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub async fn apply(&self, envelope: &RpcLog) -> Result<ApplyOutcome, EngineError> {
        if self.storage.rpc_log_exists(&envelope.sig).await? {
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let wallet = match recover_wallet(envelope.rpc.as_bytes(), &envelope.sig) {
            Ok(wallet) => wallet,
            Err(error) => {
                return Ok(ApplyOutcome::Skipped(SkipReason::BadSignature(
                    error.to_string(),
                )))
            }
        };
        if !wallet.eq_ignore_ascii_case(&envelope.from_wallet) {
            return Ok(ApplyOutcome::Skipped(SkipReason::SignerMismatch));
        }

        let user_id = match self.storage.user_id_for_wallet(&wallet).await? {
            Some(user_id) => user_id,
            None => return Ok(ApplyOutcome::Skipped(SkipReason::UnknownSigner)),
        };

        let method = match envelope.method() {
            Ok(method) => method,
            Err(error) => {
                return Ok(ApplyOutcome::Skipped(SkipReason::Undecodable(
                    error.to_string(),
                )))
            }
        };

        match self.validator.validate(user_id, &method).await {
            Ok(()) => {}
            Err(ValidateError::Rejected(failure)) => {
                tracing::info!(
                    sig = %envelope.sig,
                    method = method.name(),
                    %failure,
                    "dropping rejected rpc"
                );
                return Ok(ApplyOutcome::Skipped(SkipReason::Rejected(failure)));
            }
            Err(ValidateError::Storage(error)) => return Err(error.into()),
        }

        let mut tx = self.storage.begin().await?;
        if !insert_rpc_log(&mut tx, envelope).await? {
            // Concurrent apply won the race; its transaction did the work.
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        dispatch(&mut tx, user_id, envelope, &method).await?;
        tx.commit()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;

        tracing::debug!(sig = %envelope.sig, method = method.name(), user_id, "applied rpc");
        Ok(ApplyOutcome::Applied)
    }

    /// Applies and, on success, publishes to the given notifier. Duplicates
    /// and skips are not re-announced.
    pub async fn apply_and_publish(
        &self,
        envelope: &RpcLog,
        notifier: &dyn Notifier,
    ) -> Result<ApplyOutcome, EngineError> {
        let outcome = self.apply(envelope).await?;
        if outcome == ApplyOutcome::Applied {
            notifier.rpc_applied(envelope).await;
        }
        Ok(outcome)
    }
}

/// Routes a decoded method to its conflict-resolution handler inside the
/// apply transaction. The envelope's relayed_at is the logical timestamp all
/// handlers compare on.
async fn dispatch(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i32,
    envelope: &RpcLog,
    method: &RpcMethod,
) -> Result<(), StorageError> {
    let ts = envelope.relayed_at;
    match method {
        RpcMethod::ChatCreate { chat_id, invites } => {
            chats::chat_create(tx, user_id, ts, chat_id, invites).await
        }
        RpcMethod::ChatDelete { chat_id } => chats::chat_delete(tx, user_id, ts, chat_id).await,
        RpcMethod::ChatMessage {
            chat_id,
            message_id,
            message,
        } => chats::chat_message(tx, user_id, ts, chat_id, message_id, message).await,
        RpcMethod::ChatReact {
            message_id,
            reaction,
            ..
        } => chats::chat_react(tx, user_id, ts, message_id, reaction.as_deref()).await,
        RpcMethod::ChatRead { chat_id } => chats::chat_read(tx, user_id, ts, chat_id).await,
        RpcMethod::ChatPermit { permit } => chats::chat_permit(tx, user_id, ts, *permit).await,
        RpcMethod::ChatBlock { user_id: blockee } => {
            chats::chat_block(tx, user_id, ts, *blockee).await
        }
        RpcMethod::ChatUnblock { user_id: blockee } => {
            chats::chat_unblock(tx, user_id, ts, *blockee).await
        }
        RpcMethod::ChatBlast { blast_id, message } => {
            chats::chat_blast(tx, user_id, ts, blast_id, message).await
        }
        RpcMethod::Ban {
            user_id: target,
            is_banned,
        } => chats::chat_ban(tx, *target, ts, *is_banned).await,
    }
}
