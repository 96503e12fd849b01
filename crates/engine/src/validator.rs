use chrono::Utc;
use parley_core::{dm_chat_id, Permit, RpcMethod};
use parley_storage::{PostgresStorage, StorageError};

use crate::limiter::{RateLimitRule, RateLimiter};

/// A deterministic rejection. Every node evaluating the same envelope against
/// converged state reaches the same verdict, so rejected envelopes are dropped
/// rather than queued for retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationFailure {
    #[error("chat must have exactly 2 members, got {0}")]
    BadMemberCount(usize),
    #[error("sender is not among the invited members")]
    CallerNotInvited,
    #[error("chat id does not match its members")]
    BadChatId,
    #[error("a block exists between these users")]
    Blocked,
    #[error("recipient's inbox permit does not allow this sender")]
    NotPermitted,
    #[error("rate limited: {0}")]
    RateLimited(&'static str),
    #[error("sender is not a member of this chat")]
    NotChatMember,
    #[error("message does not exist in this chat")]
    MessageNotFound,
    #[error("no block exists to remove")]
    BlockNotFound,
    #[error("sender is banned")]
    Banned,
}

#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Rejected(#[from] ValidationFailure),
}

/// Per-method preconditions, checked against committed state before an
/// envelope is applied.
#[derive(Clone)]
pub struct Validator {
    storage: PostgresStorage,
    limiter: RateLimiter,
}

impl Validator {
    pub fn new(storage: PostgresStorage, limiter: RateLimiter) -> Self {
        Self { storage, limiter }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn validate(&self, user_id: i32, method: &RpcMethod) -> Result<(), ValidateError> {
        match method {
            RpcMethod::ChatCreate { chat_id, invites } => {
                self.validate_chat_create(user_id, chat_id, invites).await
            }
            RpcMethod::ChatDelete { chat_id } | RpcMethod::ChatRead { chat_id } => {
                self.require_membership(chat_id, user_id).await
            }
            RpcMethod::ChatMessage { chat_id, .. } => {
                self.validate_chat_message(user_id, chat_id).await
            }
            RpcMethod::ChatReact {
                chat_id,
                message_id,
                ..
            } => {
                self.require_membership(chat_id, user_id).await?;
                if !self.storage.message_exists_in_chat(chat_id, message_id).await? {
                    return Err(ValidationFailure::MessageNotFound.into());
                }
                Ok(())
            }
            RpcMethod::ChatUnblock { user_id: blockee } => {
                if !self.storage.block_exists(user_id, *blockee).await? {
                    return Err(ValidationFailure::BlockNotFound.into());
                }
                Ok(())
            }
            RpcMethod::ChatBlast { .. } => {
                self.require_not_banned(user_id).await?;
                Ok(())
            }
            RpcMethod::ChatPermit { .. } | RpcMethod::ChatBlock { .. } | RpcMethod::Ban { .. } => {
                Ok(())
            }
        }
    }

    async fn validate_chat_create(
        &self,
        user_id: i32,
        chat_id: &str,
        invites: &[parley_core::ChatInvite],
    ) -> Result<(), ValidateError> {
        if invites.len() != 2 {
            return Err(ValidationFailure::BadMemberCount(invites.len()).into());
        }
        if !invites.iter().any(|invite| invite.user_id == user_id) {
            return Err(ValidationFailure::CallerNotInvited.into());
        }
        if chat_id != dm_chat_id(invites[0].user_id, invites[1].user_id) {
            return Err(ValidationFailure::BadChatId.into());
        }
        self.require_not_banned(user_id).await?;

        let other = invites
            .iter()
            .map(|invite| invite.user_id)
            .find(|id| *id != user_id)
            .unwrap_or(user_id);
        if other != user_id {
            if self.storage.block_exists_between(user_id, other).await? {
                return Err(ValidationFailure::Blocked.into());
            }
            if !self.permits_sender(other, user_id).await? {
                return Err(ValidationFailure::NotPermitted.into());
            }
        }

        let since = self.limiter.window_start(Utc::now());
        let members: Vec<i32> = invites.iter().map(|invite| invite.user_id).collect();
        let joined = self.storage.max_new_chats_in_window(&members, since).await?;
        if joined >= self.limiter.get(RateLimitRule::MaxNewChats) {
            return Err(ValidationFailure::RateLimited("max new chats").into());
        }
        Ok(())
    }

    async fn validate_chat_message(
        &self,
        user_id: i32,
        chat_id: &str,
    ) -> Result<(), ValidateError> {
        self.require_not_banned(user_id).await?;
        self.require_membership(chat_id, user_id).await?;
        for other in self.storage.other_chat_members(chat_id, user_id).await? {
            if self.storage.block_exists_between(user_id, other).await? {
                return Err(ValidationFailure::Blocked.into());
            }
            if !self.permits_sender(other, user_id).await? {
                return Err(ValidationFailure::NotPermitted.into());
            }
        }

        let since = self.limiter.window_start(Utc::now());
        let sent = self.storage.messages_sent_in_window(user_id, since).await?;
        if sent >= self.limiter.get(RateLimitRule::MaxMessages) {
            return Err(ValidationFailure::RateLimited("max messages").into());
        }
        let heaviest = self
            .storage
            .max_messages_per_chat_in_window(user_id, since)
            .await?;
        if heaviest >= self.limiter.get(RateLimitRule::MaxMessagesPerRecipient) {
            return Err(ValidationFailure::RateLimited("max messages per recipient").into());
        }
        Ok(())
    }

    async fn require_membership(&self, chat_id: &str, user_id: i32) -> Result<(), ValidateError> {
        if !self.storage.is_chat_member(chat_id, user_id).await? {
            return Err(ValidationFailure::NotChatMember.into());
        }
        Ok(())
    }

    async fn require_not_banned(&self, user_id: i32) -> Result<(), ValidateError> {
        if self.storage.is_banned(user_id).await? {
            return Err(ValidationFailure::Banned.into());
        }
        Ok(())
    }

    /// Whether `recipient`'s inbox permit lets `sender` reach them, at chat
    /// creation and on every later message. No permit row means allow-all.
    async fn permits_sender(&self, recipient: i32, sender: i32) -> Result<bool, StorageError> {
        match self.storage.permit_for(recipient).await? {
            None | Some(Permit::All) => Ok(true),
            Some(Permit::None) => Ok(false),
            Some(Permit::Followees) => self.storage.follows(recipient, sender).await,
            Some(Permit::Tippers) => self.storage.has_tipped(sender, recipient).await,
        }
    }
}
