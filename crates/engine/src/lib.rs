#![forbid(unsafe_code)]

//! The replication engine: everything between the wire and the database.
//!
//! An envelope entering this crate (from a local caller, a peer push, or the
//! sweeper's pull) flows through the same pipeline: idempotence check, signer
//! recovery, identity resolution, validation, and a single transaction that
//! logs the envelope and dispatches its conflict-resolution handler. Peers
//! converge because every node runs this identical deterministic pipeline
//! against its own copy of the state.

mod limiter;
mod notify;
mod peer;
mod processor;
mod sweeper;
mod validator;

#[cfg(test)]
pub(crate) mod test_support;

pub use limiter::{RateLimitRule, RateLimiter};
pub use notify::Notifier;
pub use peer::{Outbox, PeerClient, PeerConfig, PeerSet};
pub use processor::{ApplyOutcome, RpcProcessor, SkipReason};
pub use sweeper::{SweepConfig, Sweeper};
pub use validator::{ValidateError, ValidationFailure, Validator};

use parley_storage::StorageError;

/// Failures that abort an apply and are worth retrying on a later sweep.
/// Everything else (malformed envelopes, validation rejections) is a logged
/// drop, not an error, because retrying cannot fix it.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}
