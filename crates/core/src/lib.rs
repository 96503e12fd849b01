#![forbid(unsafe_code)]

pub mod protocol;

pub use protocol::{
    blast_message_id, dm_chat_id, ChatInvite, Permit, ProtocolError, RpcLog, RpcMethod, WireFormat,
};

/// Query flag and content type used to negotiate the alternate binary wire
/// format on the peer-to-peer endpoints.
pub const MSGPACK_QUERY_FLAG: &str = "msgpack";
pub const MSGPACK_CONTENT_TYPE: &str = "application/msgpack";

/// Signature header carried on signed requests, user-originated and
/// peer-originated alike.
pub const SIG_HEADER: &str = "x-sig";

/// Nonce header signed by peers on GET requests (an RFC3339 timestamp).
pub const NONCE_HEADER: &str = "x-nonce";
