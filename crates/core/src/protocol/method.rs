use serde::{Deserialize, Serialize};

use super::ProtocolError;

/// Who may start a chat with (or message) a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permit {
    None,
    All,
    Followees,
    Tippers,
}

impl Permit {
    pub fn as_str(self) -> &'static str {
        match self {
            Permit::None => "none",
            Permit::All => "all",
            Permit::Followees => "followees",
            Permit::Tippers => "tippers",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatInvite {
    pub user_id: i32,
    pub invite_code: String,
}

/// Closed union of every RPC method this core replicates. The serde tag is
/// the wire method name; an unrecognized name fails decoding, which the
/// processor treats as an explicit drop rather than a panic or a retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum RpcMethod {
    #[serde(rename = "chat.create")]
    ChatCreate {
        chat_id: String,
        invites: Vec<ChatInvite>,
    },
    #[serde(rename = "chat.delete")]
    ChatDelete { chat_id: String },
    #[serde(rename = "chat.message")]
    ChatMessage {
        chat_id: String,
        message_id: String,
        message: String,
    },
    #[serde(rename = "chat.react")]
    ChatReact {
        chat_id: String,
        message_id: String,
        reaction: Option<String>,
    },
    #[serde(rename = "chat.read")]
    ChatRead { chat_id: String },
    #[serde(rename = "chat.permit")]
    ChatPermit { permit: Permit },
    #[serde(rename = "chat.block")]
    ChatBlock { user_id: i32 },
    #[serde(rename = "chat.unblock")]
    ChatUnblock { user_id: i32 },
    #[serde(rename = "chat.blast")]
    ChatBlast { blast_id: String, message: String },
    /// Administrative; never exposed as a public submission method.
    #[serde(rename = "internal.ban")]
    Ban { user_id: i32, is_banned: bool },
}

impl RpcMethod {
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(payload).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    pub fn to_payload(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Wire method name, used for log lines and rate-limit rule lookups.
    pub fn name(&self) -> &'static str {
        match self {
            RpcMethod::ChatCreate { .. } => "chat.create",
            RpcMethod::ChatDelete { .. } => "chat.delete",
            RpcMethod::ChatMessage { .. } => "chat.message",
            RpcMethod::ChatReact { .. } => "chat.react",
            RpcMethod::ChatRead { .. } => "chat.read",
            RpcMethod::ChatPermit { .. } => "chat.permit",
            RpcMethod::ChatBlock { .. } => "chat.block",
            RpcMethod::ChatUnblock { .. } => "chat.unblock",
            RpcMethod::ChatBlast { .. } => "chat.blast",
            RpcMethod::Ban { .. } => "internal.ban",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_chat_create() {
        let payload = r#"{
            "method": "chat.create",
            "params": {
                "chat_id": "69:101",
                "invites": [
                    {"user_id": 69, "invite_code": "earlier"},
                    {"user_id": 101, "invite_code": "earlier"}
                ]
            }
        }"#;
        let method = RpcMethod::from_payload(payload.as_bytes()).expect("decode");
        match method {
            RpcMethod::ChatCreate { chat_id, invites } => {
                assert_eq!(chat_id, "69:101");
                assert_eq!(invites.len(), 2);
                assert_eq!(invites[0].invite_code, "earlier");
            }
            other => panic!("unexpected method: {other:?}"),
        }
    }

    #[test]
    fn decodes_react_removal() {
        let payload =
            r#"{"method":"chat.react","params":{"chat_id":"1:2","message_id":"m1","reaction":null}}"#;
        let method = RpcMethod::from_payload(payload.as_bytes()).expect("decode");
        assert_eq!(
            method,
            RpcMethod::ChatReact {
                chat_id: "1:2".to_string(),
                message_id: "m1".to_string(),
                reaction: None,
            }
        );
    }

    #[test]
    fn rejects_unknown_method() {
        let payload = r#"{"method":"chat.destroy_everything","params":{}}"#;
        assert!(RpcMethod::from_payload(payload.as_bytes()).is_err());
    }

    #[test]
    fn payload_roundtrip() {
        let method = RpcMethod::ChatPermit {
            permit: Permit::Followees,
        };
        let payload = method.to_payload().expect("encode");
        assert!(payload.contains("chat.permit"));
        assert!(payload.contains("followees"));
        let decoded = RpcMethod::from_payload(payload.as_bytes()).expect("decode");
        assert_eq!(decoded, method);
    }

    #[test]
    fn ban_is_internal() {
        let payload = r#"{"method":"internal.ban","params":{"user_id":7,"is_banned":true}}"#;
        let method = RpcMethod::from_payload(payload.as_bytes()).expect("decode");
        assert_eq!(method.name(), "internal.ban");
    }
}
