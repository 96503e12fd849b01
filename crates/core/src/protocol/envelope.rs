use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ProtocolError;

/// The unit of replication: a signed, opaque RPC payload plus the metadata
/// needed to replay it on any peer.
///
/// `sig` doubles as the envelope's identity: the durable log holds at most
/// one row per signature, and inserting a duplicate is a no-op rather than an
/// error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcLog {
    /// Base URL of the node the envelope first entered the network through.
    #[serde(rename = "relayed_by")]
    pub relayed_by: String,
    /// Caller-supplied logical timestamp; all last-write-wins comparisons key
    /// off this value, never off local wall clocks.
    #[serde(rename = "relayed_at")]
    pub relayed_at: DateTime<Utc>,
    /// Local wall-clock time of successful application. Set by each node on
    /// insert; the pull path uses it as its cursor watermark.
    #[serde(rename = "applied_at", skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    /// Wallet address the signature must recover to.
    #[serde(rename = "from_wallet")]
    pub from_wallet: String,
    /// The raw JSON payload text exactly as the caller signed it.
    #[serde(rename = "rpc")]
    pub rpc: String,
    /// base64 of the 65-byte recoverable signature over `rpc`.
    #[serde(rename = "sig")]
    pub sig: String,
}

/// Wire framing negotiated per request: JSON by default, msgpack when the
/// `?msgpack=t` flag and content type say so.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Json,
    Msgpack,
}

impl RpcLog {
    pub fn encode(&self, format: WireFormat) -> Result<Vec<u8>, ProtocolError> {
        match format {
            WireFormat::Json => {
                serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))
            }
            WireFormat::Msgpack => {
                rmp_serde::to_vec_named(self).map_err(|e| ProtocolError::Encode(e.to_string()))
            }
        }
    }

    pub fn decode(bytes: &[u8], format: WireFormat) -> Result<Self, ProtocolError> {
        match format {
            WireFormat::Json => {
                serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
            }
            WireFormat::Msgpack => {
                rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
            }
        }
    }

    pub fn encode_batch(batch: &[Self], format: WireFormat) -> Result<Vec<u8>, ProtocolError> {
        match format {
            WireFormat::Json => {
                serde_json::to_vec(batch).map_err(|e| ProtocolError::Encode(e.to_string()))
            }
            WireFormat::Msgpack => {
                rmp_serde::to_vec_named(batch).map_err(|e| ProtocolError::Encode(e.to_string()))
            }
        }
    }

    pub fn decode_batch(bytes: &[u8], format: WireFormat) -> Result<Vec<Self>, ProtocolError> {
        match format {
            WireFormat::Json => {
                serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
            }
            WireFormat::Msgpack => {
                rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
            }
        }
    }

    /// Decodes the opaque payload into its typed method call.
    pub fn method(&self) -> Result<super::RpcMethod, ProtocolError> {
        super::RpcMethod::from_payload(self.rpc.as_bytes())
    }
}
