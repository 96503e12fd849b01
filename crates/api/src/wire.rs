//! Per-request wire format negotiation. JSON is the default; the peer
//! endpoints switch to msgpack when the query flag asks for it.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use parley_core::{WireFormat, MSGPACK_CONTENT_TYPE};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WireParams {
    pub msgpack: Option<String>,
    pub after: Option<String>,
}

impl WireParams {
    pub fn format(&self) -> WireFormat {
        match self.msgpack.as_deref() {
            Some("t") | Some("true") | Some("1") => WireFormat::Msgpack,
            _ => WireFormat::Json,
        }
    }
}

/// Wraps pre-encoded wire bytes with the matching content type.
pub(crate) fn encoded_response(bytes: Vec<u8>, format: WireFormat) -> Response {
    let content_type = match format {
        WireFormat::Json => "application/json",
        WireFormat::Msgpack => MSGPACK_CONTENT_TYPE,
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))],
        bytes,
    )
        .into_response()
}
