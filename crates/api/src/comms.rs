//! The `/comms` surface: user submissions, peer push and pull, and the
//! operator status view. Peer requests are authenticated by signature
//! recovery against the configured peer wallets; user submissions carry
//! their own signature inside the envelope.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use parley_auth::{check_nonce, recover_wallet, DEFAULT_NONCE_MAX_AGE};
use parley_core::{RpcLog, NONCE_HEADER, SIG_HEADER};
use parley_engine::{ApplyOutcome, SkipReason, ValidationFailure};
use parley_storage::FailedRpc;
use serde::Serialize;

use crate::wire::{encoded_response, WireParams};
use crate::ApiState;

/// Page size of the bulk endpoint; pullers advance their cursor and ask
/// again for the rest.
const BULK_LIMIT: i64 = 10_000;

pub(crate) enum ApiError {
    BadRequest(String),
    Unauthorized(&'static str),
    Forbidden(&'static str),
    TooManyRequests(String),
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Unauthorized(message) => (StatusCode::UNAUTHORIZED, message.to_string()),
            ApiError::Forbidden(message) => (StatusCode::FORBIDDEN, message.to_string()),
            ApiError::TooManyRequests(message) => (StatusCode::TOO_MANY_REQUESTS, message),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };
        (status, message).into_response()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, ApiError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::Unauthorized("missing signature header"))
}

/// Maps a terminal skip to the client-facing status for direct submissions.
fn skip_response(reason: SkipReason) -> ApiError {
    match reason {
        SkipReason::BadSignature(_) | SkipReason::SignerMismatch => {
            ApiError::Unauthorized("signature does not verify")
        }
        SkipReason::UnknownSigner => ApiError::Unauthorized("unknown wallet"),
        SkipReason::Undecodable(detail) => ApiError::BadRequest(detail),
        SkipReason::Rejected(ValidationFailure::RateLimited(rule)) => {
            ApiError::TooManyRequests(format!("rate limited: {rule}"))
        }
        SkipReason::Rejected(failure) => ApiError::BadRequest(failure.to_string()),
    }
}

/// POST /comms/mutate. A user submits a signed RPC payload; this node wraps
/// it in an envelope, applies it, and gossips it to every peer.
pub(crate) async fn mutate(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RpcLog>, ApiError> {
    let sig = header_str(&headers, SIG_HEADER)?;
    let wallet = recover_wallet(&body, sig)
        .map_err(|_| ApiError::Unauthorized("signature does not verify"))?;
    let rpc = String::from_utf8(body.to_vec())
        .map_err(|_| ApiError::BadRequest("payload is not valid utf-8".to_string()))?;

    let envelope = RpcLog {
        relayed_by: state.host().to_string(),
        relayed_at: Utc::now(),
        applied_at: None,
        from_wallet: wallet,
        rpc,
        sig: sig.to_string(),
    };
    // Administrative methods only enter over the peer channel.
    if let Ok(method) = envelope.method() {
        if method.name().starts_with("internal.") {
            return Err(ApiError::Forbidden("method is not externally callable"));
        }
    }

    let outcome = state
        .processor()
        .apply_and_publish(&envelope, state.notifier())
        .await
        .map_err(|error| {
            tracing::error!(%error, "mutate apply failed");
            ApiError::Internal
        })?;
    match outcome {
        ApplyOutcome::Applied => {
            state.peers().broadcast(&envelope);
            Ok(Json(envelope))
        }
        ApplyOutcome::AlreadyApplied => Ok(Json(envelope)),
        ApplyOutcome::Skipped(reason) => Err(skip_response(reason)),
    }
}

/// POST /comms/rpc/receive. A peer pushes one envelope; the request body is
/// signed by the peer's node wallet.
pub(crate) async fn receive(
    State(state): State<ApiState>,
    Query(params): Query<WireParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let sig = header_str(&headers, SIG_HEADER)?;
    let wallet = recover_wallet(&body, sig)
        .map_err(|_| ApiError::Unauthorized("signature does not verify"))?;
    if !state.peers().is_peer_wallet(&wallet) {
        return Err(ApiError::Forbidden("not a configured peer"));
    }

    let envelope = RpcLog::decode(&body, params.format())
        .map_err(|error| ApiError::BadRequest(error.to_string()))?;
    match state
        .processor()
        .apply_and_publish(&envelope, state.notifier())
        .await
    {
        // Skips included: the push is acknowledged either way, the peer has
        // nothing more useful to do with it.
        Ok(_) => Ok(StatusCode::OK),
        Err(error) => {
            // Park it in the retry queue; the sweeper owns it from here.
            state
                .storage()
                .record_failure(&envelope, &error.to_string())
                .await
                .map_err(|record_error| {
                    tracing::error!(%record_error, "failed to queue retry");
                    ApiError::Internal
                })?;
            tracing::warn!(sig = %envelope.sig, %error, "received rpc queued for retry");
            Ok(StatusCode::OK)
        }
    }
}

/// GET /comms/rpc/bulk. A peer pulls everything applied locally after its
/// cursor. Authenticated by a signed, fresh nonce header.
pub(crate) async fn bulk(
    State(state): State<ApiState>,
    Query(params): Query<WireParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let sig = header_str(&headers, SIG_HEADER)?;
    let nonce = headers
        .get(NONCE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::Unauthorized("missing nonce header"))?;
    check_nonce(nonce, Utc::now(), DEFAULT_NONCE_MAX_AGE)
        .map_err(|_| ApiError::Unauthorized("stale or malformed nonce"))?;
    let wallet = recover_wallet(nonce.as_bytes(), sig)
        .map_err(|_| ApiError::Unauthorized("signature does not verify"))?;
    if !state.peers().is_peer_wallet(&wallet) {
        return Err(ApiError::Forbidden("not a configured peer"));
    }

    let after = match params.after.as_deref() {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map_err(|error| ApiError::BadRequest(format!("invalid cursor: {error}")))?
            .with_timezone(&Utc),
        None => DateTime::UNIX_EPOCH,
    };
    let batch = state
        .storage()
        .rpc_log_after(after, BULK_LIMIT)
        .await
        .map_err(|error| {
            tracing::error!(%error, "bulk read failed");
            ApiError::Internal
        })?;

    let format = params.format();
    let bytes = RpcLog::encode_batch(&batch, format).map_err(|error| {
        tracing::error!(%error, "bulk encode failed");
        ApiError::Internal
    })?;
    Ok(encoded_response(bytes, format))
}

#[derive(Serialize)]
pub(crate) struct StatusBody {
    host: String,
    wallet: String,
    booted_at: DateTime<Utc>,
    healthy: bool,
    peers: Vec<String>,
    failed: Vec<FailedRpc>,
}

/// GET /comms. Operator view: identity, liveness, configured peers, and the
/// most recent retry-queue entries.
pub(crate) async fn status(State(state): State<ApiState>) -> Result<Json<StatusBody>, ApiError> {
    let healthy = state.storage().ping().await.is_ok();
    let failed = state
        .storage()
        .recent_failures(20)
        .await
        .unwrap_or_default();
    Ok(Json(StatusBody {
        host: state.host().to_string(),
        wallet: state.key().wallet().to_string(),
        booted_at: state.booted_at(),
        healthy,
        peers: state.peers().configs().map(|peer| peer.host.clone()).collect(),
        failed,
    }))
}
