#![forbid(unsafe_code)]

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{extract::State, http::StatusCode, Router};
use chrono::{DateTime, Utc};
use parley_auth::WalletKey;
use parley_engine::{PeerSet, RpcProcessor};
use parley_storage::PostgresStorage;

mod comms;
mod stream;
mod wire;

pub use stream::BroadcastNotifier;

#[derive(Clone)]
pub struct ApiState {
    inner: Arc<ApiStateInner>,
}

struct ApiStateInner {
    host: String,
    key: Arc<WalletKey>,
    storage: PostgresStorage,
    processor: RpcProcessor,
    peers: PeerSet,
    notifier: BroadcastNotifier,
    booted_at: DateTime<Utc>,
}

impl ApiState {
    #[must_use]
    pub fn new(
        host: String,
        key: Arc<WalletKey>,
        storage: PostgresStorage,
        processor: RpcProcessor,
        peers: PeerSet,
        notifier: BroadcastNotifier,
    ) -> Self {
        Self {
            inner: Arc::new(ApiStateInner {
                host,
                key,
                storage,
                processor,
                peers,
                notifier,
                booted_at: Utc::now(),
            }),
        }
    }

    fn host(&self) -> &str {
        &self.inner.host
    }

    fn key(&self) -> &WalletKey {
        &self.inner.key
    }

    fn storage(&self) -> &PostgresStorage {
        &self.inner.storage
    }

    fn processor(&self) -> &RpcProcessor {
        &self.inner.processor
    }

    fn peers(&self) -> &PeerSet {
        &self.inner.peers
    }

    fn notifier(&self) -> &BroadcastNotifier {
        &self.inner.notifier
    }

    fn booted_at(&self) -> DateTime<Utc> {
        self.inner.booted_at
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/comms", get(comms::status))
        .route("/comms/mutate", post(comms::mutate))
        .route("/comms/rpc/receive", post(comms::receive))
        .route("/comms/rpc/bulk", get(comms::bulk))
        .route("/comms/rpc/stream", get(stream::stream))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> StatusCode {
    match state.storage().ping().await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
