use std::sync::Arc;

use parley_auth::{AuthError, WalletKey};
use parley_core::{ProtocolError, RpcLog, WireFormat, MSGPACK_CONTENT_TYPE, MSGPACK_QUERY_FLAG, SIG_HEADER};
use reqwest::header::CONTENT_TYPE;
use tokio::sync::mpsc;

/// A remote node we gossip with: where to reach it and which wallet its
/// requests must be signed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Base URL without a trailing slash.
    pub host: String,
    pub wallet: String,
}

/// Bounded, non-blocking queue in front of a peer's push task. When the peer
/// is slow or down the queue fills and pushes are dropped; the sweeper's pull
/// phase recovers whatever gossip misses, so dropping is safe.
pub struct Outbox {
    tx: mpsc::Sender<RpcLog>,
}

impl Outbox {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RpcLog>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Returns false when the queue is full (or the push task is gone) and
    /// the envelope was dropped.
    pub fn push(&self, envelope: RpcLog) -> bool {
        self.tx.try_send(envelope).is_ok()
    }
}

#[derive(Debug, thiserror::Error)]
enum PushError {
    #[error(transparent)]
    Encode(#[from] ProtocolError),
    #[error(transparent)]
    Sign(#[from] AuthError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Push half of gossip: a queue plus a background task that POSTs each
/// applied envelope to one peer's receive endpoint.
pub struct PeerClient {
    config: PeerConfig,
    outbox: Outbox,
}

impl PeerClient {
    pub fn spawn(
        config: PeerConfig,
        key: Arc<WalletKey>,
        http: reqwest::Client,
        capacity: usize,
    ) -> Self {
        let (outbox, mut rx) = Outbox::new(capacity);
        let url = format!("{}/comms/rpc/receive?{MSGPACK_QUERY_FLAG}=t", config.host);
        let host = config.host.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(error) = push_one(&http, &url, &key, &envelope).await {
                    tracing::warn!(peer = %host, sig = %envelope.sig, %error, "push failed");
                }
            }
        });
        Self { config, outbox }
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn enqueue(&self, envelope: RpcLog) {
        if !self.outbox.push(envelope) {
            tracing::warn!(peer = %self.config.host, "outbox full, dropping push");
        }
    }
}

async fn push_one(
    http: &reqwest::Client,
    url: &str,
    key: &WalletKey,
    envelope: &RpcLog,
) -> Result<(), PushError> {
    let body = envelope.encode(WireFormat::Msgpack)?;
    let sig = key.sign(&body)?;
    http.post(url)
        .header(SIG_HEADER, sig)
        .header(CONTENT_TYPE, MSGPACK_CONTENT_TYPE)
        .body(body)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

/// Every peer this node gossips with.
pub struct PeerSet {
    peers: Vec<PeerClient>,
}

impl PeerSet {
    pub fn new(peers: Vec<PeerClient>) -> Self {
        Self { peers }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn configs(&self) -> impl Iterator<Item = &PeerConfig> {
        self.peers.iter().map(PeerClient::config)
    }

    /// Whether a wallet belongs to a configured peer; the receive endpoint
    /// only accepts pushes signed by one of these.
    pub fn is_peer_wallet(&self, wallet: &str) -> bool {
        self.peers
            .iter()
            .any(|peer| peer.config.wallet.eq_ignore_ascii_case(wallet))
    }

    /// Best-effort fan-out of a freshly applied envelope to every peer.
    pub fn broadcast(&self, envelope: &RpcLog) {
        for peer in &self.peers {
            peer.enqueue(envelope.clone());
        }
    }
}
