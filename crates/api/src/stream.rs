//! Live feed of freshly applied envelopes over server-sent events, backed by
//! a broadcast channel the processor publishes into.

use std::convert::Infallible;

use async_trait::async_trait;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};
use parley_core::RpcLog;
use parley_engine::Notifier;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::ApiState;

/// Fan-out point between the apply pipeline and SSE subscribers. Slow
/// subscribers lag and miss events rather than applying backpressure; the
/// feed is advisory, the log is the source of truth.
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<RpcLog>,
}

impl BroadcastNotifier {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RpcLog> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn rpc_applied(&self, envelope: &RpcLog) {
        // Send only fails when nobody is subscribed.
        let _ = self.tx.send(envelope.clone());
    }
}

/// GET /comms/rpc/stream.
pub(crate) async fn stream(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.notifier().subscribe();
    let events = BroadcastStream::new(rx).filter_map(|result| async move {
        let envelope = result.ok()?;
        let data = serde_json::to_string(&envelope).ok()?;
        Some(Ok(Event::default().event("rpc").data(data)))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}
