use async_trait::async_trait;
use parley_core::RpcLog;

/// Hook invoked after an envelope commits, for fan-out to live subscribers.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn rpc_applied(&self, envelope: &RpcLog);
}
