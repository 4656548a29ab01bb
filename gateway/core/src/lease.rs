use std::time::Duration;

/// A distributed, exclusive, renewable lease.
///
/// Exclusivity is enforced by the implementation's backing store, not by local coordination.
#[async_trait::async_trait]
pub trait LeaseLock: Send + Sync + 'static {
    /// The name of the lock guarded by this lease.
    fn name(&self) -> &str;

    /// Claims the lease for `node_id` or extends its claim. Returns false when another node holds
    /// an unexpired claim.
    async fn try_acquire_or_renew(&self, node_id: &str, duration: Duration) -> anyhow::Result<bool>;

    /// Gives up `node_id`'s claim so that another node may acquire the lease without waiting for
    /// it to expire.
    async fn release(&self, node_id: &str) -> anyhow::Result<()>;
}
