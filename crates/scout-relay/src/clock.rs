use async_trait::async_trait;
use std::time::Duration;

/// Source of the pause between relay cycles. Swapped out in tests so the
/// loop can be driven without real sleeping.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, d: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await
    }
}
