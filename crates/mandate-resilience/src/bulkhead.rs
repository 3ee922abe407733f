//! Bounded-concurrency bulkhead.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use mandate_types::{Error, OpContext, Result};

/// Bulkhead parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkheadConfig {
    /// Maximum calls in flight at once.
    #[serde(rename = "max")]
    pub max_concurrent: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { max_concurrent: 32 }
    }
}

/// Bounded semaphore isolating a resource from concurrency spikes.
#[derive(Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl Bulkhead {
    /// Create a bulkhead admitting at most `config.max_concurrent` calls.
    pub fn new(config: BulkheadConfig) -> Self {
        let capacity = config.max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Acquire a slot, waiting if the bulkhead is full.
    ///
    /// Cancellation or deadline expiry while waiting surfaces the
    /// corresponding error without consuming a slot.
    pub async fn acquire(&self, ctx: &OpContext) -> Result<OwnedSemaphorePermit> {
        let semaphore = self.semaphore.clone();
        ctx.run(async move {
            semaphore
                .acquire_owned()
                .await
                .map_err(|_| Error::internal("bulkhead semaphore closed"))
        })
        .await
    }

    /// Run `fut` inside a slot; the slot is released on every exit path.
    pub async fn execute<T, Fut>(&self, ctx: &OpContext, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire(ctx).await?;
        let out = ctx.run(fut).await;
        drop(permit);
        out
    }
}
