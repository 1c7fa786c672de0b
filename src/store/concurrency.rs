//! Per-source in-flight counters.
//!
//! Soft upper bound on concurrent upstream requests per source. The counter
//! is incremented first and rolled back when over the limit, so two racing
//! acquirers can never both squeeze past a full source.

use redis::AsyncCommands;
use tracing::warn;

use crate::constants::STUCK_SLOT_TTL_SECS;
use crate::error::ProxyError;
use crate::store::models::concurrency_key;

#[derive(Debug, Clone, Copy)]
pub struct Acquire {
    pub allowed: bool,
    pub current: i64,
}

#[derive(Clone)]
pub struct ConcurrencyLedger {
    client: redis::Client,
}

impl ConcurrencyLedger {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    /// Claim a slot on `source_id`. Increment-then-rollback: the counter goes
    /// up first, and comes straight back down if that pushed it past `limit`.
    /// A limit of zero disables the source without touching the counter.
    pub async fn try_acquire(&self, source_id: &str, limit: u64) -> Result<Acquire, ProxyError> {
        if limit == 0 {
            let current = self.read(source_id).await.unwrap_or(0);
            return Ok(Acquire {
                allowed: false,
                current,
            });
        }

        let key = concurrency_key(source_id);
        let mut conn = self.connection().await?;

        let current: i64 = conn.incr(&key, 1).await?;
        if current == 1 {
            // New counter: arm the stuck-slot guard so a dead process
            // cannot pin the source forever.
            let _: bool = conn.expire(&key, STUCK_SLOT_TTL_SECS).await?;
        }

        if current as u64 > limit {
            let after: i64 = conn.decr(&key, 1).await?;
            return Ok(Acquire {
                allowed: false,
                current: after,
            });
        }

        Ok(Acquire {
            allowed: true,
            current,
        })
    }

    /// Give a slot back. Best-effort: a failure here must never fail the
    /// request, so errors are logged and swallowed.
    pub async fn release(&self, source_id: &str) {
        if let Err(e) = self.release_inner(source_id).await {
            warn!(source_id, "failed to release concurrency slot: {e}");
        }
    }

    async fn release_inner(&self, source_id: &str) -> Result<(), redis::RedisError> {
        let key = concurrency_key(source_id);
        let mut conn = self.connection().await?;
        let after: i64 = conn.decr(&key, 1).await?;
        if after < 0 {
            let _: () = conn.set(&key, 0).await?;
        }
        Ok(())
    }

    pub async fn read(&self, source_id: &str) -> Result<i64, ProxyError> {
        let mut conn = self.connection().await?;
        let current: Option<i64> = conn.get(concurrency_key(source_id)).await?;
        Ok(current.unwrap_or(0))
    }
}
