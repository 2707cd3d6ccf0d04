/*!
 * # Counter Store
 *
 * Thin client over the shared atomic-counter store that backs admission
 * decisions. The store is the only durable state in this subsystem: callers
 * increment namespaced counters and arm a TTL on the increment that creates
 * the key, and the store expires windows on its own.
 *
 * Two backends ship here:
 *
 * - `RedisCounterStore` for multi-instance deployments (INCR / EXPIRE / TTL)
 * - `InMemoryCounterStore` for single-node deployments and tests
 *
 * Every Redis round-trip carries a short timeout; a timeout surfaces as
 * `StoreError::Timeout` so callers can fail open without adding latency to
 * the request path.
 */

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::Instant;

/// Failure talking to the counter store. All variants are recoverable by
/// policy (fail-open); none should abort a request.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("counter store connection failed: {0}")]
    Connection(String),
    #[error("counter store backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_io_error() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

/// Contract for the external atomic-counter service.
///
/// Atomicity is the store's guarantee, not this subsystem's: two concurrent
/// increments for the same key must observe two distinct counts.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increments `key`, creating it at 1 when absent.
    async fn increment(&self, key: &str) -> Result<u64, StoreError>;

    /// Sets the expiry for `key`. Callers arm this exactly once, on the
    /// increment that took the counter from 0 to 1.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Remaining time until `key` expires, or `None` when the key is absent
    /// or carries no expiry.
    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>, StoreError>;
}

/// Redis-backed counter store with namespaced keys and bounded round-trips.
#[derive(Clone)]
pub struct RedisCounterStore {
    client: Arc<redis::Client>,
    namespace: String,
    op_timeout: Duration,
}

impl RedisCounterStore {
    pub fn new(client: Arc<redis::Client>, namespace: impl Into<String>, op_timeout: Duration) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            op_timeout,
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StoreError> {
        self.client
            .get_async_connection()
            .await
            .map_err(StoreError::from)
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>> + Send,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.op_timeout))?
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        let redis_key = self.namespaced(key);
        self.bounded(async {
            let mut conn = self.connection().await?;
            let count: i64 = conn.incr(&redis_key, 1).await?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let redis_key = self.namespaced(key);
        let secs = ttl.as_secs().max(1) as usize;
        self.bounded(async {
            let mut conn = self.connection().await?;
            conn.expire(&redis_key, secs).await.map_err(StoreError::from)
        })
        .await
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let redis_key = self.namespaced(key);
        self.bounded(async {
            let mut conn = self.connection().await?;
            // TTL returns -2 for a missing key and -1 for a key without expiry.
            let ttl: i64 = conn.ttl(&redis_key).await?;
            Ok((ttl > 0).then(|| Duration::from_secs(ttl as u64)))
        })
        .await
    }
}

#[derive(Debug)]
struct CounterSlot {
    count: u64,
    deadline: Option<Instant>,
}

impl CounterSlot {
    fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// In-memory counter store for redis-less deployments and tests. Uses the
/// tokio clock so paused-time tests can drive window expiry.
#[derive(Clone, Default)]
pub struct InMemoryCounterStore {
    slots: Arc<DashMap<String, CounterSlot>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        let mut slot = self.slots.entry(key.to_string()).or_insert(CounterSlot {
            count: 0,
            deadline: None,
        });
        if slot.expired() {
            slot.count = 0;
            slot.deadline = None;
        }
        slot.count += 1;
        Ok(slot.count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        if let Some(mut slot) = self.slots.get_mut(key) {
            slot.deadline = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let Some(slot) = self.slots.get(key) else {
            return Ok(None);
        };
        if slot.expired() {
            return Ok(None);
        }
        Ok(slot
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now())))
    }
}
