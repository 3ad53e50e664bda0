use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::storage::SubscriptionStore;
use crate::telemetry::metric_inc;
use crate::types::{Subscription, Timestamp};

/// Parsed subscriptions, valid while `now < expires_at`.
#[derive(Debug)]
pub struct SubscriptionCacheEntry {
    pub subscriptions: Vec<Subscription>,
    pub expires_at: Timestamp,
}

impl SubscriptionCacheEntry {
    pub fn is_fresh(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }
}

/// Memoizes the subscription store for a fixed TTL.
///
/// Entries are replaced, never mutated, so readers holding an `Arc` to an
/// old entry are unaffected by a refresh or invalidation.
pub struct SubscriptionCache {
    store: Arc<dyn SubscriptionStore>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entry: RwLock<Option<Arc<SubscriptionCacheEntry>>>,
    fill_lock: Mutex<()>,
    generation: AtomicU64,
}

impl SubscriptionCache {
    pub fn new(store: Arc<dyn SubscriptionStore>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            ttl,
            clock,
            entry: RwLock::new(None),
            fill_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Current subscriptions, reading the store if the entry is missing
    /// or expired.
    pub async fn get(&self) -> Result<Arc<SubscriptionCacheEntry>, StoreError> {
        if let Some(entry) = self.fresh_entry().await {
            return Ok(entry);
        }

        // One concurrent fill; latecomers reuse its result.
        let _fill = self.fill_lock.lock().await;
        if let Some(entry) = self.fresh_entry().await {
            return Ok(entry);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let records = self.store.get_all().await?;

        let subscriptions: Vec<Subscription> = records
            .iter()
            .filter_map(|record| match Subscription::parse(record) {
                Ok(sub) => Some(sub),
                Err(err) => {
                    tracing::warn!(url = %record.target, error = %err, "skipping subscription");
                    None
                }
            })
            .collect();

        let entry = Arc::new(SubscriptionCacheEntry {
            subscriptions,
            expires_at: self.clock.now_ms() + self.ttl.as_millis() as Timestamp,
        });

        // An invalidation during the read means this data may already be stale.
        if self.generation.load(Ordering::SeqCst) == generation {
            *self.entry.write().await = Some(entry.clone());
        }

        metric_inc("relay.cache.refresh");
        tracing::debug!(count = entry.subscriptions.len(), "subscription cache refreshed");
        Ok(entry)
    }

    /// Discard the cached entry; the next `get` reads the store.
    pub async fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entry.write().await.take();
    }

    async fn fresh_entry(&self) -> Option<Arc<SubscriptionCacheEntry>> {
        let now = self.clock.now_ms();
        let guard = self.entry.read().await;
        guard.as_ref().filter(|e| e.is_fresh(now)).cloned()
    }
}
