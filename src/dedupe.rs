use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::poller::CacheTrimmer;
use crate::types::{Timestamp, MINUTE_MS};
use crate::window::MAX_LOOKBACK_MS;

/// Bounded set of already-emitted record keys.
///
/// Pollers see overlapping windows, so the same record can come back on
/// consecutive cycles. A poller consults `first_seen` before producing an
/// event; the coordinator calls `trim_caches` once per cycle.
pub struct SeenCache {
    seen: Mutex<HashMap<String, Timestamp>>,
    retention_ms: Timestamp,
    max_entries: usize,
    clock: Arc<dyn Clock>,
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl SeenCache {
    /// Defaults:
    /// - retention: the widest window a poller can be asked for, plus a minute
    /// - max_entries: 100_000
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            retention_ms: MAX_LOOKBACK_MS + MINUTE_MS,
            max_entries: 100_000,
            clock,
        }
    }

    pub fn with_retention_ms(mut self, retention_ms: Timestamp) -> Self {
        self.retention_ms = retention_ms.max(0);
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    /// Record `key`; returns `true` the first time it is seen.
    pub async fn first_seen(&self, key: impl Into<String>) -> bool {
        let now = self.clock.now_ms();
        let mut guard = self.seen.lock().await;
        let key = key.into();
        if guard.contains_key(&key) {
            return false;
        }
        guard.insert(key, now);
        true
    }

    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.seen.lock().await.is_empty()
    }

    async fn trim(&self) -> usize {
        let cutoff = self.clock.now_ms() - self.retention_ms;
        let mut guard = self.seen.lock().await;
        let before = guard.len();

        guard.retain(|_, seen_at| *seen_at >= cutoff);

        if guard.len() > self.max_entries {
            let mut by_age: Vec<(Timestamp, String)> =
                guard.iter().map(|(k, t)| (*t, k.clone())).collect();
            by_age.sort();
            let excess = guard.len() - self.max_entries;
            for (_, key) in by_age.into_iter().take(excess) {
                guard.remove(&key);
            }
        }

        before - guard.len()
    }
}

#[async_trait]
impl CacheTrimmer for SeenCache {
    async fn trim_caches(&self) {
        let evicted = self.trim().await;
        if evicted > 0 {
            tracing::debug!(evicted, "trimmed seen cache");
        }
    }
}
