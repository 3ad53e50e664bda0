use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

struct Pending {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Per-key timer table.
///
/// Scheduling a key that already has a pending timer cancels that timer
/// and starts a new one, so a burst of calls closer together than `wait`
/// runs the action exactly once, `wait` after the last call.
pub struct Debouncer<K> {
    pending: Arc<Mutex<HashMap<K, Pending>>>,
    next_generation: AtomicU64,
}

impl<K> Default for Debouncer<K> {
    fn default() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` to run after `wait`, replacing any pending timer
    /// for `key`. Returns `true` if a pending timer was replaced.
    pub async fn schedule_or_reset<F, Fut>(&self, key: K, wait: Duration, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        // Held across spawn + insert so the new timer always finds its own entry.
        let mut guard = self.pending.lock().await;

        let table = self.pending.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            sleep(wait).await;
            {
                let mut guard = table.lock().await;
                match guard.get(&task_key) {
                    Some(p) if p.generation == generation => {
                        guard.remove(&task_key);
                    }
                    _ => return,
                }
            }
            action().await;
        });

        match guard.insert(key, Pending { generation, handle }) {
            Some(previous) => {
                previous.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel the pending timer for `key`, if any.
    ///
    /// An action that already started running is not interrupted.
    pub async fn cancel(&self, key: &K) -> bool {
        let mut guard = self.pending.lock().await;
        match guard.remove(key) {
            Some(p) => {
                p.handle.abort();
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) {
        let mut guard = self.pending.lock().await;
        for (_, p) in guard.drain() {
            p.handle.abort();
        }
    }

    pub async fn is_pending(&self, key: &K) -> bool {
        self.pending.lock().await.contains_key(key)
    }
}
