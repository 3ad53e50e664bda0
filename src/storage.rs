use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::types::SubscriptionRecord;

/// Persistent source of webhook registrations.
///
/// Only read by the relay. Whoever mutates registrations should call
/// `Dispatcher::invalidate_subscriptions` afterwards.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<SubscriptionRecord>, StoreError>;
}

/// In-memory storage for lightweight deployments.
#[derive(Default)]
pub struct InMemorySubscriptionStore {
    records: Mutex<Vec<SubscriptionRecord>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<SubscriptionRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    /// Insert a registration, replacing any existing one for the same target.
    pub async fn upsert(&self, record: SubscriptionRecord) {
        let mut records = self.records.lock().await;
        match records.iter_mut().find(|r| r.target == record.target) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    pub async fn remove(&self, target: &str) -> bool {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|r| r.target != target);
        records.len() != before
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn get_all(&self) -> Result<Vec<SubscriptionRecord>, StoreError> {
        Ok(self.records.lock().await.clone())
    }
}
