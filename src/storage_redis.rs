use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::StoreError;
use crate::storage::SubscriptionStore;
use crate::types::SubscriptionRecord;

/// Reads registrations from the hash `<prefix>:subscriptions`.
///
/// Field is the target URI, value the serialized filter list.
pub struct RedisSubscriptionStore {
    client: redis::Client,
    prefix: String,
}

impl RedisSubscriptionStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn subscriptions_key(&self) -> String {
        format!("{}:subscriptions", self.prefix)
    }
}

#[async_trait]
impl SubscriptionStore for RedisSubscriptionStore {
    async fn get_all(&self) -> Result<Vec<SubscriptionRecord>, StoreError> {
        let mut conn = self
            .client
            .get_tokio_connection()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let map: HashMap<String, String> = conn
            .hgetall(self.subscriptions_key())
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut records: Vec<SubscriptionRecord> = map
            .into_iter()
            .map(|(target, events)| SubscriptionRecord::new(target, events))
            .collect();
        records.sort_by(|a, b| a.target.cmp(&b.target));
        Ok(records)
    }
}
