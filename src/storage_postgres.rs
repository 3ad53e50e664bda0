use async_trait::async_trait;
use tokio_postgres::Client;

use crate::error::StoreError;
use crate::storage::SubscriptionStore;
use crate::types::SubscriptionRecord;

/// Reads registrations from a `webhook_subscriptions` table.
///
/// `events` holds the serialized filter list, e.g. `["msg-new"]`.
pub struct PostgresSubscriptionStore {
    client: Client,
}

impl PostgresSubscriptionStore {
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhook_subscriptions (
                    target TEXT PRIMARY KEY,
                    events TEXT NOT NULL
                )",
                &[],
            )
            .await?;

        Ok(Self { client })
    }
}

#[async_trait]
impl SubscriptionStore for PostgresSubscriptionStore {
    async fn get_all(&self) -> Result<Vec<SubscriptionRecord>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT target, events FROM webhook_subscriptions ORDER BY target",
                &[],
            )
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let target: String = row
                    .try_get(0)
                    .map_err(|e| StoreError::Decode(e.to_string()))?;
                let events: String = row
                    .try_get(1)
                    .map_err(|e| StoreError::Decode(e.to_string()))?;
                Ok(SubscriptionRecord::new(target, events))
            })
            .collect()
    }
}
