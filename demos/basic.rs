use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing_subscriber::EnvFilter;
use webhook_relay::{
    notifier_channel, CoordinatorConfig, Dispatcher, DispatcherConfig, DomainEvent,
    InMemorySubscriptionStore, NotifierSignal, PollCoordinator, Poller, PollerError, SeenCache,
    SubscriptionRecord, Timestamp,
};

/// Pretends a new message row lands every poll.
struct MessagePoller {
    next_id: AtomicU64,
    seen: Arc<SeenCache>,
}

#[async_trait]
impl Poller for MessagePoller {
    fn name(&self) -> &str {
        "messages"
    }

    async fn poll(&self, after: Timestamp) -> Result<Vec<DomainEvent>, PollerError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if !self.seen.first_seen(format!("msg-{id}")).await {
            return Ok(Vec::new());
        }
        Ok(vec![DomainEvent::new("msg-new", json!({ "id": id, "after": after }))])
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let store = Arc::new(InMemorySubscriptionStore::new());
    store
        .upsert(SubscriptionRecord::with_filters("https://example.com/webhook", ["msg-new"]))
        .await;

    let dispatcher = Arc::new(Dispatcher::with_http(DispatcherConfig::default(), store));

    let seen = Arc::new(SeenCache::default());
    let coordinator = PollCoordinator::builder(CoordinatorConfig::from_env()?)
        .poller(Arc::new(MessagePoller {
            next_id: AtomicU64::new(1),
            seen: seen.clone(),
        }))
        .trimmer(seen)
        .build();
    coordinator.emitter().on_any(dispatcher.clone()).await;

    let (tx, rx) = notifier_channel(64);
    coordinator.start(Some(rx)).await;

    tx.send(NotifierSignal::Change(vec!["/data/messages.db".into()])).await?;
    tokio::time::sleep(Duration::from_secs(2)).await;

    coordinator.stop().await;
    dispatcher.drain(Duration::from_secs(5)).await;
    Ok(())
}
