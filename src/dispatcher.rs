use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::cache::SubscriptionCache;
use crate::clock::{Clock, SystemClock};
use crate::emitter::EventListener;
use crate::storage::SubscriptionStore;
use crate::telemetry::metric_inc;
use crate::transport::Transport;
use crate::types::{DomainEvent, Subscription};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long a subscription store read is reused.
    pub cache_ttl: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Fans events out to matching webhook subscriptions.
///
/// Every matching subscription gets its own spawned delivery task.
/// `dispatch` returns as soon as the tasks are spawned; outcomes are
/// only logged. There is no retry, no backoff and no concurrency cap.
pub struct Dispatcher {
    cache: SubscriptionCache,
    transport: Arc<dyn Transport>,
    in_flight: Arc<InFlight>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        store: Arc<dyn SubscriptionStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::with_clock(config, store, transport, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: DispatcherConfig,
        store: Arc<dyn SubscriptionStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache: SubscriptionCache::new(store, config.cache_ttl, clock),
            transport,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Dispatcher delivering over HTTP with a default `reqwest` client.
    #[cfg(feature = "http")]
    pub fn with_http(config: DispatcherConfig, store: Arc<dyn SubscriptionStore>) -> Self {
        Self::new(config, store, Arc::new(crate::transport::HttpTransport::new()))
    }

    /// Start one delivery per matching subscription.
    ///
    /// Returns the number of deliveries started, not delivered.
    pub async fn dispatch(&self, event: DomainEvent) -> usize {
        let entry = match self.cache.get().await {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(event_type = %event.event_type, error = %err, "cannot load subscriptions; event not dispatched");
                return 0;
            }
        };

        let matched: Vec<&Subscription> = entry
            .subscriptions
            .iter()
            .filter(|sub| sub.matches(&event.event_type))
            .collect();

        if matched.is_empty() {
            return 0;
        }

        let body = match serde_json::to_vec(&event) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(event_type = %event.event_type, error = %err, "cannot encode event");
                return 0;
            }
        };

        for sub in &matched {
            let guard = self.in_flight.enter();
            let transport = self.transport.clone();
            let url = sub.target.clone();
            let body = body.clone();
            let event_type = event.event_type.clone();

            tokio::spawn(async move {
                let _guard = guard;
                match transport.deliver(&url, body).await {
                    Ok(()) => {
                        metric_inc("relay.delivery.success");
                        tracing::debug!(%url, %event_type, "webhook delivered");
                    }
                    Err(err) => {
                        metric_inc("relay.delivery.failure");
                        tracing::warn!(
                            %url,
                            %event_type,
                            status = ?err.status(),
                            error = %err,
                            "webhook delivery failed"
                        );
                    }
                }
            });
        }

        matched.len()
    }

    /// Drop cached subscriptions so the next dispatch re-reads the store.
    pub async fn invalidate_subscriptions(&self) {
        self.cache.invalidate().await;
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Wait up to `bound` for in-flight deliveries to finish.
    ///
    /// Returns `false` if deliveries were still running when the bound
    /// elapsed. Those keep running in the background.
    pub async fn drain(&self, bound: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.in_flight.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };

        let drained = tokio::time::timeout(bound, wait).await.is_ok();
        if !drained {
            tracing::warn!(in_flight = self.in_flight(), "drain bound elapsed with deliveries in flight");
        }
        drained
    }
}

#[async_trait]
impl EventListener for Dispatcher {
    async fn on_event(&self, event: &DomainEvent) {
        self.dispatch(event.clone()).await;
    }

    fn name(&self) -> &'static str {
        "dispatcher"
    }
}
