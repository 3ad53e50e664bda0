use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::types::{DomainEvent, WILDCARD};

/// In-process consumer of produced events.
///
/// Called inline from the poll cycle; implementations should return
/// quickly and handle their own failures.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &DomainEvent);

    /// Human-readable name (for logs).
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Typed publish/subscribe registry.
///
/// Listeners are keyed by event type; `on_any` listeners receive every
/// event after the type-specific ones.
#[derive(Default)]
pub struct EventEmitter {
    listeners: RwLock<HashMap<String, Vec<Arc<dyn EventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn on(&self, event_type: impl Into<String>, listener: Arc<dyn EventListener>) {
        let mut guard = self.listeners.write().await;
        guard.entry(event_type.into()).or_default().push(listener);
    }

    pub async fn on_any(&self, listener: Arc<dyn EventListener>) {
        self.on(WILDCARD, listener).await;
    }

    pub async fn listener_count(&self, event_type: &str) -> usize {
        let guard = self.listeners.read().await;
        guard.get(event_type).map_or(0, Vec::len)
    }

    /// Deliver one event, in registration order. Returns the number of
    /// listeners that received it.
    pub async fn emit(&self, event: &DomainEvent) -> usize {
        let targets: Vec<Arc<dyn EventListener>> = {
            let guard = self.listeners.read().await;
            let typed = guard.get(&event.event_type).into_iter().flatten();
            let any = if event.event_type == WILDCARD {
                None
            } else {
                guard.get(WILDCARD)
            };
            typed.chain(any.into_iter().flatten()).cloned().collect()
        };

        for listener in &targets {
            tracing::trace!(listener = listener.name(), event_type = %event.event_type, "emit");
            listener.on_event(event).await;
        }
        targets.len()
    }

    /// Deliver a batch in order, sleeping `pacing` between events.
    pub async fn emit_paced(&self, events: &[DomainEvent], pacing: Duration) -> usize {
        let mut delivered = 0;
        for (i, event) in events.iter().enumerate() {
            if i > 0 && !pacing.is_zero() {
                sleep(pacing).await;
            }
            delivered += self.emit(event).await;
        }
        delivered
    }
}
