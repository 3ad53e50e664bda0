//! Change-driven polling and webhook fanout.
//!
//! This crate turns unreliable storage change notifications into
//! **serialized, windowed poll cycles** and fans the resulting events out
//! to webhook subscribers.
//!
//! ## Pipeline
//! notifier → debounce → [`PollCoordinator`] → [`Poller`]s →
//! [`EventEmitter`] → listeners (e.g. [`Dispatcher`]) → webhooks.
//! A fallback timer drives the coordinator directly when notifications
//! go quiet.
//!
//! ## Guarantees
//! - One poll cycle at a time
//! - A burst of notifications yields one cycle
//! - Polling continues at least once per fallback interval
//! - One failing subscriber never affects another
//!
//! ## Non-Guarantees
//! - Exactly-once delivery (windows overlap on purpose; consumers dedupe)
//! - Delivery retries or backoff
//! - Endpoint authentication or request signing
//! - A cap on concurrent outbound deliveries

mod cache;
mod clock;
mod coordinator;
mod debounce;
mod dedupe;
mod dispatcher;
mod emitter;
mod error;
mod notifier;
mod poller;
mod storage;
mod telemetry;
mod transport;
mod types;
pub mod window;

#[cfg(feature = "redis")]
mod storage_redis;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use cache::{SubscriptionCache, SubscriptionCacheEntry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{
    CoordinatorConfig,
    CoordinatorState,
    CycleOutcome,
    PollCoordinator,
    PollCoordinatorBuilder,
    PollCycleState,
    PollerErrorPolicy,
};
pub use debounce::Debouncer;
pub use dedupe::SeenCache;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use emitter::{EventEmitter, EventListener};
pub use error::{ConfigError, DeliveryError, PollerError, StoreError};
pub use notifier::{channel as notifier_channel, NotifierReceiver, NotifierSender, NotifierSignal};
pub use poller::{CacheTrimmer, NoopTrimmer, Poller};
pub use storage::{InMemorySubscriptionStore, SubscriptionStore};
pub use transport::Transport;
pub use types::{
    DomainEvent,
    PollSource,
    Subscription,
    SubscriptionRecord,
    Timestamp,
    DAY_MS,
    MINUTE_MS,
    SECOND_MS,
    WILDCARD,
};

#[cfg(feature = "http")]
pub use transport::HttpTransport;

#[cfg(feature = "redis")]
pub use storage_redis::RedisSubscriptionStore;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresSubscriptionStore;
