use async_trait::async_trait;

use crate::error::PollerError;
use crate::types::{DomainEvent, Timestamp};

/// Turns a time window into domain events.
///
/// Called with overlapping, non-decreasing lower bounds; the same
/// underlying record may be returned by more than one cycle.
#[async_trait]
pub trait Poller: Send + Sync {
    /// Human-readable name (for logs).
    fn name(&self) -> &str;

    /// Events materialized strictly after `after`, in the order they
    /// should be emitted.
    async fn poll(&self, after: Timestamp) -> Result<Vec<DomainEvent>, PollerError>;

    /// Timestamp of the oldest data this poller knows about, if any.
    /// Used to seed the first cycle.
    async fn earliest_timestamp(&self) -> Option<Timestamp> {
        None
    }
}

/// Bounds downstream dedupe bookkeeping; invoked once per poll cycle.
#[async_trait]
pub trait CacheTrimmer: Send + Sync {
    async fn trim_caches(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTrimmer;

#[async_trait]
impl CacheTrimmer for NoopTrimmer {
    async fn trim_caches(&self) {}
}
