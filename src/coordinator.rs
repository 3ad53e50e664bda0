use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

use crate::clock::{Clock, SystemClock};
use crate::debounce::Debouncer;
use crate::emitter::EventEmitter;
use crate::error::{ConfigError, PollerError};
use crate::notifier::{NotifierReceiver, NotifierSignal};
use crate::poller::{CacheTrimmer, NoopTrimmer, Poller};
use crate::telemetry::metric_inc;
use crate::types::{PollSource, Timestamp};
use crate::window;

/// Debounce key shared by every notification for one coordinator.
const DEBOUNCE_KEY: &str = "poll-cycle";

/// What to do when a poller fails mid-cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerErrorPolicy {
    /// Skip the remaining pollers and leave `last_check` untouched.
    AbortCycle,
    /// Log the failure and continue with the next poller.
    Isolate,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Fallback timer period. Clamped to 3s..=30s at start.
    pub poll_interval: Duration,
    /// Quiet period before a burst of notifications triggers a cycle.
    pub debounce_wait: Duration,
    /// Delay between emitted events within a cycle.
    pub pacing: Duration,
    /// Pause after a cycle when other callers are queued on the lock.
    pub grace_pause: Duration,
    /// Subtracted from the earliest known data timestamp when seeding.
    pub seed_margin: Duration,
    pub poller_error_policy: PollerErrorPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            debounce_wait: Duration::from_millis(500),
            pacing: Duration::from_millis(10),
            grace_pause: Duration::from_millis(25),
            seed_margin: Duration::from_secs(60),
            poller_error_policy: PollerErrorPolicy::AbortCycle,
        }
    }
}

impl CoordinatorConfig {
    /// Defaults overridden by `RELAY_POLL_INTERVAL_MS`, `RELAY_DEBOUNCE_MS`
    /// and `RELAY_POLLER_ERROR_POLICY` (`abort` | `isolate`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = env_millis("RELAY_POLL_INTERVAL_MS")? {
            config.poll_interval = ms;
        }
        if let Some(ms) = env_millis("RELAY_DEBOUNCE_MS")? {
            config.debounce_wait = ms;
        }
        if let Ok(value) = std::env::var("RELAY_POLLER_ERROR_POLICY") {
            let policy = match value.trim() {
                "abort" => Some(PollerErrorPolicy::AbortCycle),
                "isolate" => Some(PollerErrorPolicy::Isolate),
                _ => None,
            };
            config.poller_error_policy = policy.ok_or(ConfigError::Invalid {
                key: "RELAY_POLLER_ERROR_POLICY",
                value,
            })?;
        }

        Ok(config)
    }
}

fn env_millis(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Stopped,
    Starting,
    Idle,
    Polling,
}

/// Owned by the coordinator, only touched while holding its lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollCycleState {
    pub last_check: Timestamp,
    pub in_progress: bool,
}

/// Result of one attempt to run a poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed {
        lower_bound: Timestamp,
        events: usize,
        failed_pollers: usize,
    },
    Aborted {
        lower_bound: Timestamp,
        poller: String,
        error: PollerError,
    },
    /// The coordinator was stopped before the cycle could run.
    Skipped,
}

pub struct PollCoordinatorBuilder {
    config: CoordinatorConfig,
    pollers: Vec<Arc<dyn Poller>>,
    trimmer: Arc<dyn CacheTrimmer>,
    emitter: Arc<EventEmitter>,
    clock: Arc<dyn Clock>,
}

impl PollCoordinatorBuilder {
    /// Pollers run in the order they are added.
    pub fn poller(mut self, poller: Arc<dyn Poller>) -> Self {
        self.pollers.push(poller);
        self
    }

    pub fn trimmer(mut self, trimmer: Arc<dyn CacheTrimmer>) -> Self {
        self.trimmer = trimmer;
        self
    }

    pub fn emitter(mut self, emitter: Arc<EventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> PollCoordinator {
        let (state, _) = watch::channel(CoordinatorState::Stopped);
        let (shutdown, _) = watch::channel(true);
        let interval = window::fallback_interval(self.config.poll_interval);

        PollCoordinator {
            inner: Arc::new(Inner {
                config: self.config,
                pollers: self.pollers,
                trimmer: self.trimmer,
                emitter: self.emitter,
                clock: self.clock,
                cycle: Mutex::new(PollCycleState::default()),
                waiters: AtomicUsize::new(0),
                stopped: AtomicBool::new(true),
                state,
                shutdown,
                debouncer: Debouncer::new(),
                fallback_interval_ms: AtomicU64::new(interval.as_millis() as u64),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

/// Serializes poll cycles coming from change notifications and from the
/// fallback timer, and feeds their results to the emitter.
pub struct PollCoordinator {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    config: CoordinatorConfig,
    pollers: Vec<Arc<dyn Poller>>,
    trimmer: Arc<dyn CacheTrimmer>,
    emitter: Arc<EventEmitter>,
    clock: Arc<dyn Clock>,
    cycle: Mutex<PollCycleState>,
    waiters: AtomicUsize,
    stopped: AtomicBool,
    state: watch::Sender<CoordinatorState>,
    shutdown: watch::Sender<bool>,
    debouncer: Debouncer<&'static str>,
    fallback_interval_ms: AtomicU64,
}

impl PollCoordinator {
    pub fn builder(config: CoordinatorConfig) -> PollCoordinatorBuilder {
        PollCoordinatorBuilder {
            config,
            pollers: Vec::new(),
            trimmer: Arc::new(NoopTrimmer),
            emitter: Arc::new(EventEmitter::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn emitter(&self) -> &Arc<EventEmitter> {
        &self.inner.emitter
    }

    pub fn state(&self) -> CoordinatorState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.inner.state.subscribe()
    }

    pub fn fallback_interval(&self) -> Duration {
        Duration::from_millis(self.inner.fallback_interval_ms.load(Ordering::SeqCst))
    }

    /// Timestamp of the last completed cycle. Waits for an in-flight cycle.
    pub async fn last_check(&self) -> Timestamp {
        self.inner.cycle.lock().await.last_check
    }

    /// Seed `last_check`, run a silent warm-up cycle, then start the
    /// notification and fallback paths.
    ///
    /// `notifications` is optional; without it only the fallback timer
    /// drives polling.
    pub async fn start(&self, notifications: Option<NotifierReceiver>) {
        let inner = &self.inner;
        if !inner.transition(CoordinatorState::Stopped, CoordinatorState::Starting) {
            tracing::warn!("poll coordinator already started");
            return;
        }

        inner.shutdown.send_replace(false);
        inner.stopped.store(false, Ordering::SeqCst);

        let interval = window::fallback_interval(inner.config.poll_interval);
        inner
            .fallback_interval_ms
            .store(interval.as_millis() as u64, Ordering::SeqCst);

        let seed = inner.seed_timestamp().await;
        {
            let mut cycle = inner.cycle.lock().await;
            *cycle = PollCycleState {
                last_check: seed,
                in_progress: false,
            };
        }
        tracing::info!(seed, pollers = inner.pollers.len(), "poll coordinator starting");

        match inner.run_cycle(PollSource::Seed).await {
            CycleOutcome::Aborted { poller, error, .. } => {
                tracing::warn!(%poller, %error, "seed poll failed; continuing start");
            }
            CycleOutcome::Skipped => return,
            CycleOutcome::Completed { .. } => {}
        }

        if !inner.transition(CoordinatorState::Starting, CoordinatorState::Idle) {
            // stopped during the seed poll
            return;
        }

        // Subscribed before spawning so a stop() racing the spawn is still seen.
        let mut tasks = self.tasks.lock().await;
        if let Some(rx) = notifications {
            let shutdown = inner.shutdown.subscribe();
            tasks.push(tokio::spawn(trigger_loop(inner.clone(), rx, shutdown)));
        }
        let shutdown = inner.shutdown.subscribe();
        tasks.push(tokio::spawn(fallback_loop(inner.clone(), interval, shutdown)));

        tracing::info!(interval_ms = interval.as_millis() as u64, "poll coordinator started");
    }

    /// Stop accepting new cycles and detach the trigger sources.
    ///
    /// A cycle already running is allowed to finish on its own task; this
    /// call does not wait for it, so it is safe to call from a listener.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        inner.state.send_replace(CoordinatorState::Stopped);
        inner.shutdown.send_replace(true);
        inner.debouncer.cancel_all().await;

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        tracing::info!("poll coordinator stopped");
    }

    /// Run one cycle now, tagged with `source`.
    pub async fn poll(&self, source: PollSource) -> CycleOutcome {
        self.inner.run_cycle(source).await
    }

    /// One fallback timer tick. Returns `None` when the tick was skipped.
    pub async fn fallback_tick(&self) -> Option<CycleOutcome> {
        self.inner.fallback_tick().await
    }

    /// Feed a raw notifier signal through the debounced path.
    pub async fn notify(&self, signal: NotifierSignal) {
        self.inner.on_signal(signal).await;
    }
}

impl Inner {
    async fn seed_timestamp(&self) -> Timestamp {
        let mut earliest: Option<Timestamp> = None;
        for poller in &self.pollers {
            if let Some(ts) = poller.earliest_timestamp().await {
                earliest = Some(earliest.map_or(ts, |e| e.min(ts)));
            }
        }

        let base = earliest.unwrap_or_else(|| self.clock.now_ms());
        base.saturating_sub(self.config.seed_margin.as_millis() as Timestamp)
    }

    async fn run_cycle(&self, source: PollSource) -> CycleOutcome {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let mut cycle = self.cycle.lock().await;
        self.waiters.fetch_sub(1, Ordering::SeqCst);

        if self.stopped.load(Ordering::SeqCst) {
            metric_inc("relay.cycle.skipped");
            tracing::debug!(%source, "coordinator stopped; cycle skipped");
            return CycleOutcome::Skipped;
        }

        if source != PollSource::Seed {
            self.transition(CoordinatorState::Idle, CoordinatorState::Polling);
        }
        cycle.in_progress = true;

        let now = self.clock.now_ms();
        let lower_bound = window::lower_bound(source, cycle.last_check, now);
        let emit = source != PollSource::Seed;
        tracing::debug!(%source, last_check = cycle.last_check, lower_bound, "poll cycle started");

        let mut events = 0;
        let mut failed_pollers = 0;
        let mut aborted = None;

        for poller in &self.pollers {
            match poller.poll(lower_bound).await {
                Ok(batch) => {
                    if emit && !batch.is_empty() {
                        // pacing spans the whole cycle, not just one poller's batch
                        if events > 0 && !self.config.pacing.is_zero() {
                            sleep(self.config.pacing).await;
                        }
                        self.emitter.emit_paced(&batch, self.config.pacing).await;
                    }
                    events += batch.len();
                }
                Err(error) => {
                    tracing::warn!(poller = poller.name(), %source, %error, "poller failed");
                    match self.config.poller_error_policy {
                        PollerErrorPolicy::AbortCycle => {
                            aborted = Some((poller.name().to_string(), error));
                            break;
                        }
                        PollerErrorPolicy::Isolate => failed_pollers += 1,
                    }
                }
            }
        }

        let outcome = match aborted {
            Some((poller, error)) => {
                metric_inc("relay.cycle.aborted");
                CycleOutcome::Aborted {
                    lower_bound,
                    poller,
                    error,
                }
            }
            None => {
                cycle.last_check = cycle.last_check.max(now);
                metric_inc("relay.cycle.completed");
                tracing::debug!(%source, events, failed_pollers, "poll cycle completed");
                CycleOutcome::Completed {
                    lower_bound,
                    events,
                    failed_pollers,
                }
            }
        };

        self.trimmer.trim_caches().await;
        cycle.in_progress = false;
        drop(cycle);

        if source != PollSource::Seed {
            self.transition(CoordinatorState::Polling, CoordinatorState::Idle);
        }

        if self.waiters.load(Ordering::SeqCst) > 0 && !self.config.grace_pause.is_zero() {
            sleep(self.config.grace_pause).await;
        }

        outcome
    }

    async fn fallback_tick(&self) -> Option<CycleOutcome> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }

        let interval = Duration::from_millis(self.fallback_interval_ms.load(Ordering::SeqCst));
        let last_check = self.cycle.lock().await.last_check;
        let now = self.clock.now_ms();

        if !window::fallback_due(last_check, now, interval) {
            metric_inc("relay.fallback.skipped");
            tracing::trace!(elapsed_ms = now.saturating_sub(last_check), "fallback tick skipped");
            return None;
        }

        Some(self.run_cycle(PollSource::Fallback).await)
    }

    async fn on_signal(self: &Arc<Self>, signal: NotifierSignal) {
        match signal {
            NotifierSignal::Change(paths) => {
                tracing::trace!(paths = paths.len(), "change notification");
                let inner = self.clone();
                self.debouncer
                    .schedule_or_reset(DEBOUNCE_KEY, self.config.debounce_wait, move || async move {
                        inner.run_cycle(PollSource::Debounced).await;
                    })
                    .await;
            }
            NotifierSignal::Error(error) => {
                tracing::warn!(%error, "change notifier error");
            }
        }
    }

    fn transition(&self, from: CoordinatorState, to: CoordinatorState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }
}

async fn trigger_loop(inner: Arc<Inner>, mut rx: NotifierReceiver, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            signal = rx.recv() => match signal {
                Some(signal) if !inner.stopped.load(Ordering::SeqCst) => inner.on_signal(signal).await,
                Some(_) => break,
                None => {
                    tracing::info!("change notifier closed; fallback polling only");
                    break;
                }
            },
        }
    }
}

/// Fires fallback ticks. Each due cycle runs on its own task so that
/// `stop()` never waits on a cycle in progress.
async fn fallback_loop(inner: Arc<Inner>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut running: Option<JoinHandle<()>> = None;

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                if running.as_ref().is_some_and(|handle| !handle.is_finished()) {
                    tracing::trace!("previous fallback cycle still running; tick skipped");
                    continue;
                }
                let inner = inner.clone();
                running = Some(tokio::spawn(async move {
                    if let Some(CycleOutcome::Aborted { poller, .. }) = inner.fallback_tick().await {
                        tracing::debug!(%poller, "fallback cycle aborted");
                    }
                }));
            }
        }
    }
}
