use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use webhook_relay::{
    notifier_channel, CoordinatorConfig, CoordinatorState, CycleOutcome, DomainEvent, EventListener,
    ManualClock, NotifierSignal, PollCoordinator, PollSource, Poller, PollerError, PollerErrorPolicy,
    SeenCache, Timestamp, DAY_MS,
};

const T: Timestamp = 1_700_000_000_000;

#[derive(Default)]
struct ScriptedPoller {
    name: &'static str,
    events: Vec<DomainEvent>,
    fail: bool,
    delay: Duration,
    earliest: Option<Timestamp>,
    calls: Mutex<Vec<Timestamp>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedPoller {
    fn named(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    fn emitting(name: &'static str, types: &[&str]) -> Self {
        Self {
            name,
            events: types
                .iter()
                .enumerate()
                .map(|(i, t)| DomainEvent::new(*t, json!({ "id": i })))
                .collect(),
            ..Default::default()
        }
    }

    async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    async fn last_bound(&self) -> Option<Timestamp> {
        self.calls.lock().await.last().copied()
    }
}

#[async_trait]
impl Poller for ScriptedPoller {
    fn name(&self) -> &str {
        self.name
    }

    async fn poll(&self, after: Timestamp) -> Result<Vec<DomainEvent>, PollerError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.calls.lock().await.push(after);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            return Err(PollerError::Query("table locked".into()));
        }
        Ok(self.events.clone())
    }

    async fn earliest_timestamp(&self) -> Option<Timestamp> {
        self.earliest
    }
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl EventListener for Recorder {
    async fn on_event(&self, event: &DomainEvent) {
        self.seen.lock().await.push(event.event_type.clone());
    }
}

#[derive(Default)]
struct TimedRecorder {
    at: Mutex<Vec<Instant>>,
}

#[async_trait]
impl EventListener for TimedRecorder {
    async fn on_event(&self, _event: &DomainEvent) {
        self.at.lock().await.push(Instant::now());
    }
}

/// Stops its coordinator from inside the emit path.
#[derive(Default)]
struct StopOnEvent {
    coordinator: OnceLock<Weak<PollCoordinator>>,
    stopped: AtomicBool,
}

#[async_trait]
impl EventListener for StopOnEvent {
    async fn on_event(&self, _event: &DomainEvent) {
        if let Some(coordinator) = self.coordinator.get().and_then(Weak::upgrade) {
            coordinator.stop().await;
            self.stopped.store(true, Ordering::SeqCst);
        }
    }
}

fn config() -> CoordinatorConfig {
    CoordinatorConfig {
        poll_interval: Duration::from_secs(5),
        ..Default::default()
    }
}

async fn build(
    config: CoordinatorConfig,
    pollers: Vec<Arc<ScriptedPoller>>,
    clock: Arc<ManualClock>,
) -> (PollCoordinator, Arc<Recorder>) {
    let mut builder = PollCoordinator::builder(config).clock(clock);
    for poller in pollers {
        builder = builder.poller(poller);
    }
    let coordinator = builder.build();
    let recorder = Arc::new(Recorder::default());
    coordinator.emitter().on_any(recorder.clone()).await;
    (coordinator, recorder)
}

#[tokio::test(start_paused = true)]
async fn test_seed_poll_warms_without_emitting() {
    let clock = Arc::new(ManualClock::new(T));
    let poller = Arc::new(ScriptedPoller {
        earliest: Some(T - 10_000),
        ..ScriptedPoller::emitting("messages", &["msg-new"])
    });
    let (coordinator, recorder) = build(config(), vec![poller.clone()], clock).await;

    coordinator.start(None).await;

    // seed = earliest - 60s, then the notification-path overlap of 30s
    assert_eq!(poller.last_bound().await, Some(T - 100_000));
    assert!(recorder.seen.lock().await.is_empty());
    assert_eq!(coordinator.last_check().await, T);
    assert_eq!(coordinator.state(), CoordinatorState::Idle);

    coordinator.stop().await;
    assert_eq!(coordinator.state(), CoordinatorState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_notifications_runs_one_cycle() {
    let clock = Arc::new(ManualClock::new(T));
    let poller = Arc::new(ScriptedPoller::emitting("messages", &["msg-new", "msg-deleted"]));
    let (coordinator, recorder) = build(config(), vec![poller.clone()], clock.clone()).await;

    let (tx, rx) = notifier_channel(16);
    coordinator.start(Some(rx)).await;
    assert_eq!(poller.call_count().await, 1);

    for i in 0..5 {
        tx.send(NotifierSignal::Change(vec![format!("/data/{i}.db").into()]))
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(poller.call_count().await, 1);

    sleep(Duration::from_millis(600)).await;
    assert_eq!(poller.call_count().await, 2);
    assert_eq!(*recorder.seen.lock().await, vec!["msg-new", "msg-deleted"]);

    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_notifier_error_does_not_stop_pipeline() {
    let clock = Arc::new(ManualClock::new(T));
    let poller = Arc::new(ScriptedPoller::named("messages"));
    let (coordinator, _recorder) = build(config(), vec![poller.clone()], clock).await;

    let (tx, rx) = notifier_channel(16);
    coordinator.start(Some(rx)).await;

    tx.send(NotifierSignal::Error("watch limit reached".into())).await.unwrap();
    tx.send(NotifierSignal::Change(vec![])).await.unwrap();
    sleep(Duration::from_secs(1)).await;

    assert_eq!(poller.call_count().await, 2);
    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_debounced_window_scenarios() {
    let clock = Arc::new(ManualClock::new(T));
    let poller = Arc::new(ScriptedPoller::named("messages"));
    let (coordinator, _recorder) = build(config(), vec![poller.clone()], clock.clone()).await;
    coordinator.start(None).await;
    assert_eq!(coordinator.last_check().await, T);

    // stale: last check more than a day ago
    let now = T + 100_000_000;
    clock.set(now);
    coordinator.poll(PollSource::Debounced).await;
    assert_eq!(poller.last_bound().await, Some(now - DAY_MS - 30_000));

    // recent
    clock.advance(2_000);
    coordinator.poll(PollSource::Debounced).await;
    assert_eq!(poller.last_bound().await, Some(now + 2_000 - 32_000));

    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_fallback_resets_future_dated_check() {
    let clock = Arc::new(ManualClock::new(T));
    let poller = Arc::new(ScriptedPoller::named("messages"));
    let (coordinator, _recorder) = build(config(), vec![poller.clone()], clock.clone()).await;
    coordinator.start(None).await;

    // clock skew: the last check now lies 5s in the future
    clock.set(T - 5_000);
    let outcome = coordinator.poll(PollSource::Fallback).await;

    assert_eq!(poller.last_bound().await, Some(T - 5_000 - 60_000));
    assert!(matches!(outcome, CycleOutcome::Completed { .. }));
    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_fallback_tick_skips_when_recent() {
    let clock = Arc::new(ManualClock::new(T));
    let poller = Arc::new(ScriptedPoller::named("messages"));
    let (coordinator, _recorder) = build(config(), vec![poller.clone()], clock.clone()).await;
    coordinator.start(None).await;
    let calls = poller.call_count().await;

    clock.advance(4_000);
    assert_eq!(coordinator.fallback_tick().await, None);
    assert_eq!(poller.call_count().await, calls);

    clock.advance(1);
    let outcome = coordinator.fallback_tick().await;
    assert!(matches!(outcome, Some(CycleOutcome::Completed { .. })));
    assert_eq!(poller.call_count().await, calls + 1);
    assert_eq!(poller.last_bound().await, Some(T - 30_000));

    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_fallback_timer_polls_without_notifications() {
    let clock = Arc::new(ManualClock::new(T));
    let poller = Arc::new(ScriptedPoller::named("messages"));
    let (coordinator, _recorder) = build(config(), vec![poller.clone()], clock.clone()).await;
    coordinator.start(None).await;

    // Wall clock runs just ahead of each timer tick.
    sleep(Duration::from_millis(50)).await;
    for _ in 0..3 {
        clock.advance(5_000);
        sleep(Duration::from_millis(5_000)).await;
    }

    assert_eq!(poller.call_count().await, 4);
    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_last_check_never_decreases() {
    let clock = Arc::new(ManualClock::new(T));
    let poller = Arc::new(ScriptedPoller::named("messages"));
    let (coordinator, _recorder) = build(config(), vec![poller.clone()], clock.clone()).await;
    coordinator.start(None).await;

    let mut previous = coordinator.last_check().await;
    for step in [10_000, -50_000, 3_000, -1_000_000, 200_000] {
        clock.advance(step);
        coordinator.poll(PollSource::Debounced).await;
        coordinator.poll(PollSource::Fallback).await;
        let current = coordinator.last_check().await;
        assert!(current >= previous, "{current} < {previous}");
        previous = current;
    }

    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_poller_error_aborts_cycle() {
    let clock = Arc::new(ManualClock::new(T));
    let first = Arc::new(ScriptedPoller::emitting("first", &["a"]));
    let broken = Arc::new(ScriptedPoller {
        fail: true,
        ..ScriptedPoller::named("broken")
    });
    let third = Arc::new(ScriptedPoller::emitting("third", &["c"]));
    let (coordinator, recorder) =
        build(config(), vec![first.clone(), broken, third.clone()], clock.clone()).await;

    // The seed poll fails too; start carries on without advancing last_check.
    coordinator.start(None).await;
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
    let before = coordinator.last_check().await;
    assert_eq!(before, T - 60_000);

    clock.advance(10_000);
    match coordinator.poll(PollSource::Debounced).await {
        CycleOutcome::Aborted { poller, error, .. } => {
            assert_eq!(poller, "broken");
            assert_eq!(error, PollerError::Query("table locked".into()));
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    assert_eq!(first.call_count().await, 2);
    assert_eq!(third.call_count().await, 0);
    assert_eq!(coordinator.last_check().await, before);
    assert_eq!(*recorder.seen.lock().await, vec!["a"]);
    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_isolate_policy_continues_after_poller_error() {
    let clock = Arc::new(ManualClock::new(T));
    let broken = Arc::new(ScriptedPoller {
        fail: true,
        ..ScriptedPoller::named("broken")
    });
    let healthy = Arc::new(ScriptedPoller::emitting("healthy", &["msg-new"]));
    let config = CoordinatorConfig {
        poller_error_policy: PollerErrorPolicy::Isolate,
        ..config()
    };
    let (coordinator, recorder) = build(config, vec![broken, healthy.clone()], clock.clone()).await;
    coordinator.start(None).await;

    clock.advance(1_000);
    let outcome = coordinator.poll(PollSource::Debounced).await;

    assert!(matches!(
        outcome,
        CycleOutcome::Completed { events: 1, failed_pollers: 1, .. }
    ));
    assert_eq!(healthy.call_count().await, 2);
    assert_eq!(coordinator.last_check().await, T + 1_000);
    assert_eq!(*recorder.seen.lock().await, vec!["msg-new"]);
}

#[tokio::test(start_paused = true)]
async fn test_cycles_are_mutually_exclusive() {
    let clock = Arc::new(ManualClock::new(T));
    let poller = Arc::new(ScriptedPoller {
        delay: Duration::from_millis(100),
        ..ScriptedPoller::named("slow")
    });
    let (coordinator, _recorder) = build(config(), vec![poller.clone()], clock).await;
    let coordinator = Arc::new(coordinator);
    coordinator.start(None).await;

    let handles: Vec<_> = (0..3)
        .map(|i| {
            let coordinator = coordinator.clone();
            let source = if i % 2 == 0 { PollSource::Debounced } else { PollSource::Fallback };
            tokio::spawn(async move { coordinator.poll(source).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(poller.call_count().await, 4);
    assert_eq!(poller.max_active.load(Ordering::SeqCst), 1);
    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_prevents_new_cycles() {
    let clock = Arc::new(ManualClock::new(T));
    let poller = Arc::new(ScriptedPoller::named("messages"));
    let (coordinator, _recorder) = build(config(), vec![poller.clone()], clock.clone()).await;

    let (tx, rx) = notifier_channel(16);
    coordinator.start(Some(rx)).await;
    coordinator.stop().await;

    assert_eq!(coordinator.poll(PollSource::Debounced).await, CycleOutcome::Skipped);
    assert_eq!(coordinator.fallback_tick().await, None);

    let _ = tx.send(NotifierSignal::Change(vec![])).await;
    clock.advance(60_000);
    sleep(Duration::from_secs(60)).await;

    assert_eq!(poller.call_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_seen_cache_trimmed_each_cycle() {
    let clock = Arc::new(ManualClock::new(T));
    let seen = Arc::new(SeenCache::new(clock.clone()).with_retention_ms(1_000));
    let coordinator = PollCoordinator::builder(config())
        .clock(clock.clone())
        .trimmer(seen.clone())
        .poller(Arc::new(ScriptedPoller::named("messages")))
        .build();
    coordinator.start(None).await;

    assert!(seen.first_seen("msg-1").await);
    clock.advance(2_000);
    coordinator.poll(PollSource::Debounced).await;

    assert!(seen.is_empty().await);
    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_right_after_start_with_live_notifier() {
    let clock = Arc::new(ManualClock::new(T));
    let poller = Arc::new(ScriptedPoller::named("messages"));
    let (coordinator, _recorder) = build(config(), vec![poller.clone()], clock).await;

    let (tx, rx) = notifier_channel(16);
    coordinator.start(Some(rx)).await;

    // the loops have not been polled yet when stop() runs
    assert!(timeout(Duration::from_secs(1), coordinator.stop()).await.is_ok());
    assert_eq!(coordinator.state(), CoordinatorState::Stopped);
    assert_eq!(poller.call_count().await, 1);
    drop(tx);
}

#[tokio::test(start_paused = true)]
async fn test_stop_from_listener_during_fallback_cycle() {
    let clock = Arc::new(ManualClock::new(T));
    let poller = Arc::new(ScriptedPoller::emitting("messages", &["msg-new"]));
    let coordinator = Arc::new(
        PollCoordinator::builder(config())
            .clock(clock.clone())
            .poller(poller.clone())
            .build(),
    );
    let listener = Arc::new(StopOnEvent::default());
    let _ = listener.coordinator.set(Arc::downgrade(&coordinator));
    coordinator.emitter().on_any(listener.clone()).await;
    coordinator.start(None).await;

    clock.advance(5_000);
    sleep(Duration::from_millis(5_050)).await;

    assert!(listener.stopped.load(Ordering::SeqCst));
    assert_eq!(coordinator.state(), CoordinatorState::Stopped);
    assert_eq!(poller.call_count().await, 2);
    // the cycle finished and released the lock
    assert_eq!(
        timeout(Duration::from_secs(1), coordinator.last_check()).await.ok(),
        Some(T + 5_000)
    );
}

#[tokio::test(start_paused = true)]
async fn test_pacing_spans_all_pollers_in_a_cycle() {
    let clock = Arc::new(ManualClock::new(T));
    let pollers = vec![
        Arc::new(ScriptedPoller::emitting("messages", &["msg-new"])),
        Arc::new(ScriptedPoller::emitting("reactions", &["reaction-new"])),
        Arc::new(ScriptedPoller::emitting("receipts", &["receipt-new"])),
    ];
    let (coordinator, _recorder) = build(config(), pollers, clock.clone()).await;
    let timed = Arc::new(TimedRecorder::default());
    coordinator.emitter().on_any(timed.clone()).await;
    coordinator.start(None).await;

    clock.advance(1_000);
    coordinator.poll(PollSource::Debounced).await;

    let at = timed.at.lock().await;
    assert_eq!(at.len(), 3);
    for pair in at.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(10), "gap {:?}", pair[1] - pair[0]);
    }
    drop(at);
    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_grace_pause_only_when_lock_is_contended() {
    let clock = Arc::new(ManualClock::new(T));
    let poller = Arc::new(ScriptedPoller {
        delay: Duration::from_millis(100),
        ..ScriptedPoller::named("slow")
    });
    let (coordinator, _recorder) = build(config(), vec![poller], clock).await;
    let coordinator = Arc::new(coordinator);
    coordinator.start(None).await;

    let started = Instant::now();
    coordinator.poll(PollSource::Debounced).await;
    let alone = started.elapsed();
    assert!(alone >= Duration::from_millis(100));
    assert!(alone < Duration::from_millis(125), "uncontended cycle paused: {alone:?}");

    let timed_poll = |coordinator: Arc<PollCoordinator>| {
        tokio::spawn(async move {
            let started = Instant::now();
            coordinator.poll(PollSource::Debounced).await;
            started.elapsed()
        })
    };
    let first = timed_poll(coordinator.clone());
    sleep(Duration::from_millis(10)).await;
    let second = timed_poll(coordinator.clone());

    let first = first.await.unwrap();
    let second = second.await.unwrap();
    // first saw a queued caller and paused 25ms; second ran alone
    assert!(first >= Duration::from_millis(125), "contended cycle did not pause: {first:?}");
    assert!(second >= Duration::from_millis(190));
    assert!(second < Duration::from_millis(215), "second cycle paused: {second:?}");

    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_extreme_earliest_timestamp_seeds_safely() {
    let clock = Arc::new(ManualClock::new(T));
    let poller = Arc::new(ScriptedPoller {
        earliest: Some(Timestamp::MIN),
        ..ScriptedPoller::named("messages")
    });
    let (coordinator, _recorder) = build(config(), vec![poller.clone()], clock).await;

    coordinator.start(None).await;

    // an unusable seed collapses to now on the notification path
    assert_eq!(poller.last_bound().await, Some(T - 30_000));
    assert_eq!(coordinator.last_check().await, T);
    coordinator.stop().await;
}
