// tests/scheduler_limits.rs
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vehicle_harvest::{
    ConcurrencyLimits, FetchError, FetchErrorKind, FetchRequest, FetchScheduler, FetchTask,
    GeoIndex, OutcomeStore, RawRecord, RetryPolicy, SchedulerConfig, SourceAdapter, SourceId,
    TaskOutcome, TaskReport,
};

/// Tracks in-flight fetches globally and per adapter.
#[derive(Default)]
struct Gauge {
    now: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let n = self.now.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(n, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.now.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct SlowAdapter {
    source: SourceId,
    delay: Duration,
    global: Arc<Gauge>,
    local: Gauge,
    calls: AtomicU32,
    error: Option<FetchError>,
}

impl SlowAdapter {
    fn new(source: &str, delay: Duration, global: Arc<Gauge>) -> Self {
        Self {
            source: SourceId::new(source),
            delay,
            global,
            local: Gauge::default(),
            calls: AtomicU32::new(0),
            error: None,
        }
    }

    fn failing(mut self, error: FetchError) -> Self {
        self.error = Some(error);
        self
    }
}

#[async_trait]
impl SourceAdapter for SlowAdapter {
    fn source(&self) -> SourceId {
        self.source.clone()
    }

    async fn fetch(&self, _request: FetchRequest) -> Result<Vec<RawRecord>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.global.enter();
        self.local.enter();
        tokio::time::sleep(self.delay).await;
        self.local.leave();
        self.global.leave();
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(vec![RawRecord {
                title: "2018 Ford Transit".into(),
                ..Default::default()
            }]),
        }
    }
}

fn config(global: usize, per_source: usize, max_attempts: u32, timeout: Duration) -> SchedulerConfig {
    SchedulerConfig::new(
        ConcurrencyLimits {
            global,
            per_source_default: per_source,
            per_source: HashMap::new(),
        },
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(8),
            jitter: Duration::from_millis(1),
        },
        timeout,
    )
}

fn tasks(adapter: &Arc<SlowAdapter>, codes: &[&str]) -> Vec<FetchTask> {
    let geo = GeoIndex::builtin();
    codes
        .iter()
        .map(|code| FetchTask {
            target: geo.resolve(code).cloned().expect("known target"),
            source: adapter.source.clone(),
            adapter: adapter.clone(),
            page_budget: 1,
            proxy: None,
        })
        .collect()
}

async fn collect(mut rx: mpsc::Receiver<TaskReport>) -> Vec<TaskReport> {
    let mut out = Vec::new();
    while let Some(r) = rx.recv().await {
        out.push(r);
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ceilings_are_never_exceeded() {
    let global = Arc::new(Gauge::default());
    let ebay = Arc::new(SlowAdapter::new("ebay", Duration::from_millis(30), global.clone()));
    let gumtree = Arc::new(SlowAdapter::new("gumtree", Duration::from_millis(30), global.clone()));

    let mut batch = tasks(&ebay, &["M1", "LS1", "B1", "G1", "L1"]);
    batch.extend(tasks(&gumtree, &["S1", "BS1", "NE1", "CV1", "NG1"]));
    assert_eq!(batch.len(), 10);

    let outcomes = Arc::new(OutcomeStore::in_memory());
    let sched = FetchScheduler::new(config(3, 2, 1, Duration::from_secs(5)), outcomes.clone());
    let reports = collect(sched.run(batch, CancellationToken::new())).await;

    assert_eq!(reports.len(), 10);
    assert!(global.peak() <= 3, "global peak {}", global.peak());
    assert!(ebay.local.peak() <= 2, "ebay peak {}", ebay.local.peak());
    assert!(gumtree.local.peak() <= 2, "gumtree peak {}", gumtree.local.peak());
    assert!(global.peak() >= 2, "work should overlap");
    assert_eq!(outcomes.len(), 10);
}

#[tokio::test]
async fn saturated_source_does_not_block_others() {
    let global = Arc::new(Gauge::default());
    let slow = Arc::new(SlowAdapter::new("ebay", Duration::from_millis(80), global.clone()));
    let fast = Arc::new(SlowAdapter::new("gumtree", Duration::from_millis(1), global.clone()));

    // Queue head is all slow-source work; the fast source must still be picked up.
    let mut batch = tasks(&slow, &["M1", "LS1", "B1"]);
    batch.extend(tasks(&fast, &["S1", "BS1"]));

    let sched = FetchScheduler::new(
        config(3, 1, 1, Duration::from_secs(5)),
        Arc::new(OutcomeStore::in_memory()),
    );
    let reports = collect(sched.run(batch, CancellationToken::new())).await;

    let first_two: Vec<&SourceId> = reports.iter().take(2).map(|r| &r.source).collect();
    assert!(first_two.iter().all(|s| s.as_str() == "gumtree"), "{first_two:?}");
    assert_eq!(reports.len(), 5);
}

#[tokio::test]
async fn retryable_failures_are_recorded_exactly_once() {
    let adapter = Arc::new(
        SlowAdapter::new("ebay", Duration::from_millis(1), Arc::new(Gauge::default()))
            .failing(FetchError::Network("connection reset".into())),
    );
    let outcomes = Arc::new(OutcomeStore::in_memory());
    let sched = FetchScheduler::new(config(2, 2, 3, Duration::from_secs(5)), outcomes.clone());
    let reports = collect(sched.run(tasks(&adapter, &["M1"]), CancellationToken::new())).await;

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].attempts, 3);
    assert_eq!(reports[0].outcome, TaskOutcome::Failed(FetchErrorKind::Network));
    assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);

    let rec = outcomes.snapshot();
    assert_eq!(rec.len(), 1);
    assert_eq!((rec[0].attempts, rec[0].successes), (1, 0));
}

#[tokio::test]
async fn malformed_targets_fail_fast() {
    let adapter = Arc::new(
        SlowAdapter::new("ebay", Duration::from_millis(1), Arc::new(Gauge::default()))
            .failing(FetchError::Malformed("postcode rejected".into())),
    );
    let sched = FetchScheduler::new(
        config(2, 2, 5, Duration::from_secs(5)),
        Arc::new(OutcomeStore::in_memory()),
    );
    let reports = collect(sched.run(tasks(&adapter, &["M1"]), CancellationToken::new())).await;

    assert_eq!(reports[0].attempts, 1);
    assert_eq!(reports[0].outcome, TaskOutcome::Failed(FetchErrorKind::Malformed));
}

#[tokio::test]
async fn slow_fetches_time_out_and_are_retried() {
    let adapter = Arc::new(SlowAdapter::new(
        "ebay",
        Duration::from_millis(500),
        Arc::new(Gauge::default()),
    ));
    let outcomes = Arc::new(OutcomeStore::in_memory());
    let sched = FetchScheduler::new(config(1, 1, 2, Duration::from_millis(20)), outcomes.clone());
    let reports = collect(sched.run(tasks(&adapter, &["M1"]), CancellationToken::new())).await;

    assert_eq!(reports[0].outcome, TaskOutcome::TimedOut);
    assert_eq!(reports[0].attempts, 2);
    assert!(reports[0].elapsed < Duration::from_millis(400));
    assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    let rec = &outcomes.snapshot()[0];
    assert_eq!((rec.attempts, rec.successes), (1, 0));
}

#[tokio::test]
async fn cancellation_stops_admission_but_finishes_in_flight() {
    let adapter = Arc::new(SlowAdapter::new(
        "ebay",
        Duration::from_millis(60),
        Arc::new(Gauge::default()),
    ));
    let outcomes = Arc::new(OutcomeStore::in_memory());
    let sched = FetchScheduler::new(config(1, 1, 1, Duration::from_secs(5)), outcomes.clone());

    let cancel = CancellationToken::new();
    let rx = sched.run(tasks(&adapter, &["M1", "LS1", "B1", "G1"]), cancel.clone());
    tokio::time::sleep(Duration::from_millis(15)).await;
    cancel.cancel();
    let reports = collect(rx).await;

    assert_eq!(reports.len(), 1);
    assert!(matches!(reports[0].outcome, TaskOutcome::Ok(_)));
    assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcomes.len(), 1);
}

#[tokio::test]
async fn cancellation_during_backoff_keeps_last_failure() {
    let adapter = Arc::new(
        SlowAdapter::new("ebay", Duration::from_millis(1), Arc::new(Gauge::default()))
            .failing(FetchError::RateLimited),
    );
    let mut cfg = config(1, 1, 5, Duration::from_secs(5));
    cfg.retry.base_delay = Duration::from_secs(30);
    cfg.retry.max_delay = Duration::from_secs(30);
    let outcomes = Arc::new(OutcomeStore::in_memory());
    let sched = FetchScheduler::new(cfg, outcomes.clone());

    let cancel = CancellationToken::new();
    let rx = sched.run(tasks(&adapter, &["M1"]), cancel.clone());
    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();
    let reports = collect(rx).await;

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].attempts, 1);
    assert_eq!(reports[0].outcome, TaskOutcome::Failed(FetchErrorKind::RateLimited));
    assert_eq!(outcomes.snapshot()[0].attempts, 1);
}
