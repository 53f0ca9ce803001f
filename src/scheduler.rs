// src/scheduler.rs
//! # Fetch Scheduler
//!
//! Runs a batch of `(target, source)` fetch tasks under two ceilings: a
//! global worker pool and a per-source semaphore.
//!
//! - Workers pull from one shared queue and take the first task whose source
//!   gate has a free permit, so a saturated source never blocks the others.
//! - Idle workers park on a `Notify` and are woken whenever a permit frees.
//! - Transient errors are retried with capped exponential backoff plus
//!   jitter; every attempt runs under the task deadline.
//! - Each task that reaches a terminal outcome is recorded in the outcome
//!   store exactly once and yields exactly one [`TaskReport`].

use metrics::{counter, histogram};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::adapter::{DynAdapter, FetchErrorKind, FetchRequest, ProxyHandle, RawRecord, SourceId};
use crate::geo::{Target, TargetId};
use crate::metrics::{
    ensure_metrics_described, FETCH_MS, RETRIES_TOTAL, TASKS_TOTAL, TASK_FAILURES_TOTAL,
};
use crate::outcomes::OutcomeStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyLimits {
    /// Tasks in flight across all sources.
    pub global: usize,
    /// Tasks in flight per source unless overridden.
    pub per_source_default: usize,
    pub per_source: HashMap<SourceId, usize>,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            global: 8,
            per_source_default: 3,
            per_source: HashMap::new(),
        }
    }
}

impl ConcurrencyLimits {
    pub fn for_source(&self, source: &SourceId) -> usize {
        self.per_source
            .get(source)
            .copied()
            .unwrap_or(self.per_source_default)
            .max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the uniform random delay added to each backoff.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Deterministic part of the delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        self.backoff(retry) + jitter
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub limits: ConcurrencyLimits,
    pub retry: RetryPolicy,
    /// Deadline of a single adapter attempt.
    pub task_timeout: Duration,
}

impl SchedulerConfig {
    pub fn new(limits: ConcurrencyLimits, retry: RetryPolicy, task_timeout: Duration) -> Self {
        Self {
            limits,
            retry,
            task_timeout,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            limits: ConcurrencyLimits::default(),
            retry: RetryPolicy::default(),
            task_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchTask {
    pub target: Target,
    pub source: SourceId,
    pub adapter: DynAdapter,
    pub page_budget: u32,
    pub proxy: Option<ProxyHandle>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Ok(Vec<RawRecord>),
    Failed(FetchErrorKind),
    TimedOut,
}

impl TaskOutcome {
    /// Counts as a success for learning: the fetch worked and found something.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Ok(records) if !records.is_empty())
    }

    pub fn record_count(&self) -> usize {
        match self {
            TaskOutcome::Ok(records) => records.len(),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub target: TargetId,
    pub source: SourceId,
    pub attempts: u32,
    pub outcome: TaskOutcome,
    pub elapsed: Duration,
}

struct Shared {
    queue: Mutex<VecDeque<FetchTask>>,
    gates: HashMap<SourceId, Arc<Semaphore>>,
    notify: Notify,
}

enum Take {
    Ready(FetchTask, OwnedSemaphorePermit),
    Blocked,
    Drained,
}

impl Shared {
    /// First queued task whose source gate has a permit, removed with the permit held.
    fn take_ready(&self) -> Take {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            return Take::Drained;
        }
        for idx in 0..queue.len() {
            let Some(gate) = self.gates.get(&queue[idx].source) else {
                continue;
            };
            if let Ok(permit) = gate.clone().try_acquire_owned() {
                if let Some(task) = queue.remove(idx) {
                    return Take::Ready(task, permit);
                }
            }
        }
        Take::Blocked
    }
}

pub struct FetchScheduler {
    config: SchedulerConfig,
    outcomes: Arc<OutcomeStore>,
}

impl FetchScheduler {
    pub fn new(config: SchedulerConfig, outcomes: Arc<OutcomeStore>) -> Self {
        Self { config, outcomes }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Start the batch and return the report stream. Reports arrive in
    /// completion order; the stream ends once every admitted task finished.
    /// After `cancel` fires no further task is admitted.
    pub fn run(&self, tasks: Vec<FetchTask>, cancel: CancellationToken) -> mpsc::Receiver<TaskReport> {
        ensure_metrics_described();

        let (tx, rx) = mpsc::channel(tasks.len().max(1));
        if tasks.is_empty() {
            return rx;
        }

        let mut gates = HashMap::new();
        for t in &tasks {
            gates
                .entry(t.source.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.limits.for_source(&t.source))));
        }

        let workers = self.config.limits.global.max(1).min(tasks.len());
        tracing::info!(
            target: "scheduler",
            tasks = tasks.len(),
            workers,
            sources = gates.len(),
            "fetch batch started"
        );

        let shared = Arc::new(Shared {
            queue: Mutex::new(tasks.into()),
            gates,
            notify: Notify::new(),
        });

        for _ in 0..workers {
            let worker = Worker {
                shared: shared.clone(),
                config: self.config.clone(),
                outcomes: self.outcomes.clone(),
                cancel: cancel.clone(),
                tx: tx.clone(),
            };
            tokio::spawn(worker.run());
        }
        rx
    }
}

struct Worker {
    shared: Arc<Shared>,
    config: SchedulerConfig,
    outcomes: Arc<OutcomeStore>,
    cancel: CancellationToken,
    tx: mpsc::Sender<TaskReport>,
}

impl Worker {
    async fn run(self) {
        loop {
            // Register interest before scanning so a permit freed in between is not missed.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.cancel.is_cancelled() {
                break;
            }

            match self.shared.take_ready() {
                Take::Ready(task, permit) => {
                    let report = self.execute(task).await;
                    drop(permit);
                    self.shared.notify.notify_waiters();
                    if self.tx.send(report).await.is_err() {
                        tracing::debug!(target: "scheduler", "report receiver dropped");
                    }
                }
                Take::Blocked => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
                Take::Drained => break,
            }
        }
        // Let blocked peers observe the drained queue.
        self.shared.notify.notify_waiters();
    }

    async fn execute(&self, task: FetchTask) -> TaskReport {
        let started = Instant::now();
        let policy = self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempts = 0u32;

        let outcome = loop {
            attempts += 1;
            let request = FetchRequest {
                target: task.target.clone(),
                page_budget: task.page_budget,
                proxy: task.proxy.clone(),
            };

            let t0 = Instant::now();
            let result = tokio::time::timeout(self.config.task_timeout, task.adapter.fetch(request)).await;
            histogram!(FETCH_MS).record(t0.elapsed().as_secs_f64() * 1000.0);

            let (outcome, retryable) = match result {
                Ok(Ok(records)) => break TaskOutcome::Ok(records),
                Ok(Err(e)) => {
                    tracing::debug!(
                        target: "scheduler",
                        target_id = %task.target.id,
                        source = %task.source,
                        attempt = attempts,
                        error = %e,
                        "fetch attempt failed"
                    );
                    (TaskOutcome::Failed(e.kind()), e.is_retryable())
                }
                Err(_) => {
                    tracing::debug!(
                        target: "scheduler",
                        target_id = %task.target.id,
                        source = %task.source,
                        attempt = attempts,
                        "fetch attempt timed out"
                    );
                    (TaskOutcome::TimedOut, true)
                }
            };

            if !retryable || attempts >= max_attempts {
                break outcome;
            }

            counter!(RETRIES_TOTAL).increment(1);
            let delay = policy.delay_for(attempts - 1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => break outcome,
            }
        };

        let success = outcome.is_success();
        self.outcomes
            .record(&task.target.id, &task.source, success, outcome.record_count());

        counter!(TASKS_TOTAL).increment(1);
        if !matches!(outcome, TaskOutcome::Ok(_)) {
            counter!(TASK_FAILURES_TOTAL).increment(1);
            tracing::warn!(
                target: "scheduler",
                target_id = %task.target.id,
                source = %task.source,
                attempts,
                outcome = ?outcome,
                "fetch task failed"
            );
        }

        TaskReport {
            target: task.target.id,
            source: task.source,
            attempts,
            outcome,
            elapsed: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{FetchError, SourceAdapter};
    use crate::geo::Level;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        source: SourceId,
        calls: AtomicU32,
        script: Vec<Result<usize, FetchError>>,
    }

    #[async_trait]
    impl SourceAdapter for Scripted {
        fn source(&self) -> SourceId {
            self.source.clone()
        }

        async fn fetch(&self, _request: FetchRequest) -> Result<Vec<RawRecord>, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let step = self.script.get(n).or(self.script.last()).cloned();
            match step {
                Some(Ok(k)) => Ok(vec![RawRecord::default(); k]),
                Some(Err(e)) => Err(e),
                None => Ok(Vec::new()),
            }
        }
    }

    fn target() -> Target {
        Target::new("M1", "Manchester", "North West", Level::High, Level::High, 53.48, -2.24)
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig::new(
            ConcurrencyLimits::default(),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                jitter: Duration::ZERO,
            },
            Duration::from_secs(5),
        )
    }

    fn task(adapter: Arc<Scripted>) -> FetchTask {
        FetchTask {
            target: target(),
            source: adapter.source.clone(),
            adapter,
            page_budget: 1,
            proxy: None,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<TaskReport>) -> Vec<TaskReport> {
        let mut out = Vec::new();
        while let Some(r) = rx.recv().await {
            out.push(r);
        }
        out
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: Duration::ZERO,
        };
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(2), Duration::from_millis(350));
        assert_eq!(p.backoff(40), Duration::from_millis(350));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
    }

    #[test]
    fn per_source_override_and_floor() {
        let mut limits = ConcurrencyLimits::default();
        limits.per_source.insert(SourceId::new("ebay"), 1);
        limits.per_source.insert(SourceId::new("gumtree"), 0);
        assert_eq!(limits.for_source(&SourceId::new("ebay")), 1);
        assert_eq!(limits.for_source(&SourceId::new("gumtree")), 1);
        assert_eq!(limits.for_source(&SourceId::new("autotrader")), 3);
    }

    #[tokio::test]
    async fn transient_failures_then_success() {
        let outcomes = Arc::new(OutcomeStore::in_memory());
        let adapter = Arc::new(Scripted {
            source: SourceId::new("ebay"),
            calls: AtomicU32::new(0),
            script: vec![Err(FetchError::RateLimited), Ok(4)],
        });
        let sched = FetchScheduler::new(fast_config(), outcomes.clone());
        let reports = collect(sched.run(vec![task(adapter)], CancellationToken::new())).await;

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].attempts, 2);
        assert_eq!(reports[0].outcome.record_count(), 4);
        let rec = outcomes.get(&TargetId::new("M1"), &SourceId::new("ebay")).unwrap();
        assert_eq!((rec.attempts, rec.successes, rec.total_listings), (1, 1, 4));
    }

    #[tokio::test]
    async fn parse_errors_are_not_retried() {
        let outcomes = Arc::new(OutcomeStore::in_memory());
        let adapter = Arc::new(Scripted {
            source: SourceId::new("ebay"),
            calls: AtomicU32::new(0),
            script: vec![Err(FetchError::Parse("layout changed".into()))],
        });
        let sched = FetchScheduler::new(fast_config(), outcomes.clone());
        let reports = collect(sched.run(vec![task(adapter.clone())], CancellationToken::new())).await;

        assert_eq!(reports[0].attempts, 1);
        assert_eq!(reports[0].outcome, TaskOutcome::Failed(FetchErrorKind::Parse));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcomes.rate(&TargetId::new("M1"), &SourceId::new("ebay")), Some(0.0));
    }

    #[tokio::test]
    async fn empty_result_is_not_a_learning_success() {
        let outcomes = Arc::new(OutcomeStore::in_memory());
        let adapter = Arc::new(Scripted {
            source: SourceId::new("gumtree"),
            calls: AtomicU32::new(0),
            script: vec![Ok(0)],
        });
        let sched = FetchScheduler::new(fast_config(), outcomes.clone());
        let reports = collect(sched.run(vec![task(adapter)], CancellationToken::new())).await;

        assert!(matches!(reports[0].outcome, TaskOutcome::Ok(ref r) if r.is_empty()));
        assert_eq!(outcomes.rate(&TargetId::new("M1"), &SourceId::new("gumtree")), Some(0.0));
    }

    #[tokio::test]
    async fn cancelled_before_start_admits_nothing() {
        let outcomes = Arc::new(OutcomeStore::in_memory());
        let adapter = Arc::new(Scripted {
            source: SourceId::new("ebay"),
            calls: AtomicU32::new(0),
            script: vec![Ok(1)],
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let sched = FetchScheduler::new(fast_config(), outcomes.clone());
        let reports = collect(sched.run(vec![task(adapter.clone()), task(adapter.clone())], cancel)).await;

        assert!(reports.is_empty());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn no_tasks_closes_stream() {
        let sched = FetchScheduler::new(fast_config(), Arc::new(OutcomeStore::in_memory()));
        assert!(collect(sched.run(Vec::new(), CancellationToken::new())).await.is_empty());
    }
}
