// src/orchestrator.rs
//! # Orchestrator
//!
//! One harvest run: select targets, fan them out over the requested sources,
//! fetch through the scheduler, then normalize and merge every record.
//!
//! Learning state is checkpointed and the dataset synced every
//! `checkpoint_every` reports and once more at the end. A store failure
//! stops admission of further tasks and aborts the run once the tasks already
//! in flight have finished. Their attempts reach the outcome store in memory
//! only; no checkpoint follows the failure.

use chrono::Utc;
use metrics::{counter, gauge};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::adapter::{DynAdapter, ProxyHandle, SourceId};
use crate::config::HarvestConfig;
use crate::error::RunError;
use crate::geo::{GeoIndex, GeoPoint, TargetId};
use crate::merge::{MergeOutcome, MergeStore};
use crate::metrics::{ensure_metrics_described, RECORDS_REJECTED_TOTAL, RUN_LAST_TS};
use crate::normalize::RecordNormalizer;
use crate::outcomes::OutcomeStore;
use crate::scheduler::{ConcurrencyLimits, FetchScheduler, FetchTask, SchedulerConfig, TaskOutcome, TaskReport};
use crate::selector::{Radius, SelectOptions, Strategy, TargetSelector};

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub sources: Vec<SourceId>,
    pub strategy: Strategy,
    pub target_count: usize,
    pub pages_per_target: u32,
    pub radius: Option<Radius>,
    pub include: Vec<String>,
    pub exclude_recent: bool,
    /// Passed to adapters unexamined.
    pub proxy: Option<ProxyHandle>,
    /// Overrides the orchestrator's default ceilings for this run.
    pub limits: Option<ConcurrencyLimits>,
    pub cancel: Option<CancellationToken>,
    /// Targets picked by earlier runs; returned updated in the summary.
    pub recently_used: HashSet<TargetId>,
}

impl RunRequest {
    pub fn new(sources: impl IntoIterator<Item = SourceId>) -> Self {
        Self {
            sources: sources.into_iter().collect(),
            strategy: Strategy::Mixed,
            target_count: 10,
            pages_per_target: 1,
            radius: None,
            include: Vec::new(),
            exclude_recent: false,
            proxy: None,
            limits: None,
            cancel: None,
            recently_used: HashSet::new(),
        }
    }

    /// Request built from the `[run]` section of the config.
    pub fn from_config(cfg: &HarvestConfig) -> Self {
        let mut req = Self::new(cfg.source_ids());
        req.strategy = cfg.run.strategy;
        req.target_count = cfg.run.targets;
        req.pages_per_target = cfg.run.pages_per_target;
        req.include = cfg.run.include.clone();
        req.exclude_recent = cfg.run.exclude_recent;
        req.radius = cfg.run.center.map(|c| Radius {
            center: GeoPoint::new(c.lat, c.lon),
            radius_km: c.radius_km,
        });
        req
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceTotals {
    pub tasks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub raw: usize,
    pub normalized: usize,
    pub rejected: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub per_source: BTreeMap<SourceId, SourceTotals>,
    pub rejection_reasons: BTreeMap<String, usize>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    pub selected_targets: Vec<TargetId>,
    /// Selected targets that produced no usable record from any source.
    pub zero_yield_targets: Vec<TargetId>,
    /// Requested sources with no registered adapter.
    pub unknown_sources: Vec<SourceId>,
    /// Tasks never started because the run was cancelled.
    pub not_admitted: usize,
    pub recently_used: HashSet<TargetId>,
    pub dataset_rows: usize,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl RunSummary {
    pub fn totals(&self) -> SourceTotals {
        self.per_source
            .values()
            .fold(SourceTotals::default(), |mut acc, t| {
                acc.tasks += t.tasks;
                acc.succeeded += t.succeeded;
                acc.failed += t.failed;
                acc.timed_out += t.timed_out;
                acc.raw += t.raw;
                acc.normalized += t.normalized;
                acc.rejected += t.rejected;
                acc.inserted += t.inserted;
                acc.updated += t.updated;
                acc.unchanged += t.unchanged;
                acc
            })
    }
}

pub struct Orchestrator {
    geo: Arc<GeoIndex>,
    outcomes: Arc<OutcomeStore>,
    merge: Arc<MergeStore>,
    adapters: HashMap<SourceId, DynAdapter>,
    scheduler: SchedulerConfig,
    normalizer: RecordNormalizer,
    checkpoint_every: usize,
}

impl Orchestrator {
    pub fn new(
        geo: Arc<GeoIndex>,
        outcomes: Arc<OutcomeStore>,
        merge: Arc<MergeStore>,
        scheduler: SchedulerConfig,
    ) -> Self {
        Self {
            geo,
            outcomes,
            merge,
            adapters: HashMap::new(),
            scheduler,
            normalizer: RecordNormalizer::new(),
            checkpoint_every: 10,
        }
    }

    pub fn with_adapter(mut self, adapter: DynAdapter) -> Self {
        self.register(adapter);
        self
    }

    pub fn with_normalizer(mut self, normalizer: RecordNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_checkpoint_every(mut self, n: usize) -> Self {
        self.checkpoint_every = n.max(1);
        self
    }

    /// Register (or replace) the adapter for its source.
    pub fn register(&mut self, adapter: DynAdapter) {
        let source = adapter.source();
        if self.adapters.insert(source.clone(), adapter).is_some() {
            tracing::warn!(target: "harvest", source = %source, "adapter replaced");
        }
    }

    pub fn sources(&self) -> Vec<SourceId> {
        let mut out: Vec<SourceId> = self.adapters.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn outcomes(&self) -> &Arc<OutcomeStore> {
        &self.outcomes
    }

    pub fn merge_store(&self) -> &Arc<MergeStore> {
        &self.merge
    }

    pub async fn run(&self, request: RunRequest) -> Result<RunSummary, RunError> {
        ensure_metrics_described();
        let started = Instant::now();

        if request.sources.is_empty() {
            return Err(RunError::NoSources);
        }

        let mut known: Vec<SourceId> = Vec::new();
        let mut unknown: Vec<SourceId> = Vec::new();
        for s in request.sources {
            if known.contains(&s) || unknown.contains(&s) {
                continue;
            }
            if self.adapters.contains_key(&s) {
                known.push(s);
            } else {
                tracing::warn!(target: "harvest", source = %s, "no adapter registered for source");
                unknown.push(s);
            }
        }

        let options = SelectOptions {
            radius: request.radius,
            include: request.include,
            exclude_recent: request.exclude_recent,
            sources: known.clone(),
        };
        let selection = TargetSelector::new(&self.geo, &self.outcomes).select(
            request.strategy,
            request.target_count,
            &options,
            request.recently_used,
        );

        let mut tasks = Vec::with_capacity(selection.targets.len() * known.len());
        for target in &selection.targets {
            for source in &known {
                let Some(adapter) = self.adapters.get(source) else {
                    continue;
                };
                tasks.push(FetchTask {
                    target: target.clone(),
                    source: source.clone(),
                    adapter: adapter.clone(),
                    page_budget: request.pages_per_target.max(1),
                    proxy: request.proxy.clone(),
                });
            }
        }
        let task_count = tasks.len();

        tracing::info!(
            target: "harvest",
            strategy = %request.strategy,
            targets = selection.targets.len(),
            sources = known.len(),
            tasks = task_count,
            "harvest run started"
        );

        let mut config = self.scheduler.clone();
        if let Some(limits) = request.limits {
            config.limits = limits;
        }
        // Child token: a store failure stops admission without cancelling the caller's token.
        let cancel = request
            .cancel
            .map(|c| c.child_token())
            .unwrap_or_default();
        let mut reports = FetchScheduler::new(config, self.outcomes.clone()).run(tasks, cancel.clone());

        let mut summary = RunSummary {
            selected_targets: selection.ids(),
            unknown_sources: unknown,
            recently_used: selection.recently_used,
            ..RunSummary::default()
        };
        for s in &known {
            summary.per_source.entry(s.clone()).or_default();
        }
        let mut usable: HashMap<TargetId, usize> = HashMap::new();

        let mut received = 0usize;
        while let Some(report) = reports.recv().await {
            received += 1;
            let step = self.absorb(report, &mut summary, &mut usable).map_err(RunError::from);
            let step = step.and_then(|()| {
                if received % self.checkpoint_every == 0 {
                    self.checkpoint()
                } else {
                    Ok(())
                }
            });
            if let Err(e) = step {
                return Err(abort(e, &cancel, &mut reports).await);
            }
        }
        self.checkpoint()?;

        summary.not_admitted = task_count - received;
        summary.zero_yield_targets = summary
            .selected_targets
            .iter()
            .filter(|t| usable.get(*t).copied().unwrap_or(0) == 0)
            .cloned()
            .collect();
        summary.dataset_rows = self.merge.len();
        summary.duration = started.elapsed();

        gauge!(RUN_LAST_TS).set(Utc::now().timestamp() as f64);
        let totals = summary.totals();
        tracing::info!(
            target: "harvest",
            tasks = totals.tasks,
            succeeded = totals.succeeded,
            failed = totals.failed + totals.timed_out,
            inserted = totals.inserted,
            updated = totals.updated,
            rejected = totals.rejected,
            not_admitted = summary.not_admitted,
            rows = summary.dataset_rows,
            ms = summary.duration.as_millis() as u64,
            "harvest run finished"
        );

        Ok(summary)
    }

    /// Fold one report into the summary, merging its usable records.
    fn absorb(
        &self,
        report: TaskReport,
        summary: &mut RunSummary,
        usable: &mut HashMap<TargetId, usize>,
    ) -> Result<(), crate::error::StoreError> {
        let totals = summary.per_source.entry(report.source.clone()).or_default();
        totals.tasks += 1;

        let records = match report.outcome {
            TaskOutcome::Ok(records) => {
                totals.succeeded += 1;
                records
            }
            TaskOutcome::Failed(_) => {
                totals.failed += 1;
                return Ok(());
            }
            TaskOutcome::TimedOut => {
                totals.timed_out += 1;
                return Ok(());
            }
        };
        totals.raw += records.len();

        for raw in &records {
            let listing = match self.normalizer.normalize(raw, &report.target, &report.source) {
                Ok(l) => l,
                Err(rejection) => {
                    totals.rejected += 1;
                    *summary
                        .rejection_reasons
                        .entry(rejection.reason_key())
                        .or_default() += 1;
                    counter!(RECORDS_REJECTED_TOTAL).increment(1);
                    tracing::debug!(
                        target: "harvest",
                        source = %report.source,
                        target_id = %report.target,
                        reason = %rejection,
                        "record rejected"
                    );
                    continue;
                }
            };
            totals.normalized += 1;
            *usable.entry(report.target.clone()).or_default() += 1;

            match self.merge.merge(listing)? {
                MergeOutcome::Inserted => totals.inserted += 1,
                MergeOutcome::Updated => totals.updated += 1,
                MergeOutcome::Unchanged => totals.unchanged += 1,
            }
        }
        Ok(())
    }

    fn checkpoint(&self) -> Result<(), RunError> {
        self.outcomes.checkpoint()?;
        self.merge.sync()?;
        Ok(())
    }
}

/// Stop admission and wait for in-flight tasks so nothing records after `run` returns.
async fn abort(
    err: RunError,
    cancel: &CancellationToken,
    reports: &mut mpsc::Receiver<TaskReport>,
) -> RunError {
    cancel.cancel();
    tracing::error!(target: "harvest", error = %err, "store failure, aborting run");
    let mut discarded = 0usize;
    while reports.recv().await.is_some() {
        discarded += 1;
    }
    if discarded > 0 {
        tracing::warn!(target: "harvest", discarded, "in-flight reports discarded after abort");
    }
    err
}
