// src/adapters/fixture.rs
//! Adapter serving pre-extracted raw records from JSON.
//!
//! Fixture shape:
//!
//! ```json
//! {
//!   "source": "ebay",
//!   "page_size": 20,
//!   "latency_ms": 5,
//!   "targets": { "M1": [ { "title": "...", "price": "£9,995" } ] },
//!   "failures": { "B1": "rate-limited" }
//! }
//! ```
//!
//! Targets listed under `failures` always fail with that error kind; unknown
//! targets return no records.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::adapter::{FetchError, FetchErrorKind, FetchRequest, RawRecord, SourceAdapter, SourceId};
use crate::geo::TargetId;

#[derive(Debug, Deserialize)]
struct FixtureFile {
    source: String,
    #[serde(default)]
    page_size: Option<usize>,
    #[serde(default)]
    latency_ms: u64,
    #[serde(default)]
    targets: HashMap<String, Vec<RawRecord>>,
    #[serde(default)]
    failures: HashMap<String, FetchErrorKind>,
}

#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    source: SourceId,
    page_size: Option<usize>,
    latency: Duration,
    records: HashMap<TargetId, Vec<RawRecord>>,
    failures: HashMap<TargetId, FetchErrorKind>,
}

impl FixtureAdapter {
    pub fn new(source: impl AsRef<str>) -> Self {
        Self {
            source: SourceId::new(source),
            page_size: None,
            latency: Duration::ZERO,
            records: HashMap::new(),
            failures: HashMap::new(),
        }
    }

    pub fn with_records(mut self, target: impl AsRef<str>, records: Vec<RawRecord>) -> Self {
        self.records
            .entry(TargetId::new(target))
            .or_default()
            .extend(records);
        self
    }

    pub fn with_failure(mut self, target: impl AsRef<str>, kind: FetchErrorKind) -> Self {
        self.failures.insert(TargetId::new(target), kind);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn from_json(s: &str) -> Result<Self> {
        let file: FixtureFile = serde_json::from_str(s).context("parsing listing fixture json")?;
        let mut adapter = Self::new(&file.source).with_latency(Duration::from_millis(file.latency_ms));
        adapter.page_size = file.page_size.filter(|n| *n > 0);
        for (code, records) in file.targets {
            adapter = adapter.with_records(code, records);
        }
        for (code, kind) in file.failures {
            adapter = adapter.with_failure(code, kind);
        }
        Ok(adapter)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture {}", path.display()))?;
        Self::from_json(&s).with_context(|| format!("loading fixture {}", path.display()))
    }

    pub fn target_count(&self) -> usize {
        self.records.len()
    }
}

/// Load the configured `name → path` fixtures. A file that fails to load, or
/// whose `source` differs from its configured name, is skipped with a warning.
pub fn load_fixtures(fixtures: &BTreeMap<String, PathBuf>) -> Vec<FixtureAdapter> {
    let mut out = Vec::with_capacity(fixtures.len());
    for (name, path) in fixtures {
        let adapter = match FixtureAdapter::from_path(path) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(target: "harvest", source = %name, error = ?e, "fixture skipped");
                continue;
            }
        };
        if adapter.source != SourceId::new(name) {
            tracing::warn!(
                target: "harvest",
                source = %name,
                file_source = %adapter.source,
                path = %path.display(),
                "fixture skipped: file serves a different source"
            );
            continue;
        }
        tracing::info!(
            target: "harvest",
            source = %name,
            targets = adapter.target_count(),
            "fixture adapter loaded"
        );
        out.push(adapter);
    }
    out
}

fn error_of(kind: FetchErrorKind, target: &TargetId) -> FetchError {
    match kind {
        FetchErrorKind::Network => FetchError::Network(format!("fixture network failure for {target}")),
        FetchErrorKind::Timeout => FetchError::Timeout,
        FetchErrorKind::RateLimited => FetchError::RateLimited,
        FetchErrorKind::Parse => FetchError::Parse(format!("fixture page for {target} unreadable")),
        FetchErrorKind::Malformed => FetchError::Malformed(format!("fixture rejects {target}")),
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source(&self) -> SourceId {
        self.source.clone()
    }

    async fn fetch(&self, request: FetchRequest) -> Result<Vec<RawRecord>, FetchError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let id = &request.target.id;
        if let Some(kind) = self.failures.get(id) {
            return Err(error_of(*kind, id));
        }

        let records = self.records.get(id).cloned().unwrap_or_default();
        Ok(match self.page_size {
            Some(n) => records
                .into_iter()
                .take(n.saturating_mul(request.page_budget.max(1) as usize))
                .collect(),
            None => records,
        })
    }
}
