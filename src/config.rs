// src/config.rs
//! Harvest configuration, loaded from TOML or JSON.
//!
//! Lookup order for [`load_config_default`]:
//! 1) `$HARVEST_CONFIG_PATH`
//! 2) `config/harvest.toml`
//! 3) `config/harvest.json`
//! 4) built-in defaults

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::adapter::SourceId;
use crate::scheduler::{ConcurrencyLimits, RetryPolicy, SchedulerConfig};
use crate::selector::Strategy;

pub const ENV_CONFIG_PATH: &str = "HARVEST_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON-lines dataset log.
    pub dataset_path: PathBuf,
    /// Outcome store snapshot.
    pub outcomes_path: PathBuf,
    /// Append-only attempt history; disabled when absent.
    pub history_path: Option<PathBuf>,
    /// Recently-used targets carried between runs; disabled when absent.
    pub recent_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dataset_path: PathBuf::from("data/listings.jsonl"),
            outcomes_path: PathBuf::from("data/outcomes.json"),
            history_path: Some(PathBuf::from("data/attempts.jsonl")),
            recent_path: Some(PathBuf::from("data/recent_targets.json")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CenterConfig {
    pub lat: f64,
    pub lon: f64,
    pub radius_km: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunDefaults {
    pub sources: Vec<String>,
    pub strategy: Strategy,
    pub targets: usize,
    pub pages_per_target: u32,
    pub exclude_recent: bool,
    pub include: Vec<String>,
    pub center: Option<CenterConfig>,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            sources: vec!["ebay".to_string(), "gumtree".to_string()],
            strategy: Strategy::Mixed,
            targets: 10,
            pages_per_target: 3,
            exclude_recent: true,
            include: Vec::new(),
            center: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub task_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let p = RetryPolicy::default();
        Self {
            max_attempts: p.max_attempts,
            base_delay_ms: p.base_delay.as_millis() as u64,
            max_delay_ms: p.max_delay.as_millis() as u64,
            jitter_ms: p.jitter.as_millis() as u64,
            task_timeout_secs: SchedulerConfig::default().task_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub storage: StorageConfig,
    /// Checkpoint learning state and sync the dataset every N task reports.
    pub checkpoint_every: usize,
    pub run: RunDefaults,
    pub concurrency: ConcurrencyLimits,
    pub retry: RetryConfig,
    /// Source name → fixture file served by the fixture adapter.
    pub fixtures: BTreeMap<String, PathBuf>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            checkpoint_every: 10,
            run: RunDefaults::default(),
            concurrency: ConcurrencyLimits::default(),
            retry: RetryConfig::default(),
            fixtures: BTreeMap::new(),
        }
    }
}

impl HarvestConfig {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::new(
            self.concurrency.clone(),
            RetryPolicy {
                max_attempts: self.retry.max_attempts,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                jitter: Duration::from_millis(self.retry.jitter_ms),
            },
            Duration::from_secs(self.retry.task_timeout_secs),
        )
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        let mut out: Vec<SourceId> = Vec::new();
        for s in &self.run.sources {
            let id = SourceId::new(s);
            if !id.as_str().is_empty() && !out.contains(&id) {
                out.push(id);
            }
        }
        out
    }

    /// Clamp values that would stall or disable the harvester.
    fn sanitize(mut self) -> Self {
        self.checkpoint_every = self.checkpoint_every.max(1);
        self.run.pages_per_target = self.run.pages_per_target.max(1);
        if let Some(c) = self.run.center {
            if !(c.radius_km.is_finite() && c.radius_km > 0.0) {
                self.run.center = None;
            }
        }

        self.concurrency.global = self.concurrency.global.max(1);
        self.concurrency.per_source_default = self.concurrency.per_source_default.max(1);
        self.concurrency.per_source = std::mem::take(&mut self.concurrency.per_source)
            .into_iter()
            .map(|(k, v)| (SourceId::new(k.as_str()), v.max(1)))
            .collect::<HashMap<_, _>>();

        self.retry.max_attempts = self.retry.max_attempts.max(1);
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            self.retry.max_delay_ms = self.retry.base_delay_ms;
        }
        self.retry.task_timeout_secs = self.retry.task_timeout_secs.max(1);

        self.fixtures = std::mem::take(&mut self.fixtures)
            .into_iter()
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v))
            .filter(|(k, _)| !k.is_empty())
            .collect();
        self
    }
}

/// Load configuration from an explicit path. Supports TOML or JSON formats.
pub fn load_config_from(path: &Path) -> Result<HarvestConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading harvest config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let cfg = parse_config(&content, ext.as_str())
        .with_context(|| format!("parsing harvest config {}", path.display()))?;
    tracing::info!(target: "harvest", path = %path.display(), "config loaded");
    Ok(cfg)
}

/// Load configuration using env var + fallbacks (see module docs).
pub fn load_config_default() -> Result<HarvestConfig> {
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_config_from(&pb);
        } else {
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
    }
    let toml_p = PathBuf::from("config/harvest.toml");
    if toml_p.exists() {
        return load_config_from(&toml_p);
    }
    let json_p = PathBuf::from("config/harvest.json");
    if json_p.exists() {
        return load_config_from(&json_p);
    }
    Ok(HarvestConfig::default())
}

fn parse_config(s: &str, hint_ext: &str) -> Result<HarvestConfig> {
    // JSON documents open with a brace; anything else is tried as TOML first.
    let looks_json = s.trim_start().starts_with('{');
    let try_toml_first = hint_ext == "toml" || (hint_ext != "json" && !looks_json);

    let first = if try_toml_first {
        parse_toml(s)
    } else {
        parse_json(s)
    };
    match first {
        Ok(cfg) => Ok(cfg),
        Err(first_err) => {
            let second = if try_toml_first {
                parse_json(s)
            } else {
                parse_toml(s)
            };
            second.map_err(|_| first_err.context("unsupported harvest config format"))
        }
    }
}

fn parse_toml(s: &str) -> Result<HarvestConfig> {
    let cfg: HarvestConfig = toml::from_str(s)?;
    Ok(cfg.sanitize())
}

fn parse_json(s: &str) -> Result<HarvestConfig> {
    let cfg: HarvestConfig = serde_json::from_str(s)?;
    Ok(cfg.sanitize())
}
