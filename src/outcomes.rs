// src/outcomes.rs
//! # Outcome Store
//!
//! Learned success history per `(target, source)` pair; the substrate the
//! target selector ranks on.
//!
//! - Plain running ratio (`successes / attempts`); recency lives in
//!   `last_updated`, not in weighting.
//! - Per-key updates are linearizable: each key is mutated under its map
//!   entry lock, and unrelated keys update in parallel.
//! - `checkpoint()` writes an atomic JSON snapshot (temp file + rename) and
//!   appends the buffered attempt log to a JSON-lines history file.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::adapter::SourceId;
use crate::error::StoreError;
use crate::geo::TargetId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct OutcomeKey {
    target: TargetId,
    source: SourceId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub target: TargetId,
    pub source: SourceId,
    pub attempts: u64,
    pub successes: u64,
    /// Raw records returned across successful attempts.
    #[serde(default)]
    pub total_listings: u64,
    pub last_updated: DateTime<Utc>,
}

impl OutcomeRecord {
    fn empty(target: TargetId, source: SourceId, now: DateTime<Utc>) -> Self {
        Self {
            target,
            source,
            attempts: 0,
            successes: 0,
            total_listings: 0,
            last_updated: now,
        }
    }

    /// `None` while the pair has never been attempted ("unknown", not zero).
    pub fn success_rate(&self) -> Option<f64> {
        (self.attempts > 0).then(|| self.successes as f64 / self.attempts as f64)
    }

    pub fn avg_listings_per_attempt(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.total_listings as f64 / self.attempts as f64
        }
    }
}

/// One `record` call, kept for the append-only history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptEntry {
    pub target: TargetId,
    pub source: SourceId,
    pub success: bool,
    pub listings: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    records: Vec<OutcomeRecord>,
}

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Default)]
pub struct OutcomeStore {
    records: DashMap<OutcomeKey, OutcomeRecord>,
    pending_history: Mutex<Vec<AttemptEntry>>,
    snapshot_path: Option<PathBuf>,
    history_path: Option<PathBuf>,
}

impl OutcomeStore {
    /// Volatile store; `checkpoint()` is a no-op.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open (or create on first checkpoint) a persisted store.
    ///
    /// A snapshot that exists but cannot be decoded is an error rather than a
    /// silent reset of everything learned so far.
    pub fn open(
        snapshot_path: impl Into<PathBuf>,
        history_path: Option<PathBuf>,
    ) -> Result<Self, StoreError> {
        let snapshot_path = snapshot_path.into();
        let records = DashMap::new();

        match fs::read_to_string(&snapshot_path) {
            Ok(s) => {
                let snap: Snapshot =
                    serde_json::from_str(&s).map_err(|source| StoreError::Decode {
                        path: snapshot_path.clone(),
                        source,
                    })?;
                for r in snap.records {
                    let key = OutcomeKey {
                        target: r.target.clone(),
                        source: r.source.clone(),
                    };
                    records.insert(key, r);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&snapshot_path, e)),
        }

        tracing::info!(
            target: "outcomes",
            path = %snapshot_path.display(),
            pairs = records.len(),
            "outcome store loaded"
        );

        Ok(Self {
            records,
            pending_history: Mutex::new(Vec::new()),
            snapshot_path: Some(snapshot_path),
            history_path,
        })
    }

    /// Count one terminal attempt for the pair. `listings` is the number of raw
    /// records the attempt yielded.
    pub fn record(
        &self,
        target: &TargetId,
        source: &SourceId,
        success: bool,
        listings: usize,
    ) -> OutcomeRecord {
        self.record_at(target, source, success, listings, Utc::now())
    }

    pub fn record_at(
        &self,
        target: &TargetId,
        source: &SourceId,
        success: bool,
        listings: usize,
        now: DateTime<Utc>,
    ) -> OutcomeRecord {
        let key = OutcomeKey {
            target: target.clone(),
            source: source.clone(),
        };
        let updated = {
            let mut entry = self
                .records
                .entry(key)
                .or_insert_with(|| OutcomeRecord::empty(target.clone(), source.clone(), now));
            entry.attempts += 1;
            if success {
                entry.successes += 1;
                entry.total_listings += listings as u64;
            }
            entry.last_updated = now;
            entry.value().clone()
        };

        self.pending_history.lock().push(AttemptEntry {
            target: target.clone(),
            source: source.clone(),
            success,
            listings: listings as u64,
            at: now,
        });

        updated
    }

    pub fn get(&self, target: &TargetId, source: &SourceId) -> Option<OutcomeRecord> {
        let key = OutcomeKey {
            target: target.clone(),
            source: source.clone(),
        };
        self.records.get(&key).map(|r| r.value().clone())
    }

    /// Learned rate for one pair; `None` = never attempted.
    pub fn rate(&self, target: &TargetId, source: &SourceId) -> Option<f64> {
        self.get(target, source).and_then(|r| r.success_rate())
    }

    /// Rate pooled over several sources (all known sources when `sources` is
    /// empty). `None` when none of them has attempts for this target.
    pub fn aggregate_rate(&self, target: &TargetId, sources: &[SourceId]) -> Option<f64> {
        let (attempts, successes) = if sources.is_empty() {
            self.records
                .iter()
                .filter(|r| &r.target == target)
                .fold((0u64, 0u64), |(a, s), r| (a + r.attempts, s + r.successes))
        } else {
            sources
                .iter()
                .filter_map(|s| self.get(target, s))
                .fold((0u64, 0u64), |(a, s), r| (a + r.attempts, s + r.successes))
        };
        (attempts > 0).then(|| successes as f64 / attempts as f64)
    }

    /// All records, ordered by `(target, source)`.
    pub fn snapshot(&self) -> Vec<OutcomeRecord> {
        let mut out: Vec<OutcomeRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        out.sort_by(|a, b| (&a.target, &a.source).cmp(&(&b.target, &b.source)));
        out
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Persist the learned state and flush buffered history.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        if let Some(path) = &self.snapshot_path {
            let snap = Snapshot {
                version: SNAPSHOT_VERSION,
                records: self.snapshot(),
            };
            let bytes = serde_json::to_vec_pretty(&snap).map_err(|source| StoreError::Encode {
                path: path.clone(),
                source,
            })?;
            write_atomic(path, &bytes)?;
        }

        let pending = std::mem::take(&mut *self.pending_history.lock());
        if let (Some(path), false) = (&self.history_path, pending.is_empty()) {
            if let Err(e) = append_history(path, &pending) {
                // Put entries back so a later checkpoint can retry.
                let mut buf = self.pending_history.lock();
                let newer = std::mem::replace(&mut *buf, pending);
                buf.extend(newer);
                return Err(e);
            }
        }

        tracing::debug!(target: "outcomes", pairs = self.records.len(), "checkpoint written");
        Ok(())
    }
}

/// Write `bytes` to `path` via a sibling temp file and an atomic rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|source| StoreError::Persist {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn append_history(path: &Path, entries: &[AttemptEntry]) -> Result<(), StoreError> {
    fs::create_dir_all(parent_dir(path)).map_err(|e| StoreError::io(parent_dir(path), e))?;
    let mut buf = Vec::with_capacity(entries.len() * 96);
    for e in entries {
        serde_json::to_writer(&mut buf, e).map_err(|source| StoreError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
        buf.push(b'\n');
    }
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;
    f.write_all(&buf).map_err(|e| StoreError::io(path, e))?;
    f.sync_data().map_err(|e| StoreError::io(path, e))
}
