// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod adapter;
pub mod adapters;
pub mod config;
pub mod error;
pub mod geo;
pub mod merge;
pub mod metrics;
pub mod normalize;
pub mod orchestrator;
pub mod outcomes;
pub mod scheduler;
pub mod selector;

// ---- Re-exports for stable public API ----
pub use crate::adapter::{
    DynAdapter, FetchError, FetchErrorKind, FetchRequest, ProxyHandle, RawRecord, SourceAdapter,
    SourceId,
};
pub use crate::error::{RunError, StoreError};
pub use crate::geo::{GeoIndex, GeoPoint, Level, Target, TargetId};
pub use crate::merge::{MergeOutcome, MergeStore, MergedRecord};
pub use crate::normalize::{Listing, ListingNature, RecordNormalizer, Rejection};
pub use crate::orchestrator::{Orchestrator, RunRequest, RunSummary, SourceTotals};
pub use crate::outcomes::{OutcomeRecord, OutcomeStore};
pub use crate::scheduler::{
    ConcurrencyLimits, FetchScheduler, FetchTask, RetryPolicy, SchedulerConfig, TaskOutcome,
    TaskReport,
};
pub use crate::selector::{Radius, SelectOptions, Selection, Strategy, TargetSelector};
