// src/selector.rs
//! # Target Selector
//!
//! Picks which targets a run visits, ranked by an *effectiveness score*:
//!
//! ```text
//! score = 0.3 · activity + 0.2 · density + 0.5 · success
//! ```
//!
//! where the class terms are normalised to `[0, 1]` and `success` is the
//! learned rate from the [`OutcomeStore`], or the neutral `0.5` for targets
//! never attempted. Targets with a confirmed below-neutral rate rank after
//! every cold target, so unexplored areas always get their chance.
//!
//! Recently used targets are an explicit input and come back updated in the
//! [`Selection`]; the selector keeps no state of its own.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::adapter::SourceId;
use crate::geo::{haversine_km, GeoIndex, GeoPoint, Level, Target, TargetId};
use crate::outcomes::OutcomeStore;

pub const WEIGHT_ACTIVITY: f64 = 0.3;
pub const WEIGHT_DENSITY: f64 = 0.2;
pub const WEIGHT_SUCCESS: f64 = 0.5;
/// Stand-in success rate for targets with no attempts.
pub const NEUTRAL_SUCCESS: f64 = 0.5;
/// Round-robin rounds across regions before falling back to score order.
pub const REGION_ROUND_CAP: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    HighDensityCenters,
    HighCommercialActivity,
    BalancedRegionalSpread,
    #[default]
    Mixed,
    ExplicitList,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::HighDensityCenters,
        Strategy::HighCommercialActivity,
        Strategy::BalancedRegionalSpread,
        Strategy::Mixed,
        Strategy::ExplicitList,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::HighDensityCenters => "high-density-centers",
            Strategy::HighCommercialActivity => "high-commercial-activity",
            Strategy::BalancedRegionalSpread => "balanced-regional-spread",
            Strategy::Mixed => "mixed",
            Strategy::ExplicitList => "explicit-list",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown strategy `{0}`")]
pub struct UnknownStrategy(pub String);

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase().replace('_', "-");
        Strategy::ALL
            .into_iter()
            .find(|st| st.as_str() == norm)
            .ok_or_else(|| UnknownStrategy(s.to_string()))
    }
}

/// Geographic constraint: keep targets within `radius_km` of `center`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Radius {
    pub center: GeoPoint,
    pub radius_km: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    pub radius: Option<Radius>,
    /// Explicit include list (postcodes or area codes). Required by
    /// `explicit-list`; a candidate filter for every other strategy.
    pub include: Vec<String>,
    pub exclude_recent: bool,
    /// Sources whose learned rates feed the score; empty = all known.
    pub sources: Vec<SourceId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredTarget {
    pub target: Target,
    pub score: f64,
    /// Pooled learned rate, `None` when cold.
    pub learned_rate: Option<f64>,
}

impl ScoredTarget {
    /// Confirmed below-neutral performers sort behind cold targets.
    fn demoted(&self) -> bool {
        matches!(self.learned_rate, Some(r) if r < NEUTRAL_SUCCESS)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub targets: Vec<Target>,
    pub recently_used: HashSet<TargetId>,
}

impl Selection {
    pub fn ids(&self) -> Vec<TargetId> {
        self.targets.iter().map(|t| t.id.clone()).collect()
    }
}

pub struct TargetSelector<'a> {
    geo: &'a GeoIndex,
    outcomes: &'a OutcomeStore,
}

impl<'a> TargetSelector<'a> {
    pub fn new(geo: &'a GeoIndex, outcomes: &'a OutcomeStore) -> Self {
        Self { geo, outcomes }
    }

    /// Effectiveness score of one target.
    pub fn score(&self, target: &Target, sources: &[SourceId]) -> ScoredTarget {
        let learned_rate = self.outcomes.aggregate_rate(&target.id, sources);
        let score = effectiveness(target.activity, target.density, learned_rate);
        ScoredTarget {
            target: target.clone(),
            score,
            learned_rate,
        }
    }

    /// Ordered list of at most `limit` targets. A `limit` larger than the pool
    /// returns the whole pool.
    pub fn select(
        &self,
        strategy: Strategy,
        limit: usize,
        options: &SelectOptions,
        recently_used: HashSet<TargetId>,
    ) -> Selection {
        let mut recently_used = recently_used;
        if limit == 0 {
            return Selection {
                targets: Vec::new(),
                recently_used,
            };
        }

        let candidates = self.candidates(strategy, options);
        let ordered = match strategy {
            // Caller order is the ranking.
            Strategy::ExplicitList => candidates,
            Strategy::BalancedRegionalSpread => {
                regional_round_robin(self.ranked(candidates, options))
            }
            Strategy::HighDensityCenters | Strategy::HighCommercialActivity | Strategy::Mixed => self
                .ranked(candidates, options)
                .into_iter()
                .map(|st| st.target)
                .collect(),
        };

        let picked = apply_exclusion(ordered, limit, options.exclude_recent, &recently_used);
        recently_used.extend(picked.iter().map(|t| t.id.clone()));

        tracing::debug!(
            target: "harvest",
            strategy = %strategy,
            limit,
            picked = picked.len(),
            "targets selected"
        );

        Selection {
            targets: picked,
            recently_used,
        }
    }

    fn candidates(&self, strategy: Strategy, options: &SelectOptions) -> Vec<Target> {
        let include: Option<Vec<&Target>> = (!options.include.is_empty()).then(|| {
            let mut seen = HashSet::new();
            options
                .include
                .iter()
                .filter_map(|code| {
                    let resolved = self.geo.resolve(code);
                    if resolved.is_none() {
                        tracing::warn!(
                            target: "harvest",
                            code = %code,
                            "unknown target in include list"
                        );
                    }
                    resolved
                })
                .filter(|t| seen.insert(t.id.clone()))
                .collect()
        });

        let base: Vec<&Target> = match (strategy, include) {
            (_, Some(list)) => list,
            (Strategy::ExplicitList, None) => Vec::new(),
            (_, None) => self.geo.iter().collect(),
        };

        base.into_iter()
            .filter(|t| match strategy {
                Strategy::HighDensityCenters => t.density == Level::High,
                Strategy::HighCommercialActivity => t.activity == Level::High,
                Strategy::BalancedRegionalSpread | Strategy::Mixed | Strategy::ExplicitList => true,
            })
            .filter(|t| match options.radius {
                Some(r) => haversine_km(r.center, t.location) <= r.radius_km,
                None => true,
            })
            .cloned()
            .collect()
    }

    fn ranked(&self, candidates: Vec<Target>, options: &SelectOptions) -> Vec<ScoredTarget> {
        let mut scored: Vec<ScoredTarget> = candidates
            .iter()
            .map(|t| self.score(t, &options.sources))
            .collect();
        scored.sort_by(rank_order);
        scored
    }
}

/// Weighted sum of the class terms and the learned (or neutral) rate.
pub fn effectiveness(activity: Level, density: Level, learned_rate: Option<f64>) -> f64 {
    let success = learned_rate.unwrap_or(NEUTRAL_SUCCESS);
    WEIGHT_ACTIVITY * activity.normalized()
        + WEIGHT_DENSITY * density.normalized()
        + WEIGHT_SUCCESS * success
}

fn rank_order(a: &ScoredTarget, b: &ScoredTarget) -> Ordering {
    a.demoted()
        .cmp(&b.demoted())
        .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
        .then_with(|| a.target.id.cmp(&b.target.id))
}

/// Interleave regions: one pick per region per round (regions ordered by their
/// best target), for up to `REGION_ROUND_CAP` rounds; leftovers follow in
/// plain rank order.
fn regional_round_robin(ranked: Vec<ScoredTarget>) -> Vec<Target> {
    let mut by_region: BTreeMap<String, Vec<ScoredTarget>> = BTreeMap::new();
    let mut region_order: Vec<String> = Vec::new();
    for st in ranked {
        if !by_region.contains_key(&st.target.region) {
            region_order.push(st.target.region.clone());
        }
        by_region.entry(st.target.region.clone()).or_default().push(st);
    }

    let mut queues: Vec<std::collections::VecDeque<ScoredTarget>> = region_order
        .iter()
        .filter_map(|r| by_region.remove(r))
        .map(Into::into)
        .collect();

    let mut out = Vec::new();
    for _ in 0..REGION_ROUND_CAP {
        let mut took_any = false;
        for q in queues.iter_mut() {
            if let Some(st) = q.pop_front() {
                out.push(st.target);
                took_any = true;
            }
        }
        if !took_any {
            break;
        }
    }

    let mut rest: Vec<ScoredTarget> = queues.into_iter().flatten().collect();
    rest.sort_by(rank_order);
    out.extend(rest.into_iter().map(|st| st.target));
    out
}

/// Skip recently used targets unless that would leave the selection short;
/// then backfill with the best excluded ones, keeping rank order.
fn apply_exclusion(
    ordered: Vec<Target>,
    limit: usize,
    exclude_recent: bool,
    recently_used: &HashSet<TargetId>,
) -> Vec<Target> {
    if !exclude_recent {
        return ordered.into_iter().take(limit).collect();
    }

    let (fresh, used): (Vec<Target>, Vec<Target>) = ordered
        .into_iter()
        .partition(|t| !recently_used.contains(&t.id));

    let mut picked: Vec<Target> = fresh.into_iter().take(limit).collect();
    if picked.len() < limit {
        let short = limit - picked.len();
        tracing::debug!(target: "harvest", short, "relaxing recent-target exclusion");
        picked.extend(used.into_iter().take(short));
    }
    picked
}
