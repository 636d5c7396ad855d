//! Cluster selection among VDC candidates.
//!
//! Strategies score a candidate by the normalised headroom it would have
//! left after taking the request: for every resource with a non-zero limit,
//! `(available - request) / limit`, averaged. Spread prefers the highest
//! score, bin packing the lowest.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;
use vdc_proto::{ClusterId, QuotaSnapshot, ResourceVector};

use crate::error::{Result, SchedulerError};

/// A cluster offered for placement with its current quota view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterCandidate {
    /// Cluster scope.
    pub cluster: ClusterId,
    /// Quota view used for ranking.
    pub snapshot: QuotaSnapshot,
}

impl ClusterCandidate {
    /// Pair a cluster with a snapshot.
    #[must_use]
    pub const fn new(cluster: ClusterId, snapshot: QuotaSnapshot) -> Self {
        Self { cluster, snapshot }
    }
}

/// Mean fraction of each limited resource left after placing `request`.
///
/// Resources the request does not fit in count as zero headroom. A
/// snapshot without any limit scores zero.
#[must_use]
pub fn headroom_after(request: &ResourceVector, snapshot: &QuotaSnapshot) -> f64 {
    let available = snapshot.available();
    let limits = snapshot.limits;
    let dims = [
        (limits.cpu, available.cpu, request.cpu),
        (limits.memory, available.memory, request.memory),
        (
            f64::from(limits.gpu),
            f64::from(available.gpu),
            f64::from(request.gpu),
        ),
    ];

    let mut total = 0.0;
    let mut counted = 0u32;
    for (limit, avail, req) in dims {
        if limit <= 0.0 {
            continue;
        }
        total += ((avail - req).max(0.0) / limit).min(1.0);
        counted += 1;
    }
    if counted == 0 {
        0.0
    } else {
        total / f64::from(counted)
    }
}

/// Scores candidates; higher is better.
pub trait SelectionStrategy: Send + Sync {
    /// Strategy name, for logs.
    fn name(&self) -> &'static str;

    /// Score a candidate that fits `request`.
    fn score(&self, request: &ResourceVector, snapshot: &QuotaSnapshot) -> f64;
}

/// Prefer the cluster with the most headroom left.
#[derive(Debug, Clone, Copy, Default)]
pub struct Spread;

impl SelectionStrategy for Spread {
    fn name(&self) -> &'static str {
        "spread"
    }

    fn score(&self, request: &ResourceVector, snapshot: &QuotaSnapshot) -> f64 {
        headroom_after(request, snapshot)
    }
}

/// Prefer the cluster that will be most full.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinPack;

impl SelectionStrategy for BinPack {
    fn name(&self) -> &'static str {
        "bin_pack"
    }

    fn score(&self, request: &ResourceVector, snapshot: &QuotaSnapshot) -> f64 {
        1.0 - headroom_after(request, snapshot)
    }
}

/// Strategy selector used in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionKind {
    /// [`Spread`].
    #[default]
    Spread,
    /// [`BinPack`].
    BinPack,
}

impl SelectionKind {
    /// Build the strategy.
    #[must_use]
    pub fn build(self) -> Box<dyn SelectionStrategy> {
        match self {
            Self::Spread => Box::new(Spread),
            Self::BinPack => Box::new(BinPack),
        }
    }
}

impl fmt::Display for SelectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spread => f.write_str("spread"),
            Self::BinPack => f.write_str("bin_pack"),
        }
    }
}

/// Ranks candidate clusters with a pluggable strategy.
pub struct ClusterSelector {
    strategy: Box<dyn SelectionStrategy>,
}

impl fmt::Debug for ClusterSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterSelector")
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

impl Default for ClusterSelector {
    fn default() -> Self {
        Self::new(Box::new(Spread))
    }
}

impl ClusterSelector {
    /// Create a selector.
    #[must_use]
    pub fn new(strategy: Box<dyn SelectionStrategy>) -> Self {
        Self { strategy }
    }

    /// Create a selector from a configured kind.
    #[must_use]
    pub fn from_kind(kind: SelectionKind) -> Self {
        Self::new(kind.build())
    }

    /// Name of the strategy in use.
    #[must_use]
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Candidates with room for `request`, best first.
    ///
    /// Stale snapshots are never ranked. Equal scores are ordered by
    /// cluster id.
    #[must_use]
    pub fn rank(&self, request: &ResourceVector, candidates: &[ClusterCandidate]) -> Vec<ClusterId> {
        let mut scored: Vec<(f64, &ClusterId)> = candidates
            .iter()
            .filter(|c| !c.snapshot.stale && c.snapshot.has_capacity(request))
            .map(|c| (self.strategy.score(request, &c.snapshot), &c.cluster))
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.cmp(b.1))
        });
        debug!(
            strategy = self.strategy.name(),
            offered = candidates.len(),
            fitting = scored.len(),
            "ranked clusters"
        );
        scored.into_iter().map(|(_, id)| id.clone()).collect()
    }

    /// Best cluster with room for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NoCapacity`] if no candidate fits.
    pub fn choose(&self, request: &ResourceVector, candidates: &[ClusterCandidate]) -> Result<ClusterId> {
        self.rank(request, candidates)
            .into_iter()
            .next()
            .ok_or(SchedulerError::NoCapacity { request: *request })
    }

    /// Cluster to queue against when nothing fits now: the one with the
    /// most headroom regardless of fit, fresh snapshots before stale ones.
    #[must_use]
    pub fn best_effort(
        &self,
        request: &ResourceVector,
        candidates: &[ClusterCandidate],
    ) -> Option<ClusterId> {
        candidates
            .iter()
            .max_by(|a, b| {
                b.snapshot
                    .stale
                    .cmp(&a.snapshot.stale)
                    .then_with(|| {
                        headroom_after(request, &a.snapshot)
                            .partial_cmp(&headroom_after(request, &b.snapshot))
                            .unwrap_or(Ordering::Equal)
                    })
                    .then_with(|| b.cluster.cmp(&a.cluster))
            })
            .map(|c| c.cluster.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rv(cpu: f64, memory: f64, gpu: u32) -> ResourceVector {
        ResourceVector::new(cpu, memory, gpu).unwrap_or_else(|_| unreachable!())
    }

    fn candidate(id: &str, limits: ResourceVector, used: ResourceVector) -> ClusterCandidate {
        ClusterCandidate::new(
            ClusterId::new(id).unwrap_or_else(|_| unreachable!()),
            QuotaSnapshot::new(limits, used),
        )
    }

    fn names(ids: &[ClusterId]) -> Vec<&str> {
        ids.iter().map(ClusterId::as_str).collect()
    }

    // ==================== Scoring ====================

    #[test]
    fn test_headroom_ignores_unlimited_dimensions() {
        let snapshot = QuotaSnapshot::empty(rv(4.0, 0.0, 0));
        let score = headroom_after(&rv(1.0, 0.0, 0), &snapshot);
        assert!((score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_headroom_of_empty_limits_is_zero() {
        let snapshot = QuotaSnapshot::empty(ResourceVector::ZERO);
        assert!(headroom_after(&ResourceVector::ZERO, &snapshot).abs() < f64::EPSILON);
    }

    // ==================== Ranking ====================

    #[test]
    fn test_spread_picks_most_headroom() {
        let candidates = vec![
            candidate("small", rv(2.0, 0.0, 0), ResourceVector::ZERO),
            candidate("large", rv(4.0, 1.0, 0), ResourceVector::ZERO),
        ];
        let selector = ClusterSelector::from_kind(SelectionKind::Spread);
        let chosen = selector.choose(&rv(1.0, 0.0, 0), &candidates);
        assert_eq!(chosen.ok().map(|c| c.to_string()), Some("large".to_string()));
    }

    #[test]
    fn test_bin_pack_picks_fullest() {
        let candidates = vec![
            candidate("busy", rv(8.0, 0.0, 0), rv(6.0, 0.0, 0)),
            candidate("idle", rv(8.0, 0.0, 0), ResourceVector::ZERO),
        ];
        let selector = ClusterSelector::from_kind(SelectionKind::BinPack);
        assert_eq!(names(&selector.rank(&rv(1.0, 0.0, 0), &candidates)), vec!["busy", "idle"]);
    }

    #[test]
    fn test_rank_filters_misfits_and_stale() {
        let mut stale = candidate("stale", rv(64.0, 0.0, 0), ResourceVector::ZERO);
        stale.snapshot = stale.snapshot.into_stale();
        let candidates = vec![
            stale,
            candidate("tiny", rv(1.0, 0.0, 0), ResourceVector::ZERO),
            candidate("ok", rv(8.0, 0.0, 0), ResourceVector::ZERO),
        ];
        let selector = ClusterSelector::default();
        assert_eq!(names(&selector.rank(&rv(2.0, 0.0, 0), &candidates)), vec!["ok"]);
    }

    #[test]
    fn test_equal_scores_ordered_by_id() {
        let candidates = vec![
            candidate("b", rv(4.0, 0.0, 0), ResourceVector::ZERO),
            candidate("a", rv(4.0, 0.0, 0), ResourceVector::ZERO),
        ];
        let selector = ClusterSelector::default();
        assert_eq!(names(&selector.rank(&rv(1.0, 0.0, 0), &candidates)), vec!["a", "b"]);
    }

    #[test]
    fn test_choose_without_fit_is_no_capacity() {
        let candidates = vec![candidate("a", rv(1.0, 0.0, 0), ResourceVector::ZERO)];
        let selector = ClusterSelector::default();
        assert!(matches!(
            selector.choose(&rv(2.0, 0.0, 0), &candidates),
            Err(SchedulerError::NoCapacity { .. })
        ));
    }

    // ==================== Best effort ====================

    #[test]
    fn test_best_effort_ignores_fit() {
        let candidates = vec![
            candidate("full", rv(8.0, 0.0, 0), rv(8.0, 0.0, 0)),
            candidate("half", rv(8.0, 0.0, 0), rv(4.0, 0.0, 0)),
        ];
        let selector = ClusterSelector::default();
        let chosen = selector.best_effort(&rv(16.0, 0.0, 0), &candidates);
        // Neither fits; ties on zero headroom fall back to id order.
        assert_eq!(chosen.map(|c| c.to_string()), Some("full".to_string()));

        let chosen = selector.best_effort(&rv(2.0, 0.0, 0), &candidates);
        assert_eq!(chosen.map(|c| c.to_string()), Some("half".to_string()));
    }

    #[test]
    fn test_best_effort_prefers_fresh() {
        let mut stale = candidate("stale", rv(64.0, 0.0, 0), ResourceVector::ZERO);
        stale.snapshot = stale.snapshot.into_stale();
        let candidates = vec![stale, candidate("fresh", rv(1.0, 0.0, 0), rv(1.0, 0.0, 0))];
        let selector = ClusterSelector::default();
        assert_eq!(
            selector
                .best_effort(&rv(1.0, 0.0, 0), &candidates)
                .map(|c| c.to_string()),
            Some("fresh".to_string())
        );
    }

    #[test]
    fn test_best_effort_empty() {
        assert!(ClusterSelector::default()
            .best_effort(&ResourceVector::ZERO, &[])
            .is_none());
    }
}
