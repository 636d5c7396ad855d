//! Queue ordering policies.
//!
//! A policy only orders; admission decides what fits. Ordering is pure,
//! deterministic and total: ties always fall back to the insertion sequence
//! and finally the job id.
//!
//! Neither policy ages jobs. Under sustained high-priority load a
//! low-priority job can wait indefinitely with [`PriorityPolicy`].

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use vdc_proto::Job;

/// Orders the pending queue for an admission pass.
pub trait SchedulingPolicy: Send + Sync {
    /// Policy name, for logs.
    fn name(&self) -> &'static str;

    /// Return `jobs` in admission order.
    fn order(&self, jobs: &[Job]) -> Vec<Job>;
}

fn arrival_order(a: &Job, b: &Job) -> Ordering {
    a.submitted_at
        .cmp(&b.submitted_at)
        .then_with(|| a.sequence.cmp(&b.sequence))
        .then_with(|| a.id.cmp(&b.id))
}

/// First in, first out by submission time.
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoPolicy;

impl SchedulingPolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn order(&self, jobs: &[Job]) -> Vec<Job> {
        let mut ordered = jobs.to_vec();
        ordered.sort_by(arrival_order);
        ordered
    }
}

/// Highest priority first, then FIFO.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityPolicy;

impl SchedulingPolicy for PriorityPolicy {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn order(&self, jobs: &[Job]) -> Vec<Job> {
        let mut ordered = jobs.to_vec();
        ordered.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| arrival_order(a, b))
        });
        ordered
    }
}

/// Policy selector used in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// [`FifoPolicy`].
    #[default]
    Fifo,
    /// [`PriorityPolicy`].
    Priority,
}

impl PolicyKind {
    /// Build the policy.
    #[must_use]
    pub fn build(self) -> Arc<dyn SchedulingPolicy> {
        match self {
            Self::Fifo => Arc::new(FifoPolicy),
            Self::Priority => Arc::new(PriorityPolicy),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fifo => f.write_str("fifo"),
            Self::Priority => f.write_str("priority"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use proptest::prelude::*;
    use vdc_proto::{ExecutorType, JobId, JobRequest, ResourceVector};

    fn base_time() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
    }

    fn job(id: &str, priority: i32, offset_secs: i64, sequence: u64) -> Job {
        let request = JobRequest::new(
            JobId::new(id).unwrap_or_else(|_| unreachable!()),
            ResourceVector::ZERO.with_cpu(1.0),
            ExecutorType::Local,
        )
        .with_priority(priority);
        let mut job = Job::from_request(request, base_time() + Duration::seconds(offset_secs));
        job.sequence = sequence;
        job
    }

    fn ids(jobs: &[Job]) -> Vec<&str> {
        jobs.iter().map(|j| j.id.as_str()).collect()
    }

    // ==================== FIFO ====================

    #[test]
    fn test_fifo_ignores_priority() {
        let jobs = vec![job("c", 100, 30, 2), job("a", -5, 10, 0), job("b", 50, 20, 1)];
        assert_eq!(ids(&FifoPolicy.order(&jobs)), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_fifo_ties_by_sequence_then_id() {
        let jobs = vec![job("z", 0, 0, 1), job("y", 0, 0, 0), job("x", 0, 0, 1)];
        assert_eq!(ids(&FifoPolicy.order(&jobs)), vec!["y", "x", "z"]);
    }

    // ==================== Priority ====================

    #[test]
    fn test_priority_higher_first() {
        let jobs = vec![job("low", 1, 0, 0), job("high", 10, 0, 1), job("mid", 5, 0, 2)];
        assert_eq!(ids(&PriorityPolicy.order(&jobs)), vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_priority_equal_is_fifo() {
        let jobs = vec![job("later", 3, 20, 1), job("earlier", 3, 10, 0)];
        assert_eq!(ids(&PriorityPolicy.order(&jobs)), vec!["earlier", "later"]);
    }

    #[test]
    fn test_kind_builds_named_policy() {
        assert_eq!(PolicyKind::Fifo.build().name(), "fifo");
        assert_eq!(PolicyKind::Priority.build().name(), "priority");
        assert_eq!(PolicyKind::default(), PolicyKind::Fifo);
    }

    proptest! {
        #[test]
        fn prop_fifo_distinct_times_sorted(offsets in proptest::collection::hash_set(0i64..10_000, 1..30)) {
            let jobs: Vec<Job> = offsets
                .iter()
                .enumerate()
                .map(|(i, off)| job(&format!("j{i}"), (i as i32 * 7) % 11, *off, i as u64))
                .collect();
            let ordered = FifoPolicy.order(&jobs);
            prop_assert_eq!(ordered.len(), jobs.len());
            for pair in ordered.windows(2) {
                prop_assert!(pair[0].submitted_at < pair[1].submitted_at);
            }
        }

        #[test]
        fn prop_priority_is_deterministic(priorities in proptest::collection::vec(-5i32..5, 1..30)) {
            let jobs: Vec<Job> = priorities
                .iter()
                .enumerate()
                .map(|(i, p)| job(&format!("j{i}"), *p, 0, i as u64))
                .collect();
            let mut reversed = jobs.clone();
            reversed.reverse();
            prop_assert_eq!(PriorityPolicy.order(&jobs), PriorityPolicy.order(&reversed));
        }
    }
}
