//! Scheduler and quota manager settings.
//!
//! Durations are written in seconds in configuration files (`*_secs` keys,
//! integer or fractional) and held as [`Duration`] in memory.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use vdc_quota::RemoteQuotaConfig;

use crate::error::{Result, SchedulerError};
use crate::policy::PolicyKind;
use crate::selector::SelectionKind;

/// Serde adapter storing a [`Duration`] as seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Secs {
        Whole(u64),
        Fractional(f64),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if value.subsec_nanos() == 0 {
            serializer.serialize_u64(value.as_secs())
        } else {
            serializer.serialize_f64(value.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Secs::deserialize(deserializer)? {
            Secs::Whole(secs) => Ok(Duration::from_secs(secs)),
            Secs::Fractional(secs) => {
                Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
            }
        }
    }
}

/// Settings for admission, dispatch and cluster selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Queue ordering policy.
    pub policy: PolicyKind,
    /// Cluster selection strategy.
    pub selection: SelectionKind,
    /// Period of the admission tick.
    #[serde(rename = "admission_interval_secs", with = "duration_secs")]
    pub admission_interval: Duration,
    /// Period of status polling for running jobs.
    #[serde(rename = "poll_interval_secs", with = "duration_secs")]
    pub poll_interval: Duration,
    /// Bound on one executor submit.
    #[serde(rename = "dispatch_timeout_secs", with = "duration_secs")]
    pub dispatch_timeout: Duration,
    /// Bound on one executor status query.
    #[serde(rename = "poll_timeout_secs", with = "duration_secs")]
    pub poll_timeout: Duration,
    /// Failed dispatches tolerated before a job is marked failed.
    pub max_dispatch_retries: u32,
    /// Clusters tried after the best-ranked one before queuing best-effort.
    pub fallback_count: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            selection: SelectionKind::default(),
            admission_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(10),
            dispatch_timeout: Duration::from_secs(30),
            poll_timeout: Duration::from_secs(10),
            max_dispatch_retries: 3,
            fallback_count: 2,
        }
    }
}

impl SchedulerConfig {
    /// Set the ordering policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }

    /// Set the selection strategy.
    #[must_use]
    pub const fn with_selection(mut self, selection: SelectionKind) -> Self {
        self.selection = selection;
        self
    }

    /// Set the dispatch retry budget.
    #[must_use]
    pub const fn with_max_dispatch_retries(mut self, retries: u32) -> Self {
        self.max_dispatch_retries = retries;
        self
    }

    /// Set the number of fallback clusters.
    #[must_use]
    pub const fn with_fallback_count(mut self, count: usize) -> Self {
        self.fallback_count = count;
        self
    }

    /// Set the executor timeouts.
    #[must_use]
    pub const fn with_timeouts(mut self, dispatch: Duration, poll: Duration) -> Self {
        self.dispatch_timeout = dispatch;
        self.poll_timeout = poll;
        self
    }

    /// Set the loop periods.
    #[must_use]
    pub const fn with_intervals(mut self, admission: Duration, poll: Duration) -> Self {
        self.admission_interval = admission;
        self.poll_interval = poll;
        self
    }

    /// Validate the settings.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] for zero periods or timeouts.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("admission_interval_secs", self.admission_interval),
            ("poll_interval_secs", self.poll_interval),
            ("dispatch_timeout_secs", self.dispatch_timeout),
            ("poll_timeout_secs", self.poll_timeout),
        ] {
            if value.is_zero() {
                return Err(SchedulerError::Config(format!(
                    "scheduler.{name} must be positive"
                )));
            }
        }
        Ok(())
    }
}

/// Settings for quota refresh and cluster health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaManagerConfig {
    /// Period of the background refresh.
    #[serde(rename = "refresh_interval_secs", with = "duration_secs")]
    pub refresh_interval: Duration,
    /// How long remote providers serve cached data.
    #[serde(rename = "cache_ttl_secs", with = "duration_secs")]
    pub cache_ttl: Duration,
    /// Bound on one backend query.
    #[serde(rename = "request_timeout_secs", with = "duration_secs")]
    pub request_timeout: Duration,
    /// Snapshots older than this are not trusted.
    #[serde(rename = "max_staleness_secs", with = "duration_secs")]
    pub max_staleness: Duration,
    /// Consecutive failures before a cluster enters cooldown.
    pub failure_threshold: u32,
    /// How long a failing cluster is excluded from selection.
    #[serde(rename = "cooldown_secs", with = "duration_secs")]
    pub cooldown: Duration,
    /// First retry delay after a failed refresh.
    #[serde(rename = "backoff_base_secs", with = "duration_secs")]
    pub backoff_base: Duration,
    /// Upper bound of the retry delay.
    #[serde(rename = "backoff_max_secs", with = "duration_secs")]
    pub backoff_max: Duration,
}

impl Default for QuotaManagerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(15),
            cache_ttl: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            max_staleness: Duration::from_secs(120),
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl QuotaManagerConfig {
    /// Set the failure threshold and cooldown.
    #[must_use]
    pub const fn with_cooldown(mut self, failure_threshold: u32, cooldown: Duration) -> Self {
        self.failure_threshold = failure_threshold;
        self.cooldown = cooldown;
        self
    }

    /// Set the retry backoff bounds.
    #[must_use]
    pub const fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Set the staleness bound.
    #[must_use]
    pub const fn with_max_staleness(mut self, max: Duration) -> Self {
        self.max_staleness = max;
        self
    }

    /// Settings handed to remote quota providers.
    #[must_use]
    pub const fn remote_quota_config(&self) -> RemoteQuotaConfig {
        RemoteQuotaConfig {
            cache_ttl: self.cache_ttl,
            request_timeout: self.request_timeout,
            max_staleness: self.max_staleness,
        }
    }

    /// Validate the settings.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval.is_zero() {
            return Err(SchedulerError::Config(
                "quota.refresh_interval_secs must be positive".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(SchedulerError::Config(
                "quota.request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(SchedulerError::Config(
                "quota.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.backoff_base > self.backoff_max {
            return Err(SchedulerError::Config(format!(
                "quota.backoff_base_secs ({:?}) exceeds quota.backoff_max_secs ({:?})",
                self.backoff_base, self.backoff_max
            )));
        }
        if self.max_staleness < self.cache_ttl {
            return Err(SchedulerError::Config(
                "quota.max_staleness_secs must be at least quota.cache_ttl_secs".to_string(),
            ));
        }
        Ok(())
    }
}
