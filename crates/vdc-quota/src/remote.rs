//! Quota accounting for scopes whose capacity lives in an external backend.
//!
//! The backend's own usage figures lag behind dispatches: a Slurm job that is
//! still pending is not allocated, and a Kubernetes quota only grows once the
//! Job controller has created pods. The provider therefore keeps every
//! reservation until it is released and overlays them on the last fetched
//! value:
//!
//! ```text
//! effective_used = max(backend_used, Σ committed) + Σ pending
//! ```
//!
//! The maximum is taken per resource. A committed job counts once whether or
//! not the backend has absorbed it yet.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vdc_proto::{ClusterId, QuotaSnapshot, ResourceVector};

use crate::error::{QuotaError, Result};
use crate::provider::{QuotaProvider, Reservation};

/// Capacity figures reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackendUsage {
    /// Total capacity.
    pub limits: ResourceVector,
    /// Capacity in use according to the backend.
    pub used: ResourceVector,
}

/// Source of capacity figures for [`RemoteQuotaProvider`].
pub trait QuotaBackend: Send + Sync {
    /// Backend kind, for logs.
    fn kind(&self) -> &'static str;

    /// Scopes this backend can report on.
    fn scopes(&self) -> Vec<ClusterId>;

    /// Fetch current capacity and usage of a scope.
    fn fetch<'a>(
        &'a self,
        scope: &'a ClusterId,
    ) -> Pin<Box<dyn Future<Output = Result<BackendUsage>> + Send + 'a>>;
}

/// Timing knobs for [`RemoteQuotaProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteQuotaConfig {
    /// How long a fetched snapshot is served without asking the backend.
    pub cache_ttl: Duration,
    /// Bound on a single backend query.
    pub request_timeout: Duration,
    /// Snapshots older than this are not trusted for reservations.
    pub max_staleness: Duration,
}

impl Default for RemoteQuotaConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            max_staleness: Duration::from_secs(120),
        }
    }
}

impl RemoteQuotaConfig {
    /// Set the cache TTL.
    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the maximum staleness.
    #[must_use]
    pub const fn with_max_staleness(mut self, max: Duration) -> Self {
        self.max_staleness = max;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Fetched {
    usage: BackendUsage,
    observed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RemoteScope {
    fetched: Option<Fetched>,
    stale: bool,
    invalidated: bool,
    reservations: HashMap<Uuid, Reservation>,
}

impl RemoteScope {
    fn committed(&self) -> ResourceVector {
        self.reservations
            .values()
            .filter(|r| r.is_committed())
            .map(|r| r.resources)
            .sum()
    }

    fn pending(&self) -> ResourceVector {
        self.reservations
            .values()
            .filter(|r| !r.is_committed())
            .map(|r| r.resources)
            .sum()
    }

    fn effective_used(&self, backend_used: &ResourceVector) -> ResourceVector {
        backend_used.component_max(&self.committed()) + self.pending()
    }

    fn snapshot(&self) -> Option<QuotaSnapshot> {
        self.fetched.map(|fetched| QuotaSnapshot {
            limits: fetched.usage.limits,
            used: self.effective_used(&fetched.usage.used),
            observed_at: fetched.observed_at,
            stale: self.stale,
        })
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        match &self.fetched {
            Some(fetched) if !self.stale && !self.invalidated => age(fetched.observed_at) < ttl,
            _ => false,
        }
    }
}

fn age(at: DateTime<Utc>) -> Duration {
    (Utc::now() - at).to_std().unwrap_or(Duration::ZERO)
}

/// Quota provider backed by a [`QuotaBackend`], with caching, a reservation
/// overlay and fail-closed admission.
#[derive(Debug)]
pub struct RemoteQuotaProvider<B> {
    backend: B,
    config: RemoteQuotaConfig,
    scopes: RwLock<HashMap<ClusterId, RemoteScope>>,
}

impl<B: QuotaBackend> RemoteQuotaProvider<B> {
    /// Create a provider for every scope the backend reports on.
    #[must_use]
    pub fn new(backend: B, config: RemoteQuotaConfig) -> Self {
        let scopes = backend
            .scopes()
            .into_iter()
            .map(|scope| (scope, RemoteScope::default()))
            .collect();
        Self {
            backend,
            config,
            scopes: RwLock::new(scopes),
        }
    }

    /// The wrapped backend.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Timing configuration.
    #[must_use]
    pub const fn config(&self) -> &RemoteQuotaConfig {
        &self.config
    }

    /// Number of outstanding reservations on a scope.
    #[must_use]
    pub fn reservation_count(&self, scope: &ClusterId) -> usize {
        self.scopes
            .read()
            .get(scope)
            .map_or(0, |s| s.reservations.len())
    }

    /// Last known snapshot of a scope without contacting the backend.
    #[must_use]
    pub fn cached_snapshot(&self, scope: &ClusterId) -> Option<QuotaSnapshot> {
        self.scopes.read().get(scope).and_then(RemoteScope::snapshot)
    }

    async fn refresh(&self, scope: &ClusterId) -> Result<QuotaSnapshot> {
        let outcome = tokio::time::timeout(self.config.request_timeout, self.backend.fetch(scope))
            .await
            .unwrap_or_else(|_| {
                Err(QuotaError::BackendUnavailable {
                    scope: scope.clone(),
                    reason: format!(
                        "{} backend did not answer within {:?}",
                        self.backend.kind(),
                        self.config.request_timeout
                    ),
                })
            });

        let mut scopes = self.scopes.write();
        let state = scopes
            .get_mut(scope)
            .ok_or_else(|| QuotaError::UnknownScope(scope.clone()))?;

        match outcome {
            Ok(usage) => {
                if state.stale {
                    info!(scope = %scope, backend = self.backend.kind(), "quota backend reachable again");
                }
                state.fetched = Some(Fetched {
                    usage,
                    observed_at: Utc::now(),
                });
                state.stale = false;
                state.invalidated = false;
                let snapshot = state.snapshot().ok_or_else(|| QuotaError::BackendUnavailable {
                    scope: scope.clone(),
                    reason: "no snapshot after fetch".to_string(),
                })?;
                debug!(
                    scope = %scope,
                    limits = %snapshot.limits,
                    used = %snapshot.used,
                    "refreshed remote quota"
                );
                Ok(snapshot)
            }
            Err(error) => {
                warn!(scope = %scope, backend = self.backend.kind(), error = %error, "quota fetch failed");
                state.stale = true;
                match state.snapshot() {
                    Some(snapshot) => Ok(snapshot),
                    None => Err(match error {
                        QuotaError::BackendUnavailable { .. } => error,
                        other => QuotaError::BackendUnavailable {
                            scope: scope.clone(),
                            reason: other.to_string(),
                        },
                    }),
                }
            }
        }
    }
}

impl<B: QuotaBackend> QuotaProvider for RemoteQuotaProvider<B> {
    fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    fn scopes(&self) -> Vec<ClusterId> {
        self.scopes.read().keys().cloned().collect()
    }

    fn get_quota<'a>(
        &'a self,
        scope: &'a ClusterId,
    ) -> Pin<Box<dyn Future<Output = Result<QuotaSnapshot>> + Send + 'a>> {
        Box::pin(async move {
            {
                let scopes = self.scopes.read();
                let state = scopes
                    .get(scope)
                    .ok_or_else(|| QuotaError::UnknownScope(scope.clone()))?;
                if state.is_fresh(self.config.cache_ttl) {
                    if let Some(snapshot) = state.snapshot() {
                        return Ok(snapshot);
                    }
                }
            }
            self.refresh(scope).await
        })
    }

    fn reserve(&self, scope: &ClusterId, resources: &ResourceVector) -> Result<Reservation> {
        let mut scopes = self.scopes.write();
        let state = scopes
            .get_mut(scope)
            .ok_or_else(|| QuotaError::UnknownScope(scope.clone()))?;

        let unavailable = |reason: String| QuotaError::BackendUnavailable {
            scope: scope.clone(),
            reason,
        };
        let Some(snapshot) = state.snapshot() else {
            return Err(unavailable("quota has never been fetched".to_string()));
        };
        if state.stale {
            return Err(unavailable("quota snapshot is stale".to_string()));
        }
        let snapshot_age = age(snapshot.observed_at);
        if snapshot_age > self.config.max_staleness {
            return Err(unavailable(format!(
                "quota snapshot is {snapshot_age:?} old, limit {:?}",
                self.config.max_staleness
            )));
        }

        let available = snapshot.available();
        if !resources.fits_within(&available) {
            return Err(QuotaError::QuotaExceeded {
                scope: scope.clone(),
                requested: *resources,
                available,
            });
        }

        let reservation = Reservation::new(scope.clone(), *resources);
        state
            .reservations
            .insert(reservation.id, reservation.clone());
        debug!(
            scope = %scope,
            reservation = %reservation.id,
            requested = %resources,
            "reserved remote quota"
        );
        Ok(reservation)
    }

    fn commit(&self, reservation: &mut Reservation) -> Result<()> {
        let mut scopes = self.scopes.write();
        let state = scopes
            .get_mut(&reservation.scope)
            .ok_or_else(|| QuotaError::UnknownScope(reservation.scope.clone()))?;

        let now = Utc::now();
        reservation.committed_at = Some(now);
        match state.reservations.get_mut(&reservation.id) {
            Some(entry) => entry.committed_at = Some(now),
            None => debug!(
                scope = %reservation.scope,
                reservation = %reservation.id,
                "commit of released reservation ignored"
            ),
        }
        Ok(())
    }

    fn release(&self, reservation: &Reservation) -> Result<bool> {
        let mut scopes = self.scopes.write();
        let state = scopes
            .get_mut(&reservation.scope)
            .ok_or_else(|| QuotaError::UnknownScope(reservation.scope.clone()))?;

        let Some(entry) = state.reservations.remove(&reservation.id) else {
            warn!(
                scope = %reservation.scope,
                reservation = %reservation.id,
                "release of unknown or already released reservation ignored"
            );
            return Ok(false);
        };

        if entry.is_committed() {
            // The backend may still count this job; refetch before trusting
            // the freed capacity.
            state.invalidated = true;
        }
        debug!(
            scope = %reservation.scope,
            reservation = %reservation.id,
            "released remote quota"
        );
        Ok(true)
    }
}
