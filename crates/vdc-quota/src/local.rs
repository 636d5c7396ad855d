//! In-process quota accounting for fixed-size pools.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vdc_proto::{ClusterId, QuotaSnapshot, ResourceVector};

use crate::error::{QuotaError, Result};
use crate::provider::{QuotaProvider, Reservation};

#[derive(Debug)]
struct LocalScope {
    limits: ResourceVector,
    used: ResourceVector,
    reservations: HashMap<Uuid, Reservation>,
}

impl LocalScope {
    fn snapshot(&self) -> QuotaSnapshot {
        QuotaSnapshot::new(self.limits, self.used)
    }
}

/// Quota provider whose capacity is a fixed, locally configured pool.
///
/// The `used` counter is the sum of outstanding reservations and never
/// exceeds the scope's limits.
#[derive(Debug, Default)]
pub struct LocalQuotaProvider {
    scopes: RwLock<HashMap<ClusterId, LocalScope>>,
}

impl LocalQuotaProvider {
    /// Create a provider with no scopes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scope with fixed limits.
    ///
    /// # Errors
    ///
    /// `InvalidQuota` if the limits are invalid or the scope already exists.
    pub fn register_scope(&self, scope: ClusterId, limits: ResourceVector) -> Result<()> {
        limits
            .validate()
            .map_err(|e| QuotaError::InvalidQuota(e.to_string()))?;

        let mut scopes = self.scopes.write();
        if scopes.contains_key(&scope) {
            return Err(QuotaError::InvalidQuota(format!(
                "scope {scope} is already registered"
            )));
        }
        info!(scope = %scope, limits = %limits, "registered local quota scope");
        scopes.insert(
            scope,
            LocalScope {
                limits,
                used: ResourceVector::ZERO,
                reservations: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Builder form of [`LocalQuotaProvider::register_scope`].
    ///
    /// # Errors
    ///
    /// Same as [`LocalQuotaProvider::register_scope`].
    pub fn with_scope(self, scope: ClusterId, limits: ResourceVector) -> Result<Self> {
        self.register_scope(scope, limits)?;
        Ok(self)
    }

    /// Resize a scope.
    ///
    /// # Errors
    ///
    /// `UnknownScope`, or `InvalidQuota` if the new limits are invalid or
    /// smaller than what is currently reserved.
    pub fn set_limits(&self, scope: &ClusterId, limits: ResourceVector) -> Result<()> {
        limits
            .validate()
            .map_err(|e| QuotaError::InvalidQuota(e.to_string()))?;

        let mut scopes = self.scopes.write();
        let state = scopes
            .get_mut(scope)
            .ok_or_else(|| QuotaError::UnknownScope(scope.clone()))?;
        if !state.used.fits_within(&limits) {
            return Err(QuotaError::InvalidQuota(format!(
                "new limits {limits} are below current usage {} on {scope}",
                state.used
            )));
        }
        info!(scope = %scope, old = %state.limits, new = %limits, "resized local quota scope");
        state.limits = limits;
        Ok(())
    }

    /// Snapshot a scope without going through the async trait method.
    #[must_use]
    pub fn snapshot(&self, scope: &ClusterId) -> Option<QuotaSnapshot> {
        self.scopes.read().get(scope).map(LocalScope::snapshot)
    }

    /// Number of outstanding reservations on a scope.
    #[must_use]
    pub fn reservation_count(&self, scope: &ClusterId) -> usize {
        self.scopes
            .read()
            .get(scope)
            .map_or(0, |s| s.reservations.len())
    }
}

impl QuotaProvider for LocalQuotaProvider {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn scopes(&self) -> Vec<ClusterId> {
        self.scopes.read().keys().cloned().collect()
    }

    fn get_quota<'a>(
        &'a self,
        scope: &'a ClusterId,
    ) -> Pin<Box<dyn Future<Output = Result<QuotaSnapshot>> + Send + 'a>> {
        Box::pin(async move {
            self.snapshot(scope)
                .ok_or_else(|| QuotaError::UnknownScope(scope.clone()))
        })
    }

    fn reserve(&self, scope: &ClusterId, resources: &ResourceVector) -> Result<Reservation> {
        let mut scopes = self.scopes.write();
        let state = scopes
            .get_mut(scope)
            .ok_or_else(|| QuotaError::UnknownScope(scope.clone()))?;

        let available = state.limits.saturating_sub(&state.used);
        if !resources.fits_within(&available) {
            return Err(QuotaError::QuotaExceeded {
                scope: scope.clone(),
                requested: *resources,
                available,
            });
        }

        let reservation = Reservation::new(scope.clone(), *resources);
        state.used += *resources;
        state
            .reservations
            .insert(reservation.id, reservation.clone());
        debug!(
            scope = %scope,
            reservation = %reservation.id,
            requested = %resources,
            used = %state.used,
            "reserved local quota"
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
        if let Some(entry) = state.reservations.get_mut(&reservation.id) {
            entry.committed_at = Some(now);
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

        state.used = match state.used.checked_sub(&entry.resources) {
            Some(used) => used,
            None => {
                warn!(
                    scope = %reservation.scope,
                    used = %state.used,
                    released = %entry.resources,
                    "release exceeds recorded usage; clamping at zero"
                );
                state.used.saturating_sub(&entry.resources)
            }
        };
        debug!(
            scope = %reservation.scope,
            reservation = %reservation.id,
            used = %state.used,
            "released local quota"
        );
        Ok(true)
    }
}
