//! Quota provider trait and reservation tokens.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vdc_proto::{ClusterId, QuotaSnapshot, ResourceVector};

use crate::error::Result;

/// An optimistic quota debit made before a job is dispatched.
///
/// Returned by [`QuotaProvider::reserve`]; the holder must eventually pass it
/// to [`QuotaProvider::release`]. Releasing the same token twice is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// Token identity.
    pub id: Uuid,
    /// Scope the debit was made against.
    pub scope: ClusterId,
    /// Debited resources.
    pub resources: ResourceVector,
    /// When the debit was made.
    pub reserved_at: DateTime<Utc>,
    /// When the dispatch was confirmed, if it has been.
    pub committed_at: Option<DateTime<Utc>>,
}

impl Reservation {
    /// Create a pending reservation.
    #[must_use]
    pub fn new(scope: ClusterId, resources: ResourceVector) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope,
            resources,
            reserved_at: Utc::now(),
            committed_at: None,
        }
    }

    /// Check if the dispatch has been confirmed.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        self.committed_at.is_some()
    }
}

/// Source of capacity information and reservation bookkeeping for a set of
/// scopes.
///
/// `get_quota` may reach a remote backend and is async; `reserve`, `commit`
/// and `release` touch only in-process state and are atomic per scope.
pub trait QuotaProvider: Send + Sync {
    /// Provider kind, for logs.
    fn kind(&self) -> &'static str;

    /// Scopes this provider manages.
    fn scopes(&self) -> Vec<ClusterId>;

    /// Current snapshot of a scope, reservations included.
    ///
    /// Remote providers return the last cached snapshot marked `stale` when
    /// the backend cannot be reached.
    fn get_quota<'a>(
        &'a self,
        scope: &'a ClusterId,
    ) -> Pin<Box<dyn Future<Output = Result<QuotaSnapshot>> + Send + 'a>>;

    /// Debit `resources` from a scope if they fit.
    ///
    /// # Errors
    ///
    /// `QuotaExceeded` if the request does not fit (no side effect),
    /// `UnknownScope`, or `BackendUnavailable` when a remote scope cannot be
    /// trusted.
    fn reserve(&self, scope: &ClusterId, resources: &ResourceVector) -> Result<Reservation>;

    /// Mark a reservation as dispatched.
    ///
    /// # Errors
    ///
    /// `UnknownScope` if the token's scope is not managed here.
    fn commit(&self, reservation: &mut Reservation) -> Result<()>;

    /// Return a reservation's resources to the scope.
    ///
    /// Returns `false` when the token was unknown or already released.
    ///
    /// # Errors
    ///
    /// `UnknownScope` if the token's scope is not managed here.
    fn release(&self, reservation: &Reservation) -> Result<bool>;
}

/// Convenience methods available on every [`QuotaProvider`].
pub trait QuotaProviderExt: QuotaProvider {
    /// Check a request against a freshly read snapshot.
    fn fits<'a>(
        &'a self,
        scope: &'a ClusterId,
        request: &'a ResourceVector,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            let snapshot = self.get_quota(scope).await?;
            Ok(!snapshot.stale && snapshot.has_capacity(request))
        })
    }
}

impl<T: QuotaProvider + ?Sized> QuotaProviderExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_new_is_pending() {
        let scope = ClusterId::new("east").unwrap_or_else(|_| unreachable!());
        let r = Reservation::new(scope, ResourceVector::ZERO.with_cpu(2.0));
        assert!(!r.is_committed());
        assert!(r.committed_at.is_none());
    }

    #[test]
    fn test_reservation_ids_unique() {
        let scope = ClusterId::new("east").unwrap_or_else(|_| unreachable!());
        let a = Reservation::new(scope.clone(), ResourceVector::ZERO);
        let b = Reservation::new(scope, ResourceVector::ZERO);
        assert_ne!(a.id, b.id);
    }
}
