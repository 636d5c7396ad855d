//! VDC-wide view of cluster quotas.
//!
//! The manager owns the list of registered clusters, refreshes their quota
//! providers in parallel and keeps a cached snapshot per scope. Failing
//! scopes back off exponentially and, after enough consecutive failures,
//! sit out a cooldown during which they are not offered for placement.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vdc_proto::{ClusterId, ExecutorType, QuotaSnapshot};
use vdc_quota::{QuotaError, QuotaProvider};

use crate::config::QuotaManagerConfig;
use crate::error::{Result, SchedulerError};
use crate::selector::ClusterCandidate;

struct RegisteredCluster {
    executor_type: ExecutorType,
    provider: Arc<dyn QuotaProvider>,
}

#[derive(Debug, Default)]
struct ScopeHealth {
    snapshot: Option<QuotaSnapshot>,
    consecutive_failures: u32,
    backoff: Duration,
    next_attempt: Option<Instant>,
    cooldown_until: Option<Instant>,
    last_error: Option<String>,
}

impl ScopeHealth {
    fn cooling_down(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    fn due(&self, now: Instant) -> bool {
        self.next_attempt.is_none_or(|at| now >= at)
    }
}

fn age_of(snapshot: &QuotaSnapshot) -> Duration {
    snapshot.age().to_std().unwrap_or(Duration::ZERO)
}

/// Read-only health view of one cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterHealth {
    /// Cluster scope.
    pub cluster: ClusterId,
    /// Executor type of the cluster.
    pub executor_type: ExecutorType,
    /// Last cached snapshot.
    pub snapshot: Option<QuotaSnapshot>,
    /// Failed refreshes in a row.
    pub consecutive_failures: u32,
    /// Whether the cluster is excluded from placement right now.
    pub cooling_down: bool,
    /// Last refresh error.
    pub last_error: Option<String>,
}

/// Outcome of one refresh round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    /// Scopes refreshed successfully.
    pub refreshed: usize,
    /// Scopes whose refresh failed or returned stale data.
    pub failed: usize,
    /// Scopes skipped because of backoff or cooldown.
    pub skipped: usize,
}

/// Registry of VDC clusters with cached quota snapshots.
pub struct VdcQuotaManager {
    config: QuotaManagerConfig,
    clusters: RwLock<BTreeMap<ClusterId, RegisteredCluster>>,
    health: RwLock<HashMap<ClusterId, ScopeHealth>>,
}

impl std::fmt::Debug for VdcQuotaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VdcQuotaManager")
            .field("config", &self.config)
            .field("clusters", &self.clusters())
            .finish_non_exhaustive()
    }
}

impl VdcQuotaManager {
    /// Create a manager with no clusters.
    #[must_use]
    pub fn new(config: QuotaManagerConfig) -> Self {
        Self {
            config,
            clusters: RwLock::new(BTreeMap::new()),
            health: RwLock::new(HashMap::new()),
        }
    }

    /// Settings in use.
    #[must_use]
    pub const fn config(&self) -> &QuotaManagerConfig {
        &self.config
    }

    /// Register a cluster and the provider accounting for it.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::DuplicateCluster`] if already registered, or
    /// `UnknownScope` if the provider does not manage the cluster.
    pub fn register_cluster(
        &self,
        cluster: ClusterId,
        executor_type: ExecutorType,
        provider: Arc<dyn QuotaProvider>,
    ) -> Result<()> {
        if !provider.scopes().contains(&cluster) {
            return Err(QuotaError::UnknownScope(cluster).into());
        }

        let mut clusters = self.clusters.write();
        if clusters.contains_key(&cluster) {
            return Err(SchedulerError::DuplicateCluster(cluster));
        }
        info!(
            cluster = %cluster,
            executor_type = %executor_type,
            provider = provider.kind(),
            "registered cluster"
        );
        self.health.write().insert(cluster.clone(), ScopeHealth::default());
        clusters.insert(
            cluster,
            RegisteredCluster {
                executor_type,
                provider,
            },
        );
        Ok(())
    }

    /// Registered clusters, sorted.
    #[must_use]
    pub fn clusters(&self) -> Vec<ClusterId> {
        self.clusters.read().keys().cloned().collect()
    }

    /// Registered clusters running `executor_type`, sorted.
    #[must_use]
    pub fn clusters_for(&self, executor_type: ExecutorType) -> Vec<ClusterId> {
        self.clusters
            .read()
            .iter()
            .filter(|(_, c)| c.executor_type == executor_type)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Executor type of a cluster.
    #[must_use]
    pub fn executor_type(&self, cluster: &ClusterId) -> Option<ExecutorType> {
        self.clusters.read().get(cluster).map(|c| c.executor_type)
    }

    /// Provider of a cluster.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::UnknownCluster`] if not registered.
    pub fn provider(&self, cluster: &ClusterId) -> Result<Arc<dyn QuotaProvider>> {
        self.clusters
            .read()
            .get(cluster)
            .map(|c| Arc::clone(&c.provider))
            .ok_or_else(|| SchedulerError::UnknownCluster(cluster.clone()))
    }

    // ==================== Refresh ====================

    /// Refresh every registered cluster that is not backing off.
    pub async fn refresh_all(&self) -> RefreshSummary {
        self.refresh_where(|_| true).await
    }

    /// Refresh clusters whose snapshot is missing or older than `max_age`.
    pub async fn ensure_fresh(&self, max_age: Duration) -> RefreshSummary {
        self.refresh_where(|health| {
            health
                .snapshot
                .as_ref()
                .is_none_or(|s| s.stale || age_of(s) > max_age)
        })
        .await
    }

    async fn refresh_where(&self, wanted: impl Fn(&ScopeHealth) -> bool) -> RefreshSummary {
        let now = Instant::now();
        let mut summary = RefreshSummary::default();

        let targets: Vec<(ClusterId, Arc<dyn QuotaProvider>)> = {
            let clusters = self.clusters.read();
            let health = self.health.read();
            clusters
                .iter()
                .filter(|(id, _)| health.get(*id).is_some_and(&wanted))
                .filter_map(|(id, c)| {
                    let due = health.get(id).is_none_or(|h| h.due(now));
                    if due {
                        Some((id.clone(), Arc::clone(&c.provider)))
                    } else {
                        summary.skipped += 1;
                        None
                    }
                })
                .collect()
        };

        let results = join_all(targets.iter().map(|(id, provider)| async move {
            (id, provider.get_quota(id).await)
        }))
        .await;

        let mut health = self.health.write();
        for (id, result) in results {
            let entry = health.entry(id.clone()).or_default();
            match result {
                Ok(snapshot) if !snapshot.stale => {
                    if entry.consecutive_failures > 0 {
                        info!(
                            cluster = %id,
                            after_failures = entry.consecutive_failures,
                            "cluster quota recovered"
                        );
                    }
                    debug!(
                        cluster = %id,
                        used = %snapshot.used,
                        limits = %snapshot.limits,
                        "refreshed cluster quota"
                    );
                    entry.snapshot = Some(snapshot);
                    entry.consecutive_failures = 0;
                    entry.backoff = Duration::ZERO;
                    entry.next_attempt = None;
                    entry.cooldown_until = None;
                    entry.last_error = None;
                    summary.refreshed += 1;
                }
                Ok(stale) => {
                    entry.snapshot = Some(stale);
                    self.record_failure(id, entry, "backend returned stale data".to_string());
                    summary.failed += 1;
                }
                Err(e) => {
                    self.record_failure(id, entry, e.to_string());
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    fn record_failure(&self, cluster: &ClusterId, entry: &mut ScopeHealth, reason: String) {
        let now = Instant::now();
        entry.consecutive_failures += 1;
        entry.backoff = if entry.backoff.is_zero() {
            self.config.backoff_base
        } else {
            (entry.backoff * 2).min(self.config.backoff_max)
        };
        entry.next_attempt = Some(now + entry.backoff);

        if entry.consecutive_failures >= self.config.failure_threshold && !entry.cooling_down(now) {
            let until = now + self.config.cooldown;
            entry.cooldown_until = Some(until);
            entry.next_attempt = Some(until.max(now + entry.backoff));
            warn!(
                cluster = %cluster,
                failures = entry.consecutive_failures,
                cooldown_secs = self.config.cooldown.as_secs_f64(),
                error = %reason,
                "cluster entering cooldown"
            );
        } else {
            warn!(
                cluster = %cluster,
                failures = entry.consecutive_failures,
                retry_in_ms = entry.backoff.as_millis() as u64,
                error = %reason,
                "cluster quota refresh failed"
            );
        }
        entry.last_error = Some(reason);
    }

    // ==================== Views ====================

    /// Cached snapshot of one cluster.
    #[must_use]
    pub fn snapshot(&self, cluster: &ClusterId) -> Option<QuotaSnapshot> {
        self.health.read().get(cluster).and_then(|h| h.snapshot.clone())
    }

    /// Every cached snapshot, keyed by cluster.
    #[must_use]
    pub fn all_snapshots(&self) -> BTreeMap<ClusterId, QuotaSnapshot> {
        self.health
            .read()
            .iter()
            .filter_map(|(id, h)| h.snapshot.clone().map(|s| (id.clone(), s)))
            .collect()
    }

    /// Check if a cluster is currently excluded from placement.
    #[must_use]
    pub fn is_cooling_down(&self, cluster: &ClusterId) -> bool {
        self.health
            .read()
            .get(cluster)
            .is_some_and(|h| h.cooling_down(Instant::now()))
    }

    /// Health view of every cluster.
    #[must_use]
    pub fn health(&self) -> Vec<ClusterHealth> {
        let now = Instant::now();
        let clusters = self.clusters.read();
        let health = self.health.read();
        clusters
            .iter()
            .map(|(id, c)| {
                let h = health.get(id);
                ClusterHealth {
                    cluster: id.clone(),
                    executor_type: c.executor_type,
                    snapshot: h.and_then(|h| h.snapshot.clone()),
                    consecutive_failures: h.map_or(0, |h| h.consecutive_failures),
                    cooling_down: h.is_some_and(|h| h.cooling_down(now)),
                    last_error: h.and_then(|h| h.last_error.clone()),
                }
            })
            .collect()
    }

    /// Clusters of `executor_type` fit to be offered for placement.
    ///
    /// Excludes clusters in cooldown, without a snapshot, with a stale
    /// snapshot or with one older than `max_staleness`.
    #[must_use]
    pub fn candidates(&self, executor_type: ExecutorType) -> Vec<ClusterCandidate> {
        let now = Instant::now();
        let clusters = self.clusters.read();
        let health = self.health.read();
        clusters
            .iter()
            .filter(|(_, c)| c.executor_type == executor_type)
            .filter_map(|(id, _)| {
                let h = health.get(id)?;
                if h.cooling_down(now) {
                    return None;
                }
                let snapshot = h.snapshot.as_ref()?;
                if snapshot.stale || age_of(snapshot) > self.config.max_staleness {
                    return None;
                }
                Some(ClusterCandidate::new(id.clone(), snapshot.clone()))
            })
            .collect()
    }

    /// Refresh on `refresh_interval` until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.refresh_interval.as_secs_f64(),
            clusters = self.clusters.read().len(),
            "starting quota refresh loop"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.refresh_all().await;
                    debug!(
                        refreshed = summary.refreshed,
                        failed = summary.failed,
                        skipped = summary.skipped,
                        "quota refresh round"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("quota refresh loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use vdc_proto::ResourceVector;
    use vdc_quota::{LocalQuotaProvider, Reservation};

    fn id(name: &str) -> ClusterId {
        ClusterId::new(name).unwrap_or_else(|_| unreachable!())
    }

    fn local(name: &str, cpu: f64) -> Arc<LocalQuotaProvider> {
        let provider = LocalQuotaProvider::new();
        provider
            .register_scope(id(name), ResourceVector::ZERO.with_cpu(cpu))
            .unwrap_or_else(|_| unreachable!());
        Arc::new(provider)
    }

    /// Local provider whose reads can be switched to fail.
    struct Flaky {
        inner: LocalQuotaProvider,
        down: AtomicBool,
    }

    impl Flaky {
        fn new(name: &str) -> Self {
            let inner = LocalQuotaProvider::new();
            inner
                .register_scope(id(name), ResourceVector::ZERO.with_cpu(4.0))
                .unwrap_or_else(|_| unreachable!());
            Self {
                inner,
                down: AtomicBool::new(false),
            }
        }
    }

    impl QuotaProvider for Flaky {
        fn kind(&self) -> &'static str {
            "flaky"
        }

        fn scopes(&self) -> Vec<ClusterId> {
            self.inner.scopes()
        }

        fn get_quota<'a>(
            &'a self,
            scope: &'a ClusterId,
        ) -> Pin<Box<dyn Future<Output = vdc_quota::Result<QuotaSnapshot>> + Send + 'a>> {
            Box::pin(async move {
                if self.down.load(Ordering::SeqCst) {
                    return Err(QuotaError::BackendUnavailable {
                        scope: scope.clone(),
                        reason: "connection refused".to_string(),
                    });
                }
                self.inner.get_quota(scope).await
            })
        }

        fn reserve(
            &self,
            scope: &ClusterId,
            resources: &ResourceVector,
        ) -> vdc_quota::Result<Reservation> {
            self.inner.reserve(scope, resources)
        }

        fn commit(&self, reservation: &mut Reservation) -> vdc_quota::Result<()> {
            self.inner.commit(reservation)
        }

        fn release(&self, reservation: &Reservation) -> vdc_quota::Result<bool> {
            self.inner.release(reservation)
        }
    }

    fn fast_config() -> QuotaManagerConfig {
        QuotaManagerConfig::default()
            .with_cooldown(2, Duration::from_millis(80))
            .with_backoff(Duration::from_millis(1), Duration::from_millis(4))
    }

    // ==================== Registration ====================

    #[test]
    fn test_register_rejects_duplicate() {
        let manager = VdcQuotaManager::new(QuotaManagerConfig::default());
        let provider = local("east", 8.0);
        assert!(manager
            .register_cluster(id("east"), ExecutorType::Local, provider.clone())
            .is_ok());
        assert!(matches!(
            manager.register_cluster(id("east"), ExecutorType::Local, provider),
            Err(SchedulerError::DuplicateCluster(_))
        ));
    }

    #[test]
    fn test_register_requires_provider_scope() {
        let manager = VdcQuotaManager::new(QuotaManagerConfig::default());
        assert!(matches!(
            manager.register_cluster(id("west"), ExecutorType::Local, local("east", 8.0)),
            Err(SchedulerError::Quota(QuotaError::UnknownScope(_)))
        ));
    }

    #[test]
    fn test_clusters_for_filters_by_type() {
        let manager = VdcQuotaManager::new(QuotaManagerConfig::default());
        let provider = LocalQuotaProvider::new()
            .with_scope(id("k1"), ResourceVector::ZERO.with_cpu(1.0))
            .and_then(|p| p.with_scope(id("s1"), ResourceVector::ZERO.with_cpu(1.0)))
            .unwrap_or_else(|_| unreachable!());
        let provider: Arc<dyn QuotaProvider> = Arc::new(provider);
        let _ = manager.register_cluster(id("k1"), ExecutorType::Kubernetes, provider.clone());
        let _ = manager.register_cluster(id("s1"), ExecutorType::Slurm, provider);

        assert_eq!(manager.clusters_for(ExecutorType::Slurm), vec![id("s1")]);
        assert_eq!(manager.executor_type(&id("k1")), Some(ExecutorType::Kubernetes));
        assert!(manager.provider(&id("nope")).is_err());
    }

    // ==================== Refresh ====================

    #[tokio::test]
    async fn test_refresh_all_caches_snapshots() {
        let manager = VdcQuotaManager::new(QuotaManagerConfig::default());
        let _ = manager.register_cluster(id("a"), ExecutorType::Local, local("a", 8.0));
        let _ = manager.register_cluster(id("b"), ExecutorType::Local, local("b", 4.0));
        assert!(manager.candidates(ExecutorType::Local).is_empty());

        let summary = manager.refresh_all().await;
        assert_eq!(summary.refreshed, 2);
        assert_eq!(manager.all_snapshots().len(), 2);
        assert_eq!(manager.candidates(ExecutorType::Local).len(), 2);
        assert!((manager.snapshot(&id("b")).map_or(0.0, |s| s.limits.cpu) - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ensure_fresh_skips_recent() {
        let manager = VdcQuotaManager::new(QuotaManagerConfig::default());
        let _ = manager.register_cluster(id("a"), ExecutorType::Local, local("a", 8.0));
        assert_eq!(manager.ensure_fresh(Duration::from_secs(60)).await.refreshed, 1);
        assert_eq!(manager.ensure_fresh(Duration::from_secs(60)).await.refreshed, 0);
    }

    #[tokio::test]
    async fn test_failure_backs_off() {
        let manager = VdcQuotaManager::new(
            QuotaManagerConfig::default()
                .with_backoff(Duration::from_secs(30), Duration::from_secs(60)),
        );
        let flaky = Arc::new(Flaky::new("f"));
        flaky.down.store(true, Ordering::SeqCst);
        let _ = manager.register_cluster(id("f"), ExecutorType::Local, flaky);

        assert_eq!(manager.refresh_all().await.failed, 1);
        let second = manager.refresh_all().await;
        assert_eq!(second.skipped, 1);
        assert_eq!(second.failed, 0);
    }

    #[tokio::test]
    async fn test_cooldown_excludes_then_recovers() {
        let manager = VdcQuotaManager::new(fast_config());
        let flaky = Arc::new(Flaky::new("f"));
        let _ = manager.register_cluster(id("f"), ExecutorType::Local, flaky.clone());
        let _ = manager.refresh_all().await;
        assert_eq!(manager.candidates(ExecutorType::Local).len(), 1);

        flaky.down.store(true, Ordering::SeqCst);
        let _ = manager.refresh_all().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _ = manager.refresh_all().await;
        assert!(manager.is_cooling_down(&id("f")));
        assert!(manager.candidates(ExecutorType::Local).is_empty());

        // The backend is back, but the cluster sits out its cooldown.
        flaky.down.store(false, Ordering::SeqCst);
        assert_eq!(manager.refresh_all().await.skipped, 1);
        assert!(manager.candidates(ExecutorType::Local).is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.refresh_all().await.refreshed, 1);
        assert!(!manager.is_cooling_down(&id("f")));
        assert_eq!(manager.candidates(ExecutorType::Local).len(), 1);
        let health = manager.health();
        assert_eq!(health[0].consecutive_failures, 0);
        assert!(health[0].last_error.is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let manager = Arc::new(VdcQuotaManager::new(QuotaManagerConfig::default()));
        let _ = manager.register_cluster(id("a"), ExecutorType::Local, local("a", 1.0));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&manager).run(rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = tx.send(true);
        assert!(tokio::time::timeout(Duration::from_secs(2), handle).await.is_ok());
        assert!(manager.snapshot(&id("a")).is_some());
    }
}
