//! Cluster selection across the VDC: ranking, live confirmation, fallback
//! and degraded quota backends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{cluster, job_id, request, rv, Harness, SwitchableBackend};
use vdc_proto::{ExecutorType, JobState, ResourceVector};
use vdc_quota::{QuotaError, QuotaProvider, RemoteQuotaConfig, RemoteQuotaProvider};
use vdc_scheduler::{QuotaManagerConfig, SchedulerConfig, SelectionKind};

fn owner(h: &Harness, name: &str) -> Option<String> {
    h.vdc
        .status(&job_id(name))
        .ok()
        .and_then(|s| s.cluster)
        .map(|c| c.to_string())
}

fn remote(name: &str, limits: ResourceVector) -> Arc<RemoteQuotaProvider<SwitchableBackend>> {
    Arc::new(RemoteQuotaProvider::new(
        SwitchableBackend::new(cluster(name), limits),
        RemoteQuotaConfig::default().with_cache_ttl(Duration::ZERO),
    ))
}

// ==================== Ranking ====================

#[tokio::test]
async fn spread_prefers_most_headroom() {
    let h = Harness::with_defaults();
    h.add_local("small", rv(2.0, 0.0, 0));
    h.add_local("large", rv(4.0, 1.0, 0));

    let _ = h.vdc.submit(request("j", rv(1.0, 0.0, 0))).await;
    assert_eq!(owner(&h, "j").as_deref(), Some("large"));
}

#[tokio::test]
async fn bin_pack_prefers_tightest_fit() {
    let h = Harness::new(
        SchedulerConfig::default().with_selection(SelectionKind::BinPack),
        QuotaManagerConfig::default(),
    );
    h.add_local("small", rv(2.0, 0.0, 0));
    h.add_local("large", rv(16.0, 0.0, 0));

    let _ = h.vdc.submit(request("j", rv(2.0, 0.0, 0))).await;
    assert_eq!(owner(&h, "j").as_deref(), Some("small"));
}

#[tokio::test]
async fn queued_demand_spreads_consecutive_jobs() {
    let h = Harness::with_defaults();
    h.add_local("a", rv(4.0, 0.0, 0));
    h.add_local("b", rv(4.0, 0.0, 0));

    let _ = h.vdc.submit(request("first", rv(3.0, 0.0, 0))).await;
    let _ = h.vdc.submit(request("second", rv(3.0, 0.0, 0))).await;

    let first = owner(&h, "first");
    let second = owner(&h, "second");
    assert!(first.is_some() && second.is_some());
    assert_ne!(first, second);
}

#[tokio::test]
async fn hint_wins_when_it_fits() {
    let h = Harness::with_defaults();
    h.add_local("small", rv(2.0, 0.0, 0));
    h.add_local("large", rv(8.0, 0.0, 0));

    let hinted = request("j", rv(1.0, 0.0, 0)).with_cluster_hint(cluster("small"));
    let _ = h.vdc.submit(hinted).await;
    assert_eq!(owner(&h, "j").as_deref(), Some("small"));
}

#[tokio::test]
async fn hint_ignored_when_it_cannot_fit() {
    let h = Harness::with_defaults();
    h.add_local("small", rv(2.0, 0.0, 0));
    h.add_local("large", rv(8.0, 0.0, 0));

    let hinted = request("j", rv(4.0, 0.0, 0)).with_cluster_hint(cluster("small"));
    let _ = h.vdc.submit(hinted).await;
    assert_eq!(owner(&h, "j").as_deref(), Some("large"));
}

// ==================== Fallback ====================

#[tokio::test]
async fn live_check_failure_falls_back() {
    let h = Harness::with_defaults();
    let large = h.add_local("large", rv(8.0, 0.0, 0));
    h.add_local("small", rv(4.0, 0.0, 0));
    h.vdc.quota_manager().refresh_all().await;

    // Capacity vanishes behind the cached snapshot.
    let taken = large.reserve(&cluster("large"), &rv(7.0, 0.0, 0));
    assert!(taken.is_ok());

    let _ = h.vdc.submit(request("j", rv(2.0, 0.0, 0))).await;
    assert_eq!(owner(&h, "j").as_deref(), Some("small"));
}

#[tokio::test]
async fn nothing_fits_queues_best_effort() {
    let h = Harness::with_defaults();
    h.add_local("a", rv(2.0, 0.0, 0));
    h.add_local("b", rv(4.0, 1.0, 0));

    let status = h.vdc.submit(request("huge", rv(6.0, 0.0, 0))).await;
    assert_eq!(status.ok().map(|s| s.state), Some(JobState::Queued));
    assert_eq!(owner(&h, "huge").as_deref(), Some("b"));

    let reports = h.vdc.run_admission_passes().await;
    assert_eq!(reports.get(&cluster("b")).map(|r| r.deferred), Some(1));
    assert_eq!(h.state("huge"), Some(JobState::Queued));
}

// ==================== Degraded backends ====================

#[tokio::test]
async fn stale_backend_fails_closed() {
    let provider = remote("hpc", rv(8.0, 0.0, 0));
    let scope = cluster("hpc");
    assert!(provider.get_quota(&scope).await.is_ok_and(|s| !s.stale));

    provider.backend().go_down();
    let snapshot = provider.get_quota(&scope).await;
    assert!(snapshot.is_ok_and(|s| s.stale));
    assert!(matches!(
        provider.reserve(&scope, &rv(1.0, 0.0, 0)),
        Err(QuotaError::BackendUnavailable { .. })
    ));

    provider.backend().report(rv(8.0, 0.0, 0), rv(2.0, 0.0, 0));
    assert!(provider.get_quota(&scope).await.is_ok_and(|s| !s.stale));
    assert!(provider.reserve(&scope, &rv(6.0, 0.0, 0)).is_ok());
}

#[tokio::test]
async fn cooling_cluster_is_skipped_until_recovered() {
    let h = Harness::new(
        SchedulerConfig::default(),
        QuotaManagerConfig::default()
            .with_cooldown(2, Duration::from_millis(50))
            .with_backoff(Duration::from_millis(1), Duration::from_millis(1)),
    );
    let flaky = remote("flaky", rv(64.0, 0.0, 0));
    h.vdc
        .add_cluster(cluster("flaky"), ExecutorType::Local, flaky.clone())
        .unwrap_or_else(|_| unreachable!());
    h.add_local("steady", rv(2.0, 0.0, 0));
    h.vdc.quota_manager().refresh_all().await;

    flaky.backend().go_down();
    for _ in 0..2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.vdc.quota_manager().refresh_all().await;
    }
    assert!(h.vdc.quota_manager().is_cooling_down(&cluster("flaky")));

    let _ = h.vdc.submit(request("j1", rv(1.0, 0.0, 0))).await;
    assert_eq!(owner(&h, "j1").as_deref(), Some("steady"));

    flaky.backend().report(rv(64.0, 0.0, 0), ResourceVector::ZERO);
    tokio::time::sleep(Duration::from_millis(80)).await;
    let summary = h.vdc.quota_manager().refresh_all().await;
    assert!(summary.refreshed >= 1);
    assert!(!h.vdc.quota_manager().is_cooling_down(&cluster("flaky")));

    let _ = h.vdc.submit(request("j2", rv(1.0, 0.0, 0))).await;
    assert_eq!(owner(&h, "j2").as_deref(), Some("flaky"));
}

#[tokio::test]
async fn slow_backend_times_out_as_unavailable() {
    let provider = Arc::new(RemoteQuotaProvider::new(
        SwitchableBackend::new(cluster("slow"), rv(8.0, 0.0, 0)),
        RemoteQuotaConfig::default()
            .with_cache_ttl(Duration::ZERO)
            .with_request_timeout(Duration::from_millis(20)),
    ));
    provider.backend().set_delay(Duration::from_millis(200));

    let result = provider.get_quota(&cluster("slow")).await;
    assert!(matches!(result, Err(QuotaError::BackendUnavailable { .. })));
    assert!(provider.cached_snapshot(&cluster("slow")).is_none());
}
