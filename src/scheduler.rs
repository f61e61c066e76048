//! Background tickers: reconciliation, expired-rate purge, reporter flush.
//!
//! Each ticker is its own tokio task driven by `tokio::time::interval` with
//! [`MissedTickBehavior::Delay`], so a slow pass pushes the next one back
//! instead of piling up. All tickers stop when the shared `watch` shutdown
//! flag turns `true`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::health::{HealthRegistry, CHECK_QUOTA_SYNC, CHECK_RATE_PURGE, CHECK_REPORTER_FLUSH};
use crate::quota::{ExceededQuotaReporter, QuotaManager, SyncReport};
use crate::tenant::{merge_tenants, TenantResolver};

/// Consecutive failed passes before a check is reported Down.
const DOWN_AFTER_FAILURES: u64 = 3;

/// Tick periods of the background tasks.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerPeriods {
    pub sync: Duration,
    pub rate_purge: Duration,
    pub reporter_flush: Duration,
}

/// Handles of the running tickers.
pub struct QuotaScheduler {
    handles: Vec<JoinHandle<()>>,
}

impl QuotaScheduler {
    /// Spawn the three tickers.
    pub fn spawn(
        manager: Arc<QuotaManager>,
        reporter: Arc<ExceededQuotaReporter>,
        tenants: Arc<dyn TenantResolver>,
        health: HealthRegistry,
        periods: SchedulerPeriods,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let sync = spawn_ticker("quota-sync", periods.sync, shutdown_rx.clone(), {
            let manager = Arc::clone(&manager);
            let tenants = Arc::clone(&tenants);
            let health = health.clone();
            move || {
                let manager = Arc::clone(&manager);
                let tenants = Arc::clone(&tenants);
                let health = health.clone();
                async move {
                    run_sync_pass(&manager, tenants.as_ref(), &health).await;
                }
            }
        });

        let purge = spawn_ticker("rate-purge", periods.rate_purge, shutdown_rx.clone(), {
            let manager = Arc::clone(&manager);
            let tenants = Arc::clone(&tenants);
            let health = health.clone();
            move || {
                let manager = Arc::clone(&manager);
                let tenants = Arc::clone(&tenants);
                let health = health.clone();
                async move {
                    run_purge_pass(&manager, tenants.as_ref(), &health).await;
                }
            }
        });

        let flush = spawn_ticker("reporter-flush", periods.reporter_flush, shutdown_rx, {
            move || {
                let reporter = Arc::clone(&reporter);
                let tenants = Arc::clone(&tenants);
                let health = health.clone();
                async move {
                    run_flush_pass(&reporter, tenants.as_ref(), &health).await;
                }
            }
        });

        Self {
            handles: vec![sync, purge, flush],
        }
    }

    /// Wait for every ticker to exit (after shutdown was signalled).
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

fn spawn_ticker<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut pass: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    pass().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!(task = name, "Ticker stopping");
                        break;
                    }
                }
            }
        }
    })
}

// ============================================================================
// Passes
// ============================================================================

/// Reconcile every active tenant plus every tenant with local state.
pub async fn run_sync_pass(
    manager: &QuotaManager,
    tenants: &dyn TenantResolver,
    health: &HealthRegistry,
) -> SyncReport {
    let all = merge_tenants(tenants.active_tenants(), manager.known_tenants());
    let mut total = SyncReport::default();
    for tenant in &all {
        let report = manager.sync_tenant(tenant).await;
        total.reconciled += report.reconciled;
        total.retained += report.retained;
    }

    if total.retained == 0 {
        health.record_success(
            CHECK_QUOTA_SYNC,
            Some(format!("{} keys reconciled", total.reconciled)),
        );
    } else {
        health.record_failure(
            CHECK_QUOTA_SYNC,
            &format!("{} keys awaiting retry", total.retained),
            DOWN_AFTER_FAILURES,
        );
    }
    total
}

/// Purge expired rate rows of every known tenant.
pub async fn run_purge_pass(
    manager: &QuotaManager,
    tenants: &dyn TenantResolver,
    health: &HealthRegistry,
) -> u64 {
    let all = merge_tenants(tenants.active_tenants(), manager.known_tenants());
    let mut removed = 0;
    let mut last_error = None;
    for tenant in &all {
        match manager.purge_expired_rates(tenant).await {
            Ok(n) => removed += n,
            Err(err) => {
                warn!(tenant = %tenant, error = %err, "Expired rate purge failed");
                last_error = Some(err.to_string());
            }
        }
    }
    match last_error {
        None => health.record_success(CHECK_RATE_PURGE, None),
        Some(err) => health.record_failure(CHECK_RATE_PURGE, &err, DOWN_AFTER_FAILURES),
    }
    removed
}

/// Flush buffered denials of every tenant that has some.
pub async fn run_flush_pass(
    reporter: &ExceededQuotaReporter,
    tenants: &dyn TenantResolver,
    health: &HealthRegistry,
) -> usize {
    let all = merge_tenants(tenants.active_tenants(), reporter.pending_tenants());
    let mut delivered = 0;
    for tenant in &all {
        delivered += reporter.flush(tenant).await;
    }
    if delivered > 0 {
        info!(delivered, "Sent quota denial notifications");
    }
    health.record_success(CHECK_REPORTER_FLUSH, None);
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{HealthCheck, HealthStatus};
    use crate::notify::MemoryNotifier;
    use crate::quota::manager::ManagerSettings;
    use crate::quota::{DownloadQuotaLimits, QuotaKey};
    use crate::store::InMemoryQuotaRepository;
    use crate::tenant::StaticTenants;

    fn registry() -> HealthRegistry {
        let health = HealthRegistry::new();
        health.register(HealthCheck::ok(CHECK_QUOTA_SYNC));
        health.register(HealthCheck::ok(CHECK_RATE_PURGE));
        health.register(HealthCheck::ok(CHECK_REPORTER_FLUSH));
        health
    }

    #[tokio::test]
    async fn test_sync_pass_covers_tenants_with_local_state() {
        let repo = Arc::new(InMemoryQuotaRepository::new());
        let manager = QuotaManager::with_instance_id("i1", repo.clone(), ManagerSettings::default());
        let limits = DownloadQuotaLimits::new(&QuotaKey::new("unlisted", "u"), -1, -1);
        manager.get(&limits).await.unwrap();
        manager.increment(&limits).unwrap();

        let health = registry();
        let report = run_sync_pass(&manager, &StaticTenants::new(["listed"]), &health).await;
        assert_eq!(report.reconciled, 1);
        assert_eq!(repo.instance_quota("i1", &limits.key()), Some(1));
        assert_eq!(
            health.check(CHECK_QUOTA_SYNC).unwrap().status,
            HealthStatus::Ok
        );
    }

    #[tokio::test]
    async fn test_sync_pass_failure_degrades_health() {
        let repo = Arc::new(InMemoryQuotaRepository::new());
        let manager = QuotaManager::with_instance_id("i1", repo.clone(), ManagerSettings::default());
        let limits = DownloadQuotaLimits::new(&QuotaKey::new("t", "u"), -1, -1);
        manager.get(&limits).await.unwrap();
        repo.set_available(false);

        let health = registry();
        let report = run_sync_pass(&manager, &StaticTenants::new(["t"]), &health).await;
        assert_eq!(report.retained, 1);
        assert_eq!(
            health.check(CHECK_QUOTA_SYNC).unwrap().status,
            HealthStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_purge_pass_failure_is_recorded() {
        let repo = Arc::new(InMemoryQuotaRepository::new());
        repo.set_available(false);
        let manager = QuotaManager::new(repo, ManagerSettings::default());
        let health = registry();
        assert_eq!(
            run_purge_pass(&manager, &StaticTenants::new(["t"]), &health).await,
            0
        );
        assert!(health.check(CHECK_RATE_PURGE).unwrap().last_error.is_some());
    }

    #[tokio::test]
    async fn test_flush_pass_reaches_unlisted_tenants() {
        let notifier = Arc::new(MemoryNotifier::new());
        let reporter = ExceededQuotaReporter::new(notifier.clone(), 3);
        let denial = crate::error::QuotaError::RateExceeded {
            user: "u".into(),
            limit: 1,
            current: 1,
        };
        reporter.report(&denial, "file", "u", "elsewhere");
        let delivered = run_flush_pass(&reporter, &StaticTenants::new(["t"]), &registry()).await;
        assert_eq!(delivered, 1);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_tickers_run_and_stop() {
        let repo = Arc::new(InMemoryQuotaRepository::new());
        let manager = Arc::new(QuotaManager::with_instance_id(
            "i1",
            repo.clone(),
            ManagerSettings::default(),
        ));
        let limits = DownloadQuotaLimits::new(&QuotaKey::new("t", "u"), -1, -1);
        manager.get(&limits).await.unwrap();
        manager.increment(&limits).unwrap();

        let reporter = Arc::new(ExceededQuotaReporter::new(
            Arc::new(MemoryNotifier::new()),
            3,
        ));
        let (tx, rx) = watch::channel(false);
        let scheduler = QuotaScheduler::spawn(
            Arc::clone(&manager),
            reporter,
            Arc::new(StaticTenants::new(["t"])),
            registry(),
            SchedulerPeriods {
                sync: Duration::from_millis(20),
                rate_purge: Duration::from_millis(20),
                reporter_flush: Duration::from_millis(20),
            },
            rx,
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(repo.instance_quota("i1", &limits.key()), Some(1));

        tx.send(true).unwrap();
        scheduler.join().await;
    }
}
