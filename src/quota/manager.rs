//! Local diff-over-aggregate cache and the reconciliation protocol.
//!
//! Each instance keeps, per (tenant, user), the last global aggregates read
//! from the shared store plus its own un-synchronized deltas ([`UserDiffs`]).
//! Admission reads and counter updates touch only this cache. A periodic
//! [`QuotaManager::sync_tenant`] pass moves the deltas into the store and
//! refreshes the aggregates:
//!
//! 1. take the process-wide sync flag (one pass at a time);
//! 2. swap every entry for a zero-diff entry whose aggregate already includes
//!    the old diff, capturing the old entry;
//! 3. add the captured diffs to the tenant's accumulator;
//! 4. reconcile each accumulated key with the store in one transaction;
//! 5. install the fresh sums, keeping diffs recorded since the swap;
//! 6. drop reconciled keys from the accumulator, keep failed ones for the
//!    next pass.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::{
    DiffSync, DownloadQuotaLimits, QuotaKey, UserDiffs, UserQuotaAggregate, UserRateAggregate,
};
use crate::cache::BoundedCache;
use crate::error::{QuotaError, Result};
use crate::health::QuotaMetrics;
use crate::store::{QuotaRepository, StoreError};

/// Tuning knobs for [`QuotaManager`].
#[derive(Debug, Clone, Copy)]
pub struct ManagerSettings {
    /// Reconciliation period; rate rows written by a pass expire after it.
    pub sync_window: Duration,
    /// Idle time after which a clean cache entry is dropped.
    pub cache_ttl: Duration,
    /// Maximum cached users per tenant.
    pub cache_max_entries: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            sync_window: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(30 * 60),
            cache_max_entries: 10_000,
        }
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Keys written to the store and refreshed.
    pub reconciled: usize,
    /// Keys whose store write failed; their diffs stay in the accumulator.
    pub retained: usize,
}

type TenantCache = Arc<BoundedCache<String, UserDiffs>>;

/// Owner of the local diff cache and the per-tenant diff accumulator.
pub struct QuotaManager {
    instance_id: String,
    repository: Arc<dyn QuotaRepository>,
    settings: ManagerSettings,
    caches: DashMap<String, TenantCache>,
    /// tenant -> user -> diffs captured but not yet written to the store.
    accumulator: Mutex<HashMap<String, HashMap<String, DiffSync>>>,
    syncing: AtomicBool,
    metrics: Option<Arc<QuotaMetrics>>,
}

struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl QuotaManager {
    /// Manager with a fresh random instance id.
    pub fn new(repository: Arc<dyn QuotaRepository>, settings: ManagerSettings) -> Self {
        Self::with_instance_id(uuid::Uuid::new_v4().to_string(), repository, settings)
    }

    pub fn with_instance_id(
        instance_id: impl Into<String>,
        repository: Arc<dyn QuotaRepository>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            repository,
            settings,
            caches: DashMap::new(),
            accumulator: Mutex::new(HashMap::new()),
            syncing: AtomicBool::new(false),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<QuotaMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Identifier this instance writes its store rows under.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn settings(&self) -> ManagerSettings {
        self.settings
    }

    // ------------------------------------------------------------------
    // Hot path
    // ------------------------------------------------------------------

    /// Effective (aggregate + local diff) quota and rate of the user.
    ///
    /// On a cache miss this instance registers a zero contribution in the
    /// store and reads the global sums once.
    pub async fn get(
        &self,
        limits: &DownloadQuotaLimits,
    ) -> Result<(UserQuotaAggregate, UserRateAggregate)> {
        let cache = self.tenant_cache(&limits.tenant);
        if let Some(diffs) = cache.get(&limits.email) {
            return Ok(diffs.effective());
        }

        let seeded = self.seed(&limits.key()).await?;
        // A concurrent get may have won; keep whichever entry landed first.
        let diffs = cache.get_or_insert_with(limits.email.clone(), || seeded);
        Ok(diffs.effective())
    }

    /// Record one started download. Requires a prior [`QuotaManager::get`].
    ///
    /// Fails with [`QuotaError::RateExceeded`] when the effective rate is
    /// already at the user's limit.
    pub fn increment(&self, limits: &DownloadQuotaLimits) -> Result<()> {
        let outcome = self
            .existing_cache(&limits.tenant)
            .and_then(|cache| {
                cache.compute_if_present(&limits.email, |diffs| {
                    let current = diffs.total_rate();
                    if limits.rate_reached(current) {
                        return Err(current);
                    }
                    *diffs = diffs.incremented();
                    Ok(())
                })
            })
            .ok_or_else(|| Self::misuse("increment", limits))?;

        outcome.map_err(|current| QuotaError::RateExceeded {
            user: limits.email.clone(),
            limit: limits.rate_limit,
            current,
        })
    }

    /// Record one finished download. Requires a prior [`QuotaManager::get`].
    pub fn decrement(&self, limits: &DownloadQuotaLimits) -> Result<()> {
        self.existing_cache(&limits.tenant)
            .and_then(|cache| {
                cache.compute_if_present(&limits.email, |diffs| {
                    *diffs = diffs.rate_decremented();
                })
            })
            .ok_or_else(|| Self::misuse("decrement", limits))
    }

    // ------------------------------------------------------------------
    // Background work
    // ------------------------------------------------------------------

    /// Run one reconciliation pass for `tenant`.
    ///
    /// Store failures never surface: affected keys are counted in
    /// [`SyncReport::retained`] and retried on the next pass.
    pub async fn sync_tenant(&self, tenant: &str) -> SyncReport {
        let _guard = self.acquire_sync_lock().await;

        let cache = self.existing_cache(tenant);
        let captured = cache
            .as_ref()
            .map(|cache| cache.replace_all(|_, diffs| diffs.renewed()))
            .unwrap_or_default();

        let pending: Vec<(String, DiffSync)> = {
            let mut accumulator = self.lock_accumulator();
            let tenant_acc = accumulator.entry(tenant.to_string()).or_default();
            for (user, old) in captured {
                *tenant_acc.entry(user).or_default() += old.diff_sync();
            }
            tenant_acc
                .iter()
                .map(|(user, diff)| (user.clone(), *diff))
                .collect()
        };

        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.settings.sync_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let mut report = SyncReport::default();
        let mut reconciled_users = Vec::with_capacity(pending.len());
        for (user, diff) in pending {
            let key = QuotaKey::new(tenant, user.as_str());
            match self
                .repository
                .reconcile(&self.instance_id, &key, diff, expires_at)
                .await
            {
                Ok((quota, rate)) => {
                    if let Some(cache) = &cache {
                        cache.compute_if_present(&user, |diffs| {
                            *diffs = diffs.refreshed(quota, rate);
                        });
                    }
                    reconciled_users.push(user);
                    report.reconciled += 1;
                }
                Err(err) => {
                    warn!(
                        tenant = %tenant,
                        user = %user,
                        quota_diff = diff.quota_diff,
                        rate_diff = diff.rate_diff,
                        error = %err,
                        "Reconciliation failed; keeping diff for next pass"
                    );
                    report.retained += 1;
                }
            }
        }

        {
            let mut accumulator = self.lock_accumulator();
            if let Some(tenant_acc) = accumulator.get_mut(tenant) {
                for user in &reconciled_users {
                    tenant_acc.remove(user);
                }
                if tenant_acc.is_empty() {
                    accumulator.remove(tenant);
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_reconciled(report.reconciled as u64, report.retained as u64);
        }
        debug!(
            tenant = %tenant,
            reconciled = report.reconciled,
            retained = report.retained,
            "Reconciliation pass finished"
        );
        report
    }

    /// Purge expired rate rows of `tenant` from the store.
    pub async fn purge_expired_rates(&self, tenant: &str) -> Result<u64> {
        let removed = self.repository.delete_expired_rates(tenant).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_purged(removed);
        }
        if removed > 0 {
            info!(tenant = %tenant, removed, "Purged expired download rates");
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Introspection and invalidation
    // ------------------------------------------------------------------

    /// Drop every local trace of the user (cache entry and pending diffs).
    pub fn forget(&self, key: &QuotaKey) {
        if let Some(cache) = self.existing_cache(&key.tenant) {
            cache.invalidate(&key.user);
        }
        let mut accumulator = self.lock_accumulator();
        if let Some(tenant_acc) = accumulator.get_mut(&key.tenant) {
            tenant_acc.remove(&key.user);
            if tenant_acc.is_empty() {
                accumulator.remove(&key.tenant);
            }
        }
    }

    /// Cached entry of the user, without refreshing its access time.
    pub fn local_diffs(&self, key: &QuotaKey) -> Option<UserDiffs> {
        self.existing_cache(&key.tenant)?.peek(&key.user)
    }

    /// Diffs of `tenant` captured by a pass but not yet written to the store.
    pub fn pending_diffs(&self, tenant: &str) -> HashMap<String, DiffSync> {
        self.lock_accumulator()
            .get(tenant)
            .cloned()
            .unwrap_or_default()
    }

    /// Tenants with cached entries or pending diffs on this instance.
    pub fn known_tenants(&self) -> Vec<String> {
        let mut tenants: HashSet<String> = self
            .caches
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        tenants.extend(self.lock_accumulator().keys().cloned());
        let mut tenants: Vec<String> = tenants.into_iter().collect();
        tenants.sort();
        tenants
    }

    // -- private helpers ---------------------------------------------------

    async fn seed(&self, key: &QuotaKey) -> Result<UserDiffs> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.settings.sync_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        tolerate_unique(
            self.repository
                .upsert_or_combine_download_quota(&self.instance_id, key, 0)
                .await,
        )?;
        tolerate_unique(
            self.repository
                .upsert_or_combine_download_rate(&self.instance_id, key, 0, expires_at)
                .await,
        )?;
        let quota = self.repository.fetch_download_quota_sum(key).await?;
        let rate = self.repository.fetch_download_rates_sum(key).await?;
        // Diffs of a failed pass are not in the store yet but are still ours.
        // Briefly over-counts if a pass is writing this key right now.
        let pending = self
            .lock_accumulator()
            .get(&key.tenant)
            .and_then(|users| users.get(&key.user))
            .copied()
            .unwrap_or_default();
        let quota = UserQuotaAggregate::new(quota.counter + pending.quota_diff);
        let rate = UserRateAggregate::new(rate.gauge + pending.rate_diff);
        debug!(key = %key, quota = quota.counter, rate = rate.gauge, "Seeded quota cache entry");
        Ok(UserDiffs::seeded(quota, rate))
    }

    fn tenant_cache(&self, tenant: &str) -> TenantCache {
        if let Some(cache) = self.caches.get(tenant) {
            return Arc::clone(cache.value());
        }
        let settings = self.settings;
        Arc::clone(
            self.caches
                .entry(tenant.to_string())
                .or_insert_with(|| {
                    Arc::new(BoundedCache::with_pin(
                        settings.cache_ttl,
                        settings.cache_max_entries,
                        |diffs: &UserDiffs| !diffs.is_clean(),
                    ))
                })
                .value(),
        )
    }

    fn existing_cache(&self, tenant: &str) -> Option<TenantCache> {
        self.caches.get(tenant).map(|cache| Arc::clone(cache.value()))
    }

    fn lock_accumulator(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, DiffSync>>> {
        self.accumulator
            .lock()
            .expect("quota accumulator lock poisoned")
    }

    async fn acquire_sync_lock(&self) -> SyncGuard<'_> {
        while self
            .syncing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            tokio::task::yield_now().await;
        }
        SyncGuard(&self.syncing)
    }

    fn misuse(operation: &str, limits: &DownloadQuotaLimits) -> QuotaError {
        QuotaError::ProgrammingMisuse(format!(
            "{operation} called for {} before get",
            limits.key()
        ))
    }
}

/// A concurrent seed of the same row is as good as our own.
fn tolerate_unique(result: std::result::Result<(), StoreError>) -> Result<()> {
    match result {
        Err(StoreError::UniqueViolation { constraint }) => {
            debug!(constraint = %constraint, "Seed row already created concurrently");
            Ok(())
        }
        other => Ok(other?),
    }
}
