//! Admission and configuration API.
//!
//! [`QuotaService`] resolves a user's limits (cached, created lazily from the
//! tenant defaults), compares them with the effective usage reported by the
//! [`QuotaManager`] and runs the caller's operation with a [`QuotaHandler`].
//! The caller calls [`QuotaHandler::start`] when the transfer begins and
//! [`QuotaHandler::stop`] when it ends; nothing is compensated automatically,
//! so an operation that hands the handler to an asynchronous callback stays
//! balanced.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info};

use super::{
    DefaultDownloadQuotaLimits, DownloadQuotaLimits, DownloadQuotaLimitsView, QuotaKey,
    QuotaManager, UserCurrentQuotas,
};
use crate::cache::BoundedCache;
use crate::error::{collect_batch, QuotaError, Result};
use crate::health::QuotaMetrics;
use crate::quota::ExceededQuotaReporter;
use crate::store::{QuotaRepository, StoreError, UK_DOWNLOAD_QUOTA_LIMITS_EMAIL};

/// Tuning knobs for [`QuotaService`].
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Defaults seeded for a tenant that has none in the store yet.
    pub defaults: DefaultDownloadQuotaLimits,
    /// Per-tenant overrides of `defaults`.
    pub tenant_defaults: HashMap<String, DefaultDownloadQuotaLimits>,
    pub limits_cache_ttl: Duration,
    pub limits_cache_max_entries: usize,
}

impl ServiceSettings {
    fn initial_defaults(&self, tenant: &str) -> DefaultDownloadQuotaLimits {
        self.tenant_defaults
            .get(tenant)
            .copied()
            .unwrap_or(self.defaults)
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            defaults: DefaultDownloadQuotaLimits::default(),
            tenant_defaults: HashMap::new(),
            limits_cache_ttl: Duration::from_secs(30 * 60),
            limits_cache_max_entries: 10_000,
        }
    }
}

// ============================================================================
// QuotaHandler
// ============================================================================

/// Start/stop hooks handed to an admitted operation.
#[derive(Clone)]
pub struct QuotaHandler {
    manager: Arc<QuotaManager>,
    limits: DownloadQuotaLimits,
}

impl QuotaHandler {
    fn new(manager: Arc<QuotaManager>, limits: DownloadQuotaLimits) -> Self {
        Self { manager, limits }
    }

    /// The transfer begins: consumes one quota unit and one rate slot.
    pub fn start(&self) -> Result<()> {
        self.manager.increment(&self.limits)
    }

    /// The transfer ended: releases the rate slot.
    pub fn stop(&self) -> Result<()> {
        self.manager.decrement(&self.limits)
    }

    pub fn limits(&self) -> &DownloadQuotaLimits {
        &self.limits
    }
}

// ============================================================================
// QuotaService
// ============================================================================

/// Tenant-aware quota service.
pub struct QuotaService {
    manager: Arc<QuotaManager>,
    repository: Arc<dyn QuotaRepository>,
    settings: ServiceSettings,
    limits_cache: BoundedCache<QuotaKey, DownloadQuotaLimits>,
    defaults: RwLock<HashMap<String, DefaultDownloadQuotaLimits>>,
    reporter: Option<Arc<ExceededQuotaReporter>>,
    metrics: Option<Arc<QuotaMetrics>>,
}

impl QuotaService {
    pub fn new(
        manager: Arc<QuotaManager>,
        repository: Arc<dyn QuotaRepository>,
        settings: ServiceSettings,
    ) -> Self {
        let limits_cache =
            BoundedCache::new(settings.limits_cache_ttl, settings.limits_cache_max_entries);
        Self {
            manager,
            repository,
            settings,
            limits_cache,
            defaults: RwLock::new(HashMap::new()),
            reporter: None,
            metrics: None,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<ExceededQuotaReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<QuotaMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn manager(&self) -> &Arc<QuotaManager> {
        &self.manager
    }

    // ------------------------------------------------------------------
    // Admission API
    // ------------------------------------------------------------------

    /// Run `operation` if the user is under both limits.
    ///
    /// Denials are returned as [`QuotaError::QuotaExceeded`] or
    /// [`QuotaError::RateExceeded`] (converted into `E`) and reported; the
    /// operation is not invoked.
    pub async fn with_quota<T, E, F, Fut>(
        &self,
        key: &QuotaKey,
        resource: &str,
        operation: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(QuotaHandler) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<QuotaError>,
    {
        let limits = self.cached_limits(key).await?;
        if let Err(err) = self.admit(&limits).await {
            if err.is_denial() {
                self.record_denial(&err, resource, key);
            }
            return Err(err.into());
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_admission();
        }
        operation(QuotaHandler::new(Arc::clone(&self.manager), limits)).await
    }

    /// Limits and effective usage of one user.
    pub async fn get_current_quotas(&self, key: &QuotaKey) -> Result<UserCurrentQuotas> {
        let limits = self.cached_limits(key).await?;
        let (quota, rate) = self.manager.get(&limits).await?;
        Ok(UserCurrentQuotas {
            email: limits.email,
            max_quota: limits.max_quota,
            rate_limit: limits.rate_limit,
            current_quota: quota.counter,
            current_rate: rate.gauge,
        })
    }

    /// [`QuotaService::get_current_quotas`] for several users. Any failure
    /// yields a [`QuotaError::Batch`] carrying every cause.
    pub async fn get_current_quotas_batch(
        &self,
        tenant: &str,
        emails: &[String],
    ) -> Result<Vec<UserCurrentQuotas>> {
        let lookups = emails
            .iter()
            .map(|email| QuotaKey::new(tenant, email.as_str()))
            .collect::<Vec<_>>();
        let results = join_all(lookups.iter().map(|key| self.get_current_quotas(key))).await;
        collect_batch(results)
    }

    // ------------------------------------------------------------------
    // Configuration API
    // ------------------------------------------------------------------

    pub async fn get_download_quota_limits(
        &self,
        key: &QuotaKey,
    ) -> Result<DownloadQuotaLimitsView> {
        let limits = self.cached_limits(key).await?;
        Ok(DownloadQuotaLimitsView::from(&limits))
    }

    pub async fn get_download_quota_limits_batch(
        &self,
        tenant: &str,
        emails: &[String],
    ) -> Result<Vec<DownloadQuotaLimitsView>> {
        let lookups = emails
            .iter()
            .map(|email| QuotaKey::new(tenant, email.as_str()))
            .collect::<Vec<_>>();
        let results =
            join_all(lookups.iter().map(|key| self.get_download_quota_limits(key))).await;
        collect_batch(results)
    }

    /// Create or update the user's limits and refresh the cached copy.
    pub async fn upsert_download_quota_limits(
        &self,
        tenant: &str,
        view: DownloadQuotaLimitsView,
    ) -> Result<DownloadQuotaLimitsView> {
        let key = QuotaKey::new(tenant, view.email.as_str());
        let existing = self.repository.find_by_email(&key).await?;
        let mut row = DownloadQuotaLimits::new(&key, view.max_quota, view.rate_limit);
        row.id = existing.and_then(|limits| limits.id);

        let saved = match self.repository.save(row.clone()).await {
            Ok(saved) => saved,
            Err(StoreError::UniqueViolation { constraint })
                if constraint == UK_DOWNLOAD_QUOTA_LIMITS_EMAIL =>
            {
                // Someone else inserted the row first: update theirs.
                let winner = self
                    .repository
                    .find_by_email(&key)
                    .await?
                    .ok_or_else(|| QuotaError::LimitsNotFound(key.to_string()))?;
                row.id = winner.id;
                self.repository.save(row).await?
            }
            Err(err) => return Err(err.into()),
        };

        self.limits_cache.insert(key.clone(), saved.clone());
        info!(key = %key, max_quota = saved.max_quota, rate_limit = saved.rate_limit, "Download quota limits updated");
        Ok(DownloadQuotaLimitsView::from(&saved))
    }

    /// Tenant defaults, loaded from the store (and seeded there) on first use.
    pub async fn get_default_limits(&self, tenant: &str) -> Result<DefaultDownloadQuotaLimits> {
        let cached = self.read_defaults().get(tenant).copied();
        if let Some(defaults) = cached {
            return Ok(defaults);
        }
        let defaults = match self.repository.get_default_limits(tenant).await? {
            Some(defaults) => defaults,
            None => {
                self.repository
                    .save_default_limits(tenant, self.settings.initial_defaults(tenant))
                    .await?
            }
        };
        self.write_defaults().insert(tenant.to_string(), defaults);
        Ok(defaults)
    }

    /// Load the defaults of every tenant up front.
    pub async fn init_default_limits(&self, tenants: &[String]) -> Result<()> {
        let results = join_all(tenants.iter().map(|tenant| self.get_default_limits(tenant))).await;
        collect_batch(results).map(|_| ())
    }

    /// New default `max_quota` for users created from now on.
    pub async fn change_default_quota_limits(
        &self,
        tenant: &str,
        max_quota: i64,
    ) -> Result<DefaultDownloadQuotaLimits> {
        let current = self.get_default_limits(tenant).await?;
        self.store_defaults(
            tenant,
            DefaultDownloadQuotaLimits {
                max_quota,
                ..current
            },
        )
        .await
    }

    /// New default `rate_limit` for users created from now on.
    pub async fn change_default_rate_limits(
        &self,
        tenant: &str,
        rate_limit: i64,
    ) -> Result<DefaultDownloadQuotaLimits> {
        let current = self.get_default_limits(tenant).await?;
        self.store_defaults(
            tenant,
            DefaultDownloadQuotaLimits {
                rate_limit,
                ..current
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Delete the users' limits and counters and drop every local copy.
    pub async fn remove_quota_for(&self, tenant: &str, emails: &[String]) -> Result<()> {
        let mut results = Vec::with_capacity(emails.len());
        for email in emails {
            let key = QuotaKey::new(tenant, email.as_str());
            let result = self.repository.delete_by_email(&key).await;
            self.limits_cache.invalidate(&key);
            self.manager.forget(&key);
            results.push(result.map_err(QuotaError::from));
        }
        collect_batch(results)?;
        info!(tenant = %tenant, users = emails.len(), "Removed download quotas");
        Ok(())
    }

    // -- private helpers ---------------------------------------------------

    async fn cached_limits(&self, key: &QuotaKey) -> Result<DownloadQuotaLimits> {
        if let Some(limits) = self.limits_cache.get(key) {
            return Ok(limits);
        }
        let limits = self.find_or_create(key).await?;
        Ok(self.limits_cache.get_or_insert_with(key.clone(), || limits))
    }

    /// Existing limits row, or a new one built from the tenant defaults.
    async fn find_or_create(&self, key: &QuotaKey) -> Result<DownloadQuotaLimits> {
        if let Some(limits) = self.repository.find_by_email(key).await? {
            return Ok(limits);
        }
        let defaults = self.get_default_limits(&key.tenant).await?;
        let row = DownloadQuotaLimits::new(key, defaults.max_quota, defaults.rate_limit);
        match self.repository.save(row).await {
            Ok(created) => {
                debug!(key = %key, "Created download quota limits from tenant defaults");
                Ok(created)
            }
            Err(StoreError::UniqueViolation { constraint })
                if constraint == UK_DOWNLOAD_QUOTA_LIMITS_EMAIL =>
            {
                debug!(key = %key, "Limits created concurrently; re-reading");
                self.repository
                    .find_by_email(key)
                    .await?
                    .ok_or_else(|| QuotaError::LimitsNotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn admit(&self, limits: &DownloadQuotaLimits) -> Result<()> {
        let (quota, rate) = self.manager.get(limits).await?;
        if limits.quota_reached(quota.counter) {
            return Err(QuotaError::QuotaExceeded {
                user: limits.email.clone(),
                limit: limits.max_quota,
                current: quota.counter,
            });
        }
        if limits.rate_reached(rate.gauge) {
            return Err(QuotaError::RateExceeded {
                user: limits.email.clone(),
                limit: limits.rate_limit,
                current: rate.gauge,
            });
        }
        Ok(())
    }

    fn record_denial(&self, err: &QuotaError, resource: &str, key: &QuotaKey) {
        if let Some(metrics) = &self.metrics {
            match err {
                QuotaError::QuotaExceeded { .. } => metrics.record_quota_denial(),
                _ => metrics.record_rate_denial(),
            }
        }
        if let Some(reporter) = &self.reporter {
            reporter.report(err, resource, &key.user, &key.tenant);
        }
    }

    async fn store_defaults(
        &self,
        tenant: &str,
        defaults: DefaultDownloadQuotaLimits,
    ) -> Result<DefaultDownloadQuotaLimits> {
        let saved = self.repository.save_default_limits(tenant, defaults).await?;
        self.write_defaults().insert(tenant.to_string(), saved);
        info!(
            tenant = %tenant,
            max_quota = saved.max_quota,
            rate_limit = saved.rate_limit,
            "Default download quota limits changed"
        );
        Ok(saved)
    }

    fn read_defaults(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, DefaultDownloadQuotaLimits>> {
        self.defaults.read().expect("default limits lock poisoned")
    }

    fn write_defaults(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, DefaultDownloadQuotaLimits>> {
        self.defaults.write().expect("default limits lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemoryNotifier;
    use crate::quota::manager::ManagerSettings;
    use crate::store::{InMemoryQuotaRepository, MockQuotaRepository};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const TENANT: &str = "tenant";

    fn key(user: &str) -> QuotaKey {
        QuotaKey::new(TENANT, user)
    }

    fn service_on(repo: Arc<InMemoryQuotaRepository>) -> QuotaService {
        let manager = Arc::new(QuotaManager::with_instance_id(
            "i1",
            repo.clone(),
            ManagerSettings::default(),
        ));
        QuotaService::new(manager, repo, ServiceSettings::default())
    }

    fn view(email: &str, max_quota: i64, rate_limit: i64) -> DownloadQuotaLimitsView {
        DownloadQuotaLimitsView {
            email: email.into(),
            max_quota,
            rate_limit,
        }
    }

    async fn usage_of(repo: &InMemoryQuotaRepository, user: &str, used: i64) {
        repo.upsert_or_combine_download_quota("other-instance", &key(user), used)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_admission_denied_at_limit() {
        let repo = Arc::new(InMemoryQuotaRepository::new());
        let service = service_on(repo.clone());
        service
            .upsert_download_quota_limits(TENANT, view("alice", 10, -1))
            .await
            .unwrap();
        usage_of(&repo, "alice", 10).await;

        let invoked = AtomicBool::new(false);
        let result: Result<()> = service
            .with_quota(&key("alice"), "file-1", |_handler| async {
                invoked.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        match result {
            Err(QuotaError::QuotaExceeded { limit, current, .. }) => {
                assert_eq!(limit, 10);
                assert_eq!(current, 10);
            }
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_admission_allowed_below_limit() {
        let repo = Arc::new(InMemoryQuotaRepository::new());
        let service = service_on(repo.clone());
        service
            .upsert_download_quota_limits(TENANT, view("alice", 10, -1))
            .await
            .unwrap();
        usage_of(&repo, "alice", 9).await;

        let value: Result<&str> = service
            .with_quota(&key("alice"), "file-1", |handler| async move {
                handler.start()?;
                handler.stop()?;
                Ok("done")
            })
            .await;
        assert_eq!(value.unwrap(), "done");

        let current = service.get_current_quotas(&key("alice")).await.unwrap();
        assert_eq!(current.current_quota, 10);
        assert_eq!(current.current_rate, 0);
    }

    #[tokio::test]
    async fn test_unlimited_never_denies() {
        let repo = Arc::new(InMemoryQuotaRepository::new());
        let service = service_on(repo.clone());
        usage_of(&repo, "bob", 1_000_000).await;

        // No explicit limits: created from the unlimited defaults.
        let result: Result<()> = service
            .with_quota(&key("bob"), "file", |_| async { Ok(()) })
            .await;
        assert!(result.is_ok());
        let limits = service.get_download_quota_limits(&key("bob")).await.unwrap();
        assert_eq!(limits.max_quota, -1);
    }

    #[tokio::test]
    async fn test_rate_denial_reports_configured_rate_limit() {
        let repo = Arc::new(InMemoryQuotaRepository::new());
        let service = service_on(repo);
        service
            .upsert_download_quota_limits(TENANT, view("carol", -1, 1))
            .await
            .unwrap();

        let handler_slot = std::sync::Mutex::new(None);
        let slot = &handler_slot;
        let _: Result<()> = service
            .with_quota(&key("carol"), "f1", |handler| async move {
                handler.start()?;
                *slot.lock().unwrap() = Some(handler);
                Ok(())
            })
            .await;

        let result: Result<()> = service
            .with_quota(&key("carol"), "f2", |_| async { Ok(()) })
            .await;
        match result {
            Err(QuotaError::RateExceeded { limit, current, .. }) => {
                assert_eq!(limit, 1);
                assert_eq!(current, 1);
            }
            other => panic!("expected RateExceeded, got {other:?}"),
        }

        // Releasing the slot readmits the user.
        handler_slot.lock().unwrap().take().unwrap().stop().unwrap();
        let result: Result<()> = service
            .with_quota(&key("carol"), "f3", |_| async { Ok(()) })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_denials_feed_reporter_and_metrics() {
        let repo = Arc::new(InMemoryQuotaRepository::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let reporter = Arc::new(ExceededQuotaReporter::new(notifier.clone(), 3));
        let metrics = Arc::new(QuotaMetrics::new());
        let service = service_on(repo.clone())
            .with_reporter(reporter.clone())
            .with_metrics(metrics.clone());
        service
            .upsert_download_quota_limits(TENANT, view("alice", 0, -1))
            .await
            .unwrap();

        let _: Result<()> = service
            .with_quota(&key("alice"), "report.pdf", |_| async { Ok(()) })
            .await;
        assert_eq!(metrics.quota_denials.load(Ordering::Relaxed), 1);
        assert_eq!(reporter.flush(TENANT).await, 1);
        assert!(notifier.sent()[0].message.contains("report.pdf"));
    }

    #[tokio::test]
    async fn test_operation_error_type_is_caller_defined() {
        #[derive(Debug)]
        enum DownloadError {
            Quota(QuotaError),
        }
        impl From<QuotaError> for DownloadError {
            fn from(err: QuotaError) -> Self {
                DownloadError::Quota(err)
            }
        }

        let repo = Arc::new(InMemoryQuotaRepository::new());
        let service = service_on(repo);
        service
            .upsert_download_quota_limits(TENANT, view("alice", 0, -1))
            .await
            .unwrap();
        let result: std::result::Result<(), DownloadError> = service
            .with_quota(&key("alice"), "f", |_| async { Ok(()) })
            .await;
        assert!(matches!(
            result,
            Err(DownloadError::Quota(QuotaError::QuotaExceeded { .. }))
        ));
    }

    #[tokio::test]
    async fn test_upsert_updates_existing_row_and_cache() {
        let repo = Arc::new(InMemoryQuotaRepository::new());
        let service = service_on(repo.clone());
        service.get_download_quota_limits(&key("alice")).await.unwrap();
        service
            .upsert_download_quota_limits(TENANT, view("alice", 42, 3))
            .await
            .unwrap();

        assert_eq!(repo.limits_count(TENANT), 1);
        let limits = service.get_download_quota_limits(&key("alice")).await.unwrap();
        assert_eq!((limits.max_quota, limits.rate_limit), (42, 3));
    }

    fn stored(id: i64) -> DownloadQuotaLimits {
        let mut row = DownloadQuotaLimits::new(&key("race"), -1, -1);
        row.id = Some(id);
        row
    }

    #[tokio::test]
    async fn test_creation_race_rereads_winner() {
        // Two instances both miss the row; the second insert collides.
        let finds = Arc::new(AtomicUsize::new(0));
        let saves = Arc::new(AtomicUsize::new(0));
        let mut mock = MockQuotaRepository::new();
        let f = finds.clone();
        mock.expect_find_by_email().returning(move |_| {
            if f.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(None)
            } else {
                Ok(Some(stored(1)))
            }
        });
        let s = saves.clone();
        mock.expect_save().returning(move |mut row| {
            if s.fetch_add(1, Ordering::SeqCst) == 0 {
                row.id = Some(1);
                Ok(row)
            } else {
                Err(StoreError::UniqueViolation {
                    constraint: UK_DOWNLOAD_QUOTA_LIMITS_EMAIL.into(),
                })
            }
        });
        mock.expect_get_default_limits()
            .returning(|_| Ok(Some(DefaultDownloadQuotaLimits::default())));

        let repo: Arc<dyn QuotaRepository> = Arc::new(mock);
        let make = || {
            let manager = Arc::new(QuotaManager::new(repo.clone(), ManagerSettings::default()));
            QuotaService::new(manager, repo.clone(), ServiceSettings::default())
        };
        let (first, second) = (make(), make());

        let race = key("race");
        let (a, b) = tokio::join!(
            first.get_download_quota_limits(&race),
            second.get_download_quota_limits(&race),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(saves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_upsert_race_updates_winner_row() {
        let saves = Arc::new(AtomicUsize::new(0));
        let mut mock = MockQuotaRepository::new();
        let lookups = Arc::new(AtomicUsize::new(0));
        let l = lookups.clone();
        mock.expect_find_by_email().returning(move |_| {
            if l.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(None)
            } else {
                Ok(Some(stored(7)))
            }
        });
        let s = saves.clone();
        mock.expect_save().returning(move |row| {
            s.fetch_add(1, Ordering::SeqCst);
            match row.id {
                None => Err(StoreError::UniqueViolation {
                    constraint: UK_DOWNLOAD_QUOTA_LIMITS_EMAIL.into(),
                }),
                Some(_) => Ok(row),
            }
        });

        let repo: Arc<dyn QuotaRepository> = Arc::new(mock);
        let manager = Arc::new(QuotaManager::new(repo.clone(), ManagerSettings::default()));
        let service = QuotaService::new(manager, repo, ServiceSettings::default());

        let saved = service
            .upsert_download_quota_limits(TENANT, view("race", 5, 2))
            .await
            .unwrap();
        assert_eq!((saved.max_quota, saved.rate_limit), (5, 2));
        assert_eq!(saves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_batch_lookup_composes_every_failure() {
        let repo = Arc::new(InMemoryQuotaRepository::new());
        let service = service_on(repo.clone());
        service.get_download_quota_limits(&key("ok")).await.unwrap();
        repo.set_available(false);

        let emails = vec!["ok".to_string(), "x".to_string(), "y".to_string()];
        match service.get_current_quotas_batch(TENANT, &emails).await {
            Err(QuotaError::Batch(batch)) => {
                // "ok" has cached limits but its seed still needs the store.
                assert_eq!(batch.len(), 3);
                assert!(batch
                    .causes()
                    .iter()
                    .all(|c| matches!(c, QuotaError::Storage(_))));
            }
            other => panic!("expected Batch error, got {other:?}"),
        }

        repo.set_available(true);
        let limits = service
            .get_download_quota_limits_batch(TENANT, &emails)
            .await
            .unwrap();
        assert_eq!(limits.len(), 3);
    }

    #[tokio::test]
    async fn test_defaults_seeded_from_tenant_override() {
        let repo = Arc::new(InMemoryQuotaRepository::new());
        let manager = Arc::new(QuotaManager::new(repo.clone(), ManagerSettings::default()));
        let mut settings = ServiceSettings::default();
        settings.tenant_defaults.insert(
            TENANT.into(),
            DefaultDownloadQuotaLimits {
                max_quota: 100,
                rate_limit: 4,
            },
        );
        let service = QuotaService::new(manager, repo.clone(), settings);

        let limits = service.get_download_quota_limits(&key("new")).await.unwrap();
        assert_eq!((limits.max_quota, limits.rate_limit), (100, 4));
        assert_eq!(
            repo.get_default_limits(TENANT).await.unwrap().unwrap().max_quota,
            100
        );
    }

    #[tokio::test]
    async fn test_change_defaults_affects_new_users_only() {
        let repo = Arc::new(InMemoryQuotaRepository::new());
        let service = service_on(repo.clone());
        service.init_default_limits(&[TENANT.to_string()]).await.unwrap();
        service.get_download_quota_limits(&key("old")).await.unwrap();

        service.change_default_quota_limits(TENANT, 50).await.unwrap();
        let defaults = service.change_default_rate_limits(TENANT, 2).await.unwrap();
        assert_eq!((defaults.max_quota, defaults.rate_limit), (50, 2));

        let old = service.get_download_quota_limits(&key("old")).await.unwrap();
        let new = service.get_download_quota_limits(&key("new")).await.unwrap();
        assert_eq!(old.max_quota, -1);
        assert_eq!((new.max_quota, new.rate_limit), (50, 2));
    }

    #[tokio::test]
    async fn test_remove_quota_for_clears_store_and_caches() {
        let repo = Arc::new(InMemoryQuotaRepository::new());
        let service = service_on(repo.clone());
        let _: Result<()> = service
            .with_quota(&key("gone"), "f", |h| async move { h.start() })
            .await;
        assert!(service.manager().local_diffs(&key("gone")).is_some());

        service
            .remove_quota_for(TENANT, &["gone".to_string()])
            .await
            .unwrap();
        assert_eq!(repo.limits_count(TENANT), 0);
        assert!(service.manager().local_diffs(&key("gone")).is_none());
        assert_eq!(repo.fetch_download_quota_sum(&key("gone")).await.unwrap().counter, 0);
    }
}
