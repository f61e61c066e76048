//! In-memory implementation of [`QuotaRepository`].
//!
//! Mirrors what the relational store guarantees: unique (tenant, email)
//! limits rows with generated ids, per-(instance, user) counter and rate rows
//! combined atomically, and rate sums that ignore expired rows. One instance
//! can be shared (behind an `Arc`) by several managers to simulate a fleet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{QuotaRepository, StoreError, StoreResult, UK_DOWNLOAD_QUOTA_LIMITS_EMAIL};
use crate::quota::{
    DefaultDownloadQuotaLimits, DiffSync, DownloadQuotaLimits, QuotaKey, UserQuotaAggregate,
    UserRateAggregate,
};

#[derive(Debug, Clone, Copy)]
struct RateRow {
    gauge: i64,
    expires_at: DateTime<Utc>,
}

/// Row owned by one instance for one user.
type InstanceKey = (String, QuotaKey);

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    limits: HashMap<QuotaKey, DownloadQuotaLimits>,
    defaults: HashMap<String, DefaultDownloadQuotaLimits>,
    quotas: HashMap<InstanceKey, i64>,
    rates: HashMap<InstanceKey, RateRow>,
}

impl Tables {
    fn combine_quota(&mut self, instance_id: &str, key: &QuotaKey, delta: i64) {
        *self
            .quotas
            .entry((instance_id.to_string(), key.clone()))
            .or_insert(0) += delta;
    }

    fn combine_rate(
        &mut self,
        instance_id: &str,
        key: &QuotaKey,
        delta: i64,
        expires_at: DateTime<Utc>,
    ) {
        let row = self
            .rates
            .entry((instance_id.to_string(), key.clone()))
            .or_insert(RateRow {
                gauge: 0,
                expires_at,
            });
        row.gauge += delta;
        row.expires_at = expires_at;
    }

    fn quota_sum(&self, key: &QuotaKey) -> UserQuotaAggregate {
        let counter = self
            .quotas
            .iter()
            .filter(|((_, k), _)| k == key)
            .map(|(_, counter)| *counter)
            .sum();
        UserQuotaAggregate::new(counter)
    }

    fn rate_sum(&self, key: &QuotaKey, now: DateTime<Utc>) -> UserRateAggregate {
        let gauge = self
            .rates
            .iter()
            .filter(|((_, k), row)| k == key && row.expires_at > now)
            .map(|(_, row)| row.gauge)
            .sum();
        UserRateAggregate::new(gauge)
    }
}

/// Thread-safe in-memory store.
#[derive(Debug)]
pub struct InMemoryQuotaRepository {
    tables: Mutex<Tables>,
    available: AtomicBool,
    /// Reconciliations left to abort after their first write.
    failing_reconciles: AtomicUsize,
}

impl InMemoryQuotaRepository {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                next_id: 1,
                ..Default::default()
            }),
            available: AtomicBool::new(true),
            failing_reconciles: AtomicUsize::new(0),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `count` reconciliations fail after writing the quota
    /// row. The write is rolled back, as a transaction abort would.
    pub fn fail_next_reconciles(&self, count: usize) {
        self.failing_reconciles.store(count, Ordering::SeqCst);
    }

    /// Number of limits rows stored for `tenant`.
    pub fn limits_count(&self, tenant: &str) -> usize {
        self.lock()
            .limits
            .keys()
            .filter(|k| k.tenant == tenant)
            .count()
    }

    /// Quota counter row owned by `instance_id` for `key`, if any.
    pub fn instance_quota(&self, instance_id: &str, key: &QuotaKey) -> Option<i64> {
        self.lock()
            .quotas
            .get(&(instance_id.to_string(), key.clone()))
            .copied()
    }

    /// Rate gauge row owned by `instance_id` for `key`, if any (expired or not).
    pub fn instance_rate(&self, instance_id: &str, key: &QuotaKey) -> Option<i64> {
        self.lock()
            .rates
            .get(&(instance_id.to_string(), key.clone()))
            .map(|row| row.gauge)
    }

    /// Number of rate rows currently stored, expired ones included.
    pub fn rate_rows(&self) -> usize {
        self.lock().rates.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().expect("quota store lock poisoned")
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store switched off".into()))
        }
    }
}

impl Default for InMemoryQuotaRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuotaRepository for InMemoryQuotaRepository {
    async fn find_by_email(&self, key: &QuotaKey) -> StoreResult<Option<DownloadQuotaLimits>> {
        self.check_available()?;
        Ok(self.lock().limits.get(key).cloned())
    }

    async fn save(&self, mut limits: DownloadQuotaLimits) -> StoreResult<DownloadQuotaLimits> {
        self.check_available()?;
        let key = limits.key();
        let mut tables = self.lock();
        match limits.id {
            None => {
                if tables.limits.contains_key(&key) {
                    return Err(StoreError::UniqueViolation {
                        constraint: UK_DOWNLOAD_QUOTA_LIMITS_EMAIL.to_string(),
                    });
                }
                limits.id = Some(tables.next_id);
                tables.next_id += 1;
            }
            Some(id) => match tables.limits.get(&key) {
                Some(existing) if existing.id == Some(id) => {}
                _ => return Err(StoreError::NotFound(format!("limits {id} for {key}"))),
            },
        }
        tables.limits.insert(key, limits.clone());
        Ok(limits)
    }

    async fn delete_by_email(&self, key: &QuotaKey) -> StoreResult<()> {
        self.check_available()?;
        let mut tables = self.lock();
        tables.limits.remove(key);
        tables.quotas.retain(|(_, k), _| k != key);
        tables.rates.retain(|(_, k), _| k != key);
        Ok(())
    }

    async fn get_default_limits(
        &self,
        tenant: &str,
    ) -> StoreResult<Option<DefaultDownloadQuotaLimits>> {
        self.check_available()?;
        Ok(self.lock().defaults.get(tenant).copied())
    }

    async fn save_default_limits(
        &self,
        tenant: &str,
        defaults: DefaultDownloadQuotaLimits,
    ) -> StoreResult<DefaultDownloadQuotaLimits> {
        self.check_available()?;
        self.lock().defaults.insert(tenant.to_string(), defaults);
        Ok(defaults)
    }

    async fn delete_expired_rates(&self, tenant: &str) -> StoreResult<u64> {
        self.check_available()?;
        let now = Utc::now();
        let mut tables = self.lock();
        let before = tables.rates.len();
        tables
            .rates
            .retain(|(_, k), row| k.tenant != tenant || row.expires_at > now);
        Ok((before - tables.rates.len()) as u64)
    }

    async fn upsert_or_combine_download_quota(
        &self,
        instance_id: &str,
        key: &QuotaKey,
        delta: i64,
    ) -> StoreResult<()> {
        self.check_available()?;
        self.lock().combine_quota(instance_id, key, delta);
        Ok(())
    }

    async fn upsert_or_combine_download_rate(
        &self,
        instance_id: &str,
        key: &QuotaKey,
        delta: i64,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check_available()?;
        self.lock()
            .combine_rate(instance_id, key, delta, expires_at);
        Ok(())
    }

    async fn fetch_download_quota_sum(&self, key: &QuotaKey) -> StoreResult<UserQuotaAggregate> {
        self.check_available()?;
        Ok(self.lock().quota_sum(key))
    }

    async fn fetch_download_rates_sum(&self, key: &QuotaKey) -> StoreResult<UserRateAggregate> {
        self.check_available()?;
        Ok(self.lock().rate_sum(key, Utc::now()))
    }

    async fn reconcile(
        &self,
        instance_id: &str,
        key: &QuotaKey,
        diff: DiffSync,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<(UserQuotaAggregate, UserRateAggregate)> {
        self.check_available()?;
        // One lock acquisition plays the role of the transaction.
        let mut tables = self.lock();
        tables.combine_quota(instance_id, key, diff.quota_diff);
        let abort = self
            .failing_reconciles
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if abort {
            tables.combine_quota(instance_id, key, -diff.quota_diff);
            return Err(StoreError::Unavailable(
                "reconcile aborted after quota write".into(),
            ));
        }
        tables.combine_rate(instance_id, key, diff.rate_diff, expires_at);
        Ok((tables.quota_sum(key), tables.rate_sum(key, Utc::now())))
    }
}
