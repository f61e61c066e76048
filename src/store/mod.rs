//! Shared-store contract.
//!
//! The store is the only state mutated by more than one instance. Every
//! cross-instance mutation goes through an atomic upsert/add on rows owned by
//! a single instance, so instances never read-modify-write each other's rows.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::quota::{
    DefaultDownloadQuotaLimits, DiffSync, DownloadQuotaLimits, QuotaKey, UserQuotaAggregate,
    UserRateAggregate,
};

pub use memory::InMemoryQuotaRepository;

/// Name of the uniqueness constraint on (tenant, email) limits rows.
pub const UK_DOWNLOAD_QUOTA_LIMITS_EMAIL: &str = "uk_download_quota_limits_email";

/// Store-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// An insert collided with an existing row.
    #[error("unique constraint {constraint} violated")]
    UniqueViolation { constraint: String },

    /// Transient failure talking to the store.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// An update targeted a row that does not exist.
    #[error("row not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence operations the engine needs.
///
/// Implementations must make every `upsert_or_combine_*` call a single atomic
/// statement (create-if-absent, add-if-present).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuotaRepository: Send + Sync {
    /// Limits row for the user, if any.
    async fn find_by_email(&self, key: &QuotaKey) -> StoreResult<Option<DownloadQuotaLimits>>;

    /// Insert (`id == None`) or update (`id == Some`) a limits row.
    ///
    /// Inserting a second row for the same (tenant, email) fails with
    /// [`StoreError::UniqueViolation`].
    async fn save(&self, limits: DownloadQuotaLimits) -> StoreResult<DownloadQuotaLimits>;

    /// Remove the limits row and every counter/rate row of the user.
    async fn delete_by_email(&self, key: &QuotaKey) -> StoreResult<()>;

    async fn get_default_limits(
        &self,
        tenant: &str,
    ) -> StoreResult<Option<DefaultDownloadQuotaLimits>>;

    /// Create or replace the tenant's default limits.
    async fn save_default_limits(
        &self,
        tenant: &str,
        defaults: DefaultDownloadQuotaLimits,
    ) -> StoreResult<DefaultDownloadQuotaLimits>;

    /// Purge rate rows of `tenant` whose expiration is in the past. Returns
    /// the number of rows removed.
    async fn delete_expired_rates(&self, tenant: &str) -> StoreResult<u64>;

    /// Add `delta` to this instance's quota counter row for the user.
    async fn upsert_or_combine_download_quota(
        &self,
        instance_id: &str,
        key: &QuotaKey,
        delta: i64,
    ) -> StoreResult<()>;

    /// Add `delta` to this instance's rate row for the user and push its
    /// expiration to `expires_at`.
    async fn upsert_or_combine_download_rate(
        &self,
        instance_id: &str,
        key: &QuotaKey,
        delta: i64,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Sum of every instance's quota counter rows for the user.
    async fn fetch_download_quota_sum(&self, key: &QuotaKey) -> StoreResult<UserQuotaAggregate>;

    /// Sum of every instance's non-expired rate rows for the user.
    async fn fetch_download_rates_sum(&self, key: &QuotaKey) -> StoreResult<UserRateAggregate>;

    /// Apply one captured diff and read back the global sums, in one
    /// transaction.
    ///
    /// Must be all-or-nothing: on `Err` neither row may have changed. The
    /// caller keeps a failed diff and sends it again on the next pass, so a
    /// partially applied diff would be counted twice.
    async fn reconcile(
        &self,
        instance_id: &str,
        key: &QuotaKey,
        diff: DiffSync,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<(UserQuotaAggregate, UserRateAggregate)>;
}
