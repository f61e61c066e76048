//! Download quota and rate accounting.
//!
//! - [`QuotaKey`] identifies one quota subject (tenant, user).
//! - [`DownloadQuotaLimits`] is the persisted per-user configuration.
//! - [`manager::QuotaManager`] keeps the local diff-over-aggregate view and
//!   reconciles it with the shared store.
//! - [`service::QuotaService`] is the admission API.
//! - [`reporter::ExceededQuotaReporter`] batches denial notifications.
//!
//! A negative `max_quota` / `rate_limit` means "unlimited".

pub mod diffs;
pub mod manager;
pub mod reporter;
pub mod service;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use diffs::{DiffSync, UserDiffs};
pub use manager::{QuotaManager, SyncReport};
pub use reporter::ExceededQuotaReporter;
pub use service::{QuotaHandler, QuotaService};

/// Sentinel for "no limit" in configuration and defaults.
pub const UNLIMITED: i64 = -1;

/// Composite identity of one quota subject.
///
/// ```
/// use dlquota::quota::QuotaKey;
///
/// let key = QuotaKey::new("project-a", "alice@example.com");
/// assert_eq!(key.to_string(), "project-a/alice@example.com");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuotaKey {
    pub tenant: String,
    pub user: String,
}

impl QuotaKey {
    pub fn new(tenant: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            user: user.into(),
        }
    }
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.user)
    }
}

/// Persisted limits for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadQuotaLimits {
    /// Store-assigned identifier; `None` until the row has been inserted.
    pub id: Option<i64>,
    pub tenant: String,
    pub email: String,
    /// Maximum cumulative downloads. Negative means unlimited.
    pub max_quota: i64,
    /// Maximum concurrent downloads. Negative means unlimited.
    pub rate_limit: i64,
}

impl DownloadQuotaLimits {
    /// A not-yet-persisted row.
    pub fn new(key: &QuotaKey, max_quota: i64, rate_limit: i64) -> Self {
        Self {
            id: None,
            tenant: key.tenant.clone(),
            email: key.user.clone(),
            max_quota,
            rate_limit,
        }
    }

    pub fn key(&self) -> QuotaKey {
        QuotaKey::new(self.tenant.clone(), self.email.clone())
    }

    /// `true` when `current` usage leaves no room under `max_quota`.
    pub fn quota_reached(&self, current: i64) -> bool {
        self.max_quota >= 0 && current >= self.max_quota
    }

    /// `true` when `current` in-flight downloads leave no room under `rate_limit`.
    pub fn rate_reached(&self, current: i64) -> bool {
        self.rate_limit >= 0 && current >= self.rate_limit
    }
}

/// External view of a user's limits (what the configuration API accepts and returns).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadQuotaLimitsView {
    pub email: String,
    pub max_quota: i64,
    pub rate_limit: i64,
}

impl From<&DownloadQuotaLimits> for DownloadQuotaLimitsView {
    fn from(limits: &DownloadQuotaLimits) -> Self {
        Self {
            email: limits.email.clone(),
            max_quota: limits.max_quota,
            rate_limit: limits.rate_limit,
        }
    }
}

/// Per-tenant fallback used when a user has no explicit limits yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultDownloadQuotaLimits {
    pub max_quota: i64,
    pub rate_limit: i64,
}

impl Default for DefaultDownloadQuotaLimits {
    fn default() -> Self {
        Self {
            max_quota: UNLIMITED,
            rate_limit: UNLIMITED,
        }
    }
}

/// Global quota counter summed across all instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQuotaAggregate {
    pub counter: i64,
}

impl UserQuotaAggregate {
    pub const fn new(counter: i64) -> Self {
        Self { counter }
    }
}

/// Global rate gauge summed across all instances' non-expired rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRateAggregate {
    pub gauge: i64,
}

impl UserRateAggregate {
    pub const fn new(gauge: i64) -> Self {
        Self { gauge }
    }
}

/// Limits and effective usage of one user, as seen by this instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCurrentQuotas {
    pub email: String,
    pub max_quota: i64,
    pub rate_limit: i64,
    pub current_quota: i64,
    pub current_rate: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_quota_key_equality_uses_both_fields() {
        let a = QuotaKey::new("t1", "alice");
        let b = QuotaKey::new("t2", "alice");
        let c = QuotaKey::new("t1", "alice");
        assert_ne!(a, b);
        assert_eq!(a, c);

        let set: HashSet<QuotaKey> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_limits_boundaries() {
        let limits = DownloadQuotaLimits::new(&QuotaKey::new("t", "u"), 10, 2);
        assert!(!limits.quota_reached(9));
        assert!(limits.quota_reached(10));
        assert!(!limits.rate_reached(1));
        assert!(limits.rate_reached(2));
    }

    #[test]
    fn test_negative_limits_are_unlimited() {
        let limits = DownloadQuotaLimits::new(&QuotaKey::new("t", "u"), UNLIMITED, UNLIMITED);
        assert!(!limits.quota_reached(i64::MAX));
        assert!(!limits.rate_reached(i64::MAX));
    }

    #[test]
    fn test_zero_limit_denies_everything() {
        let limits = DownloadQuotaLimits::new(&QuotaKey::new("t", "u"), 0, 0);
        assert!(limits.quota_reached(0));
        assert!(limits.rate_reached(0));
    }

    #[test]
    fn test_limits_view_from_limits() {
        let mut limits = DownloadQuotaLimits::new(&QuotaKey::new("t", "bob"), 5, 1);
        limits.id = Some(42);
        let view = DownloadQuotaLimitsView::from(&limits);
        assert_eq!(view.email, "bob");
        assert_eq!(view.max_quota, 5);
        assert_eq!(view.rate_limit, 1);
        assert_eq!(limits.key(), QuotaKey::new("t", "bob"));
    }

    #[test]
    fn test_default_limits_are_unlimited() {
        let defaults = DefaultDownloadQuotaLimits::default();
        assert_eq!(defaults.max_quota, UNLIMITED);
        assert_eq!(defaults.rate_limit, UNLIMITED);
    }
}
