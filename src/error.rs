//! Error types for the quota engine.
//!
//! [`QuotaError`] is the single error type returned by the manager, the
//! service and the reporter. Admission denials ([`QuotaError::QuotaExceeded`],
//! [`QuotaError::RateExceeded`]) are routine outcomes, not defects: callers
//! are expected to turn them into a "quota exceeded" response.

use std::fmt;

use crate::store::StoreError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, QuotaError>;

/// Everything that can go wrong inside the quota engine.
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    /// The user's effective quota reached the configured maximum.
    #[error("download quota exceeded for {user}: limit {limit}, current {current}")]
    QuotaExceeded {
        user: String,
        limit: i64,
        current: i64,
    },

    /// The user's effective rate reached the configured maximum.
    #[error("download rate exceeded for {user}: limit {limit}, current {current}")]
    RateExceeded {
        user: String,
        limit: i64,
        current: i64,
    },

    /// No limits row could be resolved for the user.
    #[error("download quota limits not found for {0}")]
    LimitsNotFound(String),

    /// The shared store failed or is unreachable.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// The engine was driven in a way its contract forbids
    /// (e.g. `increment` without a prior `get`).
    #[error("programming misuse: {0}")]
    ProgrammingMisuse(String),

    /// A user notification could not be delivered.
    #[error("notification failed: {0}")]
    Notification(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// One or more lookups of a bulk query failed.
    #[error("{0}")]
    Batch(BatchError),
}

impl QuotaError {
    /// `true` for the two admission denials.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            QuotaError::QuotaExceeded { .. } | QuotaError::RateExceeded { .. }
        )
    }

    /// `true` when the underlying store reported a uniqueness violation.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, QuotaError::Storage(StoreError::UniqueViolation { .. }))
    }
}

/// Composite error for bulk queries.
///
/// Causes are always kept flat: composing a batch into another batch appends
/// its causes instead of nesting it.
#[derive(Debug, Default)]
pub struct BatchError {
    causes: Vec<QuotaError>,
}

impl BatchError {
    /// Build a batch from a single cause, flattening it if it is itself a batch.
    pub fn single(cause: QuotaError) -> Self {
        let mut batch = Self::default();
        batch.push(cause);
        batch
    }

    /// Append a cause, flattening nested batches.
    pub fn push(&mut self, cause: QuotaError) {
        match cause {
            QuotaError::Batch(inner) => self.causes.extend(inner.causes),
            other => self.causes.push(other),
        }
    }

    /// Merge `other` into `self`.
    pub fn compose(mut self, other: BatchError) -> Self {
        self.causes.extend(other.causes);
        self
    }

    /// Every underlying cause, in the order they were recorded.
    pub fn causes(&self) -> &[QuotaError] {
        &self.causes
    }

    pub fn into_causes(self) -> Vec<QuotaError> {
        self.causes
    }

    pub fn len(&self) -> usize {
        self.causes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.causes.is_empty()
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} lookup(s) failed", self.causes.len())?;
        for cause in &self.causes {
            write!(f, "; {cause}")?;
        }
        Ok(())
    }
}

impl FromIterator<QuotaError> for BatchError {
    fn from_iter<I: IntoIterator<Item = QuotaError>>(iter: I) -> Self {
        let mut batch = Self::default();
        for cause in iter {
            batch.push(cause);
        }
        batch
    }
}

/// Collect per-item results into a list, or a flat [`QuotaError::Batch`]
/// carrying every failure.
pub fn collect_batch<T>(results: impl IntoIterator<Item = Result<T>>) -> Result<Vec<T>> {
    let mut values = Vec::new();
    let mut failures = BatchError::default();
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(err) => failures.push(err),
        }
    }
    if failures.is_empty() {
        Ok(values)
    } else {
        Err(QuotaError::Batch(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn not_found(user: &str) -> QuotaError {
        QuotaError::LimitsNotFound(user.to_string())
    }

    #[test]
    fn test_denials_are_flagged() {
        let quota = QuotaError::QuotaExceeded {
            user: "a@b.c".into(),
            limit: 10,
            current: 10,
        };
        let rate = QuotaError::RateExceeded {
            user: "a@b.c".into(),
            limit: 2,
            current: 3,
        };
        assert!(quota.is_denial());
        assert!(rate.is_denial());
        assert!(!not_found("a@b.c").is_denial());
    }

    #[test]
    fn test_quota_exceeded_message_names_user_and_values() {
        let err = QuotaError::QuotaExceeded {
            user: "alice@example.com".into(),
            limit: 10,
            current: 12,
        };
        let msg = err.to_string();
        assert!(msg.contains("alice@example.com"), "{msg}");
        assert!(msg.contains("limit 10"), "{msg}");
        assert!(msg.contains("current 12"), "{msg}");
    }

    #[test]
    fn test_unique_violation_detection() {
        let err = QuotaError::from(StoreError::UniqueViolation {
            constraint: "uk_download_quota_limits_email".into(),
        });
        assert!(err.is_unique_violation());
        let err = QuotaError::from(StoreError::Unavailable("down".into()));
        assert!(!err.is_unique_violation());
    }

    #[test]
    fn test_batch_flattens_nested_batches() {
        let inner: BatchError = vec![not_found("a"), not_found("b")].into_iter().collect();
        let mut outer = BatchError::single(not_found("c"));
        outer.push(QuotaError::Batch(inner));
        assert_eq!(outer.len(), 3);
        assert!(outer
            .causes()
            .iter()
            .all(|c| matches!(c, QuotaError::LimitsNotFound(_))));
    }

    #[test]
    fn test_batch_compose_concatenates() {
        let left = BatchError::single(not_found("a"));
        let right: BatchError = vec![not_found("b"), not_found("c")].into_iter().collect();
        let merged = left.compose(right);
        let users: Vec<String> = merged
            .into_causes()
            .into_iter()
            .map(|c| match c {
                QuotaError::LimitsNotFound(u) => u,
                other => panic!("unexpected cause {other:?}"),
            })
            .collect();
        assert_eq!(users, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_collect_batch_all_ok() {
        let results: Vec<Result<i32>> = vec![Ok(1), Ok(2)];
        assert_eq!(collect_batch(results).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_collect_batch_keeps_every_failure() {
        let results: Vec<Result<i32>> = vec![Ok(1), Err(not_found("x")), Err(not_found("y"))];
        match collect_batch(results) {
            Err(QuotaError::Batch(batch)) => {
                assert_eq!(batch.len(), 2);
                let msg = batch.to_string();
                assert!(msg.starts_with("2 lookup(s) failed"), "{msg}");
                assert!(msg.contains("for x") && msg.contains("for y"), "{msg}");
            }
            other => panic!("expected Batch error, got {other:?}"),
        }
    }
}
