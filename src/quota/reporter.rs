//! Batched notifications for denied downloads.
//!
//! Denials are buffered per (tenant, user). A buffer keeps at most
//! `threshold` messages; later denials only bump an overflow counter. A flush
//! takes and clears one tenant's buffers under the lock, then sends one
//! notification per user outside of it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::QuotaError;
use crate::health::QuotaMetrics;
use crate::notify::{Notification, NotificationLevel, Notifier};

/// Title of every denial notification.
pub const NOTIFICATION_TITLE: &str = "Download quota exceeded";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct UserErrors {
    messages: Vec<String>,
    overflow: u64,
}

impl UserErrors {
    fn render(&self) -> String {
        let mut body = self.messages.join("\n");
        if self.overflow > 0 {
            body.push_str(&format!("\nand {} more errors", self.overflow));
        }
        body
    }
}

/// Buffers denials and turns them into throttled notifications.
pub struct ExceededQuotaReporter {
    notifier: Arc<dyn Notifier>,
    threshold: usize,
    /// tenant -> user -> buffered errors.
    buffers: Mutex<HashMap<String, HashMap<String, UserErrors>>>,
    metrics: Option<Arc<QuotaMetrics>>,
}

impl ExceededQuotaReporter {
    /// `threshold` is clamped to a minimum of 1.
    pub fn new(notifier: Arc<dyn Notifier>, threshold: usize) -> Self {
        Self {
            notifier,
            threshold: threshold.max(1),
            buffers: Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<QuotaMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Buffer one denial of `resource` for `user`.
    pub fn report(&self, error: &QuotaError, resource: &str, user: &str, tenant: &str) {
        let message = format!("Download of {resource} refused: {error}");
        let mut buffers = self.lock_buffers();
        let errors = buffers
            .entry(tenant.to_string())
            .or_default()
            .entry(user.to_string())
            .or_default();
        if errors.messages.len() >= self.threshold {
            errors.overflow += 1;
        } else {
            errors.messages.push(message);
        }
    }

    /// Send one notification per user with buffered denials in `tenant`.
    ///
    /// Returns the number of notifications delivered. Delivery failures are
    /// logged and the affected messages dropped.
    pub async fn flush(&self, tenant: &str) -> usize {
        let taken = self.lock_buffers().remove(tenant).unwrap_or_default();
        if taken.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        for (user, errors) in taken {
            if errors.messages.is_empty() {
                continue;
            }
            let notification = Notification::text(
                user.as_str(),
                NOTIFICATION_TITLE,
                errors.render(),
                NotificationLevel::Warning,
            );
            match self.notifier.notify(notification).await {
                Ok(()) => {
                    delivered += 1;
                    self.record(true);
                }
                Err(err) => {
                    warn!(tenant = %tenant, user = %user, error = %err, "Failed to send quota notification");
                    self.record(false);
                }
            }
        }
        debug!(tenant = %tenant, delivered, "Flushed quota denial notifications");
        delivered
    }

    /// Tenants with at least one buffered denial.
    pub fn pending_tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self.lock_buffers().keys().cloned().collect();
        tenants.sort();
        tenants
    }

    fn record(&self, delivered: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_notification(delivered);
        }
    }

    fn lock_buffers(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, UserErrors>>> {
        self.buffers.lock().expect("reporter buffer lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{MemoryNotifier, MockNotifier};

    fn denial(current: i64) -> QuotaError {
        QuotaError::QuotaExceeded {
            user: "alice@example.com".into(),
            limit: 10,
            current,
        }
    }

    #[tokio::test]
    async fn test_threshold_caps_messages_and_counts_overflow() {
        let notifier = Arc::new(MemoryNotifier::new());
        let reporter = ExceededQuotaReporter::new(notifier.clone(), 3);
        for i in 0..10 {
            reporter.report(&denial(10 + i), &format!("file-{i}"), "alice@example.com", "t1");
        }

        assert_eq!(reporter.flush("t1").await, 1);
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        let lines: Vec<&str> = sent[0].message.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("file-0"));
        assert!(lines[2].contains("file-2"));
        assert_eq!(lines[3], "and 7 more errors");
        assert_eq!(sent[0].recipients, vec!["alice@example.com".to_string()]);
        assert_eq!(sent[0].title, NOTIFICATION_TITLE);
    }

    #[tokio::test]
    async fn test_no_suffix_under_threshold() {
        let notifier = Arc::new(MemoryNotifier::new());
        let reporter = ExceededQuotaReporter::new(notifier.clone(), 3);
        reporter.report(&denial(10), "file-a", "alice@example.com", "t1");
        reporter.flush("t1").await;
        assert!(!notifier.sent()[0].message.contains("more errors"));
    }

    #[tokio::test]
    async fn test_flush_is_isolated_per_tenant() {
        let notifier = Arc::new(MemoryNotifier::new());
        let reporter = ExceededQuotaReporter::new(notifier.clone(), 3);
        reporter.report(&denial(10), "file-a", "alice@example.com", "tenant-a");
        reporter.report(&denial(10), "file-b", "bob@example.com", "tenant-b");

        assert_eq!(reporter.flush("tenant-b").await, 1);
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipients, vec!["bob@example.com".to_string()]);
        assert!(!sent[0].message.contains("file-a"));
        assert_eq!(reporter.pending_tenants(), vec!["tenant-a".to_string()]);
    }

    #[tokio::test]
    async fn test_flush_clears_buffers() {
        let notifier = Arc::new(MemoryNotifier::new());
        let reporter = ExceededQuotaReporter::new(notifier.clone(), 3);
        reporter.report(&denial(10), "file-a", "alice@example.com", "t1");
        assert_eq!(reporter.flush("t1").await, 1);
        assert_eq!(reporter.flush("t1").await, 0);
        assert!(reporter.pending_tenants().is_empty());
    }

    #[tokio::test]
    async fn test_one_notification_per_user() {
        let mut mock = MockNotifier::new();
        mock.expect_notify().times(2).returning(|_| Ok(()));
        let reporter = ExceededQuotaReporter::new(Arc::new(mock), 3);
        reporter.report(&denial(10), "f1", "alice@example.com", "t1");
        reporter.report(&denial(11), "f2", "alice@example.com", "t1");
        reporter.report(&denial(10), "f3", "bob@example.com", "t1");
        assert_eq!(reporter.flush("t1").await, 2);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_counted_and_dropped() {
        let mut mock = MockNotifier::new();
        mock.expect_notify()
            .times(1)
            .returning(|_| Err(QuotaError::Notification("smtp down".into())));
        let metrics = Arc::new(QuotaMetrics::new());
        let reporter = ExceededQuotaReporter::new(Arc::new(mock), 3).with_metrics(metrics.clone());
        reporter.report(&denial(10), "f1", "alice@example.com", "t1");

        assert_eq!(reporter.flush("t1").await, 0);
        assert_eq!(
            metrics
                .notification_failures
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        assert!(reporter.pending_tenants().is_empty());
    }
}
