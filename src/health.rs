//! Health and metrics for the quota engine.
//!
//! - [`HealthRegistry`] tracks named component checks (`quota-sync`,
//!   `rate-purge`, `reporter-flush`) updated by the background tickers.
//! - [`QuotaMetrics`] holds lock-free admission and reconciliation counters.
//! - [`start_periodic_metrics_flush`] emits a `quota_summary` log line on a
//!   fixed period and once more on shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::info;

/// Check updated by the reconciliation ticker.
pub const CHECK_QUOTA_SYNC: &str = "quota-sync";
/// Check updated by the expired-rate purge ticker.
pub const CHECK_RATE_PURGE: &str = "rate-purge";
/// Check updated by the reporter flush ticker.
pub const CHECK_REPORTER_FLUSH: &str = "reporter-flush";

// ============================================================================
// HealthStatus
// ============================================================================

/// State of one background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    /// Recent runs failed; work is retried on the next tick.
    Degraded,
    /// Failed `down_after` times in a row.
    Down,
}

impl HealthStatus {
    fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "ok",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
        }
    }
}

// ============================================================================
// HealthCheck
// ============================================================================

/// Last known outcome of one background task.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    /// Summary of the last successful run.
    pub message: Option<String>,
    /// Consecutive failed runs since the last success.
    pub failure_streak: u64,
    pub last_error: Option<String>,
}

impl HealthCheck {
    /// A healthy check with no message.
    pub fn ok(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Ok,
            message: None,
            failure_streak: 0,
            last_error: None,
        }
    }
}

// ============================================================================
// HealthRegistry
// ============================================================================

/// Outcomes of the engine's background tasks, shared by the tickers.
///
/// # Example
/// ```
/// use dlquota::health::{HealthCheck, HealthRegistry};
/// let registry = HealthRegistry::new();
/// registry.register(HealthCheck::ok("quota-sync"));
/// assert!(registry.is_ready());
/// ```
#[derive(Clone)]
pub struct HealthRegistry {
    checks: Arc<RwLock<HashMap<String, HealthCheck>>>,
    start_time: Instant,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            checks: Arc::new(RwLock::new(HashMap::new())),
            start_time: Instant::now(),
        }
    }

    /// Add `check`, replacing a check of the same name.
    pub fn register(&self, check: HealthCheck) {
        self.checks
            .write()
            .expect("health registry lock poisoned")
            .insert(check.name.clone(), check);
    }

    /// Overwrite status and message of a registered check. Unknown names are ignored.
    pub fn update(&self, name: &str, status: HealthStatus, message: Option<String>) {
        let mut checks = self.checks.write().expect("health registry lock poisoned");
        if let Some(check) = checks.get_mut(name) {
            check.status = status;
            check.message = message;
        }
    }

    /// Record a successful run: status back to Ok, failure streak reset.
    pub fn record_success(&self, name: &str, message: Option<String>) {
        let mut checks = self.checks.write().expect("health registry lock poisoned");
        if let Some(check) = checks.get_mut(name) {
            check.status = HealthStatus::Ok;
            check.message = message;
            check.failure_streak = 0;
        }
    }

    /// Record a failed run. The check degrades on the first failure and goes
    /// Down once `down_after` consecutive runs have failed.
    pub fn record_failure(&self, name: &str, error: &str, down_after: u64) {
        let mut checks = self.checks.write().expect("health registry lock poisoned");
        if let Some(check) = checks.get_mut(name) {
            check.failure_streak += 1;
            check.last_error = Some(error.to_string());
            check.status = if check.failure_streak >= down_after.max(1) {
                HealthStatus::Down
            } else {
                HealthStatus::Degraded
            };
        }
    }

    /// No check is [`HealthStatus::Down`]. Degraded tasks still count as ready.
    pub fn is_ready(&self) -> bool {
        !self
            .checks
            .read()
            .expect("health registry lock poisoned")
            .values()
            .any(|check| check.status == HealthStatus::Down)
    }

    /// Snapshot of one check.
    pub fn check(&self, name: &str) -> Option<HealthCheck> {
        self.checks
            .read()
            .expect("health registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Snapshot of all registered checks.
    pub fn all_checks(&self) -> Vec<HealthCheck> {
        self.checks
            .read()
            .expect("health registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Render status, version, uptime, checks and (optionally) counters as JSON.
    pub fn render_health_json(&self, metrics: Option<&QuotaMetrics>) -> Value {
        let checks: serde_json::Map<String, Value> = self
            .all_checks()
            .into_iter()
            .map(|c| {
                let mut fields = json!({ "status": c.status.as_str() });
                if let Some(msg) = c.message {
                    fields["message"] = json!(msg);
                }
                if c.failure_streak > 0 {
                    fields["failure_streak"] = json!(c.failure_streak);
                }
                if let Some(err) = c.last_error {
                    fields["last_error"] = json!(err);
                }
                (c.name, fields)
            })
            .collect();

        let mut body = json!({
            "status": if self.is_ready() { "ok" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.uptime().as_secs(),
            "checks": checks,
        });
        if let Some(m) = metrics {
            body["quota"] = m.snapshot();
        }
        body
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// QuotaMetrics
// ============================================================================

/// Lock-free counters for admission and reconciliation activity.
#[derive(Debug, Default)]
pub struct QuotaMetrics {
    pub admissions: AtomicU64,
    pub quota_denials: AtomicU64,
    pub rate_denials: AtomicU64,
    /// Keys successfully reconciled with the shared store.
    pub reconciliations: AtomicU64,
    /// Keys whose reconciliation failed and stayed in the accumulator.
    pub reconciliation_failures: AtomicU64,
    pub purged_rates: AtomicU64,
    pub notifications: AtomicU64,
    pub notification_failures: AtomicU64,
}

impl QuotaMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admission(&self) {
        self.admissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quota_denial(&self) {
        self.quota_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_denial(&self) {
        self.rate_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconciled(&self, reconciled: u64, failed: u64) {
        self.reconciliations.fetch_add(reconciled, Ordering::Relaxed);
        self.reconciliation_failures
            .fetch_add(failed, Ordering::Relaxed);
    }

    pub fn record_purged(&self, rows: u64) {
        self.purged_rates.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_notification(&self, delivered: bool) {
        if delivered {
            self.notifications.fetch_add(1, Ordering::Relaxed);
        } else {
            self.notification_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current counters as a JSON object.
    pub fn snapshot(&self) -> Value {
        json!({
            "admissions": self.admissions.load(Ordering::Relaxed),
            "quota_denials": self.quota_denials.load(Ordering::Relaxed),
            "rate_denials": self.rate_denials.load(Ordering::Relaxed),
            "reconciliations": self.reconciliations.load(Ordering::Relaxed),
            "reconciliation_failures": self.reconciliation_failures.load(Ordering::Relaxed),
            "purged_rates": self.purged_rates.load(Ordering::Relaxed),
            "notifications": self.notifications.load(Ordering::Relaxed),
            "notification_failures": self.notification_failures.load(Ordering::Relaxed),
        })
    }

    /// Emit current counters as a structured log line.
    pub fn emit_summary(&self, reason: &str) {
        info!(
            event = "quota_summary",
            reason = reason,
            admissions = self.admissions.load(Ordering::Relaxed),
            quota_denials = self.quota_denials.load(Ordering::Relaxed),
            rate_denials = self.rate_denials.load(Ordering::Relaxed),
            reconciliations = self.reconciliations.load(Ordering::Relaxed),
            reconciliation_failures = self.reconciliation_failures.load(Ordering::Relaxed),
            purged_rates = self.purged_rates.load(Ordering::Relaxed),
            notifications = self.notifications.load(Ordering::Relaxed),
            "Quota metrics"
        );
    }
}

// ============================================================================
// Periodic metrics flush
// ============================================================================

/// Start a background task that emits [`QuotaMetrics`] every `period`.
///
/// Emits a final `shutdown` summary when `shutdown_rx` signals `true`.
pub fn start_periodic_metrics_flush(
    metrics: Arc<QuotaMetrics>,
    period: Duration,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    metrics.emit_summary("periodic");
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        metrics.emit_summary("shutdown");
                        break;
                    }
                }
            }
        }
    })
}

// ============================================================================
// Tests
// ============================================================================
