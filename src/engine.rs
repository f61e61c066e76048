//! Engine assembly and lifecycle.
//!
//! [`QuotaEngine::start`] wires the manager, reporter and service around a
//! repository and a notifier, registers the health checks and spawns the
//! background tickers. [`QuotaEngine::shutdown`] stops them and runs a last
//! reconciliation pass and reporter flush so local state is not lost on an
//! orderly stop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::watcher::{apply_reloads, ConfigWatcher};
use crate::config::Config;
use crate::error::Result;
use crate::events::{run_user_event_consumer, TenantUserEvents};
use crate::health::{
    start_periodic_metrics_flush, HealthCheck, HealthRegistry, QuotaMetrics, CHECK_QUOTA_SYNC,
    CHECK_RATE_PURGE, CHECK_REPORTER_FLUSH,
};
use crate::notify::Notifier;
use crate::quota::{ExceededQuotaReporter, QuotaManager, QuotaService, SyncReport};
use crate::scheduler::{run_flush_pass, run_sync_pass, QuotaScheduler, SchedulerPeriods};
use crate::store::QuotaRepository;
use crate::tenant::TenantResolver;

/// A running quota engine.
pub struct QuotaEngine {
    config: Config,
    manager: Arc<QuotaManager>,
    service: Arc<QuotaService>,
    reporter: Arc<ExceededQuotaReporter>,
    tenants: Arc<dyn TenantResolver>,
    health: HealthRegistry,
    metrics: Arc<QuotaMetrics>,
    shutdown_tx: watch::Sender<bool>,
    scheduler: QuotaScheduler,
    tasks: Vec<JoinHandle<()>>,
}

impl QuotaEngine {
    /// Validate `config`, build every component and start the tickers.
    pub async fn start(
        config: Config,
        repository: Arc<dyn QuotaRepository>,
        notifier: Arc<dyn Notifier>,
        tenants: Arc<dyn TenantResolver>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(QuotaMetrics::new());
        let manager = Arc::new(
            QuotaManager::new(Arc::clone(&repository), config.manager_settings())
                .with_metrics(Arc::clone(&metrics)),
        );
        let reporter = Arc::new(
            ExceededQuotaReporter::new(notifier, config.reporter.threshold)
                .with_metrics(Arc::clone(&metrics)),
        );
        let service = Arc::new(
            QuotaService::new(
                Arc::clone(&manager),
                repository,
                config.service_settings(),
            )
            .with_reporter(Arc::clone(&reporter))
            .with_metrics(Arc::clone(&metrics)),
        );
        service.init_default_limits(&tenants.active_tenants()).await?;

        let health = HealthRegistry::new();
        for name in [CHECK_QUOTA_SYNC, CHECK_RATE_PURGE, CHECK_REPORTER_FLUSH] {
            health.register(HealthCheck::ok(name));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = QuotaScheduler::spawn(
            Arc::clone(&manager),
            Arc::clone(&reporter),
            Arc::clone(&tenants),
            health.clone(),
            SchedulerPeriods {
                sync: config.sync_tick(),
                rate_purge: config.rate_expiration_tick(),
                reporter_flush: config.reporter_flush_tick(),
            },
            shutdown_rx.clone(),
        );
        let metrics_flush =
            start_periodic_metrics_flush(Arc::clone(&metrics), config.metrics_tick(), shutdown_rx);

        info!(
            instance = %manager.instance_id(),
            tenants = tenants.active_tenants().len(),
            sync_tick_secs = config.sync_tick_secs,
            "Quota engine started"
        );

        Ok(Self {
            config,
            manager,
            service,
            reporter,
            tenants,
            health,
            metrics,
            shutdown_tx,
            scheduler,
            tasks: vec![metrics_flush],
        })
    }

    pub fn service(&self) -> &Arc<QuotaService> {
        &self.service
    }

    pub fn manager(&self) -> &Arc<QuotaManager> {
        &self.manager
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn metrics(&self) -> &Arc<QuotaMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Reconcile every tenant now, outside the regular tick.
    pub async fn sync_now(&self) -> SyncReport {
        run_sync_pass(&self.manager, self.tenants.as_ref(), &self.health).await
    }

    /// Flush buffered denial notifications now.
    pub async fn flush_reports(&self) -> usize {
        run_flush_pass(&self.reporter, self.tenants.as_ref(), &self.health).await
    }

    /// Consume user lifecycle batches from `rx` until shutdown.
    pub fn consume_user_events(&mut self, rx: mpsc::Receiver<TenantUserEvents>) {
        let handle = tokio::spawn(run_user_event_consumer(
            Arc::clone(&self.service),
            rx,
            self.shutdown_tx.subscribe(),
        ));
        self.tasks.push(handle);
    }

    /// Watch `path` and apply changed default limits until shutdown.
    pub fn watch_config(&mut self, path: PathBuf, poll_interval: Duration) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = ConfigWatcher::new(path, poll_interval);
        self.tasks
            .push(tokio::spawn(watcher.watch(tx, self.shutdown_tx.subscribe())));
        // Ends when the watcher drops its sender.
        self.tasks.push(tokio::spawn(apply_reloads(
            Arc::clone(&self.service),
            self.config.clone(),
            rx,
        )));
    }

    /// Stop every task, then reconcile and flush one last time.
    pub async fn shutdown(self) -> SyncReport {
        let _ = self.shutdown_tx.send(true);
        self.scheduler.join().await;
        for task in self.tasks {
            let _ = task.await;
        }

        let report = run_sync_pass(&self.manager, self.tenants.as_ref(), &self.health).await;
        run_flush_pass(&self.reporter, self.tenants.as_ref(), &self.health).await;
        info!(
            instance = %self.manager.instance_id(),
            reconciled = report.reconciled,
            retained = report.retained,
            "Quota engine stopped"
        );
        report
    }
}
