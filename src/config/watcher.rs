//! File-mtime polling watcher for hot-reloading config.
//!
//! Reloaded configurations are pushed over a channel; [`apply_reloads`]
//! turns changed tenant defaults into `change_default_*` calls on the
//! service. Tick periods and cache bounds only take effect on restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::quota::QuotaService;

/// Polling-based config watcher.
pub struct ConfigWatcher {
    path: PathBuf,
    poll_interval: Duration,
    last_mtime: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf, poll_interval: Duration) -> Self {
        Self {
            path,
            poll_interval,
            last_mtime: None,
        }
    }

    pub fn default_path(poll_interval: Duration) -> Self {
        Self::new(Config::path(), poll_interval)
    }

    pub async fn watch(
        mut self,
        tx: mpsc::UnboundedSender<Config>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        self.last_mtime = read_mtime(&self.path);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Config watcher shutting down");
                        return;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            if *shutdown_rx.borrow() {
                return;
            }

            let current = read_mtime(&self.path);
            let changed = match (self.last_mtime, current) {
                (Some(prev), Some(next)) => next != prev,
                (None, Some(_)) => true,
                _ => false,
            };
            if !changed {
                continue;
            }

            self.last_mtime = current;
            match Config::load_from_path(&self.path) {
                Ok(config) => {
                    debug!(path = %self.path.display(), "Config file changed, reloading");
                    if tx.send(config).is_err() {
                        warn!("Config watcher receiver dropped, stopping watcher");
                        return;
                    }
                }
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        error = %err,
                        "Config reload rejected; keeping running configuration"
                    );
                }
            }
        }
    }
}

fn read_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

/// Push default-limit differences between `previous` and `next` into the
/// service. Returns the number of `change_default_*` calls made.
pub async fn apply_default_changes(
    service: &QuotaService,
    previous: &Config,
    next: &Config,
) -> Result<usize> {
    let mut tenants: Vec<&String> = next
        .tenants
        .iter()
        .chain(next.tenant_defaults.keys())
        .chain(previous.tenant_defaults.keys())
        .collect();
    tenants.sort();
    tenants.dedup();

    let mut changes = 0;
    for tenant in tenants {
        let before = previous.defaults_for(tenant);
        let after = next.defaults_for(tenant);
        if before.max_quota != after.max_quota {
            service
                .change_default_quota_limits(tenant, after.max_quota)
                .await?;
            changes += 1;
        }
        if before.rate_limit != after.rate_limit {
            service
                .change_default_rate_limits(tenant, after.rate_limit)
                .await?;
            changes += 1;
        }
    }
    Ok(changes)
}

/// Apply every reloaded configuration until the channel closes.
pub async fn apply_reloads(
    service: Arc<QuotaService>,
    initial: Config,
    mut rx: mpsc::UnboundedReceiver<Config>,
) {
    let mut current = initial;
    while let Some(next) = rx.recv().await {
        match apply_default_changes(&service, &current, &next).await {
            Ok(0) => debug!("Config reloaded; default limits unchanged"),
            Ok(changes) => info!(changes, "Applied reloaded default limits"),
            Err(err) => {
                // Keep the old baseline so the change is retried on the next reload.
                warn!(error = %err, "Failed to apply reloaded default limits");
                continue;
            }
        }
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::manager::ManagerSettings;
    use crate::quota::{DefaultDownloadQuotaLimits, QuotaManager, QuotaService};
    use crate::store::InMemoryQuotaRepository;
    use tempfile::TempDir;

    fn service() -> QuotaService {
        let repo = Arc::new(InMemoryQuotaRepository::new());
        let manager = Arc::new(QuotaManager::new(repo.clone(), ManagerSettings::default()));
        QuotaService::new(manager, repo, Config::default().service_settings())
    }

    #[tokio::test]
    async fn test_watcher_emits_on_change() {
        let tmp = TempDir::new().unwrap();
        let cfg_path = tmp.path().join("config.toml");
        std::fs::write(&cfg_path, "").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = ConfigWatcher::new(cfg_path.clone(), Duration::from_millis(25));
        let handle = tokio::spawn(watcher.watch(tx, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(40)).await;
        std::fs::write(&cfg_path, "sync_tick_secs = 9\n").unwrap();

        let loaded = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.sync_tick_secs, 9);

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_invalid_reload_is_not_emitted() {
        let tmp = TempDir::new().unwrap();
        let cfg_path = tmp.path().join("config.toml");
        std::fs::write(&cfg_path, "").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = ConfigWatcher::new(cfg_path.clone(), Duration::from_millis(25));
        let handle = tokio::spawn(watcher.watch(tx, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(40)).await;
        std::fs::write(&cfg_path, "sync_tick_secs = 0\n").unwrap();

        let received = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(received.is_err(), "invalid config must not be forwarded");

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_apply_default_changes_only_touches_changed_fields() {
        let service = service();
        let previous = Config {
            tenants: vec!["a".into(), "b".into()],
            ..Config::default()
        };
        let mut next = previous.clone();
        next.tenant_defaults.insert(
            "a".into(),
            DefaultDownloadQuotaLimits {
                max_quota: 20,
                rate_limit: -1,
            },
        );

        let changes = apply_default_changes(&service, &previous, &next)
            .await
            .unwrap();
        assert_eq!(changes, 1);
        assert_eq!(service.get_default_limits("a").await.unwrap().max_quota, 20);
        assert_eq!(service.get_default_limits("b").await.unwrap().max_quota, -1);
    }

    #[tokio::test]
    async fn test_apply_reloads_follows_channel() {
        let service = Arc::new(service());
        let initial = Config {
            tenants: vec!["a".into()],
            ..Config::default()
        };
        let mut next = initial.clone();
        next.defaults.rate_limit = 4;

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(next).unwrap();
        drop(tx);
        apply_reloads(Arc::clone(&service), initial, rx).await;

        assert_eq!(service.get_default_limits("a").await.unwrap().rate_limit, 4);
    }
}
