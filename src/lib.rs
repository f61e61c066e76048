//! dlquota: distributed download quota and rate-limit engine.
//!
//! Several application instances share one store. Each instance admits
//! downloads against a local view (the last reconciled aggregate plus its
//! own unsynchronised diffs) and periodically reconciles those diffs with
//! the store, so admission never waits on the network.
//!
//! The usual entry point is [`QuotaEngine::start`], which wires a
//! [`QuotaService`] around a [`QuotaRepository`] and a [`Notifier`] and
//! spawns the background tickers.
//!
//! ```
//! # tokio_test::block_on(async {
//! use std::sync::Arc;
//!
//! use dlquota::quota::manager::ManagerSettings;
//! use dlquota::quota::service::ServiceSettings;
//! use dlquota::{InMemoryQuotaRepository, QuotaKey, QuotaManager, QuotaService};
//!
//! let repo = Arc::new(InMemoryQuotaRepository::new());
//! let manager = Arc::new(QuotaManager::new(repo.clone(), ManagerSettings::default()));
//! let service = QuotaService::new(manager, repo, ServiceSettings::default());
//!
//! let key = QuotaKey::new("acme", "alice@example.com");
//! let served: dlquota::Result<&str> = service
//!     .with_quota(&key, "report.pdf", |handler| async move {
//!         handler.start()?;
//!         handler.stop()?;
//!         Ok("served")
//!     })
//!     .await;
//! assert_eq!(served.unwrap(), "served");
//! # });
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod logging;
pub mod notify;
pub mod quota;
pub mod scheduler;
pub mod store;
pub mod tenant;

pub use config::Config;
pub use engine::QuotaEngine;
pub use error::{BatchError, QuotaError, Result};
pub use notify::{LogNotifier, MemoryNotifier, Notification, NotificationLevel, Notifier};
pub use quota::{
    DefaultDownloadQuotaLimits, DownloadQuotaLimits, DownloadQuotaLimitsView,
    ExceededQuotaReporter, QuotaHandler, QuotaKey, QuotaManager, QuotaService, SyncReport,
    UserCurrentQuotas, UNLIMITED,
};
pub use store::{InMemoryQuotaRepository, QuotaRepository, StoreError};
pub use tenant::{StaticTenants, TenantResolver};
