//! User lifecycle events.
//!
//! An external identity service publishes batches of [`UserLifecycleEvent`]s
//! per tenant. Deletions remove every trace of the user's quota state; the
//! other actions need no quota work.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::quota::QuotaService;

/// One change to a tenant's user base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UserLifecycleEvent {
    Created { email: String },
    Updated { email: String },
    Deleted { email: String },
}

/// Events of one tenant, delivered together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantUserEvents {
    pub tenant: String,
    pub events: Vec<UserLifecycleEvent>,
}

impl TenantUserEvents {
    /// Emails of deleted users, first occurrence order, without duplicates.
    pub fn deleted_emails(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.events
            .iter()
            .filter_map(|event| match event {
                UserLifecycleEvent::Deleted { email } => Some(email),
                _ => None,
            })
            .filter(|email| seen.insert(email.as_str()))
            .cloned()
            .collect()
    }
}

/// Apply one batch. Returns the number of users whose quota state was removed.
pub async fn handle_batch(service: &QuotaService, batch: &TenantUserEvents) -> Result<usize> {
    let deleted = batch.deleted_emails();
    if deleted.is_empty() {
        debug!(tenant = %batch.tenant, events = batch.events.len(), "No deletions in user event batch");
        return Ok(0);
    }
    service.remove_quota_for(&batch.tenant, &deleted).await?;
    Ok(deleted.len())
}

/// Drain `rx` until it closes or `shutdown_rx` turns `true`.
pub async fn run_user_event_consumer(
    service: Arc<QuotaService>,
    mut rx: mpsc::Receiver<TenantUserEvents>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            batch = rx.recv() => {
                let Some(batch) = batch else {
                    debug!("User event channel closed");
                    return;
                };
                match handle_batch(&service, &batch).await {
                    Ok(0) => {}
                    Ok(removed) => info!(tenant = %batch.tenant, removed, "Removed quota state of deleted users"),
                    Err(err) => warn!(tenant = %batch.tenant, error = %err, "Failed to process user event batch"),
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("User event consumer shutting down");
                    return;
                }
            }
        }
    }
}
