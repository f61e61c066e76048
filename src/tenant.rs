//! Tenant resolution.

use std::sync::RwLock;

/// Source of the tenants this instance serves.
pub trait TenantResolver: Send + Sync {
    fn active_tenants(&self) -> Vec<String>;
}

/// Fixed tenant list, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticTenants {
    tenants: RwLock<Vec<String>>,
}

impl StaticTenants {
    pub fn new(tenants: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut tenants: Vec<String> = tenants.into_iter().map(Into::into).collect();
        tenants.sort();
        tenants.dedup();
        Self {
            tenants: RwLock::new(tenants),
        }
    }

    pub fn replace(&self, tenants: Vec<String>) {
        let mut tenants = tenants;
        tenants.sort();
        tenants.dedup();
        *self.tenants.write().expect("tenant list lock poisoned") = tenants;
    }
}

impl TenantResolver for StaticTenants {
    fn active_tenants(&self) -> Vec<String> {
        self.tenants
            .read()
            .expect("tenant list lock poisoned")
            .clone()
    }
}

/// Union of `active` and `extra`, sorted and deduplicated.
pub(crate) fn merge_tenants(active: Vec<String>, extra: Vec<String>) -> Vec<String> {
    let mut all = active;
    all.extend(extra);
    all.sort();
    all.dedup();
    all
}
