use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::{Notifier, NotifyHub};

/// One engine per organization, keyed by the pgwire database name. Each gets
/// its own WAL file, notifier hub and compactor task.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    hubs: DashMap<String, Arc<NotifyHub>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            hubs: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily create the engine for an organization.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "organization name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many organizations"));
        }

        // Keep the name usable as a file name.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty organization name",
            ));
        }

        // Two connections may race here; the entry API keeps whichever engine lands first.
        let entry = self.engines.entry(tenant.to_string());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let hub = Arc::new(NotifyHub::new());
        let notifier: Arc<dyn Notifier> = hub.clone();
        let engine = Arc::new(Engine::new(wal_path, notifier)?);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        entry.or_insert(engine.clone());
        self.hubs.insert(tenant.to_string(), hub);
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!("loaded organization {safe_name}");
        Ok(engine)
    }

    /// Notice stream for an organization's user, for in-process consumers.
    pub fn notifications(&self, tenant: &str) -> Option<Arc<NotifyHub>> {
        self.hubs.get(tenant).map(|h| h.value().clone())
    }
}
