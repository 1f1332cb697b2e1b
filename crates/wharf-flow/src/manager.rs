//! The destination manager: router lifecycle across config updates.
//!
//! The control plane pushes the full warehouse set on every backend-config
//! update. The manager diffs it against the running router set: routers
//! start for new or re-enabled warehouses, stop for disabled or removed
//! ones, and restart when the destination config revision changed.
//! Readiness flips once the first config has been applied.

use std::collections::HashMap;

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::info;

use wharf_core::warehouse::Warehouse;

use crate::metrics;
use crate::router::{Router, RouterConfig, RouterDeps};

/// Owns the router set, keyed by warehouse identifier.
pub struct DestinationManager {
    deps: RouterDeps,
    config: RouterConfig,
    routers: Mutex<HashMap<String, Router>>,
    ready: AtomicBool,
}

impl DestinationManager {
    /// Creates a manager with no routers; call
    /// [`DestinationManager::apply_config`] to start them.
    #[must_use]
    pub fn new(deps: RouterDeps, config: RouterConfig) -> Self {
        Self {
            deps,
            config,
            routers: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(false),
        }
    }

    /// Reconciles the router set against the given warehouse set.
    pub async fn apply_config(&self, warehouses: Vec<Warehouse>) {
        let desired: HashMap<String, Warehouse> = warehouses
            .into_iter()
            .filter(Warehouse::is_enabled)
            .map(|w| (w.identifier(), w))
            .collect();

        let mut routers = self.routers.lock().await;

        // Stop routers that are gone, disabled, or running a stale config
        // revision.
        let stale: Vec<String> = routers
            .iter()
            .filter(|(identifier, router)| {
                desired
                    .get(*identifier)
                    .is_none_or(|w| w.destination.revision_id != router.revision_id())
            })
            .map(|(identifier, _)| identifier.clone())
            .collect();
        for identifier in stale {
            if let Some(router) = routers.remove(&identifier) {
                info!(warehouse = %identifier, "stopping router");
                router.stop().await;
            }
        }

        // Start routers for warehouses without one.
        for (identifier, warehouse) in desired {
            if !routers.contains_key(&identifier) {
                info!(warehouse = %identifier, "starting router");
                routers.insert(
                    identifier,
                    Router::spawn(warehouse, &self.deps, &self.config),
                );
            }
        }

        metrics::set_active_routers(routers.len());
        drop(routers);
        self.ready.store(true, Ordering::Release);
    }

    /// Marks a warehouse for immediate sync and wakes its scheduler.
    ///
    /// Returns false when no router serves the identifier.
    pub async fn trigger_sync(&self, identifier: &str) -> bool {
        let routers = self.routers.lock().await;
        let Some(router) = routers.get(identifier) else {
            return false;
        };
        self.deps.triggers.mark(identifier);
        router.trigger();
        true
    }

    /// Returns the identifiers of the running routers.
    pub async fn active_routers(&self) -> Vec<String> {
        let routers = self.routers.lock().await;
        let mut identifiers: Vec<String> = routers.keys().cloned().collect();
        identifiers.sort();
        identifiers
    }

    /// True once the router set has been populated from config; the
    /// health endpoint serves this.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Stops every router and waits for their loops to exit.
    pub async fn shutdown(&self) {
        let mut routers = self.routers.lock().await;
        for (identifier, router) in routers.drain() {
            info!(warehouse = %identifier, "stopping router");
            router.stop().await;
        }
        metrics::set_active_routers(0);
        self.ready.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wharf_core::id::{DestinationId, SourceId, WorkspaceId};
    use wharf_core::storage::MemoryObjectStore;
    use wharf_core::warehouse::{Destination, DestinationConfig, DestinationType, Source};
    use wharf_warehouse::StaticDriverRegistry;

    use crate::admission::{AdmissionController, AdmissionLimits};
    use crate::repo::memory::{
        InMemoryStagingFileStore, InMemoryTableUploadStore, InMemoryUploadStore,
    };
    use crate::schedule::TriggerStore;

    fn warehouse(destination: &str, revision: &str) -> Warehouse {
        Warehouse {
            source: Source {
                id: SourceId::new("src"),
                name: "src".into(),
                enabled: true,
            },
            destination: Destination {
                id: DestinationId::new(destination),
                name: destination.into(),
                destination_type: DestinationType::S3Datalake,
                enabled: true,
                revision_id: revision.into(),
                config: DestinationConfig::new(),
            },
            workspace_id: WorkspaceId::new("ws"),
            namespace: "analytics".into(),
        }
    }

    fn manager() -> DestinationManager {
        let storage = Arc::new(MemoryObjectStore::new());
        let deps = RouterDeps {
            uploads: Arc::new(InMemoryUploadStore::new()),
            table_uploads: Arc::new(InMemoryTableUploadStore::new()),
            staging: Arc::new(InMemoryStagingFileStore::new()),
            storage: Arc::clone(&storage) as Arc<dyn wharf_core::storage::ObjectStore>,
            registry: Arc::new(StaticDriverRegistry::new(storage)),
            admission: Arc::new(AdmissionController::new(AdmissionLimits::default())),
            triggers: Arc::new(TriggerStore::new()),
        };
        DestinationManager::new(deps, RouterConfig::default())
    }

    #[tokio::test]
    async fn apply_config_starts_and_stops_routers() {
        let manager = manager();
        assert!(!manager.is_ready());

        manager
            .apply_config(vec![warehouse("dst-a", "r1"), warehouse("dst-b", "r1")])
            .await;
        assert!(manager.is_ready());
        assert_eq!(
            manager.active_routers().await,
            vec!["S3_DATALAKE:src:dst-a", "S3_DATALAKE:src:dst-b"]
        );

        // dst-b disappears from the config.
        manager.apply_config(vec![warehouse("dst-a", "r1")]).await;
        assert_eq!(manager.active_routers().await, vec!["S3_DATALAKE:src:dst-a"]);

        manager.shutdown().await;
        assert!(manager.active_routers().await.is_empty());
        assert!(!manager.is_ready());
    }

    #[tokio::test]
    async fn disabled_warehouse_gets_no_router() {
        let manager = manager();
        let mut disabled = warehouse("dst-a", "r1");
        disabled.destination.enabled = false;

        manager.apply_config(vec![disabled]).await;
        assert!(manager.active_routers().await.is_empty());
        assert!(manager.is_ready(), "readiness reflects applied config");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn revision_bump_restarts_the_router() {
        let manager = manager();
        manager.apply_config(vec![warehouse("dst-a", "r1")]).await;

        // Same identifier, new revision: the router is replaced.
        manager.apply_config(vec![warehouse("dst-a", "r2")]).await;
        let routers = manager.routers.lock().await;
        assert_eq!(
            routers.get("S3_DATALAKE:src:dst-a").map(Router::revision_id),
            Some("r2")
        );
        drop(routers);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn trigger_sync_requires_a_router() {
        let manager = manager();
        assert!(!manager.trigger_sync("S3_DATALAKE:src:dst-a").await);

        manager.apply_config(vec![warehouse("dst-a", "r1")]).await;
        assert!(manager.trigger_sync("S3_DATALAKE:src:dst-a").await);
        manager.shutdown().await;
    }
}
