//! Per-node handle to the current catalog, plus a table-manager cache.
//!
//! Resolution order: the catalog hosted on this node, the cached remote
//! location, the ring owner of the lookup key, the locator files, and finally
//! asking a locator-listed node to start a catalog from its stored copy.
//! Relocation and migration errors are retried with bounded attempts;
//! consistency errors propagate immediately.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::catalog::Catalog;
use crate::config::CoordConfig;
use crate::error::{CoordError, CoordResult};
use crate::expect_response;
use crate::locator::LocatorFiles;
use crate::remote::RemoteCatalog;
use crate::ring::{CatalogResolver, CATALOG_LOOKUP_KEY};
use crate::service::{CatalogService, TableManagerService, TableManagerWrapper};
use crate::transport::{NodeRequest, Request, Response, Transport};
use crate::types::{
    CommitPhase, DatabaseId, LockRequest, LockType, ReplicaOutcomes, TableInfo, TableKey,
    TableProxy,
};

/// Per-node handle on the catalog, wherever it lives, plus a cache of
/// table manager locations.
pub struct CatalogReference {
    local_id: DatabaseId,
    config: CoordConfig,
    transport: Arc<dyn Transport>,
    local: RwLock<Option<Arc<Catalog>>>,
    cached: RwLock<Option<DatabaseId>>,
    resolver: RwLock<Option<Arc<dyn CatalogResolver>>>,
    locator: Option<Arc<LocatorFiles>>,
    managers: RwLock<HashMap<TableKey, TableManagerWrapper>>,
}

impl CatalogReference {
    pub fn new(
        local_id: DatabaseId,
        config: CoordConfig,
        transport: Arc<dyn Transport>,
        locator: Option<Arc<LocatorFiles>>,
    ) -> Self {
        Self {
            local_id,
            config,
            transport,
            local: RwLock::new(None),
            cached: RwLock::new(None),
            resolver: RwLock::new(None),
            locator,
            managers: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_resolver(&self, resolver: Arc<dyn CatalogResolver>) {
        *self.resolver.write() = Some(resolver);
    }

    /// Install (or clear) the catalog hosted on this node.
    pub fn set_local_catalog(&self, catalog: Option<Arc<Catalog>>) {
        let hosted = catalog.is_some();
        *self.local.write() = catalog;
        if hosted {
            *self.cached.write() = None;
        }
    }

    /// The catalog hosted on this node, if it is still usable.
    pub fn local_catalog(&self) -> Option<Arc<Catalog>> {
        let mut local = self.local.write();
        let retired = match local.as_ref() {
            Some(catalog) if !catalog.is_usable() => Some(catalog.migration_status().moved_location),
            _ => None,
        };
        let Some(moved_to) = retired else {
            return local.clone();
        };
        *local = None;
        drop(local);
        if moved_to.is_some() {
            self.set_catalog_location(moved_to);
        }
        None
    }

    pub fn set_catalog_location(&self, location: Option<DatabaseId>) {
        *self.cached.write() = location.filter(|loc| loc != &self.local_id);
    }

    /// Best current knowledge of the catalog location, without asking peers.
    pub fn catalog_location(&self) -> Option<DatabaseId> {
        if self.local_catalog().is_some() {
            return Some(self.local_id.clone());
        }
        self.cached.read().clone()
    }

    async fn ask_location(&self, node: &DatabaseId) -> Option<DatabaseId> {
        if let Ok(Response::Pong { has_catalog: true }) =
            self.transport.call(node, Request::Ping).await
        {
            return Some(node.clone());
        }
        // The node may know where the catalog went.
        let request = Request::Node(NodeRequest::CatalogLocation);
        let resp = self.transport.call(node, request).await.ok()?;
        let hint = expect_response!(resp, Response::Location(location) => location).ok()??;
        if &hint == node {
            return None;
        }
        match self.transport.call(&hint, Request::Ping).await {
            Ok(Response::Pong { has_catalog: true }) => Some(hint),
            _ => None,
        }
    }

    /// Locate the current catalog.
    pub async fn catalog(&self) -> CoordResult<Arc<dyn CatalogService>> {
        if let Some(local) = self.local_catalog() {
            return Ok(local as Arc<dyn CatalogService>);
        }
        let cached = self.cached.read().clone();
        if let Some(location) = cached {
            return Ok(self.remote(location));
        }

        let mut candidates: Vec<DatabaseId> = Vec::new();
        let resolver = self.resolver.read().clone();
        if let Some(owner) = resolver.and_then(|r| r.resolve(CATALOG_LOOKUP_KEY)) {
            candidates.push(owner);
        }
        let recorded = self
            .locator
            .as_ref()
            .and_then(|locator| locator.read())
            .map(|record| record.catalog_locations)
            .unwrap_or_default();
        for node in &recorded {
            if !candidates.contains(node) {
                candidates.push(node.clone());
            }
        }

        for candidate in &candidates {
            if candidate == &self.local_id {
                continue;
            }
            if let Some(found) = self.ask_location(candidate).await {
                tracing::debug!(catalog = %found, "catalog located");
                *self.cached.write() = Some(found.clone());
                return Ok(self.remote(found));
            }
        }

        // No live catalog: ask a node holding a stored copy to start one.
        for node in &recorded {
            let resp = self
                .transport
                .call(node, Request::Node(NodeRequest::StartCatalog))
                .await;
            match resp.and_then(|resp| expect_response!(resp, Response::Ack => ())) {
                Ok(()) => {
                    tracing::warn!(catalog = %node, "catalog restarted from stored state");
                    if let Some(local) = self.local_catalog() {
                        return Ok(local as Arc<dyn CatalogService>);
                    }
                    self.set_catalog_location(Some(node.clone()));
                    return Ok(self.remote(node.clone()));
                }
                Err(err) => {
                    tracing::debug!(node = %node, error = ?err, "catalog restart attempt failed")
                }
            }
        }
        Err(CoordError::NotFound("no reachable catalog".into()))
    }

    fn remote(&self, location: DatabaseId) -> Arc<dyn CatalogService> {
        Arc::new(RemoteCatalog::new(location, self.transport.clone()))
    }

    fn forget_catalog(&self, location: &DatabaseId, moved_to: Option<DatabaseId>) {
        if location == &self.local_id {
            // Drops the local slot if the hosted instance is no longer usable.
            self.local_catalog();
        }
        let mut cached = self.cached.write();
        if cached.as_ref() == Some(location) || moved_to.is_some() {
            *cached = moved_to.filter(|loc| loc != &self.local_id);
        }
    }

    /// Run `op` against the current catalog, re-resolving on relocation.
    pub async fn with_catalog<T, F, Fut>(&self, op: F) -> CoordResult<T>
    where
        F: Fn(Arc<dyn CatalogService>) -> Fut + Send + Sync,
        Fut: Future<Output = CoordResult<T>> + Send,
        T: Send,
    {
        let attempts = self.config.reference_attempts.max(1);
        let mut last_err = CoordError::NotFound("no reachable catalog".into());
        for attempt in 0..attempts {
            let catalog = match self.catalog().await {
                Ok(catalog) => catalog,
                Err(err) => {
                    last_err = err;
                    tokio::time::sleep(self.config.reference_backoff).await;
                    continue;
                }
            };
            let location = catalog.location();
            match op(catalog).await {
                Ok(value) => return Ok(value),
                Err(CoordError::Moved { location: moved_to }) => {
                    tracing::debug!(catalog = %location, moved_to = ?moved_to, attempt, "catalog moved");
                    self.forget_catalog(&location, moved_to.clone());
                    last_err = CoordError::Moved { location: moved_to };
                }
                Err(err @ (CoordError::Shutdown | CoordError::Unreachable { .. })) => {
                    tracing::debug!(catalog = %location, error = ?err, attempt, "catalog unavailable");
                    self.forget_catalog(&location, None);
                    last_err = err;
                }
                Err(CoordError::MigrationInProgress) => {
                    last_err = CoordError::MigrationInProgress;
                    tokio::time::sleep(self.config.reference_backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    pub async fn available_machines(&self) -> CoordResult<Vec<DatabaseId>> {
        self.with_catalog(|catalog| async move { catalog.available_machines().await })
            .await
    }

    pub async fn add_table_manager_state_replica(
        &self,
        info: &TableInfo,
        node: &DatabaseId,
    ) -> CoordResult<()> {
        self.with_catalog(|catalog| async move {
            catalog.add_table_manager_state_replica(info, node).await
        })
        .await
    }

    pub async fn remove_table_manager_state_replica(
        &self,
        info: &TableInfo,
        node: &DatabaseId,
    ) -> CoordResult<()> {
        self.with_catalog(|catalog| async move {
            catalog.remove_table_manager_state_replica(info, node).await
        })
        .await
    }

    /// Ask the catalog for the manager of `info`, refreshing the cache.
    pub async fn lookup_table_manager(&self, info: &TableInfo) -> CoordResult<Option<TableManagerWrapper>> {
        let wrapper = self
            .with_catalog(|catalog| async move { catalog.lookup(info).await })
            .await?;
        let mut managers = self.managers.write();
        match &wrapper {
            Some(wrapper) if wrapper.handle.is_some() => {
                managers.insert(info.key(), wrapper.clone());
            }
            _ => {
                managers.remove(&info.key());
            }
        }
        Ok(wrapper)
    }

    /// Cached manager for `info`, falling back to a catalog lookup.
    pub async fn resolve_table_manager(&self, info: &TableInfo) -> CoordResult<Option<TableManagerWrapper>> {
        let cached = self.managers.read().get(&info.key()).cloned();
        if cached.is_some() {
            return Ok(cached);
        }
        self.lookup_table_manager(info).await
    }

    pub fn invalidate(&self, key: &TableKey) {
        self.managers.write().remove(key);
    }

    /// Wrappers without a live handle are not cached.
    pub fn cache_table_manager(&self, wrapper: TableManagerWrapper) {
        if wrapper.handle.is_some() {
            self.managers.write().insert(wrapper.key(), wrapper);
        }
    }

    /// Run `op` against the manager of `info`, re-resolving when it moved.
    pub async fn with_table_manager<T, F, Fut>(&self, info: &TableInfo, op: F) -> CoordResult<T>
    where
        F: Fn(Arc<dyn TableManagerService>) -> Fut + Send + Sync,
        Fut: Future<Output = CoordResult<T>> + Send,
        T: Send,
    {
        let key = info.key();
        let attempts = self.config.reference_attempts.max(1);
        let mut last_err = CoordError::NotFound(key.to_string());
        for attempt in 0..attempts {
            let wrapper = self
                .resolve_table_manager(info)
                .await?
                .ok_or_else(|| CoordError::NotFound(key.to_string()))?;
            let Some(handle) = wrapper.handle.clone() else {
                last_err = CoordError::unreachable(&wrapper.owner, "table manager has no live handle");
                self.invalidate(&key);
                tokio::time::sleep(self.config.reference_backoff).await;
                continue;
            };
            match op(handle).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_relocation() => {
                    tracing::debug!(table = %key, owner = %wrapper.owner, error = ?err, attempt, "table manager relocated");
                    self.invalidate(&key);
                    last_err = err;
                }
                Err(CoordError::MigrationInProgress) => {
                    last_err = CoordError::MigrationInProgress;
                    tokio::time::sleep(self.config.reference_backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    /// Acquire `lock_type` on `info` and learn which replicas to operate on.
    pub async fn get_query_proxy(
        &self,
        info: &TableInfo,
        lock_type: LockType,
        requestor: &LockRequest,
    ) -> CoordResult<TableProxy> {
        self.with_table_manager(info, |manager| async move {
            manager.get_table_proxy(lock_type, requestor).await
        })
        .await
    }

    pub async fn release_lock_and_update_replica_state(
        &self,
        info: &TableInfo,
        commit: bool,
        requestor: &LockRequest,
        outcomes: &ReplicaOutcomes,
        phase: CommitPhase,
    ) -> CoordResult<()> {
        self.with_table_manager(info, |manager| async move {
            manager
                .release_lock_and_update_replica_state(commit, requestor, outcomes, phase)
                .await
        })
        .await
    }
}
