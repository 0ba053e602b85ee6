//! The cluster-wide metadata catalog.
//!
//! One active instance exists at a time. It maps every table to the node
//! hosting its manager, tracks where each manager's metadata is replicated and
//! which nodes are members of the cluster. In-memory state answers live
//! lookups; the metadata store mirrors every mutation for cold starts, and a
//! snapshot is pushed to a few peers so the catalog survives its host.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::CoordConfig;
use crate::error::{CoordError, CoordResult};
use crate::expect_response;
use crate::locator::LocatorFiles;
use crate::migration::{MigrationState, MigrationStatus};
use crate::remote::RemoteTableManager;
use crate::service::{CatalogService, TableManagerService, TableManagerWrapper};
use crate::store::{CatalogCounters, MetadataStore, TableRow};
use crate::transport::{NodeRequest, Request, Response, Transport};
use crate::types::{
    DatabaseId, DatabaseInstanceWrapper, TableInfo, TableKey, TableManagerDescriptor,
};

/// Serializable copy of the whole catalog state. Manager handles are not
/// part of it; they are re-established lazily by `lookup`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub tables: Vec<TableRow>,
    pub manager_replicas: Vec<(TableKey, Vec<DatabaseId>)>,
    pub connections: Vec<DatabaseInstanceWrapper>,
    pub counters: CatalogCounters,
    /// Nodes holding a replicated copy of this snapshot.
    #[serde(default)]
    pub state_replicas: Vec<DatabaseId>,
}

impl CatalogSnapshot {
    pub fn load(store: &dyn MetadataStore) -> anyhow::Result<Self> {
        Ok(Self {
            tables: store.tables()?,
            manager_replicas: store.manager_replicas()?,
            connections: store.connections()?,
            counters: store.counters()?.unwrap_or_default(),
            state_replicas: Vec::new(),
        })
    }

    /// Replace every catalog relation in `store` with this snapshot.
    pub fn persist(&self, store: &dyn MetadataStore) -> anyhow::Result<()> {
        store.clear_catalog()?;
        for row in &self.tables {
            store.put_table(row)?;
        }
        for (key, nodes) in &self.manager_replicas {
            store.put_manager_replicas(key, nodes)?;
        }
        for instance in &self.connections {
            store.put_connection(instance)?;
        }
        store.put_counters(&self.counters)
    }
}

/// Node-side hooks the catalog uses for managers hosted on its own node.
#[async_trait]
pub trait ManagerHost: Send + Sync {
    fn hosted_manager(&self, key: &TableKey) -> Option<Arc<dyn TableManagerService>>;

    /// Instantiate a manager here from the locally persisted metadata.
    async fn recreate_table_manager(
        &self,
        info: &TableInfo,
        old_owner: &DatabaseId,
    ) -> CoordResult<Arc<dyn TableManagerService>>;
}

#[derive(Default)]
struct CatalogState {
    table_managers: BTreeMap<TableKey, TableManagerWrapper>,
    replica_locations: BTreeMap<TableKey, BTreeSet<DatabaseId>>,
    primary_locations: BTreeMap<TableKey, DatabaseId>,
    connected_nodes: BTreeMap<DatabaseId, DatabaseInstanceWrapper>,
    counters: CatalogCounters,
    state_replicas: Vec<DatabaseId>,
}

impl CatalogState {
    fn from_snapshot(snapshot: CatalogSnapshot) -> Self {
        let mut state = CatalogState {
            counters: snapshot.counters,
            state_replicas: snapshot.state_replicas,
            ..CatalogState::default()
        };
        for row in snapshot.tables {
            let key = row.info.key();
            if let Some(primary) = row.primary {
                state.primary_locations.insert(key.clone(), primary);
            }
            state
                .table_managers
                .insert(key, TableManagerWrapper::new(row.info, row.manager, None));
        }
        for (key, nodes) in snapshot.manager_replicas {
            // Directory entries without a table would break the lookup invariant.
            if state.table_managers.contains_key(&key) {
                state.replica_locations.insert(key, nodes.into_iter().collect());
            }
        }
        for instance in snapshot.connections {
            state.connected_nodes.insert(instance.id.clone(), instance);
        }
        state
    }

    fn snapshot(&self) -> CatalogSnapshot {
        CatalogSnapshot {
            tables: self
                .table_managers
                .iter()
                .map(|(key, wrapper)| self.table_row(key, wrapper))
                .collect(),
            manager_replicas: self
                .replica_locations
                .iter()
                .map(|(key, nodes)| (key.clone(), nodes.iter().cloned().collect()))
                .collect(),
            connections: self.connected_nodes.values().cloned().collect(),
            counters: self.counters,
            state_replicas: self.state_replicas.clone(),
        }
    }

    fn table_row(&self, key: &TableKey, wrapper: &TableManagerWrapper) -> TableRow {
        TableRow {
            info: wrapper.info.clone(),
            manager: wrapper.owner.clone(),
            primary: self.primary_locations.get(key).cloned(),
        }
    }

    fn replica_locations_of(&self, key: &TableKey) -> Vec<DatabaseId> {
        self.replica_locations
            .get(key)
            .map(|nodes| nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn is_active(&self, node: &DatabaseId) -> bool {
        self.connected_nodes
            .get(node)
            .map(|instance| instance.active)
            .unwrap_or(false)
    }
}

enum Recreation {
    Alive,
    Recreated,
    Failed,
}

/// Shared handles the catalog needs from its hosting node.
#[derive(Clone)]
pub struct CatalogContext {
    pub location: DatabaseId,
    pub config: CoordConfig,
    pub store: Arc<dyn MetadataStore>,
    pub transport: Arc<dyn Transport>,
    pub host: Weak<dyn ManagerHost>,
    pub locator: Option<Arc<LocatorFiles>>,
}

/// Cluster-wide directory of members, table managers and metadata copies.
/// Exactly one active instance exists; the others are replicated snapshots.
pub struct Catalog {
    ctx: CatalogContext,
    state: RwLock<CatalogState>,
    migration: MigrationState,
    /// Serializes snapshot pushes so replicas never see them out of order.
    replication: tokio::sync::Mutex<()>,
}

impl Catalog {
    pub fn new(ctx: CatalogContext) -> Self {
        Self::from_state(CatalogState::default(), ctx)
    }

    fn from_state(state: CatalogState, ctx: CatalogContext) -> Self {
        Self {
            migration: MigrationState::new(ctx.config.migration_timeout),
            state: RwLock::new(state),
            replication: tokio::sync::Mutex::new(()),
            ctx,
        }
    }

    /// Rebuild from the catalog relations in the local store, if any were
    /// ever written there.
    pub fn recover(ctx: CatalogContext) -> CoordResult<Option<Self>> {
        if !ctx.store.has_catalog()? {
            return Ok(None);
        }
        let snapshot = CatalogSnapshot::load(ctx.store.as_ref())?;
        tracing::info!(
            location = %ctx.location,
            tables = snapshot.tables.len(),
            nodes = snapshot.connections.len(),
            "recovered catalog from local store"
        );
        Ok(Some(Self::from_state(CatalogState::from_snapshot(snapshot), ctx)))
    }

    /// Node hosting this instance.
    pub fn location(&self) -> &DatabaseId {
        &self.ctx.location
    }

    pub fn migration_status(&self) -> MigrationStatus {
        self.migration.status()
    }

    pub fn is_usable(&self) -> bool {
        self.migration.is_usable()
    }

    /// Refuse every later call with `Shutdown`.
    pub fn shutdown(&self) {
        self.migration.shutdown(false);
    }

    /// Copy membership, the manager directory, the replica-location directory
    /// and the primary-location directory from `source`. Manager handles stay
    /// empty until a lookup heals them.
    pub async fn recreate_system_table_state(&self, source: &dyn CatalogService) -> CoordResult<()> {
        let snapshot = source.export_state().await?;
        self.install_snapshot(snapshot)
    }

    /// Replace the in-memory directory with `snapshot`, persisting it first.
    pub fn install_snapshot(&self, snapshot: CatalogSnapshot) -> CoordResult<()> {
        snapshot.persist(self.ctx.store.as_ref())?;
        *self.state.write() = CatalogState::from_snapshot(snapshot);
        Ok(())
    }

    /// Record this node (and the current state replicas) in the locator files.
    pub fn publish_location(&self) {
        let Some(locator) = &self.ctx.locator else {
            return;
        };
        let mut locations = vec![self.ctx.location.clone()];
        locations.extend(self.state.read().state_replicas.iter().cloned());
        match locator.record(locations) {
            Ok(record) => {
                tracing::info!(update_count = record.update_count, locations = ?record.catalog_locations, "published catalog location")
            }
            Err(err) => tracing::warn!(error = ?err, "failed to update locator files"),
        }
    }

    fn mirror(&self, what: &str, result: anyhow::Result<()>) {
        if let Err(err) = result {
            tracing::warn!(operation = what, error = ?err, "failed to mirror catalog mutation to store");
        }
    }

    fn host(&self) -> Option<Arc<dyn ManagerHost>> {
        self.ctx.host.upgrade()
    }

    /// A handle to the manager of `info` as hosted on `owner`, without probing it.
    fn handle_for(&self, info: &TableInfo, owner: &DatabaseId) -> Option<Arc<dyn TableManagerService>> {
        if owner == &self.ctx.location {
            self.host().and_then(|host| host.hosted_manager(&info.key()))
        } else {
            Some(Arc::new(RemoteTableManager::new(
                info.clone(),
                owner.clone(),
                self.ctx.transport.clone(),
            )))
        }
    }

    /// Ask `node` to instantiate the manager from its local metadata copy.
    async fn recreate_on(
        &self,
        node: &DatabaseId,
        info: &TableInfo,
        old_owner: &DatabaseId,
    ) -> CoordResult<Arc<dyn TableManagerService>> {
        if node == &self.ctx.location {
            let host = self.host().ok_or(CoordError::Shutdown)?;
            return host.recreate_table_manager(info, old_owner).await;
        }
        let request = Request::Node(NodeRequest::RecreateTableManager {
            info: info.clone(),
            old_owner: old_owner.clone(),
        });
        let resp = self.ctx.transport.call(node, request).await?;
        expect_response!(resp, Response::Ack => ())?;
        Ok(Arc::new(RemoteTableManager::new(
            info.clone(),
            node.clone(),
            self.ctx.transport.clone(),
        )))
    }

    /// Point the directory entry for `key` at a (new) live handle.
    fn install_handle(&self, key: &TableKey, handle: Arc<dyn TableManagerService>) -> Option<TableManagerWrapper> {
        let mut state = self.state.write();
        let owner = handle.location();
        let wrapper = state.table_managers.get_mut(key)?;
        let moved = wrapper.owner != owner;
        wrapper.owner = owner.clone();
        wrapper.info.host = Some(owner.clone());
        wrapper.handle = Some(handle);
        let wrapper = wrapper.clone();
        if moved {
            state
                .replica_locations
                .entry(key.clone())
                .or_default()
                .insert(owner);
            let row = state.table_row(key, &wrapper);
            let nodes = state.replica_locations_of(key);
            self.mirror("relocate manager", self.ctx.store.put_table(&row));
            self.mirror("relocate manager", self.ctx.store.put_manager_replicas(key, &nodes));
        }
        Some(wrapper)
    }

    /// Re-establish a missing handle: owner first, then every metadata replica.
    async fn heal_handle(&self, wrapper: &TableManagerWrapper) -> Option<Arc<dyn TableManagerService>> {
        let key = wrapper.key();
        let mut candidates = vec![wrapper.owner.clone()];
        for node in self.state.read().replica_locations_of(&key) {
            if !candidates.contains(&node) {
                candidates.push(node);
            }
        }
        for node in candidates {
            match self.recreate_on(&node, &wrapper.info, &wrapper.owner).await {
                Ok(handle) => return Some(handle),
                Err(err) => {
                    tracing::debug!(table = %key, node = %node, error = ?err, "could not re-establish table manager")
                }
            }
        }
        None
    }

    /// Order recreation candidates: active members first, then by id. The
    /// previous owner is excluded unless it is this node.
    fn recreation_candidates(&self, key: &TableKey, old_owner: &DatabaseId) -> Vec<DatabaseId> {
        let state = self.state.read();
        let mut nodes: Vec<DatabaseId> = state
            .replica_locations_of(key)
            .into_iter()
            .filter(|node| node != old_owner || node == &self.ctx.location)
            .collect();
        nodes.sort_by(|a, b| {
            state
                .is_active(b)
                .cmp(&state.is_active(a))
                .then_with(|| a.cmp(b))
        });
        nodes
    }

    async fn recreate_if_not_alive(&self, wrapper: &TableManagerWrapper) -> Recreation {
        let key = wrapper.key();
        let current = wrapper
            .handle
            .clone()
            .or_else(|| self.handle_for(&wrapper.info, &wrapper.owner));
        if let Some(handle) = current {
            if handle.ping().await.is_ok() {
                if wrapper.handle.is_none() {
                    self.install_handle(&key, handle);
                }
                return Recreation::Alive;
            }
        }

        for node in self.recreation_candidates(&key, &wrapper.owner) {
            match self.recreate_on(&node, &wrapper.info, &wrapper.owner).await {
                Ok(handle) => {
                    self.install_handle(&key, handle);
                    tracing::info!(table = %key, old_owner = %wrapper.owner, new_owner = %node, "table manager recreated");
                    return Recreation::Recreated;
                }
                Err(err) => {
                    tracing::debug!(table = %key, node = %node, error = ?err, "table manager recreation attempt failed")
                }
            }
        }
        tracing::warn!(table = %key, owner = %wrapper.owner, "table manager unreachable and could not be recreated");
        Recreation::Failed
    }

    async fn check_accessibility(&self, node: Option<&DatabaseId>) -> bool {
        let wrappers: Vec<TableManagerWrapper> = self
            .state
            .read()
            .table_managers
            .values()
            .filter(|w| node.map(|n| &w.owner == n).unwrap_or(true))
            .cloned()
            .collect();
        let mut recreated = false;
        for wrapper in wrappers {
            if let Recreation::Recreated = self.recreate_if_not_alive(&wrapper).await {
                recreated = true;
            }
        }
        recreated
    }

    /// Push the current snapshot to up to `catalog_replication_factor` live
    /// members, and republish the locator files when that set changes.
    async fn replicate_state(&self) {
        let factor = self.ctx.config.catalog_replication_factor;
        let _guard = self.replication.lock().await;
        let (snapshot, previous, candidates) = {
            let state = self.state.read();
            let previous = state.state_replicas.clone();
            let mut candidates: Vec<DatabaseId> = previous
                .iter()
                .filter(|node| state.is_active(node))
                .cloned()
                .collect();
            for node in state.connected_nodes.values().filter(|i| i.active) {
                if !candidates.contains(&node.id) {
                    candidates.push(node.id.clone());
                }
            }
            candidates.retain(|node| node != &self.ctx.location);
            (state.snapshot(), previous, candidates)
        };

        let mut replicas = Vec::new();
        for node in candidates {
            if replicas.len() >= factor {
                break;
            }
            let request = Request::Node(NodeRequest::StoreCatalogState(snapshot.clone()));
            let result = match self.ctx.transport.call(&node, request).await {
                Ok(resp) => expect_response!(resp, Response::Ack => ()),
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => replicas.push(node),
                Err(err) => {
                    tracing::debug!(node = %node, error = ?err, "catalog state push failed")
                }
            }
        }

        if replicas != previous {
            self.state.write().state_replicas = replicas;
            self.publish_location();
        }
    }
}

#[async_trait]
impl CatalogService for Catalog {
    fn location(&self) -> DatabaseId {
        self.ctx.location.clone()
    }

    async fn add_table_information(
        &self,
        owner: &DatabaseId,
        info: &TableInfo,
        replica_locations: &[DatabaseId],
    ) -> CoordResult<bool> {
        self.migration.check()?;
        let key = info.key();
        let handle = self.handle_for(info, owner);
        {
            let mut state = self.state.write();
            if state.table_managers.contains_key(&key) {
                return Ok(false);
            }
            let mut info = info.clone();
            info.host = Some(owner.clone());
            let wrapper = TableManagerWrapper::new(info, owner.clone(), handle);
            state.table_managers.insert(key.clone(), wrapper.clone());
            state.primary_locations.insert(key.clone(), owner.clone());
            let nodes = state.replica_locations.entry(key.clone()).or_default();
            nodes.insert(owner.clone());
            nodes.extend(replica_locations.iter().cloned());

            let row = state.table_row(&key, &wrapper);
            let nodes = state.replica_locations_of(&key);
            self.mirror("add table", self.ctx.store.put_table(&row));
            self.mirror("add table", self.ctx.store.put_manager_replicas(&key, &nodes));
        }
        tracing::info!(table = %key, owner = %owner, "table registered");
        self.replicate_state().await;
        Ok(true)
    }

    async fn remove_table_information(&self, info: &TableInfo) -> CoordResult<()> {
        self.migration.check()?;
        let removed: Vec<(TableManagerWrapper, Vec<DatabaseId>)> = {
            let mut state = self.state.write();
            let keys: Vec<TableKey> = if info.is_schema_wide() {
                state
                    .table_managers
                    .keys()
                    .filter(|key| key.schema == info.schema)
                    .cloned()
                    .collect()
            } else {
                vec![info.key()]
            };
            let mut removed = Vec::new();
            for key in keys {
                let Some(wrapper) = state.table_managers.remove(&key) else {
                    continue;
                };
                let nodes = state.replica_locations_of(&key);
                state.replica_locations.remove(&key);
                state.primary_locations.remove(&key);
                self.mirror("remove table", self.ctx.store.delete_table(&key));
                self.mirror("remove table", self.ctx.store.delete_manager_replicas(&key));
                removed.push((wrapper, nodes));
            }
            removed
        };
        if removed.is_empty() && !info.is_schema_wide() {
            return Err(CoordError::NotFound(info.key().to_string()));
        }

        for (wrapper, nodes) in &removed {
            let key = wrapper.key();
            let handle = wrapper
                .handle
                .clone()
                .or_else(|| self.handle_for(&wrapper.info, &wrapper.owner));
            if let Some(handle) = handle {
                if let Err(err) = handle.shutdown(true).await {
                    tracing::debug!(table = %key, error = ?err, "shutdown of dropped table manager failed");
                }
            }
            for node in nodes {
                if node == &self.ctx.location {
                    self.mirror("remove table", self.ctx.store.delete_manager_state(&key));
                    continue;
                }
                let request = Request::Node(NodeRequest::DeleteManagerState(key.clone()));
                if let Err(err) = self.ctx.transport.call(node, request).await {
                    tracing::debug!(table = %key, node = %node, error = ?err, "failed to delete manager state copy");
                }
            }
            tracing::info!(table = %key, "table removed");
        }
        self.replicate_state().await;
        Ok(())
    }

    async fn lookup(&self, info: &TableInfo) -> CoordResult<Option<TableManagerWrapper>> {
        self.migration.check()?;
        let key = info.key();
        let Some(wrapper) = self.state.read().table_managers.get(&key).cloned() else {
            return Ok(None);
        };
        if wrapper.handle.is_some() {
            return Ok(Some(wrapper));
        }
        match self.heal_handle(&wrapper).await {
            Some(handle) => Ok(self.install_handle(&key, handle).or(Some(wrapper))),
            None => {
                tracing::warn!(table = %key, owner = %wrapper.owner, "table manager handle could not be re-established");
                Ok(Some(wrapper))
            }
        }
    }

    async fn exists(&self, info: &TableInfo) -> CoordResult<bool> {
        self.migration.check()?;
        Ok(self.state.read().table_managers.contains_key(&info.key()))
    }

    async fn all_table_managers(&self) -> CoordResult<Vec<TableManagerDescriptor>> {
        self.migration.check()?;
        Ok(self
            .state
            .read()
            .table_managers
            .values()
            .map(TableManagerWrapper::descriptor)
            .collect())
    }

    async fn local_table_managers(
        &self,
        node: &DatabaseId,
    ) -> CoordResult<Vec<TableManagerDescriptor>> {
        self.migration.check()?;
        Ok(self
            .state
            .read()
            .table_managers
            .values()
            .filter(|w| &w.owner == node)
            .map(TableManagerWrapper::descriptor)
            .collect())
    }

    async fn primary_locations(&self) -> CoordResult<Vec<(TableKey, DatabaseId)>> {
        self.migration.check()?;
        Ok(self
            .state
            .read()
            .primary_locations
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn replica_locations(&self, info: &TableInfo) -> CoordResult<Vec<DatabaseId>> {
        self.migration.check()?;
        Ok(self.state.read().replica_locations_of(&info.key()))
    }

    async fn change_table_manager_location(
        &self,
        owner: &DatabaseId,
        info: &TableInfo,
    ) -> CoordResult<()> {
        self.migration.check()?;
        let key = info.key();
        if !self.state.read().table_managers.contains_key(&key) {
            return Err(CoordError::NotFound(key.to_string()));
        }
        match self.handle_for(info, owner) {
            Some(handle) => {
                self.install_handle(&key, handle);
            }
            None => {
                let mut state = self.state.write();
                if let Some(wrapper) = state.table_managers.get_mut(&key) {
                    wrapper.owner = owner.clone();
                    wrapper.info.host = Some(owner.clone());
                    wrapper.handle = None;
                }
            }
        }
        tracing::info!(table = %key, owner = %owner, "table manager location changed");
        self.replicate_state().await;
        Ok(())
    }

    async fn add_table_manager_state_replica(
        &self,
        info: &TableInfo,
        node: &DatabaseId,
    ) -> CoordResult<()> {
        self.migration.check()?;
        let key = info.key();
        {
            let mut state = self.state.write();
            if !state.table_managers.contains_key(&key) {
                return Err(CoordError::NotFound(key.to_string()));
            }
            let inserted = state
                .replica_locations
                .entry(key.clone())
                .or_default()
                .insert(node.clone());
            if !inserted {
                return Ok(());
            }
            let nodes = state.replica_locations_of(&key);
            self.mirror("add state replica", self.ctx.store.put_manager_replicas(&key, &nodes));
        }
        self.replicate_state().await;
        Ok(())
    }

    async fn remove_table_manager_state_replica(
        &self,
        info: &TableInfo,
        node: &DatabaseId,
    ) -> CoordResult<()> {
        self.migration.check()?;
        let key = info.key();
        {
            let mut state = self.state.write();
            let owner = state.table_managers.get(&key).map(|w| w.owner.clone());
            // The owner always keeps its own copy.
            if owner.as_ref() == Some(node) {
                return Ok(());
            }
            let removed = state
                .replica_locations
                .get_mut(&key)
                .map(|nodes| nodes.remove(node))
                .unwrap_or(false);
            if !removed {
                return Ok(());
            }
            let nodes = state.replica_locations_of(&key);
            self.mirror("remove state replica", self.ctx.store.put_manager_replicas(&key, &nodes));
        }
        self.replicate_state().await;
        Ok(())
    }

    async fn check_table_manager_accessibility(
        &self,
        node: Option<&DatabaseId>,
    ) -> CoordResult<bool> {
        self.migration.check()?;
        let recreated = self.check_accessibility(node).await;
        if recreated {
            self.replicate_state().await;
        }
        Ok(recreated)
    }

    async fn recreate_table_manager_if_not_alive(&self, info: &TableInfo) -> CoordResult<bool> {
        self.migration.check()?;
        let key = info.key();
        let wrapper = self
            .state
            .read()
            .table_managers
            .get(&key)
            .cloned()
            .ok_or_else(|| CoordError::NotFound(key.to_string()))?;
        match self.recreate_if_not_alive(&wrapper).await {
            Recreation::Alive => Ok(true),
            Recreation::Recreated => {
                self.replicate_state().await;
                Ok(true)
            }
            Recreation::Failed => Ok(false),
        }
    }

    async fn suspect_instance_of_failure(&self, node: &DatabaseId) -> CoordResult<()> {
        self.migration.check()?;
        if node == &self.ctx.location {
            return Ok(());
        }
        let reachable = matches!(
            self.ctx.transport.call(node, Request::Ping).await,
            Ok(Response::Pong { .. })
        );
        if reachable {
            tracing::debug!(node = %node, "suspected node answered ping");
            return Ok(());
        }

        tracing::warn!(node = %node, "node unreachable; removing from membership");
        if self.state.write().connected_nodes.remove(node).is_some() {
            self.mirror("remove connection", self.ctx.store.delete_connection(node));
        }
        self.check_accessibility(Some(node)).await;

        let handles: Vec<(TableKey, Arc<dyn TableManagerService>)> = self
            .state
            .read()
            .table_managers
            .iter()
            .filter_map(|(key, w)| w.handle.clone().map(|h| (key.clone(), h)))
            .collect();
        for (key, handle) in handles {
            if let Err(err) = handle.notify_node_failed(node).await {
                tracing::debug!(table = %key, failed = %node, error = ?err, "node failure notification not delivered");
            }
        }
        self.replicate_state().await;
        Ok(())
    }

    async fn add_connection_information(&self, node: &DatabaseId) -> CoordResult<u64> {
        self.migration.check()?;
        let id = {
            let mut state = self.state.write();
            let existing = state.connected_nodes.get_mut(node).map(|instance| {
                instance.active = true;
                instance.clone()
            });
            let instance = match existing {
                Some(instance) => instance,
                None => {
                    state.counters.next_connection_id += 1;
                    let instance = DatabaseInstanceWrapper {
                        id: node.clone(),
                        connection_id: state.counters.next_connection_id,
                        active: true,
                    };
                    state.connected_nodes.insert(node.clone(), instance.clone());
                    instance
                }
            };
            self.mirror("add connection", self.ctx.store.put_connection(&instance));
            self.mirror("add connection", self.ctx.store.put_counters(&state.counters));
            instance.connection_id
        };
        tracing::info!(node = %node, connection_id = id, "node registered");
        self.replicate_state().await;
        Ok(id)
    }

    async fn remove_connection_information(&self, node: &DatabaseId) -> CoordResult<()> {
        self.migration.check()?;
        if self.state.write().connected_nodes.remove(node).is_none() {
            return Ok(());
        }
        self.mirror("remove connection", self.ctx.store.delete_connection(node));
        self.replicate_state().await;
        Ok(())
    }

    async fn database_instances(&self) -> CoordResult<Vec<DatabaseInstanceWrapper>> {
        self.migration.check()?;
        Ok(self.state.read().connected_nodes.values().cloned().collect())
    }

    async fn database_instance(
        &self,
        node: &DatabaseId,
    ) -> CoordResult<Option<DatabaseInstanceWrapper>> {
        self.migration.check()?;
        Ok(self.state.read().connected_nodes.get(node).cloned())
    }

    async fn available_machines(&self) -> CoordResult<Vec<DatabaseId>> {
        self.migration.check()?;
        let state = self.state.read();
        let mut load: BTreeMap<&DatabaseId, usize> = BTreeMap::new();
        for wrapper in state.table_managers.values() {
            *load.entry(&wrapper.owner).or_default() += 1;
        }
        let mut nodes: Vec<&DatabaseId> = state
            .connected_nodes
            .values()
            .filter(|instance| instance.active)
            .map(|instance| &instance.id)
            .collect();
        nodes.sort_by_key(|node| (load.get(node).copied().unwrap_or(0), *node));
        Ok(nodes.into_iter().cloned().collect())
    }

    async fn new_table_set_number(&self) -> CoordResult<u64> {
        self.migration.check()?;
        let mut state = self.state.write();
        state.counters.next_table_set_number += 1;
        self.mirror("table set number", self.ctx.store.put_counters(&state.counters));
        Ok(state.counters.next_table_set_number)
    }

    async fn export_state(&self) -> CoordResult<CatalogSnapshot> {
        self.migration.check_relocation()?;
        Ok(self.state.read().snapshot())
    }

    async fn prepare_for_migration(&self, new_location: &DatabaseId) -> CoordResult<()> {
        self.migration.prepare_for_migration(new_location)?;
        tracing::info!(target_location = %new_location, "catalog migration prepared");
        Ok(())
    }

    async fn complete_migration(&self, new_location: &DatabaseId) -> CoordResult<()> {
        self.migration.complete_migration(new_location)?;
        tracing::info!(target_location = %new_location, "catalog moved");
        Ok(())
    }
}
