//! One cluster member: hosts table managers, optionally the catalog, and
//! answers peer requests for both.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::catalog::{Catalog, CatalogContext, CatalogSnapshot, ManagerHost};
use crate::config::CoordConfig;
use crate::error::{CoordError, CoordResult};
use crate::locator::LocatorFiles;
use crate::reference::CatalogReference;
use crate::ring::CatalogResolver;
use crate::service::{CatalogService, TableManagerService};
use crate::store::{ManagerStateRecord, MetadataStore};
use crate::table_manager::{ManagerContext, TableManager};
use crate::transport::{
    CatalogRequest, ManagerRequest, NodeRequest, Request, RequestHandler, Response, Transport,
};
use crate::types::{
    CommitPhase, DatabaseId, LockRequest, LockType, ReplicaOutcomes, TableInfo, TableKey,
    TableProxy,
};

/// One cluster member: hosts table managers, maybe the catalog, and answers
/// peer RPCs through `RequestHandler`.
pub struct Node {
    id: DatabaseId,
    config: CoordConfig,
    store: Arc<dyn MetadataStore>,
    transport: Arc<dyn Transport>,
    locator: Option<Arc<LocatorFiles>>,
    reference: Arc<CatalogReference>,
    managers: RwLock<BTreeMap<TableKey, Arc<TableManager>>>,
    next_session: AtomicU64,
    self_ref: Weak<Node>,
}

impl Node {
    pub fn new(
        id: DatabaseId,
        config: CoordConfig,
        store: Arc<dyn MetadataStore>,
        transport: Arc<dyn Transport>,
        locator: Option<Arc<LocatorFiles>>,
    ) -> Arc<Self> {
        let reference = Arc::new(CatalogReference::new(
            id.clone(),
            config.clone(),
            transport.clone(),
            locator.clone(),
        ));
        Arc::new_cyclic(|self_ref| Self {
            id,
            config,
            store,
            transport,
            locator,
            reference,
            managers: RwLock::new(BTreeMap::new()),
            next_session: AtomicU64::new(1),
            self_ref: self_ref.clone(),
        })
    }

    pub fn id(&self) -> &DatabaseId {
        &self.id
    }

    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    pub fn reference(&self) -> &Arc<CatalogReference> {
        &self.reference
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn set_resolver(&self, resolver: Arc<dyn CatalogResolver>) {
        self.reference.set_resolver(resolver);
    }

    /// A fresh lock requester identity on this node.
    pub fn session(&self) -> LockRequest {
        LockRequest::new(self.id.clone(), self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    fn manager_ctx(&self) -> ManagerContext {
        ManagerContext {
            location: self.id.clone(),
            config: self.config.clone(),
            catalog: self.reference.clone(),
            store: self.store.clone(),
            transport: self.transport.clone(),
        }
    }

    fn catalog_ctx(&self) -> CatalogContext {
        let host: Weak<dyn ManagerHost> = self.self_ref.clone();
        CatalogContext {
            location: self.id.clone(),
            config: self.config.clone(),
            store: self.store.clone(),
            transport: self.transport.clone(),
            host,
            locator: self.locator.clone(),
        }
    }

    pub fn hosts_catalog(&self) -> bool {
        self.reference.local_catalog().is_some()
    }

    /// Usable manager for `key` hosted here.
    pub fn local_manager(&self, key: &TableKey) -> Option<Arc<TableManager>> {
        self.managers
            .read()
            .get(key)
            .filter(|manager| manager.is_usable())
            .cloned()
    }

    /// Keys of the usable managers hosted here.
    pub fn local_managers(&self) -> Vec<TableKey> {
        self.managers
            .read()
            .iter()
            .filter(|(_, manager)| manager.is_usable())
            .map(|(key, _)| key.clone())
            .collect()
    }

    async fn install_catalog(&self, catalog: Arc<Catalog>) -> CoordResult<Arc<Catalog>> {
        self.reference.set_local_catalog(Some(catalog.clone()));
        catalog.add_connection_information(&self.id).await?;
        catalog.publish_location();
        Ok(catalog)
    }

    /// Start a catalog on this node: recovered from the local store when one
    /// was ever written here, empty otherwise.
    pub async fn bootstrap_catalog(&self) -> CoordResult<Arc<Catalog>> {
        if let Some(catalog) = self.reference.local_catalog() {
            return Ok(catalog);
        }
        let catalog = match Catalog::recover(self.catalog_ctx())? {
            Some(catalog) => catalog,
            None => Catalog::new(self.catalog_ctx()),
        };
        tracing::info!(node = %self.id, "catalog started");
        self.install_catalog(Arc::new(catalog)).await
    }

    /// Start a catalog from the copy replicated to this node. Fails when no
    /// copy was ever stored here.
    pub async fn recover_catalog(&self) -> CoordResult<Arc<Catalog>> {
        if let Some(catalog) = self.reference.local_catalog() {
            return Ok(catalog);
        }
        let catalog = Catalog::recover(self.catalog_ctx())?
            .ok_or_else(|| CoordError::NotFound(format!("no stored catalog state on {}", self.id)))?;
        tracing::warn!(node = %self.id, "catalog recovered from replicated state");
        self.install_catalog(Arc::new(catalog)).await
    }

    /// Register this node with the current catalog.
    pub async fn join(&self) -> CoordResult<u64> {
        let id = &self.id;
        self.reference
            .with_catalog(|catalog| async move { catalog.add_connection_information(id).await })
            .await
    }

    /// Move the catalog to this node: prepare the old instance, copy its
    /// state, persist it here, complete the old instance, republish.
    pub async fn migrate_catalog_here(&self) -> CoordResult<()> {
        let old = self.reference.catalog().await?;
        if old.location() == self.id {
            return Ok(());
        }
        let old_location = old.location();
        old.prepare_for_migration(&self.id).await?;
        let catalog = Arc::new(Catalog::new(self.catalog_ctx()));
        catalog.recreate_system_table_state(old.as_ref()).await?;
        old.complete_migration(&self.id).await?;
        tracing::info!(from = %old_location, to = %self.id, "catalog migrated");
        self.install_catalog(catalog).await?;
        Ok(())
    }

    fn store_catalog_state(&self, snapshot: CatalogSnapshot) -> CoordResult<()> {
        if self.hosts_catalog() {
            return Err(CoordError::AlreadyExists(format!(
                "active catalog hosted on {}",
                self.id
            )));
        }
        snapshot.persist(self.store.as_ref())?;
        Ok(())
    }

    /// Create a table managed from this node and take the CREATE lock on it.
    ///
    /// Returns `None` when the table already exists. The caller creates the
    /// table on the returned replicas and then reports the outcome through
    /// `release_lock_and_update_replica_state`.
    pub async fn create_table(
        &self,
        info: TableInfo,
        requestor: &LockRequest,
    ) -> CoordResult<Option<TableProxy>> {
        let key = info.key();
        if self.local_manager(&key).is_some() {
            return Ok(None);
        }
        let info = if info.table_set == 0 {
            let table_set = self
                .reference
                .with_catalog(|catalog| async move { catalog.new_table_set_number().await })
                .await?;
            info.with_table_set(table_set)
        } else {
            info
        };

        let manager = Arc::new(TableManager::new(info, self.manager_ctx()));
        self.managers.write().insert(key.clone(), manager.clone());

        let id = &self.id;
        let manager_info = manager.info();
        let locations = [self.id.clone()];
        let locations = &locations;
        let added = self
            .reference
            .with_catalog(|catalog| async move {
                catalog.add_table_information(id, manager_info, locations).await
            })
            .await;
        match added {
            Ok(true) => {}
            Ok(false) => {
                self.forget_manager(&key, &manager);
                return Ok(None);
            }
            Err(err) => {
                self.forget_manager(&key, &manager);
                return Err(err);
            }
        }

        let proxy = manager.get_table_proxy(LockType::Create, requestor).await?;
        self.reference.invalidate(&key);
        Ok(Some(proxy))
    }

    fn forget_manager(&self, key: &TableKey, manager: &Arc<TableManager>) {
        let mut managers = self.managers.write();
        if managers
            .get(key)
            .map(|current| Arc::ptr_eq(current, manager))
            .unwrap_or(false)
        {
            managers.remove(key);
        }
    }

    /// DROP TABLE: take the DROP lock and remove the table from the catalog
    /// while still holding it. Removal shuts the manager down, so requests
    /// queued behind the DROP are woken with `Moved` and then see the table
    /// as gone.
    pub async fn drop_table(&self, info: &TableInfo, requestor: &LockRequest) -> CoordResult<()> {
        self.reference
            .get_query_proxy(info, LockType::Drop, requestor)
            .await?;
        let removed = self
            .reference
            .with_catalog(|catalog| async move { catalog.remove_table_information(info).await })
            .await;
        if let Err(err) = removed {
            if let Err(release_err) = self
                .reference
                .release_lock_and_update_replica_state(
                    info,
                    false,
                    requestor,
                    &ReplicaOutcomes::new(),
                    CommitPhase::Complete,
                )
                .await
            {
                tracing::warn!(table = %info.key(), error = ?release_err, "failed to release DROP lock");
            }
            return Err(err);
        }
        self.reference.invalidate(&info.key());
        Ok(())
    }

    /// Drop every table of `schema`.
    pub async fn drop_schema(&self, schema: &str) -> CoordResult<()> {
        let info = TableInfo::schema_wide(schema);
        let info = &info;
        self.reference
            .with_catalog(|catalog| async move { catalog.remove_table_information(info).await })
            .await
    }

    async fn recreate_manager(
        &self,
        info: &TableInfo,
        old_owner: &DatabaseId,
    ) -> CoordResult<Arc<TableManager>> {
        let key = info.key();
        if let Some(existing) = self.local_manager(&key) {
            return Ok(existing);
        }
        let manager = Arc::new(TableManager::recreate(info, old_owner, self.manager_ctx()).await?);
        {
            let mut managers = self.managers.write();
            if let Some(existing) = managers.get(&key).filter(|m| m.is_usable()) {
                return Ok(existing.clone());
            }
            managers.insert(key.clone(), manager.clone());
        }
        if let Err(err) = manager.persist_state().await {
            tracing::warn!(table = %key, error = ?err, "recreated manager state not replicated");
        }
        Ok(manager)
    }

    /// Move the manager of `info` to this node.
    pub async fn migrate_table_manager_here(&self, info: &TableInfo) -> CoordResult<()> {
        let key = info.key();
        let wrapper = self
            .reference
            .lookup_table_manager(info)
            .await?
            .ok_or_else(|| CoordError::NotFound(key.to_string()))?;
        if wrapper.owner == self.id {
            return Ok(());
        }
        let old = wrapper
            .handle
            .clone()
            .ok_or_else(|| CoordError::unreachable(&wrapper.owner, "table manager has no live handle"))?;

        old.prepare_for_migration(&self.id).await?;
        let record = old.export_state().await?;
        let manager = Arc::new(TableManager::from_record(record, self.manager_ctx()));
        if let Err(err) = manager.persist_state().await {
            tracing::warn!(table = %key, error = ?err, "migrated manager state not replicated");
        }
        self.managers.write().insert(key.clone(), manager.clone());

        let id = &self.id;
        let relocated = self
            .reference
            .with_catalog(|catalog| async move { catalog.change_table_manager_location(id, info).await })
            .await;
        if let Err(err) = relocated {
            // The old instance resumes once its migration window expires.
            self.forget_manager(&key, &manager);
            return Err(err);
        }
        old.complete_migration(&self.id).await?;
        self.reference.invalidate(&key);
        tracing::info!(table = %key, from = %wrapper.owner, to = %self.id, "table manager migrated");
        Ok(())
    }

    /// One pass of the liveness monitor; only does work on the catalog host.
    /// Returns the members that failed to answer and were removed.
    pub async fn run_liveness_check(&self) -> CoordResult<Vec<DatabaseId>> {
        let Some(catalog) = self.reference.local_catalog() else {
            return Ok(Vec::new());
        };
        let mut failed = Vec::new();
        for instance in catalog.database_instances().await? {
            if instance.id == self.id {
                continue;
            }
            let alive = matches!(
                self.transport.call(&instance.id, Request::Ping).await,
                Ok(Response::Pong { .. })
            );
            if !alive {
                catalog.suspect_instance_of_failure(&instance.id).await?;
                failed.push(instance.id);
            }
        }
        if catalog.check_table_manager_accessibility(None).await? {
            tracing::info!(node = %self.id, "liveness pass recreated table managers");
        }
        Ok(failed)
    }

    /// Stop serving: the hosted catalog and managers reject further calls.
    pub async fn close(&self) {
        if let Some(catalog) = self.reference.local_catalog() {
            catalog.shutdown();
        }
        let managers: Vec<Arc<TableManager>> = self.managers.read().values().cloned().collect();
        for manager in managers {
            if let Err(err) = manager.shutdown(false).await {
                tracing::debug!(table = %manager.info().key(), error = ?err, "table manager shutdown failed");
            }
        }
    }

    async fn handle_catalog(&self, request: CatalogRequest) -> Response {
        let Some(catalog) = self.reference.local_catalog() else {
            return Response::Error(CoordError::Moved {
                location: self.reference.catalog_location(),
            });
        };
        match request {
            CatalogRequest::AddTableInformation {
                owner,
                info,
                replica_locations,
            } => Response::from_result(
                catalog
                    .add_table_information(&owner, &info, &replica_locations)
                    .await,
                Response::Bool,
            ),
            CatalogRequest::RemoveTableInformation(info) => {
                Response::ack(catalog.remove_table_information(&info).await)
            }
            CatalogRequest::Lookup(info) => Response::from_result(catalog.lookup(&info).await, |w| {
                Response::Descriptor(w.map(|w| w.descriptor()))
            }),
            CatalogRequest::Exists(info) => {
                Response::from_result(catalog.exists(&info).await, Response::Bool)
            }
            CatalogRequest::AllTableManagers => {
                Response::from_result(catalog.all_table_managers().await, Response::Descriptors)
            }
            CatalogRequest::LocalTableManagers(node) => Response::from_result(
                catalog.local_table_managers(&node).await,
                Response::Descriptors,
            ),
            CatalogRequest::PrimaryLocations => Response::from_result(
                catalog.primary_locations().await,
                Response::PrimaryLocations,
            ),
            CatalogRequest::ReplicaLocations(info) => {
                Response::from_result(catalog.replica_locations(&info).await, Response::Locations)
            }
            CatalogRequest::ChangeTableManagerLocation { owner, info } => {
                Response::ack(catalog.change_table_manager_location(&owner, &info).await)
            }
            CatalogRequest::AddTableManagerStateReplica { info, node } => {
                Response::ack(catalog.add_table_manager_state_replica(&info, &node).await)
            }
            CatalogRequest::RemoveTableManagerStateReplica { info, node } => {
                Response::ack(catalog.remove_table_manager_state_replica(&info, &node).await)
            }
            CatalogRequest::CheckTableManagerAccessibility(node) => Response::from_result(
                catalog.check_table_manager_accessibility(node.as_ref()).await,
                Response::Bool,
            ),
            CatalogRequest::RecreateTableManagerIfNotAlive(info) => Response::from_result(
                catalog.recreate_table_manager_if_not_alive(&info).await,
                Response::Bool,
            ),
            CatalogRequest::SuspectInstanceOfFailure(node) => {
                Response::ack(catalog.suspect_instance_of_failure(&node).await)
            }
            CatalogRequest::AddConnectionInformation(node) => {
                Response::from_result(catalog.add_connection_information(&node).await, Response::Id)
            }
            CatalogRequest::RemoveConnectionInformation(node) => {
                Response::ack(catalog.remove_connection_information(&node).await)
            }
            CatalogRequest::DatabaseInstances => {
                Response::from_result(catalog.database_instances().await, Response::Instances)
            }
            CatalogRequest::DatabaseInstance(node) => {
                Response::from_result(catalog.database_instance(&node).await, Response::Instance)
            }
            CatalogRequest::AvailableMachines => {
                Response::from_result(catalog.available_machines().await, Response::Locations)
            }
            CatalogRequest::NewTableSetNumber => {
                Response::from_result(catalog.new_table_set_number().await, Response::Id)
            }
            CatalogRequest::ExportState => {
                Response::from_result(catalog.export_state().await, Response::CatalogState)
            }
            CatalogRequest::PrepareForMigration(target) => {
                Response::ack(catalog.prepare_for_migration(&target).await)
            }
            CatalogRequest::CompleteMigration(target) => {
                Response::ack(catalog.complete_migration(&target).await)
            }
        }
    }

    async fn handle_manager(&self, table: TableKey, request: ManagerRequest) -> Response {
        // Relocated instances stay in the map so callers get their Moved answer.
        let manager = self.managers.read().get(&table).cloned();
        let Some(manager) = manager else {
            return Response::Error(CoordError::Moved { location: None });
        };
        match request {
            ManagerRequest::Ping => Response::ack(manager.ping().await),
            ManagerRequest::GetTableProxy {
                lock_type,
                requestor,
            } => Response::from_result(
                manager.get_table_proxy(lock_type, &requestor).await,
                Response::Proxy,
            ),
            ManagerRequest::TryRequestLock {
                lock_type,
                requestor,
            } => Response::from_result(
                manager.try_request_lock(lock_type, &requestor).await,
                Response::Lock,
            ),
            ManagerRequest::ReleaseLockAndUpdateReplicaState {
                commit,
                requestor,
                outcomes,
                phase,
            } => Response::ack(
                manager
                    .release_lock_and_update_replica_state(commit, &requestor, &outcomes, phase)
                    .await,
            ),
            ManagerRequest::NotifyNodeFailed(node) => {
                Response::ack(manager.notify_node_failed(&node).await)
            }
            ManagerRequest::AddReplica(node) => Response::ack(manager.add_replica(&node).await),
            ManagerRequest::RemoveReplica(node) => {
                Response::ack(manager.remove_replica(&node).await)
            }
            ManagerRequest::ActiveReplicas => {
                Response::from_result(manager.active_replicas().await, Response::Locations)
            }
            ManagerRequest::AllReplicas => {
                Response::from_result(manager.all_replicas().await, Response::Locations)
            }
            ManagerRequest::ExportState => {
                Response::from_result(manager.export_state().await, Response::ManagerState)
            }
            ManagerRequest::PrepareForMigration(target) => {
                Response::ack(manager.prepare_for_migration(&target).await)
            }
            ManagerRequest::CompleteMigration(target) => {
                Response::ack(manager.complete_migration(&target).await)
            }
            ManagerRequest::Shutdown { signal_moved } => {
                Response::ack(manager.shutdown(signal_moved).await)
            }
        }
    }

    async fn handle_node(&self, request: NodeRequest) -> Response {
        match request {
            NodeRequest::RecreateTableManager { info, old_owner } => {
                Response::ack(self.recreate_manager(&info, &old_owner).await.map(|_| ()))
            }
            NodeRequest::StoreManagerState(record) => {
                Response::ack(self.store_manager_state(&record))
            }
            NodeRequest::DeleteManagerState(key) => {
                Response::ack(self.store.delete_manager_state(&key).map_err(CoordError::from))
            }
            NodeRequest::StoreCatalogState(snapshot) => {
                Response::ack(self.store_catalog_state(snapshot))
            }
            NodeRequest::StartCatalog => {
                Response::ack(self.recover_catalog().await.map(|_| ()))
            }
            NodeRequest::CatalogLocation => Response::Location(self.reference.catalog_location()),
            NodeRequest::MigrateCatalogHere => Response::ack(self.migrate_catalog_here().await),
            NodeRequest::MigrateTableManagerHere(info) => {
                Response::ack(self.migrate_table_manager_here(&info).await)
            }
        }
    }

    fn store_manager_state(&self, record: &ManagerStateRecord) -> CoordResult<()> {
        // The owner's live copy is authoritative over pushed copies.
        if self.local_manager(&record.info.key()).is_some() {
            return Ok(());
        }
        self.store.put_manager_state(record)?;
        Ok(())
    }
}

#[async_trait]
impl RequestHandler for Node {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong {
                has_catalog: self.hosts_catalog(),
            },
            Request::Catalog(request) => self.handle_catalog(request).await,
            Request::Manager { table, request } => self.handle_manager(table, request).await,
            Request::Node(request) => self.handle_node(request).await,
        }
    }
}

#[async_trait]
impl ManagerHost for Node {
    fn hosted_manager(&self, key: &TableKey) -> Option<Arc<dyn TableManagerService>> {
        self.local_manager(key)
            .map(|manager| manager as Arc<dyn TableManagerService>)
    }

    async fn recreate_table_manager(
        &self,
        info: &TableInfo,
        old_owner: &DatabaseId,
    ) -> CoordResult<Arc<dyn TableManagerService>> {
        let manager: Arc<dyn TableManagerService> = self.recreate_manager(info, old_owner).await?;
        Ok(manager)
    }
}
