//! Transport-backed service clients.

use std::sync::Arc;

use async_trait::async_trait;

use crate::catalog::CatalogSnapshot;
use crate::error::CoordResult;
use crate::expect_response;
use crate::service::{CatalogService, TableManagerService, TableManagerWrapper};
use crate::store::ManagerStateRecord;
use crate::transport::{CatalogRequest, ManagerRequest, Request, Response, Transport};
use crate::types::{
    CommitPhase, DatabaseId, DatabaseInstanceWrapper, LockRequest, LockType, ReplicaOutcomes,
    TableInfo, TableKey, TableManagerDescriptor, TableProxy,
};

/// Client for a table manager hosted on another node.
pub struct RemoteTableManager {
    info: TableInfo,
    owner: DatabaseId,
    transport: Arc<dyn Transport>,
}

impl RemoteTableManager {
    pub fn new(info: TableInfo, owner: DatabaseId, transport: Arc<dyn Transport>) -> Self {
        Self {
            info,
            owner,
            transport,
        }
    }

    /// Wrap a directory entry with a remote handle.
    pub fn wrapper(descriptor: TableManagerDescriptor, transport: Arc<dyn Transport>) -> TableManagerWrapper {
        let handle: Arc<dyn TableManagerService> = Arc::new(Self::new(
            descriptor.info.clone(),
            descriptor.owner.clone(),
            transport,
        ));
        TableManagerWrapper::new(descriptor.info, descriptor.owner, Some(handle))
    }

    async fn call(&self, request: ManagerRequest) -> CoordResult<Response> {
        self.transport
            .call(
                &self.owner,
                Request::Manager {
                    table: self.info.key(),
                    request,
                },
            )
            .await
    }
}

#[async_trait]
impl TableManagerService for RemoteTableManager {
    fn location(&self) -> DatabaseId {
        self.owner.clone()
    }

    fn table_info(&self) -> TableInfo {
        self.info.clone()
    }

    async fn ping(&self) -> CoordResult<()> {
        let resp = self.call(ManagerRequest::Ping).await?;
        expect_response!(resp, Response::Ack => ())
    }

    async fn get_table_proxy(
        &self,
        lock_type: LockType,
        requestor: &LockRequest,
    ) -> CoordResult<TableProxy> {
        let resp = self
            .call(ManagerRequest::GetTableProxy {
                lock_type,
                requestor: requestor.clone(),
            })
            .await?;
        expect_response!(resp, Response::Proxy(proxy) => proxy)
    }

    async fn try_request_lock(
        &self,
        lock_type: LockType,
        requestor: &LockRequest,
    ) -> CoordResult<LockType> {
        let resp = self
            .call(ManagerRequest::TryRequestLock {
                lock_type,
                requestor: requestor.clone(),
            })
            .await?;
        expect_response!(resp, Response::Lock(lock) => lock)
    }

    async fn release_lock_and_update_replica_state(
        &self,
        commit: bool,
        requestor: &LockRequest,
        outcomes: &ReplicaOutcomes,
        phase: CommitPhase,
    ) -> CoordResult<()> {
        let resp = self
            .call(ManagerRequest::ReleaseLockAndUpdateReplicaState {
                commit,
                requestor: requestor.clone(),
                outcomes: outcomes.clone(),
                phase,
            })
            .await?;
        expect_response!(resp, Response::Ack => ())
    }

    async fn notify_node_failed(&self, node: &DatabaseId) -> CoordResult<()> {
        let resp = self.call(ManagerRequest::NotifyNodeFailed(node.clone())).await?;
        expect_response!(resp, Response::Ack => ())
    }

    async fn add_replica(&self, node: &DatabaseId) -> CoordResult<()> {
        let resp = self.call(ManagerRequest::AddReplica(node.clone())).await?;
        expect_response!(resp, Response::Ack => ())
    }

    async fn remove_replica(&self, node: &DatabaseId) -> CoordResult<()> {
        let resp = self.call(ManagerRequest::RemoveReplica(node.clone())).await?;
        expect_response!(resp, Response::Ack => ())
    }

    async fn active_replicas(&self) -> CoordResult<Vec<DatabaseId>> {
        let resp = self.call(ManagerRequest::ActiveReplicas).await?;
        expect_response!(resp, Response::Locations(nodes) => nodes)
    }

    async fn all_replicas(&self) -> CoordResult<Vec<DatabaseId>> {
        let resp = self.call(ManagerRequest::AllReplicas).await?;
        expect_response!(resp, Response::Locations(nodes) => nodes)
    }

    async fn export_state(&self) -> CoordResult<ManagerStateRecord> {
        let resp = self.call(ManagerRequest::ExportState).await?;
        expect_response!(resp, Response::ManagerState(record) => record)
    }

    async fn prepare_for_migration(&self, new_location: &DatabaseId) -> CoordResult<()> {
        let resp = self
            .call(ManagerRequest::PrepareForMigration(new_location.clone()))
            .await?;
        expect_response!(resp, Response::Ack => ())
    }

    async fn complete_migration(&self, new_location: &DatabaseId) -> CoordResult<()> {
        let resp = self
            .call(ManagerRequest::CompleteMigration(new_location.clone()))
            .await?;
        expect_response!(resp, Response::Ack => ())
    }

    async fn shutdown(&self, signal_moved: bool) -> CoordResult<()> {
        let resp = self.call(ManagerRequest::Shutdown { signal_moved }).await?;
        expect_response!(resp, Response::Ack => ())
    }
}

/// Client for a catalog hosted on another node.
pub struct RemoteCatalog {
    location: DatabaseId,
    transport: Arc<dyn Transport>,
}

impl RemoteCatalog {
    pub fn new(location: DatabaseId, transport: Arc<dyn Transport>) -> Self {
        Self {
            location,
            transport,
        }
    }

    async fn call(&self, request: CatalogRequest) -> CoordResult<Response> {
        self.transport
            .call(&self.location, Request::Catalog(request))
            .await
    }
}

#[async_trait]
impl CatalogService for RemoteCatalog {
    fn location(&self) -> DatabaseId {
        self.location.clone()
    }

    async fn add_table_information(
        &self,
        owner: &DatabaseId,
        info: &TableInfo,
        replica_locations: &[DatabaseId],
    ) -> CoordResult<bool> {
        let resp = self
            .call(CatalogRequest::AddTableInformation {
                owner: owner.clone(),
                info: info.clone(),
                replica_locations: replica_locations.to_vec(),
            })
            .await?;
        expect_response!(resp, Response::Bool(added) => added)
    }

    async fn remove_table_information(&self, info: &TableInfo) -> CoordResult<()> {
        let resp = self
            .call(CatalogRequest::RemoveTableInformation(info.clone()))
            .await?;
        expect_response!(resp, Response::Ack => ())
    }

    async fn lookup(&self, info: &TableInfo) -> CoordResult<Option<TableManagerWrapper>> {
        let resp = self.call(CatalogRequest::Lookup(info.clone())).await?;
        let descriptor = expect_response!(resp, Response::Descriptor(descriptor) => descriptor)?;
        Ok(descriptor.map(|d| RemoteTableManager::wrapper(d, self.transport.clone())))
    }

    async fn exists(&self, info: &TableInfo) -> CoordResult<bool> {
        let resp = self.call(CatalogRequest::Exists(info.clone())).await?;
        expect_response!(resp, Response::Bool(exists) => exists)
    }

    async fn all_table_managers(&self) -> CoordResult<Vec<TableManagerDescriptor>> {
        let resp = self.call(CatalogRequest::AllTableManagers).await?;
        expect_response!(resp, Response::Descriptors(all) => all)
    }

    async fn local_table_managers(
        &self,
        node: &DatabaseId,
    ) -> CoordResult<Vec<TableManagerDescriptor>> {
        let resp = self
            .call(CatalogRequest::LocalTableManagers(node.clone()))
            .await?;
        expect_response!(resp, Response::Descriptors(local) => local)
    }

    async fn primary_locations(&self) -> CoordResult<Vec<(TableKey, DatabaseId)>> {
        let resp = self.call(CatalogRequest::PrimaryLocations).await?;
        expect_response!(resp, Response::PrimaryLocations(primaries) => primaries)
    }

    async fn replica_locations(&self, info: &TableInfo) -> CoordResult<Vec<DatabaseId>> {
        let resp = self
            .call(CatalogRequest::ReplicaLocations(info.clone()))
            .await?;
        expect_response!(resp, Response::Locations(nodes) => nodes)
    }

    async fn change_table_manager_location(
        &self,
        owner: &DatabaseId,
        info: &TableInfo,
    ) -> CoordResult<()> {
        let resp = self
            .call(CatalogRequest::ChangeTableManagerLocation {
                owner: owner.clone(),
                info: info.clone(),
            })
            .await?;
        expect_response!(resp, Response::Ack => ())
    }

    async fn add_table_manager_state_replica(
        &self,
        info: &TableInfo,
        node: &DatabaseId,
    ) -> CoordResult<()> {
        let resp = self
            .call(CatalogRequest::AddTableManagerStateReplica {
                info: info.clone(),
                node: node.clone(),
            })
            .await?;
        expect_response!(resp, Response::Ack => ())
    }

    async fn remove_table_manager_state_replica(
        &self,
        info: &TableInfo,
        node: &DatabaseId,
    ) -> CoordResult<()> {
        let resp = self
            .call(CatalogRequest::RemoveTableManagerStateReplica {
                info: info.clone(),
                node: node.clone(),
            })
            .await?;
        expect_response!(resp, Response::Ack => ())
    }

    async fn check_table_manager_accessibility(
        &self,
        node: Option<&DatabaseId>,
    ) -> CoordResult<bool> {
        let resp = self
            .call(CatalogRequest::CheckTableManagerAccessibility(node.cloned()))
            .await?;
        expect_response!(resp, Response::Bool(recreated) => recreated)
    }

    async fn recreate_table_manager_if_not_alive(&self, info: &TableInfo) -> CoordResult<bool> {
        let resp = self
            .call(CatalogRequest::RecreateTableManagerIfNotAlive(info.clone()))
            .await?;
        expect_response!(resp, Response::Bool(alive) => alive)
    }

    async fn suspect_instance_of_failure(&self, node: &DatabaseId) -> CoordResult<()> {
        let resp = self
            .call(CatalogRequest::SuspectInstanceOfFailure(node.clone()))
            .await?;
        expect_response!(resp, Response::Ack => ())
    }

    async fn add_connection_information(&self, node: &DatabaseId) -> CoordResult<u64> {
        let resp = self
            .call(CatalogRequest::AddConnectionInformation(node.clone()))
            .await?;
        expect_response!(resp, Response::Id(id) => id)
    }

    async fn remove_connection_information(&self, node: &DatabaseId) -> CoordResult<()> {
        let resp = self
            .call(CatalogRequest::RemoveConnectionInformation(node.clone()))
            .await?;
        expect_response!(resp, Response::Ack => ())
    }

    async fn database_instances(&self) -> CoordResult<Vec<DatabaseInstanceWrapper>> {
        let resp = self.call(CatalogRequest::DatabaseInstances).await?;
        expect_response!(resp, Response::Instances(instances) => instances)
    }

    async fn database_instance(
        &self,
        node: &DatabaseId,
    ) -> CoordResult<Option<DatabaseInstanceWrapper>> {
        let resp = self
            .call(CatalogRequest::DatabaseInstance(node.clone()))
            .await?;
        expect_response!(resp, Response::Instance(instance) => instance)
    }

    async fn available_machines(&self) -> CoordResult<Vec<DatabaseId>> {
        let resp = self.call(CatalogRequest::AvailableMachines).await?;
        expect_response!(resp, Response::Locations(nodes) => nodes)
    }

    async fn new_table_set_number(&self) -> CoordResult<u64> {
        let resp = self.call(CatalogRequest::NewTableSetNumber).await?;
        expect_response!(resp, Response::Id(id) => id)
    }

    async fn export_state(&self) -> CoordResult<CatalogSnapshot> {
        let resp = self.call(CatalogRequest::ExportState).await?;
        expect_response!(resp, Response::CatalogState(snapshot) => snapshot)
    }

    async fn prepare_for_migration(&self, new_location: &DatabaseId) -> CoordResult<()> {
        let resp = self
            .call(CatalogRequest::PrepareForMigration(new_location.clone()))
            .await?;
        expect_response!(resp, Response::Ack => ())
    }

    async fn complete_migration(&self, new_location: &DatabaseId) -> CoordResult<()> {
        let resp = self
            .call(CatalogRequest::CompleteMigration(new_location.clone()))
            .await?;
        expect_response!(resp, Response::Ack => ())
    }
}
