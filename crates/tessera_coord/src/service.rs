//! Service contracts for the two singletons.
//!
//! Each contract has an in-process implementation (`Catalog`,
//! `TableManager`) and a transport-backed client (`RemoteCatalog`,
//! `RemoteTableManager`). Callers hold `Arc<dyn ...>` and never branch on
//! where the instance lives.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::catalog::CatalogSnapshot;
use crate::error::CoordResult;
use crate::store::ManagerStateRecord;
use crate::types::{
    CommitPhase, DatabaseId, DatabaseInstanceWrapper, LockRequest, LockType, ReplicaOutcomes,
    TableInfo, TableKey, TableManagerDescriptor, TableProxy,
};

/// Per-table lock and replica authority, local or behind a transport.
#[async_trait]
pub trait TableManagerService: Send + Sync {
    /// Node hosting this manager.
    fn location(&self) -> DatabaseId;

    fn table_info(&self) -> TableInfo;

    /// Liveness check; fails with `Moved`/`Shutdown` for relocated instances.
    async fn ping(&self) -> CoordResult<()>;

    async fn get_table_proxy(
        &self,
        lock_type: LockType,
        requestor: &LockRequest,
    ) -> CoordResult<TableProxy>;

    /// Non-blocking lock attempt; `LockType::None` when incompatible.
    async fn try_request_lock(
        &self,
        lock_type: LockType,
        requestor: &LockRequest,
    ) -> CoordResult<LockType>;

    async fn release_lock_and_update_replica_state(
        &self,
        commit: bool,
        requestor: &LockRequest,
        outcomes: &ReplicaOutcomes,
        phase: CommitPhase,
    ) -> CoordResult<()>;

    async fn notify_node_failed(&self, node: &DatabaseId) -> CoordResult<()>;

    async fn add_replica(&self, node: &DatabaseId) -> CoordResult<()>;

    async fn remove_replica(&self, node: &DatabaseId) -> CoordResult<()>;

    async fn active_replicas(&self) -> CoordResult<Vec<DatabaseId>>;

    async fn all_replicas(&self) -> CoordResult<Vec<DatabaseId>>;

    async fn export_state(&self) -> CoordResult<ManagerStateRecord>;

    /// Stop admitting calls ahead of a move to `new_location`. Fails with
    /// `MigrationInProgress` while any lock is held or outstanding.
    async fn prepare_for_migration(&self, new_location: &DatabaseId) -> CoordResult<()>;

    async fn complete_migration(&self, new_location: &DatabaseId) -> CoordResult<()>;

    async fn shutdown(&self, signal_moved: bool) -> CoordResult<()>;
}

/// Catalog directory entry: table, owning node and, when established, a
/// handle to the manager.
#[derive(Clone)]
pub struct TableManagerWrapper {
    pub info: TableInfo,
    pub owner: DatabaseId,
    pub handle: Option<Arc<dyn TableManagerService>>,
}

impl TableManagerWrapper {
    pub fn new(info: TableInfo, owner: DatabaseId, handle: Option<Arc<dyn TableManagerService>>) -> Self {
        Self {
            info,
            owner,
            handle,
        }
    }

    pub fn key(&self) -> TableKey {
        self.info.key()
    }

    pub fn descriptor(&self) -> TableManagerDescriptor {
        TableManagerDescriptor {
            info: self.info.clone(),
            owner: self.owner.clone(),
        }
    }
}

impl fmt::Debug for TableManagerWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableManagerWrapper")
            .field("info", &self.info)
            .field("owner", &self.owner)
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}

#[async_trait]
pub trait CatalogService: Send + Sync {
    /// Node hosting this catalog.
    fn location(&self) -> DatabaseId;

    /// Register a new table. Returns false when the table already exists.
    async fn add_table_information(
        &self,
        owner: &DatabaseId,
        info: &TableInfo,
        replica_locations: &[DatabaseId],
    ) -> CoordResult<bool>;

    /// Drop one table, or every table of the schema when the table name is empty.
    async fn remove_table_information(&self, info: &TableInfo) -> CoordResult<()>;

    async fn lookup(&self, info: &TableInfo) -> CoordResult<Option<TableManagerWrapper>>;

    async fn exists(&self, info: &TableInfo) -> CoordResult<bool>;

    async fn all_table_managers(&self) -> CoordResult<Vec<TableManagerDescriptor>>;

    async fn local_table_managers(
        &self,
        node: &DatabaseId,
    ) -> CoordResult<Vec<TableManagerDescriptor>>;

    async fn primary_locations(&self) -> CoordResult<Vec<(TableKey, DatabaseId)>>;

    async fn replica_locations(&self, info: &TableInfo) -> CoordResult<Vec<DatabaseId>>;

    async fn change_table_manager_location(
        &self,
        owner: &DatabaseId,
        info: &TableInfo,
    ) -> CoordResult<()>;

    async fn add_table_manager_state_replica(
        &self,
        info: &TableInfo,
        node: &DatabaseId,
    ) -> CoordResult<()>;

    async fn remove_table_manager_state_replica(
        &self,
        info: &TableInfo,
        node: &DatabaseId,
    ) -> CoordResult<()>;

    /// Ping every manager (or only those on `node`) and recreate the dead
    /// ones. Returns whether any manager was recreated.
    async fn check_table_manager_accessibility(&self, node: Option<&DatabaseId>)
        -> CoordResult<bool>;

    /// True when the manager is alive or was successfully recreated.
    async fn recreate_table_manager_if_not_alive(&self, info: &TableInfo) -> CoordResult<bool>;

    async fn suspect_instance_of_failure(&self, node: &DatabaseId) -> CoordResult<()>;

    async fn add_connection_information(&self, node: &DatabaseId) -> CoordResult<u64>;

    async fn remove_connection_information(&self, node: &DatabaseId) -> CoordResult<()>;

    async fn database_instances(&self) -> CoordResult<Vec<DatabaseInstanceWrapper>>;

    async fn database_instance(
        &self,
        node: &DatabaseId,
    ) -> CoordResult<Option<DatabaseInstanceWrapper>>;

    /// Live nodes, least loaded first.
    async fn available_machines(&self) -> CoordResult<Vec<DatabaseId>>;

    async fn new_table_set_number(&self) -> CoordResult<u64>;

    async fn export_state(&self) -> CoordResult<CatalogSnapshot>;

    async fn prepare_for_migration(&self, new_location: &DatabaseId) -> CoordResult<()>;

    async fn complete_migration(&self, new_location: &DatabaseId) -> CoordResult<()>;
}
