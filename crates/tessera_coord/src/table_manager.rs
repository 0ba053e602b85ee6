//! Per-table manager: owns the table's locking table and replica state.
//!
//! A manager lives on exactly one node at a time. Its metadata (replica set
//! and update ids) is persisted locally and pushed to a small set of other
//! nodes so the catalog can recreate it elsewhere when its host fails.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::CoordConfig;
use crate::error::{CoordError, CoordResult};
use crate::expect_response;
use crate::locking::LockingTable;
use crate::migration::{MigrationState, MigrationStatus};
use crate::reference::CatalogReference;
use crate::replica::ReplicaManager;
use crate::service::TableManagerService;
use crate::store::{ManagerStateRecord, MetadataStore};
use crate::transport::{NodeRequest, Request, Response, Transport};
use crate::types::{
    CommitPhase, DatabaseId, LockRequest, LockType, ReplicaOutcomes, TableInfo, TableProxy,
};

#[derive(Clone, Copy, Debug)]
struct IssuedLock {
    lock_type: LockType,
    update_id: u64,
}

#[derive(Default)]
struct ManagerState {
    replicas: ReplicaManager,
    issued: BTreeMap<LockRequest, IssuedLock>,
    /// Nodes other than this one holding a copy of the manager metadata.
    metadata_replicas: BTreeSet<DatabaseId>,
}

/// Shared handles a manager needs from its hosting node.
#[derive(Clone)]
pub struct ManagerContext {
    pub location: DatabaseId,
    pub config: CoordConfig,
    pub catalog: Arc<CatalogReference>,
    pub store: Arc<dyn MetadataStore>,
    pub transport: Arc<dyn Transport>,
}

/// Authority for one table: grants locks, issues update ids and tracks
/// which replicas are current.
pub struct TableManager {
    info: TableInfo,
    ctx: ManagerContext,
    locks: LockingTable,
    state: Mutex<ManagerState>,
    migration: MigrationState,
}

impl TableManager {
    /// A manager for a table that does not exist yet (CREATE pending).
    pub fn new(info: TableInfo, ctx: ManagerContext) -> Self {
        Self::with_replicas(info, ReplicaManager::new(), BTreeSet::new(), ctx)
    }

    fn with_replicas(
        mut info: TableInfo,
        replicas: ReplicaManager,
        metadata_replicas: BTreeSet<DatabaseId>,
        ctx: ManagerContext,
    ) -> Self {
        info.host = Some(ctx.location.clone());
        Self {
            locks: LockingTable::new(info.key()),
            migration: MigrationState::new(ctx.config.migration_timeout),
            state: Mutex::new(ManagerState {
                replicas,
                issued: BTreeMap::new(),
                metadata_replicas,
            }),
            info,
            ctx,
        }
    }

    /// Adopt state exported by the previous owner during a migration.
    pub fn from_record(record: ManagerStateRecord, ctx: ManagerContext) -> Self {
        let replicas = ReplicaManager::from_entries(record.replicas);
        Self::with_replicas(record.info, replicas, BTreeSet::new(), ctx)
    }

    /// Rebuild a manager from the locally persisted copy of its metadata after
    /// the previous owner became unreachable.
    ///
    /// Only `old_owner` is pinged for liveness; the other replica locations are
    /// taken as recorded and corrected by later writes.
    pub async fn recreate(
        info: &TableInfo,
        old_owner: &DatabaseId,
        ctx: ManagerContext,
    ) -> CoordResult<Self> {
        let key = info.key();
        let record = ctx.store.manager_state(&key)?.ok_or_else(|| {
            tracing::error!(table = %key, "no local copy of table manager state");
            CoordError::InconsistentState(format!("no persisted manager state for {key}"))
        })?;
        let mut replicas = ReplicaManager::from_entries(record.replicas);
        if replicas.is_empty() {
            tracing::error!(table = %key, "persisted manager state has no replicas");
            return Err(CoordError::InconsistentState(format!(
                "table {key} has no replicas"
            )));
        }

        if replicas.contains(old_owner) && old_owner != &ctx.location {
            let alive = matches!(
                ctx.transport.call(old_owner, Request::Ping).await,
                Ok(Response::Pong { .. })
            );
            if !alive {
                replicas.mark_failed(old_owner);
            }
        }

        let manager = Self::with_replicas(record.info, replicas, BTreeSet::new(), ctx);
        tracing::info!(
            table = %key,
            old_owner = %old_owner,
            active = manager.state.lock().replicas.active_replicas().len(),
            "recreated table manager from persisted state"
        );
        Ok(manager)
    }

    /// Table identity, including the table set number assigned at CREATE.
    pub fn info(&self) -> &TableInfo {
        &self.info
    }

    pub fn migration_status(&self) -> MigrationStatus {
        self.migration.status()
    }

    pub fn is_usable(&self) -> bool {
        self.migration.is_usable()
    }

    fn record(&self) -> ManagerStateRecord {
        let state = self.state.lock();
        ManagerStateRecord {
            info: self.info.clone(),
            replicas: state.replicas.entries(),
        }
    }

    /// Persist the metadata locally and push it to the other metadata replicas,
    /// preferring nodes that already hold a copy, then data replica hosts,
    /// then any other live node.
    pub async fn persist_state(&self) -> CoordResult<()> {
        let record = self.record();
        self.ctx.store.put_manager_state(&record)?;

        let wanted = self.ctx.config.manager_replication_factor.saturating_sub(1);
        if wanted == 0 {
            return Ok(());
        }
        let (existing, candidates) = {
            let state = self.state.lock();
            let existing = state.metadata_replicas.clone();
            let mut candidates: Vec<DatabaseId> = existing.iter().cloned().collect();
            for node in state.replicas.all_replicas() {
                if !candidates.contains(&node) {
                    candidates.push(node);
                }
            }
            candidates.retain(|node| node != &self.ctx.location);
            (existing, candidates)
        };

        let mut stored = BTreeSet::new();
        let mut failed = Vec::new();
        let mut tried: BTreeSet<DatabaseId> = candidates.iter().cloned().collect();
        self.push_state(&record, candidates, wanted, &mut stored, &mut failed)
            .await;

        if stored.len() < wanted {
            // Data replica hosts alone are not enough; spread to other live nodes.
            match self.ctx.catalog.available_machines().await {
                Ok(machines) => {
                    let extra: Vec<DatabaseId> = machines
                        .into_iter()
                        .filter(|node| node != &self.ctx.location && tried.insert(node.clone()))
                        .collect();
                    self.push_state(&record, extra, wanted, &mut stored, &mut failed)
                        .await;
                }
                Err(err) => {
                    tracing::warn!(table = %self.info.key(), error = ?err, "could not list available machines");
                }
            }
        }
        if stored.len() < wanted {
            tracing::warn!(
                table = %self.info.key(),
                wanted,
                stored = stored.len(),
                "not enough nodes to hold table manager state"
            );
        }

        for node in stored.difference(&existing) {
            if let Err(err) = self
                .ctx
                .catalog
                .add_table_manager_state_replica(&self.info, node)
                .await
            {
                tracing::warn!(table = %self.info.key(), node = %node, error = ?err, "failed to record manager state replica");
            }
        }
        for node in failed.iter().filter(|node| existing.contains(*node)) {
            if let Err(err) = self
                .ctx
                .catalog
                .remove_table_manager_state_replica(&self.info, node)
                .await
            {
                tracing::debug!(table = %self.info.key(), node = %node, error = ?err, "failed to forget manager state replica");
            }
        }

        let mut state = self.state.lock();
        for node in &failed {
            state.metadata_replicas.remove(node);
        }
        state.metadata_replicas.extend(stored);
        Ok(())
    }

    /// Send `record` to `targets` in order until `wanted` copies are held.
    async fn push_state(
        &self,
        record: &ManagerStateRecord,
        targets: Vec<DatabaseId>,
        wanted: usize,
        stored: &mut BTreeSet<DatabaseId>,
        failed: &mut Vec<DatabaseId>,
    ) {
        for target in targets {
            if stored.len() >= wanted {
                break;
            }
            let request = Request::Node(NodeRequest::StoreManagerState(record.clone()));
            let result = match self.ctx.transport.call(&target, request).await {
                Ok(resp) => expect_response!(resp, Response::Ack => ()),
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {
                    stored.insert(target);
                }
                Err(err) => {
                    tracing::warn!(
                        table = %self.info.key(),
                        target = %target,
                        error = ?err,
                        "failed to replicate table manager state"
                    );
                    failed.push(target);
                }
            }
        }
    }

    /// Choose the replica set for CREATE: the requestor first, then the
    /// least-loaded live nodes until the replication factor is met.
    async fn place_new_replicas(&self, requestor: &DatabaseId) -> Vec<DatabaseId> {
        let factor = self.ctx.config.replication_factor;
        let mut chosen = vec![requestor.clone()];
        if factor <= 1 {
            return chosen;
        }
        match self.ctx.catalog.available_machines().await {
            Ok(machines) => {
                for machine in machines {
                    if chosen.len() >= factor {
                        break;
                    }
                    if !chosen.contains(&machine) {
                        chosen.push(machine);
                    }
                }
            }
            Err(err) => {
                tracing::warn!(table = %self.info.key(), error = ?err, "could not list available machines");
            }
        }
        if chosen.len() < factor {
            tracing::warn!(
                table = %self.info.key(),
                wanted = factor,
                placed = chosen.len(),
                "not enough live nodes to meet the replication factor"
            );
        }
        chosen
    }

    fn relocation_error(&self) -> CoordError {
        match self.migration.check_relocation() {
            Err(err) => err,
            Ok(()) => CoordError::Shutdown,
        }
    }
}

#[async_trait]
impl TableManagerService for TableManager {
    fn location(&self) -> DatabaseId {
        self.ctx.location.clone()
    }

    fn table_info(&self) -> TableInfo {
        self.info.clone()
    }

    async fn ping(&self) -> CoordResult<()> {
        self.migration.check_relocation()
    }

    async fn get_table_proxy(
        &self,
        lock_type: LockType,
        requestor: &LockRequest,
    ) -> CoordResult<TableProxy> {
        self.migration.check()?;
        if lock_type != LockType::Create && self.state.lock().replicas.is_empty() {
            tracing::error!(table = %self.info.key(), lock = %lock_type, "table has no replicas");
            return Err(CoordError::InconsistentState(format!(
                "table {} has no replicas",
                self.info.key()
            )));
        }

        let granted = self.locks.request_lock(lock_type, requestor).await;
        if granted == LockType::None && lock_type != LockType::None {
            return Err(self.relocation_error());
        }
        if let Err(err) = self.migration.check() {
            self.locks.release_lock(requestor);
            return Err(err);
        }

        let placed = if lock_type == LockType::Create {
            Some(self.place_new_replicas(&requestor.node).await)
        } else {
            None
        };

        let mut state = self.state.lock();
        let current = state.replicas.current_update_id();
        let (replicas, update_id) = match lock_type {
            LockType::Create => (placed.unwrap_or_default(), current + 1),
            LockType::Write => (state.replicas.all_replicas(), current + 1),
            LockType::Drop => {
                state.replicas.reset_update_ids();
                (state.replicas.all_replicas(), 1)
            }
            LockType::Read | LockType::None => (state.replicas.active_replicas(), current),
        };
        if lock_type != LockType::None {
            state.issued.insert(
                requestor.clone(),
                IssuedLock {
                    lock_type,
                    update_id,
                },
            );
        }
        drop(state);

        tracing::debug!(
            table = %self.info.key(),
            requestor = %requestor,
            lock = %granted,
            replicas = replicas.len(),
            update_id,
            "table proxy issued"
        );
        Ok(TableProxy {
            lock_granted: granted,
            table: self.info.clone(),
            requestor: requestor.clone(),
            replicas,
            update_id,
        })
    }

    async fn try_request_lock(
        &self,
        lock_type: LockType,
        requestor: &LockRequest,
    ) -> CoordResult<LockType> {
        self.migration.check()?;
        Ok(self.locks.try_request_lock(lock_type, requestor))
    }

    async fn release_lock_and_update_replica_state(
        &self,
        commit: bool,
        requestor: &LockRequest,
        outcomes: &ReplicaOutcomes,
        phase: CommitPhase,
    ) -> CoordResult<()> {
        self.migration.check_relocation()?;
        let held = self.locks.peek_at_lock_granted(requestor);

        let (changed, persist) = {
            let mut state = self.state.lock();
            let issued = state.issued.get(requestor).copied();
            if held == LockType::None && issued.is_none() {
                tracing::error!(table = %self.info.key(), requestor = %requestor, "release without a held lock");
                return Err(CoordError::InconsistentState(format!(
                    "no lock held by {requestor} on {}",
                    self.info.key()
                )));
            }
            let writes = issued.map(|i| i.lock_type.is_exclusive()).unwrap_or(false);
            let changed = match issued {
                Some(issued) if writes => {
                    state.replicas.complete_update(commit, issued.update_id, outcomes)
                }
                _ => BTreeSet::new(),
            };
            if !phase.is_asynchronous() {
                state.issued.remove(requestor);
            }
            let persist = writes && commit && outcomes.values().any(|ok| *ok);
            (changed, persist)
        };

        if !changed.is_empty() {
            tracing::info!(
                table = %self.info.key(),
                changed = ?changed,
                first_phase = phase.is_first_phase(),
                "replica activity changed"
            );
        }
        let persisted = if persist {
            self.persist_state().await
        } else {
            Ok(())
        };
        if !phase.is_asynchronous() {
            self.locks.release_lock(requestor);
        }
        persisted
    }

    async fn notify_node_failed(&self, node: &DatabaseId) -> CoordResult<()> {
        self.migration.check_relocation()?;
        let changed = {
            let mut state = self.state.lock();
            state.metadata_replicas.remove(node);
            state.replicas.mark_failed(node)
        };
        if changed {
            tracing::info!(table = %self.info.key(), node = %node, "replica marked failed");
            self.persist_state().await?;
        }
        Ok(())
    }

    async fn add_replica(&self, node: &DatabaseId) -> CoordResult<()> {
        self.migration.check()?;
        {
            let mut state = self.state.lock();
            let current = state.replicas.current_update_id();
            state.replicas.add_replica(node.clone(), current);
        }
        self.persist_state().await
    }

    async fn remove_replica(&self, node: &DatabaseId) -> CoordResult<()> {
        self.migration.check()?;
        let removed = self.state.lock().replicas.remove_replica(node);
        if !removed {
            return Err(CoordError::NotFound(format!(
                "replica {node} of {}",
                self.info.key()
            )));
        }
        self.persist_state().await
    }

    async fn active_replicas(&self) -> CoordResult<Vec<DatabaseId>> {
        self.migration.check()?;
        Ok(self.state.lock().replicas.active_replicas())
    }

    async fn all_replicas(&self) -> CoordResult<Vec<DatabaseId>> {
        self.migration.check()?;
        Ok(self.state.lock().replicas.all_replicas())
    }

    async fn export_state(&self) -> CoordResult<ManagerStateRecord> {
        self.migration.check_relocation()?;
        Ok(self.record())
    }

    async fn prepare_for_migration(&self, new_location: &DatabaseId) -> CoordResult<()> {
        self.migration.prepare_for_migration(new_location)?;
        // Locks and issued update ids do not travel with the exported state.
        let outstanding = self.state.lock().issued.len();
        let holders = self.locks.holders().len();
        if holders > 0 || outstanding > 0 {
            self.migration.abort_migration();
            tracing::debug!(
                table = %self.info.key(),
                target = %new_location,
                holders,
                outstanding,
                "table manager busy; migration refused"
            );
            return Err(CoordError::MigrationInProgress);
        }
        tracing::info!(table = %self.info.key(), target = %new_location, "table manager migration prepared");
        Ok(())
    }

    async fn complete_migration(&self, new_location: &DatabaseId) -> CoordResult<()> {
        self.migration.complete_migration(new_location)?;
        self.locks.close();
        tracing::info!(table = %self.info.key(), target = %new_location, "table manager moved");
        Ok(())
    }

    async fn shutdown(&self, signal_moved: bool) -> CoordResult<()> {
        self.migration.shutdown(signal_moved);
        self.locks.close();
        Ok(())
    }
}
