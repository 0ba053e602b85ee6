//! Peer-to-peer message contract.
//!
//! Every catalog and table-manager operation is a remotely invocable
//! procedure. Requests and responses are plain serde enums so any byte
//! transport can carry them; the node runtime ships a TCP one and tests use
//! [`LocalTransport`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::catalog::CatalogSnapshot;
use crate::error::{CoordError, CoordResult};
use crate::store::ManagerStateRecord;
use crate::types::{
    CommitPhase, DatabaseId, DatabaseInstanceWrapper, LockRequest, LockType, ReplicaOutcomes,
    TableInfo, TableKey, TableManagerDescriptor, TableProxy,
};

/// Every RPC a node accepts, routed by target service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    /// Liveness check for a node.
    Ping,
    Catalog(CatalogRequest),
    Manager {
        table: TableKey,
        request: ManagerRequest,
    },
    Node(NodeRequest),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CatalogRequest {
    AddTableInformation {
        owner: DatabaseId,
        info: TableInfo,
        replica_locations: Vec<DatabaseId>,
    },
    RemoveTableInformation(TableInfo),
    Lookup(TableInfo),
    Exists(TableInfo),
    AllTableManagers,
    LocalTableManagers(DatabaseId),
    PrimaryLocations,
    ReplicaLocations(TableInfo),
    ChangeTableManagerLocation {
        owner: DatabaseId,
        info: TableInfo,
    },
    AddTableManagerStateReplica {
        info: TableInfo,
        node: DatabaseId,
    },
    RemoveTableManagerStateReplica {
        info: TableInfo,
        node: DatabaseId,
    },
    CheckTableManagerAccessibility(Option<DatabaseId>),
    RecreateTableManagerIfNotAlive(TableInfo),
    SuspectInstanceOfFailure(DatabaseId),
    AddConnectionInformation(DatabaseId),
    RemoveConnectionInformation(DatabaseId),
    DatabaseInstances,
    DatabaseInstance(DatabaseId),
    AvailableMachines,
    NewTableSetNumber,
    ExportState,
    PrepareForMigration(DatabaseId),
    CompleteMigration(DatabaseId),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ManagerRequest {
    Ping,
    GetTableProxy {
        lock_type: LockType,
        requestor: LockRequest,
    },
    TryRequestLock {
        lock_type: LockType,
        requestor: LockRequest,
    },
    ReleaseLockAndUpdateReplicaState {
        commit: bool,
        requestor: LockRequest,
        outcomes: ReplicaOutcomes,
        phase: CommitPhase,
    },
    NotifyNodeFailed(DatabaseId),
    AddReplica(DatabaseId),
    RemoveReplica(DatabaseId),
    ActiveReplicas,
    AllReplicas,
    ExportState,
    PrepareForMigration(DatabaseId),
    CompleteMigration(DatabaseId),
    Shutdown { signal_moved: bool },
}

/// Requests addressed to a node rather than to one of the services it hosts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NodeRequest {
    /// Instantiate a table manager here from the locally persisted copy of its
    /// metadata. Idempotent when a live manager is already hosted.
    RecreateTableManager {
        info: TableInfo,
        old_owner: DatabaseId,
    },
    /// Keep a copy of a table manager's metadata.
    StoreManagerState(ManagerStateRecord),
    DeleteManagerState(TableKey),
    /// Keep a copy of the catalog state.
    StoreCatalogState(CatalogSnapshot),
    /// Start a catalog here from the locally stored copy.
    StartCatalog,
    /// Where this node believes the catalog currently lives.
    CatalogLocation,
    MigrateCatalogHere,
    MigrateTableManagerHere(TableInfo),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Ack,
    Bool(bool),
    Id(u64),
    Lock(LockType),
    Proxy(TableProxy),
    Descriptor(Option<TableManagerDescriptor>),
    Descriptors(Vec<TableManagerDescriptor>),
    Locations(Vec<DatabaseId>),
    Location(Option<DatabaseId>),
    PrimaryLocations(Vec<(TableKey, DatabaseId)>),
    Instances(Vec<DatabaseInstanceWrapper>),
    Instance(Option<DatabaseInstanceWrapper>),
    ManagerState(ManagerStateRecord),
    CatalogState(CatalogSnapshot),
    Pong { has_catalog: bool },
    Error(CoordError),
}

impl Response {
    pub fn from_result<T>(result: CoordResult<T>, wrap: impl FnOnce(T) -> Response) -> Response {
        match result {
            Ok(value) => wrap(value),
            Err(err) => Response::Error(err),
        }
    }

    pub fn ack(result: CoordResult<()>) -> Response {
        Self::from_result(result, |_| Response::Ack)
    }
}

/// Match a response variant or surface the callee's error.
#[macro_export]
macro_rules! expect_response {
    ($resp:expr, $pat:pat => $out:expr) => {
        match $resp {
            $pat => Ok($out),
            $crate::transport::Response::Error(err) => Err(err),
            other => Err($crate::error::CoordError::Protocol(format!(
                "unexpected response {other:?}"
            ))),
        }
    };
}

/// Delivers a request to the node at `target`.
///
/// Failing to reach the node is `CoordError::Unreachable`; errors raised by
/// the callee come back inside `Response::Error`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn call(&self, target: &DatabaseId, request: Request) -> CoordResult<Response>;
}

/// Server side of the contract, implemented by a node.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}

/// In-process transport connecting nodes registered in the same process.
///
/// Messages go through a serde_json round trip so callers and callees never
/// share memory. Nodes can be marked down to simulate partitions.
#[derive(Default)]
pub struct LocalTransport {
    handlers: RwLock<HashMap<DatabaseId, Weak<dyn RequestHandler>>>,
    down: RwLock<BTreeSet<DatabaseId>>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: DatabaseId, handler: Weak<dyn RequestHandler>) {
        self.handlers.write().insert(id, handler);
    }

    pub fn deregister(&self, id: &DatabaseId) {
        self.handlers.write().remove(id);
    }

    /// While down, calls to `id` fail with `Unreachable`.
    pub fn set_down(&self, id: &DatabaseId, down: bool) {
        let mut set = self.down.write();
        if down {
            set.insert(id.clone());
        } else {
            set.remove(id);
        }
    }

    pub fn is_down(&self, id: &DatabaseId) -> bool {
        self.down.read().contains(id)
    }
}

fn wire_copy<T: Serialize + serde::de::DeserializeOwned>(value: &T) -> CoordResult<T> {
    let bytes = serde_json::to_vec(value).map_err(|err| CoordError::Protocol(err.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|err| CoordError::Protocol(err.to_string()))
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, target: &DatabaseId, request: Request) -> CoordResult<Response> {
        if self.is_down(target) {
            return Err(CoordError::unreachable(target, "node marked down"));
        }
        let handler = self
            .handlers
            .read()
            .get(target)
            .and_then(Weak::upgrade)
            .ok_or_else(|| CoordError::unreachable(target, "no such node"))?;
        let request = wire_copy(&request)?;
        let response = handler.handle(request).await;
        // The node may have gone down while the call was in flight.
        if self.is_down(target) {
            return Err(CoordError::unreachable(target, "node marked down"));
        }
        wire_copy(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: Request) -> Response {
            match request {
                Request::Ping => Response::Pong { has_catalog: false },
                _ => Response::Error(CoordError::NotFound("echo".into())),
            }
        }
    }

    #[tokio::test]
    async fn local_transport_routes_and_injects_faults() {
        let transport = LocalTransport::new();
        let id = DatabaseId::new("127.0.0.1:1", "a");
        let handler: Arc<dyn RequestHandler> = Arc::new(Echo);
        transport.register(id.clone(), Arc::downgrade(&handler));

        let resp = transport.call(&id, Request::Ping).await.expect("call");
        let has_catalog: CoordResult<bool> =
            expect_response!(resp, Response::Pong { has_catalog } => has_catalog);
        assert_eq!(has_catalog, Ok(false));

        let resp = transport
            .call(&id, Request::Catalog(CatalogRequest::AllTableManagers))
            .await
            .expect("call");
        let decoded: CoordResult<()> = expect_response!(resp, Response::Ack => ());
        assert_eq!(decoded, Err(CoordError::NotFound("echo".into())));

        transport.set_down(&id, true);
        let err = transport.call(&id, Request::Ping).await.expect_err("down");
        assert!(err.is_unreachable());

        transport.set_down(&id, false);
        drop(handler);
        let err = transport.call(&id, Request::Ping).await.expect_err("dropped");
        assert!(err.is_unreachable());
    }
}
