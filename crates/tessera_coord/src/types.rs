//! Shared value types for the coordination layer.
//!
//! These types travel between nodes, so everything here is plain data with
//! serde derives. Handles to live services are kept out of this module; see
//! `service.rs` for the wrappers that carry them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Location of a database instance: its network address plus local storage path.
///
/// Serialized as `address/path` so it can be used as a JSON map key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatabaseId {
    address: String,
    path: String,
}

impl DatabaseId {
    pub fn new(address: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            path: path.into(),
        }
    }

    /// Network address (`host:port`) used by the transport.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn host(&self) -> &str {
        match self.address.rsplit_once(':') {
            Some((host, _)) => host,
            None => &self.address,
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.address
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.path)
    }
}

impl FromStr for DatabaseId {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let (address, path) = raw.split_once('/').unwrap_or((raw, ""));
        if address.is_empty() {
            return Err(format!("invalid database id '{raw}': missing address"));
        }
        Ok(Self::new(address, path))
    }
}

impl TryFrom<String> for DatabaseId {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<DatabaseId> for String {
    fn from(id: DatabaseId) -> Self {
        id.to_string()
    }
}

/// Generic identity of a table: schema plus table name, independent of host.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableKey {
    pub schema: String,
    pub table: String,
}

impl TableKey {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Full description of a table as known to the catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema: String,
    /// Empty when the value addresses an entire schema.
    pub table: String,
    #[serde(default)]
    pub host: Option<DatabaseId>,
    #[serde(default)]
    pub modification_id: u64,
    /// Colocated table group this table belongs to.
    #[serde(default)]
    pub table_set: u64,
}

impl TableInfo {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            host: None,
            modification_id: 0,
            table_set: 0,
        }
    }

    /// Address every table in `schema`.
    pub fn schema_wide(schema: impl Into<String>) -> Self {
        Self::new(schema, "")
    }

    pub fn with_host(mut self, host: DatabaseId) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_table_set(mut self, table_set: u64) -> Self {
        self.table_set = table_set;
        self
    }

    pub fn key(&self) -> TableKey {
        TableKey::new(self.schema.clone(), self.table.clone())
    }

    pub fn is_schema_wide(&self) -> bool {
        self.table.is_empty()
    }

    /// Schema and table name match; host and counters are ignored.
    pub fn generic_eq(&self, other: &TableInfo) -> bool {
        self.schema == other.schema && self.table == other.table
    }
}

impl fmt::Display for TableInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{}.{}@{}", self.schema, self.table, host),
            None => write!(f, "{}.{}", self.schema, self.table),
        }
    }
}

/// Lock intents understood by a table manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    None,
    Read,
    Write,
    Create,
    /// Granted as `Write` after the update counter is reset.
    Drop,
}

impl LockType {
    /// Intent the locking table actually arbitrates on.
    pub fn effective(self) -> LockType {
        match self {
            LockType::Drop => LockType::Write,
            other => other,
        }
    }

    pub fn is_exclusive(self) -> bool {
        matches!(self.effective(), LockType::Write | LockType::Create)
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockType::None => "none",
            LockType::Read => "read",
            LockType::Write => "write",
            LockType::Create => "create",
            LockType::Drop => "drop",
        };
        f.write_str(name)
    }
}

/// Identity of a lock requester: the requesting node plus a session on it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockRequest {
    pub node: DatabaseId,
    pub session: u64,
}

impl LockRequest {
    pub fn new(node: DatabaseId, session: u64) -> Self {
        Self { node, session }
    }
}

impl fmt::Display for LockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node, self.session)
    }
}

/// Per-replica outcome of a write: `true` when the replica applied it.
pub type ReplicaOutcomes = BTreeMap<DatabaseId, bool>;

/// Result of `get_table_proxy`: the lock that was granted and the replicas
/// the caller must operate on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProxy {
    pub lock_granted: LockType,
    pub table: TableInfo,
    pub requestor: LockRequest,
    /// Primary copy first when one is known.
    pub replicas: Vec<DatabaseId>,
    /// Update id the caller's writes will carry once committed.
    pub update_id: u64,
}

impl TableProxy {
    pub fn all_succeeded(&self) -> ReplicaOutcomes {
        self.replicas.iter().map(|r| (r.clone(), true)).collect()
    }
}

/// Which report of a commit is being delivered to the table manager.
///
/// A two-phase (asynchronous) commit first reports the replicas that committed
/// synchronously with `Partial`, keeping the lock, and later reports the
/// remaining replicas with `Deferred`, which releases it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitPhase {
    Complete,
    Partial,
    Deferred,
}

impl CommitPhase {
    /// The lock stays held after this report.
    pub fn is_asynchronous(self) -> bool {
        matches!(self, CommitPhase::Partial)
    }

    /// Replicas missing from the report are demoted.
    pub fn is_first_phase(self) -> bool {
        !matches!(self, CommitPhase::Deferred)
    }
}

/// Cluster membership record kept by the catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInstanceWrapper {
    pub id: DatabaseId,
    pub connection_id: u64,
    /// False once the catalog has evidence the node is unreachable.
    pub active: bool,
}

/// One replica tracked by a table manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaEntry {
    pub node: DatabaseId,
    pub update_id: u64,
    /// Cleared when the node is reported failed; set again by a successful write.
    pub alive: bool,
    pub primary: bool,
}

/// Serializable view of a table-manager directory entry (no live handle).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableManagerDescriptor {
    pub info: TableInfo,
    pub owner: DatabaseId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_id_parses_address_and_path() {
        let id: DatabaseId = "10.0.0.5:7100/var/lib/db".parse().expect("parse");
        assert_eq!(id.address(), "10.0.0.5:7100");
        assert_eq!(id.path(), "var/lib/db");
        assert_eq!(id.host(), "10.0.0.5");
        assert_eq!(id.port(), Some(7100));
        assert_eq!(id.to_string(), "10.0.0.5:7100/var/lib/db");
        assert!("/only-path".parse::<DatabaseId>().is_err());
    }

    #[test]
    fn database_id_is_usable_as_json_map_key() {
        let mut outcomes = ReplicaOutcomes::new();
        outcomes.insert(DatabaseId::new("127.0.0.1:1", "a"), true);
        outcomes.insert(DatabaseId::new("127.0.0.1:2", "b"), false);
        let json = serde_json::to_string(&outcomes).expect("encode");
        let decoded: ReplicaOutcomes = serde_json::from_str(&json).expect("decode");
        assert_eq!(decoded, outcomes);
    }

    #[test]
    fn generic_equality_ignores_host_and_counters() {
        let a = TableInfo::new("public", "orders").with_host(DatabaseId::new("h:1", "x"));
        let mut b = TableInfo::new("public", "orders");
        b.modification_id = 9;
        assert!(a.generic_eq(&b));
        assert_eq!(a.key(), b.key());
        assert!(!a.generic_eq(&TableInfo::new("public", "lines")));
    }

    #[test]
    fn drop_arbitrates_as_write() {
        assert_eq!(LockType::Drop.effective(), LockType::Write);
        assert!(LockType::Drop.is_exclusive());
        assert!(LockType::Create.is_exclusive());
        assert!(!LockType::Read.is_exclusive());
    }
}
