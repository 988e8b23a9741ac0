//! Collaborator interfaces: transport sessions to storage nodes and the
//! object finder that maps keys to their owning node.

use std::sync::Arc;

use crate::rpc::LogState;
use crate::utils::CurpError;

use async_trait::async_trait;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Stable identity of one transport session. A reconnect to the same node
/// after a failure yields a new session and hence a new ID.
pub type SessionId = u64;

/// Table identifier type.
pub type TableId = u64;

/// Key hash type, identifying the tablet a key belongs to.
pub type KeyHash = u64;

/// Transaction identifier type.
pub type TxId = u64;

/// Reply status codes returned by storage nodes.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum Status {
    /// Request processed.
    Ok,

    /// Request was already applied (survived the crash or recovered from a
    /// witness); for a retried write this still means success.
    StaleRpc,

    /// The node does not own the tablet anymore.
    UnknownTablet,

    /// The node asks the client to try again later.
    Retry,

    /// Any other server-side failure.
    InternalError,
}

/// Reply to a SyncLog request.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct SyncLogReply {
    /// Reply status.
    pub status: Status,

    /// Node's log state after syncing.
    pub log_state: LogState,
}

/// Reply to a retried write.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct RetryReply {
    /// Reply status.
    pub status: Status,
}

/// Transport session to one storage node. Implementations must report a
/// request that got no answer as `ErrorKind::Unreachable`, distinct from a
/// reply carrying a failure status.
#[async_trait]
pub trait Session: Send + Sync {
    /// Gets the stable identity of this session.
    fn id(&self) -> SessionId;

    /// Asks the node to replicate its log up to at least `goal` and returns
    /// its resulting log state.
    async fn sync_log(&self, goal: LogState) -> Result<SyncLogReply, CurpError>;

    /// Sends a raw client request and waits for the reply header.
    async fn send_request(&self, req: Bytes) -> Result<RetryReply, CurpError>;
}

/// Shared handle to a session.
pub type SessionRef = Arc<dyn Session>;

/// Directory collaborator resolving which node currently owns a key.
#[async_trait]
pub trait ObjectFinder: Send + Sync {
    /// Returns a session to the current owner of `(table_id, key_hash)`.
    async fn lookup(
        &self,
        table_id: TableId,
        key_hash: KeyHash,
    ) -> Result<SessionRef, CurpError>;

    /// Invalidates the cached mapping for `(table_id, key_hash)` after a
    /// failed send, so that the next lookup re-resolves it.
    fn flush(&self, table_id: TableId, key_hash: KeyHash);
}
