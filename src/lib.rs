//! Client-side durability tracking for unsynced writes to a replicated
//! in-memory storage cluster.
//!
//! Storage nodes may acknowledge a write before it is replicated to backups.
//! The `UnsyncedRpcTracker` remembers every such write per target node,
//! learns of replication progress through log state reports, fires
//! completion callbacks once writes are durable, offers blocking and
//! asynchronous barriers, and replays writes that may have been lost when a
//! node is suspected to have crashed.

#[macro_use]
mod utils;

mod rpc;
mod tracker;

pub use utils::{logger_init, CurpError, ErrorKind};

pub use rpc::{
    Asynchrony, BufferPool, ClientRequest, KeyHash, LogState, ObjectFinder,
    RequestPool, RetryReply, RetryUnsyncedRpc, Session, SessionId,
    SessionRef, Status, SyncLogReply, SyncRpc, TableId, TxId,
};

pub use tracker::{
    Callback, TrackerConfig, TransactionTask, TxTaskRef, UnsyncedRpcTracker,
};
