//! RPC-level pieces the tracker talks through: log states, owned request
//! payloads, collaborator traits, and the SyncLog / RetryUnsynced exchanges.

mod logstate;
mod request;
mod retry;
mod session;
mod sync;

pub use logstate::LogState;
pub use request::{Asynchrony, BufferPool, ClientRequest, RequestPool};
pub use retry::RetryUnsyncedRpc;
pub use session::{
    KeyHash, ObjectFinder, RetryReply, Session, SessionId, SessionRef, Status,
    SyncLogReply, TableId, TxId,
};
pub use sync::SyncRpc;
