//! SyncLog RPC: asks a node to push its replication up to a goal.

use crate::rpc::{LogState, SessionRef, Status};
use crate::utils::CurpError;

use tokio::time::{self, Duration};

/// One SyncLog exchange with a storage node.
pub struct SyncRpc {
    /// Session to the node being synced.
    session: SessionRef,

    /// Log position the node must have replicated before replying.
    goal: LogState,

    /// Local timeout on top of the transport's own failure detection.
    timeout: Option<Duration>,
}

impl SyncRpc {
    /// Prepares a SyncLog RPC; nothing is sent until `wait()` is polled.
    pub fn new(
        session: SessionRef,
        goal: LogState,
        timeout: Option<Duration>,
    ) -> Self {
        SyncRpc {
            session,
            goal,
            timeout,
        }
    }

    /// Sends the request and waits for the node's new log state. Returns:
    ///   - `Ok(log_state)` on success
    ///   - `Err` of kind `Unreachable` or `Timeout` if no reply came back
    ///   - `Err` of kind `Status` if the node replied with a failure
    pub async fn wait(self) -> Result<LogState, CurpError> {
        let id = self.session.id();
        pf_trace!(id; "sending SyncLog goal {}", self.goal);

        let reply = match self.timeout {
            Some(dur) => {
                time::timeout(dur, self.session.sync_log(self.goal)).await??
            }
            None => self.session.sync_log(self.goal).await?,
        };

        if reply.status != Status::Ok {
            pf_warn!(id; "SyncLog replied with status {:?}", reply.status);
            return Err(CurpError::status(reply.status));
        }
        pf_trace!(id; "SyncLog done, node log state {}", reply.log_state);
        Ok(reply.log_state)
    }
}
