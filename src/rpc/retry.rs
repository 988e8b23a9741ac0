//! RetryUnsynced RPC: resends a possibly lost unsynced write to whichever
//! node owns its key now.

use std::sync::Arc;

use crate::rpc::{
    ClientRequest, KeyHash, ObjectFinder, RetryReply, SessionId, Status,
    TableId,
};
use crate::utils::CurpError;

use bytes::Bytes;

use tokio::time::{self, Duration};

/// One retry of a previously sent unsynced write.
pub struct RetryUnsyncedRpc {
    /// Resolves the key's current owner.
    finder: Arc<dyn ObjectFinder>,

    /// Table containing the written object.
    table_id: TableId,

    /// Key hash identifying the tablet.
    key_hash: KeyHash,

    /// Request bytes, already flagged as a retry.
    request: Bytes,

    /// Per-attempt local timeout.
    timeout: Option<Duration>,
}

impl RetryUnsyncedRpc {
    /// Prepares a retry of `request`, flagging it so the receiving node
    /// processes it during recovery and can detect duplicates. The caller
    /// keeps ownership of the request buffer.
    pub fn new(
        finder: Arc<dyn ObjectFinder>,
        table_id: TableId,
        key_hash: KeyHash,
        request: &mut ClientRequest,
        timeout: Option<Duration>,
    ) -> Self {
        request.mark_retry();
        RetryUnsyncedRpc {
            finder,
            table_id,
            key_hash,
            request: request.to_bytes(),
            timeout,
        }
    }

    /// Resolves the current owner and sends the request once.
    async fn send_once(&self) -> Result<(SessionId, RetryReply), CurpError> {
        let session = self.finder.lookup(self.table_id, self.key_hash).await?;
        let id = session.id();
        let reply = match self.timeout {
            Some(dur) => {
                time::timeout(dur, session.send_request(self.request.clone()))
                    .await??
            }
            None => session.send_request(self.request.clone()).await?,
        };
        Ok((id, reply))
    }

    /// Sends the retry and waits for its outcome. A transport failure or an
    /// `UnknownTablet` reply means the cached owner is stale: the mapping is
    /// flushed and the request resent exactly once more. Both `Ok` and
    /// `StaleRpc` replies count as success.
    pub async fn wait(self) -> Result<(), CurpError> {
        let first = self.send_once().await;
        let stale_owner = match &first {
            Ok((_, reply)) => reply.status == Status::UnknownTablet,
            Err(e) => e.is_transport(),
        };

        let (id, reply) = if stale_owner {
            pf_debug!("retry"; "re-resolving owner of table {} key {:#x}",
                               self.table_id, self.key_hash);
            self.finder.flush(self.table_id, self.key_hash);
            self.send_once().await?
        } else {
            first?
        };

        match reply.status {
            Status::Ok => Ok(()),
            Status::StaleRpc => {
                pf_debug!(id; "retried write already applied (table {} key {:#x})",
                              self.table_id, self.key_hash);
                Ok(())
            }
            status => {
                pf_warn!(id; "retry failed with status {:?}", status);
                Err(CurpError::status(status))
            }
        }
    }
}
