//! Crash recovery: replaying every not-yet-durable RPC of a session that is
//! being torn down.

use super::*;

use crate::rpc::{RetryUnsyncedRpc, TxId};
use crate::utils::ErrorKind;

use futures::future;

// UnsyncedRpcTracker crash recovery
impl UnsyncedRpcTracker {
    /// Invoked by the transport when the session to a node is being torn
    /// down, hinting at a possible crash of the node. Retries every write
    /// not known to be durable against its key's current owner, completing
    /// each one after its retry succeeds.
    ///
    /// If a retry fails for good, that entry and the ones behind it stay
    /// queued and the error is returned; calling this again resumes the
    /// flush. Unsynced transaction PREPAREs are not replayed: they are
    /// dropped from the queue without completing and reported through an
    /// error of kind `PrepareNotRetried`. Asynchronous barriers waiting on a
    /// dropped prepare are still notified once the rest of the backlog is.
    pub async fn flush_session(&self, session: SessionId) -> Result<(), CurpError> {
        let num_rpcs = match self.lock_masters().get(&session) {
            Some(master) => master.rpcs.len(),
            None => return Ok(()),
        };
        pf_info!(session; "flushing session, total retries: {}", num_rpcs);

        let batch_size = if self.config.parallel_retries {
            usize::MAX
        } else {
            1
        };
        loop {
            let batch = self.take_retry_batch(session, batch_size);
            if batch.is_empty() {
                break;
            }
            let results =
                future::join_all(batch.into_iter().map(|(id, rpc)| async move {
                    (id, rpc.wait().await)
                }))
                .await;
            self.complete_retries(session, results)?;
        }

        let txids = self.remove_prepares(session);
        if !txids.is_empty() {
            pf_warn!(session; "dropped {} unsynced prepares without retry: {:?}",
                              txids.len(), txids);
            let msg = format!("unsynced prepares of txns {:?} not retried", txids);
            return Err(CurpError::with_kind(
                ErrorKind::PrepareNotRetried(txids),
                msg,
            ));
        }

        pf_info!(session; "done with sending retries for unsynced rpcs");
        Ok(())
    }
}

// UnsyncedRpcTracker crash recovery internals
impl UnsyncedRpcTracker {
    /// Prepares retries for up to `max` queued writes of `session`, in queue
    /// order. Entries stay in the queue until their retry succeeds.
    fn take_retry_batch(
        &self,
        session: SessionId,
        max: usize,
    ) -> Vec<(u64, RetryUnsyncedRpc)> {
        let retry_timeout = timeout_of(self.config.retry_timeout_ms);
        let mut masters = self.lock_masters();
        let Some(master) = masters.get_mut(&session) else {
            return vec![];
        };

        let batch = master
            .rpcs
            .iter_mut()
            .filter_map(|rpc| match &mut rpc.payload {
                UnsyncedPayload::Write {
                    request,
                    table_id,
                    key_hash,
                    obj_ver,
                } => {
                    pf_trace!(session; "retrying unsynced rpc {} (table {} key {:#x} ver {})",
                                       rpc.id, table_id, key_hash, obj_ver);
                    Some((
                        rpc.id,
                        RetryUnsyncedRpc::new(
                            self.finder.clone(),
                            *table_id,
                            *key_hash,
                            request,
                            retry_timeout,
                        ),
                    ))
                }
                UnsyncedPayload::Prepare(_) => None,
            })
            .take(max)
            .collect();
        batch
    }

    /// Completes the entries whose retries succeeded, in queue order, up to
    /// the first failure, which is returned.
    fn complete_retries(
        &self,
        session: SessionId,
        results: Vec<(u64, Result<(), CurpError>)>,
    ) -> Result<(), CurpError> {
        let mut masters = self.lock_masters();
        let Some(master) = masters.get_mut(&session) else {
            return Ok(());
        };

        for (id, result) in results {
            match result {
                Ok(()) => {
                    // may have been drained by a log state report meanwhile
                    master.complete_by_id(id, &*self.pool);
                }
                Err(e) => {
                    pf_error!(session; "retry of unsynced rpc {} failed: {}",
                                       id, e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Removes every unsynced prepare of `session`, returning their txn IDs.
    fn remove_prepares(&self, session: SessionId) -> Vec<TxId> {
        self.lock_masters()
            .get_mut(&session)
            .map_or_else(Vec::new, |master| master.remove_prepares())
    }
}
