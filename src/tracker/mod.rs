//! Client-side tracker of unsynced RPCs: remembers every write acknowledged
//! by a storage node before being replicated to backups, fires completion
//! callbacks once such writes become durable, and replays them if the node
//! is suspected to have crashed.

mod barrier;
mod master;
mod recovery;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::rpc::{
    ClientRequest, KeyHash, LogState, ObjectFinder, RequestPool, SessionId,
    SessionRef, TableId,
};
use crate::utils::CurpError;

use master::{Master, UnsyncedPayload, UnsyncedRpc};

pub use master::{Callback, TransactionTask, TxTaskRef};

use serde::{Deserialize, Serialize};

use tokio::time::{Duration, Instant};

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Local timeout of a SyncLog RPC in millisecs; 0 means rely on the
    /// transport's failure detection only.
    pub sync_timeout_ms: u64,

    /// Local timeout of one retry attempt in millisecs; 0 means none.
    pub retry_timeout_ms: u64,

    /// Issue the retries of a flushed session all at once instead of one
    /// after another.
    pub parallel_retries: bool,

    /// Period of the background stale syncer in millisecs; 0 disables it.
    pub stale_sync_interval_ms: u64,

    /// Age in millisecs after which an outstanding unsynced RPC makes its
    /// node eligible for a background sync.
    pub stale_threshold_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            sync_timeout_ms: 0,
            retry_timeout_ms: 0,
            parallel_retries: false,
            stale_sync_interval_ms: 0,
            stale_threshold_ms: 100,
        }
    }
}

/// Converts a millisecs config value into an optional timeout.
fn timeout_of(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

/// Tracker of unsynced RPCs, shared by all client tasks of one client.
///
/// All bookkeeping happens under a single mutex over the map of node records.
/// The mutex is never held across an `.await`; network waits happen outside
/// of it. Completion callbacks run while it is held, so they must not call
/// back into the tracker.
pub struct UnsyncedRpcTracker {
    /// Map from session ID -> node record.
    masters: Mutex<HashMap<SessionId, Master>>,

    /// Resolves keys to current owners when retrying.
    finder: Arc<dyn ObjectFinder>,

    /// Takes back request payloads once no longer needed.
    pool: Arc<dyn RequestPool>,

    /// Configuration parameters.
    config: TrackerConfig,

    /// Next unsynced RPC entry ID.
    next_rpc_id: AtomicU64,

    /// Next SyncLog RPC sequence number.
    next_sync_seq: AtomicU64,
}

// UnsyncedRpcTracker public API implementation
impl UnsyncedRpcTracker {
    /// Creates a new tracker with default configuration.
    pub fn new(
        finder: Arc<dyn ObjectFinder>,
        pool: Arc<dyn RequestPool>,
    ) -> Self {
        Self::with_config(finder, pool, TrackerConfig::default())
    }

    /// Creates a new tracker with given configuration.
    pub fn with_config(
        finder: Arc<dyn ObjectFinder>,
        pool: Arc<dyn RequestPool>,
        config: TrackerConfig,
    ) -> Self {
        UnsyncedRpcTracker {
            masters: Mutex::new(HashMap::new()),
            finder,
            pool,
            config,
            next_rpc_id: AtomicU64::new(0),
            next_sync_seq: AtomicU64::new(0),
        }
    }

    /// Creates a new tracker, overriding default configuration with fields
    /// given in TOML string `config_str`.
    pub fn new_and_setup(
        finder: Arc<dyn ObjectFinder>,
        pool: Arc<dyn RequestPool>,
        config_str: Option<&str>,
    ) -> Result<Self, CurpError> {
        let config = parsed_config!(config_str => TrackerConfig;
                                    sync_timeout_ms, retry_timeout_ms,
                                    parallel_retries, stale_sync_interval_ms,
                                    stale_threshold_ms)?;
        if config.stale_sync_interval_ms > 0 && config.stale_threshold_ms == 0 {
            return logged_err!("tracker"; "invalid config.stale_threshold_ms '{}'",
                                          config.stale_threshold_ms);
        }
        Ok(Self::with_config(finder, pool, config))
    }

    /// Gets the configuration in use.
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Saves an unsynced write whose reply has been received; must be called
    /// before the write's `wait` returns to its issuer. Ownership of
    /// `request` moves to the tracker. `callback` fires once the write's
    /// effect at `log_pos` is durable on backups.
    #[allow(clippy::too_many_arguments)]
    pub fn register_unsynced(
        &self,
        session: &SessionRef,
        request: ClientRequest,
        table_id: TableId,
        key_hash: KeyHash,
        obj_ver: u64,
        log_pos: LogState,
        callback: impl FnOnce() + Send + 'static,
    ) {
        self.register(
            session,
            UnsyncedPayload::Write {
                request,
                table_id,
                key_hash,
                obj_ver,
            },
            log_pos,
            Box::new(callback),
        );
    }

    /// Saves an unsynced transaction PREPARE whose vote has been received.
    /// The prepare requests stay owned by `tx_task`.
    pub fn register_unsynced_prepare(
        &self,
        session: &SessionRef,
        tx_task: TxTaskRef,
        log_pos: LogState,
    ) {
        self.register(
            session,
            UnsyncedPayload::Prepare(tx_task),
            log_pos,
            Box::new(|| {}),
        );
    }

    /// Applies a log state report of the node behind `session`, completing
    /// every unsynced RPC made durable by it. Reports not more durable than
    /// what is already known leave the watermark alone, and reports for
    /// unknown sessions are ignored.
    pub fn update_log_state(&self, session: SessionId, log_state: LogState) {
        let mut masters = self.lock_masters();
        if let Some(master) = masters.get_mut(&session) {
            let num_drained = master.update_log_state(log_state, &*self.pool);
            if num_drained > 0 {
                pf_trace!(session; "log state {} completed {} unsynced rpcs",
                                   log_state, num_drained);
            }
        }
    }

    /// Number of unsynced RPCs outstanding on given session.
    pub fn num_unsynced(&self, session: SessionId) -> usize {
        self.lock_masters()
            .get(&session)
            .map_or(0, |m| m.rpcs.len())
    }

    /// Number of unsynced RPCs outstanding in total.
    pub fn total_unsynced(&self) -> usize {
        self.lock_masters().values().map(|m| m.rpcs.len()).sum()
    }

    /// Most durable log state known of the node behind given session.
    pub fn log_state(&self, session: SessionId) -> Option<LogState> {
        self.lock_masters().get(&session).map(|m| m.watermark)
    }

    /// True if a SyncLog RPC to given session is in flight.
    pub fn has_sync_in_flight(&self, session: SessionId) -> bool {
        self.lock_masters()
            .get(&session)
            .is_some_and(|m| m.sync_rpc.is_some())
    }
}

// UnsyncedRpcTracker internal helpers
impl UnsyncedRpcTracker {
    /// Locks the node map. Bookkeeping never leaves a record half-updated,
    /// so a poisoned lock is still usable.
    fn lock_masters(&self) -> MutexGuard<'_, HashMap<SessionId, Master>> {
        self.masters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(
        &self,
        session: &SessionRef,
        payload: UnsyncedPayload,
        log_pos: LogState,
        callback: Callback,
    ) {
        let id = self.next_rpc_id.fetch_add(1, Ordering::Relaxed);
        let mut masters = self.lock_masters();
        let master = masters
            .entry(session.id())
            .or_insert_with(|| Master::new(session.clone()));

        master.enqueue(UnsyncedRpc {
            id,
            payload,
            log_position: log_pos,
            registered_at: Instant::now(),
            callback,
            waiters: vec![],
        });
        pf_trace!(master.id(); "registered unsynced rpc {} at {}", id, log_pos);

        // the reply carrying log_pos is itself a report of the node's
        // progress; the new entry may even be durable already
        master.advance(log_pos);
        master.drain(&*self.pool);
    }
}

impl Drop for UnsyncedRpcTracker {
    fn drop(&mut self) {
        let masters = self
            .masters
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for master in masters.values_mut() {
            if !master.rpcs.is_empty() {
                pf_debug!(master.id(); "releasing {} unsynced rpcs on drop",
                                       master.rpcs.len());
            }
            master.release_all(&*self.pool);
        }
    }
}
