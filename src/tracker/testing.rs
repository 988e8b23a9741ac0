//! Mock collaborators shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::rpc::{
    Asynchrony, BufferPool, KeyHash, LogState, ObjectFinder, RetryReply,
    Session, SessionId, SessionRef, Status, SyncLogReply, TableId, TxId,
};
use crate::tracker::{
    Callback, TrackerConfig, TransactionTask, UnsyncedRpcTracker,
};
use crate::utils::CurpError;

use async_trait::async_trait;

use bytes::Bytes;

use tokio::time::{self, Duration};

/// In-memory stand-in for a storage node reachable through one session.
pub(crate) struct MockNode {
    id: SessionId,
    crashed: AtomicBool,
    delay: Mutex<Duration>,
    appended: Mutex<LogState>,
    sync_status: Mutex<Status>,
    retry_status: Mutex<Status>,
    num_syncs: AtomicUsize,
    syncs_in_flight: AtomicUsize,
    max_syncs_in_flight: AtomicUsize,
    received: Mutex<Vec<Bytes>>,
}

impl MockNode {
    pub(crate) fn new(id: SessionId) -> Arc<Self> {
        Arc::new(MockNode {
            id,
            crashed: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            appended: Mutex::new(LogState::default()),
            sync_status: Mutex::new(Status::Ok),
            retry_status: Mutex::new(Status::Ok),
            num_syncs: AtomicUsize::new(0),
            syncs_in_flight: AtomicUsize::new(0),
            max_syncs_in_flight: AtomicUsize::new(0),
            received: Mutex::new(vec![]),
        })
    }

    pub(crate) fn set_crashed(&self, crashed: bool) {
        self.crashed.store(crashed, Ordering::SeqCst);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Sets how far the node's log has been appended; a sync replicates
    /// everything appended.
    pub(crate) fn set_appended(&self, log_state: LogState) {
        *self.appended.lock().unwrap() = log_state;
    }

    pub(crate) fn set_sync_status(&self, status: Status) {
        *self.sync_status.lock().unwrap() = status;
    }

    pub(crate) fn set_retry_status(&self, status: Status) {
        *self.retry_status.lock().unwrap() = status;
    }

    pub(crate) fn num_syncs(&self) -> usize {
        self.num_syncs.load(Ordering::SeqCst)
    }

    /// Most SyncLog requests ever outstanding at the node at once.
    pub(crate) fn max_syncs_in_flight(&self) -> usize {
        self.max_syncs_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn received(&self) -> Vec<Bytes> {
        self.received.lock().unwrap().clone()
    }

    async fn maybe_delay(&self) {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Session for MockNode {
    fn id(&self) -> SessionId {
        self.id
    }

    async fn sync_log(&self, goal: LogState) -> Result<SyncLogReply, CurpError> {
        let now = self.syncs_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_syncs_in_flight.fetch_max(now, Ordering::SeqCst);
        self.maybe_delay().await;
        self.syncs_in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.crashed.load(Ordering::SeqCst) {
            return Err(CurpError::unreachable(self.id));
        }
        self.num_syncs.fetch_add(1, Ordering::SeqCst);

        let mut appended = self.appended.lock().unwrap();
        if *appended < goal {
            *appended = goal;
        }
        let log_state =
            LogState::synced_at(appended.head_segment_id, appended.appended_len);
        Ok(SyncLogReply {
            status: *self.sync_status.lock().unwrap(),
            log_state,
        })
    }

    async fn send_request(&self, req: Bytes) -> Result<RetryReply, CurpError> {
        self.maybe_delay().await;
        if self.crashed.load(Ordering::SeqCst) {
            return Err(CurpError::unreachable(self.id));
        }
        self.received.lock().unwrap().push(req);
        Ok(RetryReply {
            status: *self.retry_status.lock().unwrap(),
        })
    }
}

/// Object finder with a fixed ownership map, plus an optional second map
/// that takes over for a key once its mapping is flushed.
pub(crate) struct MockFinder {
    owners: Mutex<HashMap<(TableId, KeyHash), SessionRef>>,
    recovered: Mutex<HashMap<(TableId, KeyHash), SessionRef>>,
    default_owner: Mutex<Option<SessionRef>>,
    num_flushes: AtomicUsize,
}

impl MockFinder {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(MockFinder {
            owners: Mutex::new(HashMap::new()),
            recovered: Mutex::new(HashMap::new()),
            default_owner: Mutex::new(None),
            num_flushes: AtomicUsize::new(0),
        })
    }

    pub(crate) fn set_owner(
        &self,
        table_id: TableId,
        key_hash: KeyHash,
        owner: Arc<MockNode>,
    ) {
        self.owners
            .lock()
            .unwrap()
            .insert((table_id, key_hash), owner);
    }

    pub(crate) fn set_recovered_owner(
        &self,
        table_id: TableId,
        key_hash: KeyHash,
        owner: Arc<MockNode>,
    ) {
        self.recovered
            .lock()
            .unwrap()
            .insert((table_id, key_hash), owner);
    }

    /// Owner of every key not mapped explicitly.
    pub(crate) fn set_default_owner(&self, owner: Arc<MockNode>) {
        *self.default_owner.lock().unwrap() = Some(owner);
    }

    pub(crate) fn num_flushes(&self) -> usize {
        self.num_flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectFinder for MockFinder {
    async fn lookup(
        &self,
        table_id: TableId,
        key_hash: KeyHash,
    ) -> Result<SessionRef, CurpError> {
        if let Some(owner) = self.owners.lock().unwrap().get(&(table_id, key_hash))
        {
            return Ok(owner.clone());
        }
        self.default_owner.lock().unwrap().clone().ok_or_else(|| {
            CurpError::msg(format!(
                "no owner for table {} key {}",
                table_id, key_hash
            ))
        })
    }

    fn flush(&self, table_id: TableId, key_hash: KeyHash) {
        self.num_flushes.fetch_add(1, Ordering::SeqCst);
        let mut owners = self.owners.lock().unwrap();
        owners.remove(&(table_id, key_hash));
        if let Some(owner) =
            self.recovered.lock().unwrap().remove(&(table_id, key_hash))
        {
            owners.insert((table_id, key_hash), owner);
        }
    }
}

/// Records the order in which callbacks fired.
#[derive(Clone)]
pub(crate) struct Fired(Arc<Mutex<Vec<u64>>>);

impl Fired {
    pub(crate) fn new() -> Self {
        Fired(Arc::new(Mutex::new(vec![])))
    }

    pub(crate) fn callback(&self, id: u64) -> Callback {
        let fired = self.0.clone();
        Box::new(move || fired.lock().unwrap().push(id))
    }

    pub(crate) fn ids(&self) -> Vec<u64> {
        self.0.lock().unwrap().clone()
    }
}

/// Transaction task stub.
pub(crate) struct MockTx(pub(crate) TxId);

impl TransactionTask for MockTx {
    fn txid(&self) -> TxId {
        self.0
    }
}

/// Creates a tracker wired to a fresh mock finder and buffer pool.
pub(crate) fn setup_with(
    config: TrackerConfig,
) -> (Arc<MockFinder>, Arc<BufferPool>, UnsyncedRpcTracker) {
    let finder = MockFinder::new();
    let pool = Arc::new(BufferPool::new());
    let tracker =
        UnsyncedRpcTracker::with_config(finder.clone(), pool.clone(), config);
    (finder, pool, tracker)
}

pub(crate) fn setup() -> (Arc<MockFinder>, Arc<BufferPool>, UnsyncedRpcTracker)
{
    setup_with(TrackerConfig::default())
}

/// Registers an unsynced write whose callback records `key_hash` in `fired`.
pub(crate) fn register(
    tracker: &UnsyncedRpcTracker,
    pool: &BufferPool,
    node: &SessionRef,
    key_hash: KeyHash,
    pos: LogState,
    fired: &Fired,
) {
    tracker.register_unsynced(
        node,
        pool.alloc(Asynchrony::Async, &key_hash.to_be_bytes()),
        1,
        key_hash,
        1,
        pos,
        fired.callback(key_hash),
    );
}
