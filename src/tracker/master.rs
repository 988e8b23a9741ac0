//! Per-node bookkeeping: the queue of unsynced RPCs sent to one storage node
//! and that node's last known log state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::rpc::{
    ClientRequest, KeyHash, LogState, RequestPool, SessionId, SessionRef,
    TableId, TxId,
};
use crate::utils::CurpError;

use futures::future::{BoxFuture, Shared};

use tokio::time::{Duration, Instant};

/// Completion callback fired once an unsynced RPC is known to be durable.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Client-side transaction coordination object whose PREPARE was sent
/// unsynced. The tracker only holds a reference; it never owns the prepare
/// requests themselves.
pub trait TransactionTask: Send + Sync {
    /// Gets the transaction ID, used for reporting.
    fn txid(&self) -> TxId;
}

/// Shared handle to a transaction task.
pub type TxTaskRef = Arc<dyn TransactionTask>;

/// What an unsynced RPC entry carries besides its log position.
pub(crate) enum UnsyncedPayload {
    /// A plain write, whose request buffer is owned by the tracker.
    Write {
        request: ClientRequest,
        table_id: TableId,
        key_hash: KeyHash,
        obj_ver: u64,
    },

    /// A transaction PREPARE vote; payload owned by the transaction task.
    Prepare(TxTaskRef),
}

/// One outstanding unsynced RPC.
pub(crate) struct UnsyncedRpc {
    /// Tracker-wide unique entry ID.
    pub(crate) id: u64,

    /// Request payload or transaction reference.
    pub(crate) payload: UnsyncedPayload,

    /// Position of the RPC's effect in the node's log.
    pub(crate) log_position: LogState,

    /// When the entry got registered.
    pub(crate) registered_at: Instant,

    /// Fired exactly once when the entry leaves the queue as durable.
    pub(crate) callback: Callback,

    /// Asynchronous barriers for which this is the last entry of the node's
    /// backlog; notified right after `callback`.
    pub(crate) waiters: Vec<Arc<SyncWaiter>>,
}

impl UnsyncedRpc {
    /// Consumes the entry as durable: fires its callback, notifies chained
    /// barriers, then hands the request buffer back to the pool if the
    /// tracker owns one.
    pub(crate) fn complete(self, pool: &dyn RequestPool) {
        (self.callback)();
        for waiter in self.waiters {
            waiter.arrive();
        }
        if let UnsyncedPayload::Write { request, .. } = self.payload {
            pool.free(request);
        }
    }
}

/// Future of a SyncLog RPC that several barriers may await together.
pub(crate) type SharedSync = Shared<BoxFuture<'static, Result<LogState, CurpError>>>;

/// The at most one SyncLog RPC in flight to a node.
pub(crate) struct SyncRpcHolder {
    /// Issue sequence number, to tell whether it's been replaced.
    pub(crate) seq: u64,

    /// Goal the RPC was sent with.
    pub(crate) goal: LogState,

    /// The RPC itself.
    pub(crate) rpc: SharedSync,
}

/// Record of one target storage node, keyed by its session.
pub(crate) struct Master {
    /// Session to the node.
    pub(crate) session: SessionRef,

    /// Unsynced RPCs ordered by log position.
    pub(crate) rpcs: VecDeque<UnsyncedRpc>,

    /// Furthest log position heard of from the node; what a SyncLog RPC
    /// must reach to cover every queued entry.
    pub(crate) sync_goal: LogState,

    /// Most durable log state heard of from the node.
    pub(crate) watermark: LogState,

    /// SyncLog RPC in flight, if any.
    pub(crate) sync_rpc: Option<SyncRpcHolder>,
}

impl Master {
    /// Creates an empty record for the node behind `session`.
    pub(crate) fn new(session: SessionRef) -> Self {
        Master {
            session,
            rpcs: VecDeque::new(),
            sync_goal: LogState::default(),
            watermark: LogState::default(),
            sync_rpc: None,
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> SessionId {
        self.session.id()
    }

    /// Queues a new entry. Writes to one node land in its log in send order,
    /// so this is almost always an append; an entry whose registration raced
    /// ahead of an earlier-positioned one is slotted in behind it so that the
    /// queue stays sorted by log position.
    pub(crate) fn enqueue(&mut self, rpc: UnsyncedRpc) {
        let idx = self
            .rpcs
            .iter()
            .rposition(|r| r.log_position <= rpc.log_position)
            .map_or(0, |i| i + 1);
        if idx < self.rpcs.len() {
            pf_debug!(self.id(); "out-of-order registration at {}, queue idx {}",
                                 rpc.log_position, idx);
        }
        self.rpcs.insert(idx, rpc);
    }

    /// Folds a log state heard of from the node into both the sync goal and
    /// the watermark, each of which only moves forward on its own measure.
    /// Returns true if the watermark moved.
    pub(crate) fn advance(&mut self, new_log_state: LogState) -> bool {
        if self.sync_goal.position() < new_log_state.position() {
            self.sync_goal = new_log_state;
        }
        if self.watermark.durability() < new_log_state.durability() {
            self.watermark = new_log_state;
            true
        } else {
            false
        }
    }

    /// Completes the queue prefix made durable by the watermark.
    /// Returns the number of entries completed.
    pub(crate) fn drain(&mut self, pool: &dyn RequestPool) -> usize {
        let mut num_drained = 0;
        while self
            .rpcs
            .front()
            .is_some_and(|r| r.log_position.is_synced(&self.watermark))
        {
            if let Some(rpc) = self.rpcs.pop_front() {
                pf_trace!(self.id(); "unsynced rpc {} durable at {}",
                                     rpc.id, rpc.log_position);
                rpc.complete(pool);
                num_drained += 1;
            }
        }

        // queue is sorted, so nothing behind the first undurable entry can
        // be durable either
        debug_assert!(self
            .rpcs
            .iter()
            .all(|r| !r.log_position.is_synced(&self.watermark)));
        num_drained
    }

    /// Applies a log state report, draining if it moved the watermark.
    pub(crate) fn update_log_state(
        &mut self,
        new_log_state: LogState,
        pool: &dyn RequestPool,
    ) -> usize {
        if self.advance(new_log_state) {
            self.drain(pool)
        } else {
            0
        }
    }

    /// Removes the entry with given ID and completes it. Returns false if it
    /// was not in the queue anymore.
    pub(crate) fn complete_by_id(
        &mut self,
        id: u64,
        pool: &dyn RequestPool,
    ) -> bool {
        match self.rpcs.iter().position(|r| r.id == id) {
            Some(idx) => {
                if let Some(rpc) = self.rpcs.remove(idx) {
                    rpc.complete(pool);
                }
                true
            }
            None => false,
        }
    }

    /// Chains `waiter` onto the last queued entry, which is the last one of
    /// the current backlog to become durable.
    pub(crate) fn chain_tail_waiter(&mut self, waiter: Arc<SyncWaiter>) {
        if let Some(tail) = self.rpcs.back_mut() {
            tail.waiters.push(waiter);
        }
    }

    /// Removes every unsynced prepare without completing it, returning their
    /// txn IDs. Barriers chained onto a removed prepare move to the closest
    /// kept entry ahead of it; with none ahead, the removed prepare was the
    /// backlog's end and they are notified right away.
    pub(crate) fn remove_prepares(&mut self) -> Vec<TxId> {
        let mut txids = vec![];
        let mut kept: VecDeque<UnsyncedRpc> =
            VecDeque::with_capacity(self.rpcs.len());
        let mut settled = vec![];
        for rpc in self.rpcs.drain(..) {
            if let UnsyncedPayload::Prepare(tx_task) = &rpc.payload {
                txids.push(tx_task.txid());
                match kept.back_mut() {
                    Some(prev) => prev.waiters.extend(rpc.waiters),
                    None => settled.extend(rpc.waiters),
                }
            } else {
                kept.push_back(rpc);
            }
        }
        self.rpcs = kept;

        for waiter in settled {
            waiter.arrive();
        }
        txids
    }

    /// Age of the oldest entry, or zero if the queue is empty.
    pub(crate) fn oldest_age(&self) -> Duration {
        self.rpcs
            .front()
            .map_or(Duration::ZERO, |r| r.registered_at.elapsed())
    }

    /// Clears the in-flight sync slot if it still holds RPC `seq`.
    pub(crate) fn clear_sync(&mut self, seq: u64) {
        if matches!(self.sync_rpc, Some(SyncRpcHolder { seq: s, .. }) if s == seq)
        {
            self.sync_rpc = None;
        }
    }

    /// Releases every owned payload without firing callbacks. Used when the
    /// tracker itself goes away.
    pub(crate) fn release_all(&mut self, pool: &dyn RequestPool) {
        for rpc in self.rpcs.drain(..) {
            if let UnsyncedPayload::Write { request, .. } = rpc.payload {
                pool.free(request);
            }
        }
    }
}

/// Fan-in point of an asynchronous barrier: fires the caller's callback once
/// every participating node reported its backlog durable.
pub(crate) struct SyncWaiter {
    /// Number of participants yet to arrive.
    remaining: AtomicUsize,

    /// Caller's callback, taken by the last participant.
    callback: Mutex<Option<Callback>>,
}

impl SyncWaiter {
    pub(crate) fn new(participants: usize, callback: Callback) -> Self {
        debug_assert!(participants > 0);
        SyncWaiter {
            remaining: AtomicUsize::new(participants),
            callback: Mutex::new(Some(callback)),
        }
    }

    /// Marks one participant as done.
    pub(crate) fn arrive(&self) {
        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        if prev == 1 {
            let callback = self
                .callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(callback) = callback {
                callback();
            }
        }
    }
}
