//! Durability barriers: waiting for (or getting notified of) all currently
//! outstanding unsynced RPCs becoming durable.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use super::*;

use crate::rpc::SyncRpc;

use super::master::{SharedSync, SyncRpcHolder, SyncWaiter};

use futures::future::{self, FutureExt};

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

// UnsyncedRpcTracker durability barriers
impl UnsyncedRpcTracker {
    /// Waits for backup replication of every unsynced RPC registered up to
    /// now. If some node could not be synced, the first such failure is
    /// returned after all other nodes' results have been applied; entries of
    /// failed nodes remain tracked.
    pub async fn sync(&self) -> Result<(), CurpError> {
        self.sync_masters(|_| true).await
    }

    /// Same as `sync()`, except that the node behind `skip` is left out,
    /// because the caller learns its durability through a synchronous RPC
    /// it has already dispatched there.
    pub async fn sync_excluding(&self, skip: SessionId) -> Result<(), CurpError> {
        self.sync_masters(|m| m.id() != skip).await
    }

    /// Syncs only the nodes whose oldest unsynced RPC has been outstanding
    /// for at least `threshold`.
    pub async fn sync_stale(&self, threshold: Duration) -> Result<(), CurpError> {
        self.sync_masters(|m| m.oldest_age() >= threshold).await
    }

    /// Registers `callback` to be invoked once every unsynced RPC registered
    /// up to now is durable. Invoked right away if nothing is outstanding.
    /// No SyncLog RPC is issued; durability is learned from regular log
    /// state reports (or from a concurrent barrier).
    pub fn sync_async(&self, callback: impl FnOnce() + Send + 'static) {
        let mut masters = self.lock_masters();
        let num_participants =
            masters.values().filter(|m| !m.rpcs.is_empty()).count();
        if num_participants == 0 {
            drop(masters);
            callback();
            return;
        }

        pf_debug!("tracker"; "async sync over {} nodes", num_participants);
        let waiter =
            Arc::new(SyncWaiter::new(num_participants, Box::new(callback)));
        for master in masters.values_mut().filter(|m| !m.rpcs.is_empty()) {
            master.chain_tail_waiter(waiter.clone());
        }
    }

    /// Spawns a background task that periodically syncs stale nodes, if
    /// enabled in config. The task holds only a weak reference and exits
    /// once the tracker is dropped.
    pub fn spawn_stale_syncer(tracker: &Arc<Self>) -> Option<JoinHandle<()>> {
        let interval_ms = tracker.config.stale_sync_interval_ms;
        if interval_ms == 0 {
            return None;
        }
        let threshold = Duration::from_millis(tracker.config.stale_threshold_ms);
        let weak = Arc::downgrade(tracker);
        Some(tokio::spawn(Self::stale_syncer_task(
            weak,
            Duration::from_millis(interval_ms),
            threshold,
        )))
    }
}

// UnsyncedRpcTracker barrier internals
impl UnsyncedRpcTracker {
    /// Syncs every node with outstanding entries that passes `pred`, until
    /// everything known to be appended there at call time is durable.
    ///
    /// Each round issues (or joins) SyncLog RPCs under the lock, awaits them
    /// all with the lock released, then reacquires it to apply the new log
    /// states. A node never has more than one SyncLog RPC in flight: joining
    /// one whose goal falls short of the target takes a follow-up round.
    async fn sync_masters<F>(&self, pred: F) -> Result<(), CurpError>
    where
        F: Fn(&Master) -> bool,
    {
        let mut targets: HashMap<SessionId, LogState> = {
            let masters = self.lock_masters();
            let targets = masters
                .values()
                .filter(|m| !m.rpcs.is_empty() && pred(m))
                .map(|m| (m.id(), m.sync_goal))
                .collect();
            targets
        };
        if targets.is_empty() {
            return Ok(());
        }
        pf_debug!("tracker"; "syncing {} nodes", targets.len());

        let mut first_err = None;
        while !targets.is_empty() {
            let mut waits: Vec<(SessionId, u64, LogState, SharedSync)> =
                Vec::with_capacity(targets.len());
            {
                let mut masters = self.lock_masters();
                for id in targets.keys() {
                    if let Some(master) = masters.get_mut(id) {
                        waits.push(self.issue_sync(master));
                    }
                }
            }
            if waits.is_empty() {
                break;
            }

            let results =
                future::join_all(waits.iter().map(|(.., rpc)| rpc.clone())).await;

            // apply phase
            {
                let mut masters = self.lock_masters();
                for ((id, seq, goal, _), result) in waits.into_iter().zip(results) {
                    let Some(master) = masters.get_mut(&id) else {
                        targets.remove(&id);
                        continue;
                    };
                    master.clear_sync(seq);
                    match result {
                        Ok(log_state) => {
                            master.update_log_state(log_state, &*self.pool);
                        }
                        Err(e) => {
                            pf_warn!(id; "sync failed: {}", e);
                            first_err.get_or_insert(e);
                            targets.remove(&id);
                            continue;
                        }
                    }

                    let done = match targets.get(&id) {
                        Some(target) => {
                            goal.position() >= target.position()
                                || target.is_synced(&master.watermark)
                                || master.rpcs.is_empty()
                        }
                        None => true,
                    };
                    if done {
                        targets.remove(&id);
                    } else {
                        pf_trace!(id; "joined sync fell short of {}, following up",
                                      master.sync_goal);
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Returns the SyncLog RPC to await for `master`: the one in flight if
    /// any, else a new one targeting the furthest known position.
    fn issue_sync(
        &self,
        master: &mut Master,
    ) -> (SessionId, u64, LogState, SharedSync) {
        let id = master.id();
        if let Some(holder) = &master.sync_rpc {
            pf_trace!(id; "joining in-flight sync {} to {}", holder.seq, holder.goal);
            return (id, holder.seq, holder.goal, holder.rpc.clone());
        }

        let seq = self.next_sync_seq.fetch_add(1, Ordering::Relaxed);
        let goal = master.sync_goal;
        let rpc = SyncRpc::new(
            master.session.clone(),
            goal,
            timeout_of(self.config.sync_timeout_ms),
        )
        .wait()
        .boxed()
        .shared();
        master.sync_rpc = Some(SyncRpcHolder {
            seq,
            goal,
            rpc: rpc.clone(),
        });
        (id, seq, goal, rpc)
    }

    /// Body of the background stale syncer.
    async fn stale_syncer_task(
        tracker: Weak<Self>,
        interval: Duration,
        threshold: Duration,
    ) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(tracker) = tracker.upgrade() else {
                break;
            };
            if let Err(e) = tracker.sync_stale(threshold).await {
                pf_warn!("tracker"; "stale sync failed: {}", e);
            }
        }
    }
}
