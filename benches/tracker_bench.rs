//! Unsynced RPC registration + draining overhead benchmarking.

use std::sync::Arc;
use std::time::Duration;

use curp_tracker::{
    Asynchrony, BufferPool, CurpError, KeyHash, LogState, ObjectFinder,
    RetryReply, Session, SessionId, SessionRef, Status, SyncLogReply, TableId,
    UnsyncedRpcTracker,
};

use async_trait::async_trait;

use bytes::Bytes;

use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion,
};

static NUM_RPCS: [u32; 4] = [1, 16, 256, 4096];
static NUM_NODES: [u64; 3] = [1, 4, 16];

/// Node that is never actually contacted.
struct IdleNode(SessionId);

#[async_trait]
impl Session for IdleNode {
    fn id(&self) -> SessionId {
        self.0
    }

    async fn sync_log(&self, goal: LogState) -> Result<SyncLogReply, CurpError> {
        Ok(SyncLogReply {
            status: Status::Ok,
            log_state: goal,
        })
    }

    async fn send_request(&self, _req: Bytes) -> Result<RetryReply, CurpError> {
        Ok(RetryReply { status: Status::Ok })
    }
}

/// Finder that never gets consulted.
struct IdleFinder;

#[async_trait]
impl ObjectFinder for IdleFinder {
    async fn lookup(
        &self,
        _table_id: TableId,
        _key_hash: KeyHash,
    ) -> Result<SessionRef, CurpError> {
        Err(CurpError::msg("not used in benchmark"))
    }

    fn flush(&self, _table_id: TableId, _key_hash: KeyHash) {}
}

fn register_and_drain(
    tracker: &UnsyncedRpcTracker,
    pool: &BufferPool,
    nodes: &[SessionRef],
    num_rpcs: u32,
) {
    for node in nodes {
        for i in 1..=num_rpcs {
            tracker.register_unsynced(
                node,
                pool.alloc(Asynchrony::Async, b"benchmark write payload"),
                1,
                i as u64,
                1,
                LogState::new(0, i * 32, 0),
                || {},
            );
        }
    }
    for node in nodes {
        tracker.update_log_state(node.id(), LogState::synced_at(0, num_rpcs * 32));
    }
    black_box(tracker.total_unsynced());
}

fn tracker_bench_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracker_bench");
    group
        .sample_size(50)
        .warm_up_time(Duration::from_millis(100))
        .measurement_time(Duration::from_secs(3));

    for num_nodes in NUM_NODES {
        for num_rpcs in NUM_RPCS {
            group.bench_with_input(
                BenchmarkId::from_parameter(format!("{}x{}", num_nodes, num_rpcs)),
                &(num_nodes, num_rpcs),
                |b, &(num_nodes, num_rpcs)| {
                    let pool = Arc::new(BufferPool::new());
                    let nodes: Vec<SessionRef> = (0..num_nodes)
                        .map(|id| Arc::new(IdleNode(id)) as SessionRef)
                        .collect();
                    b.iter(|| {
                        // fresh tracker per iteration so that log states
                        // start over from zero
                        let tracker = UnsyncedRpcTracker::new(
                            Arc::new(IdleFinder),
                            pool.clone(),
                        );
                        register_and_drain(&tracker, &pool, &nodes, num_rpcs);
                    });
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, tracker_bench_group);
criterion_main!(benches);
