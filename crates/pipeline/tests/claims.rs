mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use proptest::prelude::*;
use serde_json::json;
use tokio::sync::Barrier;

use common::fast_queue;
use ingest_core::{JobId, LeaseToken, RunnerId, TaskId};
use ingest_pipeline::{
    FailDisposition, InMemoryTaskStore, StoreError, TaskStatus, TaskStore,
};

const LEASE: Duration = Duration::from_secs(30);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_on_single_task_hand_it_to_one_worker() {
    for _ in 0..50 {
        let queue = fast_queue(InMemoryTaskStore::arc());
        let job_id = JobId::new();
        queue.enqueue(job_id, "embed", "only", json!({}), 3).await.unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let claim = |queue: ingest_pipeline::TaskQueue, barrier: Arc<Barrier>| {
            tokio::spawn(async move {
                barrier.wait().await;
                queue.claim("embed", 1, LEASE, RunnerId::new()).await.unwrap()
            })
        };
        let a = claim(queue.clone(), barrier.clone());
        let b = claim(queue.clone(), barrier.clone());
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let mut sizes = [a.len(), b.len()];
        sizes.sort();
        assert_eq!(sizes, [0, 1]);
    }
}

#[tokio::test]
async fn expired_lease_redelivers_to_another_worker() {
    let queue = fast_queue(InMemoryTaskStore::arc());
    let job_id = JobId::new();
    queue.enqueue(job_id, "embed", "img-1", json!({}), 3).await.unwrap();
    let (crashed, survivor) = (RunnerId::new(), RunnerId::new());
    let t0 = Utc::now();

    let first = queue.claim_at("embed", 1, LEASE, crashed, t0).await.unwrap().remove(0);
    assert_eq!(first.lease_owner, Some(crashed));

    // Still leased one second before expiry.
    let early = t0 + ChronoDuration::seconds(29);
    assert!(queue.claim_at("embed", 1, LEASE, survivor, early).await.unwrap().is_empty());

    let expiry = t0 + ChronoDuration::seconds(30);
    let second = queue.claim_at("embed", 1, LEASE, survivor, expiry).await.unwrap().remove(0);
    assert_eq!(second.id, first.id);
    assert_eq!(second.lease_owner, Some(survivor));
    assert_eq!(second.attempt_count, 2);
    assert_ne!(second.lease_token, first.lease_token);

    // The crashed worker's late result is rejected; the survivor's is kept.
    let err = queue.complete(&first, json!({"from": "crashed"})).await.unwrap_err();
    assert_eq!(err, StoreError::LeaseLost(first.id));
    let done = queue.complete(&second, json!({"from": "survivor"})).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result, Some(json!({"from": "survivor"})));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn racing_workers_process_each_task_exactly_once() {
    let queue = fast_queue(InMemoryTaskStore::arc());
    let job_id = JobId::new();
    let items = (0..200).map(|i| (format!("item-{i}"), json!({ "i": i })));
    queue.enqueue_batch(job_id, "embed", items, 3).await.unwrap();

    let mut workers = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        workers.push(tokio::spawn(async move {
            let owner = RunnerId::new();
            let mut seen = Vec::new();
            loop {
                let batch = queue.claim("embed", 3, LEASE, owner).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                for task in batch {
                    queue.complete(&task, json!({})).await.unwrap();
                    seen.push(task.id);
                }
            }
            seen
        }));
    }

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.await.unwrap());
    }
    let unique: HashSet<TaskId> = all.iter().copied().collect();
    assert_eq!(all.len(), 200);
    assert_eq!(unique.len(), 200);
    assert_eq!(queue.stats(job_id).await.unwrap().completed, 200);
}

#[derive(Debug, Clone)]
enum Op {
    Claim { worker: usize },
    Complete { worker: usize },
    Fail { worker: usize },
    Tick { secs: i64 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..3).prop_map(|worker| Op::Claim { worker }),
        (0usize..3).prop_map(|worker| Op::Complete { worker }),
        (0usize..3).prop_map(|worker| Op::Fail { worker }),
        (1i64..20).prop_map(|secs| Op::Tick { secs }),
    ]
}

/// One recorded claim window.
struct Hold {
    worker: usize,
    until: DateTime<Utc>,
    released: bool,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever the interleaving of claims, results and clock ticks, a task is
    /// never handed to a worker while another worker's claim on it is live, and
    /// only the live holder can record a result.
    #[test]
    fn at_most_one_active_claim(ops in prop::collection::vec(op(), 1..60)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let store = InMemoryTaskStore::new();
            let job_id = JobId::new();
            for i in 0..2 {
                store
                    .enqueue(ingest_pipeline::Task::new(job_id, "t", format!("i{i}"), json!({}), 4))
                    .await
                    .unwrap();
            }
            let owners: Vec<RunnerId> = (0..3).map(|_| RunnerId::new()).collect();
            let mut held: HashMap<usize, Vec<(TaskId, LeaseToken)>> = HashMap::new();
            let mut holds: HashMap<TaskId, Hold> = HashMap::new();
            let mut now = Utc::now();

            for op in ops {
                match op {
                    Op::Tick { secs } => now += ChronoDuration::seconds(secs),
                    Op::Claim { worker } => {
                        let claimed = store.claim("t", 1, LEASE, owners[worker], now).await.unwrap();
                        for task in claimed {
                            if let Some(prev) = holds.get(&task.id) {
                                prop_assert!(
                                    prev.released || prev.until <= now,
                                    "task {} re-claimed by worker {} while worker {} held it",
                                    task.id, worker, prev.worker
                                );
                            }
                            holds.insert(task.id, Hold {
                                worker,
                                until: now + ChronoDuration::seconds(30),
                                released: false,
                            });
                            held.entry(worker).or_default().push((task.id, task.lease_token.unwrap()));
                        }
                    }
                    Op::Complete { worker } | Op::Fail { worker } => {
                        let Some((task_id, token)) = held.get_mut(&worker).and_then(|h| h.pop()) else {
                            continue;
                        };
                        let result = if matches!(op, Op::Complete { .. }) {
                            store.complete(task_id, token, json!({}), now).await
                        } else {
                            let retry = FailDisposition::Retry { visible_at: now };
                            store.fail(task_id, token, "boom", retry, now).await
                        };
                        let hold = holds.get_mut(&task_id).unwrap();
                        let live = hold.worker == worker && !hold.released && now < hold.until;
                        match result {
                            Ok(_) => {
                                prop_assert!(live, "stale holder recorded a result for {}", task_id);
                                hold.released = true;
                            }
                            Err(StoreError::LeaseLost(_)) => {
                                prop_assert!(!live, "live holder was rejected for {}", task_id);
                            }
                            Err(other) => prop_assert!(false, "unexpected error {}", other),
                        }
                    }
                }
            }
            Ok(())
        })?;
    }
}
