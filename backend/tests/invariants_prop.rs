//! Property tests for the core accounting invariants.

use std::sync::Arc;

use proptest::prelude::*;
use uuid::Uuid;

use corelib::models::RequestPriority;
use quota::{CounterKey, CounterStore, MemoryCounterStore, Period};
use scheduler::{QueuedItem, Request, TenantQueue};

fn mk_item(tenant_id: Uuid) -> QueuedItem {
    QueuedItem {
        request: Request {
            request_id: Uuid::new_v4(),
            tenant_id,
            user_id: None,
            session_id: None,
            arrival_ts_ms: 0,
            deadline_ts_ms: None,
            priority: RequestPriority::Normal,
            payload: String::new(),
            schema: None,
            payload_json: None,
            fingerprint: 0,
        },
        reservation_id: Uuid::new_v4(),
        attempt: 0,
        forced_tier: None,
    }
}

#[derive(Debug, Clone)]
enum QueueOp {
    Push,
    Pop,
    Remove,
    Drain,
}

fn queue_op() -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        3 => Just(QueueOp::Push),
        2 => Just(QueueOp::Pop),
        1 => Just(QueueOp::Remove),
        1 => Just(QueueOp::Drain),
    ]
}

proptest! {
    /// `served + dropped + depth = enqueued` survives any operation order.
    #[test]
    fn queue_accounting_is_conserved(ops in proptest::collection::vec(queue_op(), 1..200)) {
        let tenant = Uuid::new_v4();
        let mut queue = TenantQueue::new(tenant, 3, 1_000, 0);
        let mut now = 1u64;

        for op in ops {
            now += 1;
            match op {
                QueueOp::Push => queue.push_back(mk_item(tenant), now),
                QueueOp::Pop => {
                    if queue.pop_front(now).is_some() {
                        queue.on_served(1.0, now);
                    }
                }
                QueueOp::Remove => {
                    if let Some(id) = queue.head().map(|i| i.request.request_id) {
                        queue.remove(id, now);
                    }
                }
                QueueOp::Drain => {
                    queue.drain_all(now);
                }
            }

            let stats = queue.stats();
            prop_assert_eq!(
                stats.served + stats.dropped + stats.depth as u64,
                stats.enqueued
            );
        }
    }

    /// Every period's bounds contain `now`, are stable across the period, and
    /// tile the timeline without gaps.
    #[test]
    fn period_bounds_tile_the_timeline(now in 0u64..4_102_444_800u64) {
        for period in Period::ALL {
            let (start, end) = period.bounds(now);
            prop_assert!(start <= now, "{period}: start after now");
            prop_assert!(now < end, "{period}: now after end");
            prop_assert_eq!(period.bounds(start), (start, end));
            prop_assert_eq!(period.bounds(end.saturating_sub(1)), (start, end));
            prop_assert_eq!(period.bounds(end).0, end);
        }
    }

    /// The counter never exceeds its limit, whatever interleaving of
    /// reserves and releases runs against it.
    #[test]
    fn counter_never_exceeds_limit(
        amounts in proptest::collection::vec((1u64..5, any::<bool>()), 1..100),
        limit in 1u64..50,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        rt.block_on(async {
            let store = Arc::new(MemoryCounterStore::new());
            let key = CounterKey {
                tenant_id: Uuid::new_v4(),
                resource: corelib::models::Resource::ApiCalls,
                period: Period::Hour,
                period_start_s: 0,
            };

            for (amount, release_after) in amounts {
                let granted = store.try_increment(&key, amount, Some(limit)).await.unwrap();
                let consumed = store.get(&key).await.unwrap();
                assert!(consumed <= limit, "consumed {consumed} over limit {limit}");

                if granted.is_some() && release_after {
                    store.decrement(&key, amount).await.unwrap();
                }
            }
        });
    }
}
