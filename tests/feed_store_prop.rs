use alarmfeed::{
    AlertEvent, AuthorizationScope, Collaborators, Config, FeedStore, LiveMutation, MemoryArchive,
    MemoryPushSource, StaticResolver, StationId, ViewController, ViewerIdentity,
};
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::runtime::Builder;

fn event(id: i64, station: u64) -> AlertEvent {
    let ts = Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap();
    AlertEvent::new(id, format!("alarm {}", id), ts, (id % 5) as u8, station)
}

#[derive(Debug, Clone)]
enum Op {
    Insert(i64, u64),
    Update(i64, u64),
    Delete(i64),
    Replace(Vec<(i64, u64)>),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0i64..60, 0u64..6).prop_map(|(id, st)| Op::Insert(id, st)),
        2 => (0i64..60, 0u64..6).prop_map(|(id, st)| Op::Update(id, st)),
        2 => (0i64..60).prop_map(Op::Delete),
        1 => prop::collection::vec((0i64..60, 0u64..6), 0..40).prop_map(Op::Replace),
    ]
}

fn assert_invariants(store: &FeedStore) -> Result<(), TestCaseError> {
    let snapshot = store.snapshot();
    prop_assert!(snapshot.len() <= store.capacity());
    for pair in snapshot.windows(2) {
        prop_assert!(pair[0].id > pair[1].id, "not strictly descending: {} then {}", pair[0].id, pair[1].id);
    }
    Ok(())
}

proptest! {
    #[test]
    fn test_store_invariants_hold_for_any_sequence(
        capacity in 1usize..20,
        ops in prop::collection::vec(op(), 0..200),
    ) {
        let mut store = FeedStore::new(capacity);
        for op in ops {
            match op {
                Op::Insert(id, st) => { store.insert(event(id, st)); }
                Op::Update(id, st) => { store.apply_update(event(id, st)); }
                Op::Delete(id) => { store.apply_delete(id); }
                Op::Replace(events) => store.replace_all(events.into_iter().map(|(id, st)| event(id, st))),
            }
            assert_invariants(&store)?;
        }
    }

    #[test]
    fn test_repeated_inserts_keep_one_entry_per_id(
        ids in prop::collection::vec(0i64..30, 1..100),
    ) {
        let mut store = FeedStore::new(1000);
        for id in &ids {
            store.insert(event(*id, 1));
        }
        let distinct: BTreeSet<i64> = ids.iter().copied().collect();
        let held: Vec<i64> = store.snapshot().iter().map(|e| e.id).collect();
        prop_assert_eq!(held, distinct.into_iter().rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_full_store_keeps_the_newest_ids(
        capacity in 1usize..15,
        ids in prop::collection::vec(0i64..100, 0..80),
    ) {
        let mut store = FeedStore::new(capacity);
        for id in &ids {
            store.insert(event(*id, 1));
        }
        // With only inserts, the survivors are exactly the top ids ever seen
        let expected: Vec<i64> = ids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .rev()
            .take(capacity)
            .collect();
        let held: Vec<i64> = store.snapshot().iter().map(|e| e.id).collect();
        prop_assert_eq!(held, expected);
    }

    #[test]
    fn test_scope_filters_live_and_poll_paths(
        allowed in prop::collection::btree_set(0u64..8, 0..4),
        admin in any::<bool>(),
        live in prop::collection::vec((0i64..50, 0u64..8), 0..40),
        pulled in prop::collection::vec((50i64..100, 0u64..8), 0..40),
    ) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        let scope = if admin {
            AuthorizationScope::admin()
        } else {
            AuthorizationScope::restricted(allowed.iter().copied().map(StationId))
        };

        let snapshot = rt.block_on(async {
            let archive = MemoryArchive::new();
            let ctl = ViewController::new(
                Config::default(),
                Collaborators {
                    resolver: Arc::new(StaticResolver::new(scope)),
                    alerts: Arc::new(archive.clone()),
                    push: Arc::new(MemoryPushSource::new()),
                    search: Arc::new(archive.clone()),
                    stations: None,
                },
                ViewerIdentity::new("prop"),
            )
            .unwrap();
            ctl.enter_live_mode().await;

            for (id, st) in &live {
                ctl.on_live_mutation(LiveMutation::Insert(event(*id, *st)));
            }
            archive.extend(pulled.iter().map(|(id, st)| event(*id, *st)));
            ctl.refresh().await;

            let snapshot = ctl.live_snapshot();
            ctl.teardown().await;
            snapshot
        });

        for e in &snapshot {
            prop_assert!(admin || allowed.contains(&e.station_id.0), "event {} from station {} leaked", e.id, e.station_id);
        }
        if admin {
            let distinct: BTreeSet<i64> = pulled.iter().map(|(id, _)| *id).collect();
            prop_assert_eq!(snapshot.len(), distinct.len());
        }
    }
}
