//! Property tests for store idempotence and collection safety.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use lodestone_cas::{CasConfig, CasError, ContentStore};
use std::sync::Arc;
use proptest::prelude::*;
use std::time::Duration;
use tempfile::tempdir;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build test runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Storing a payload twice yields one hash and one object on disk.
    #[test]
    fn prop_store_is_idempotent(payload in proptest::collection::vec(any::<u8>(), 0..8192)) {
        let dir = tempdir().unwrap();
        let store = ContentStore::open(CasConfig::new(dir.path())).unwrap();
        let rt = runtime();

        let (first, second) = rt.block_on(async {
            let first = store.store_bytes(&payload, None).await.unwrap();
            let second = store.store_bytes(&payload, None).await.unwrap();
            (first, second)
        });

        prop_assert_eq!(&first.hash, &second.hash);
        prop_assert_eq!(store.list_objects().unwrap(), vec![first.hash.clone()]);
        let read_back = rt.block_on(store.read(&first.hash)).unwrap();
        prop_assert_eq!(read_back, payload);
    }

    /// Collection never deletes an object that still has an owner, and
    /// deletes every unowned one once the grace period is zero.
    #[test]
    fn prop_gc_respects_references(
        payloads in proptest::collection::hash_set(proptest::collection::vec(any::<u8>(), 1..64), 1..12),
        owned_mask in proptest::collection::vec(any::<bool>(), 12),
    ) {
        let dir = tempdir().unwrap();
        let store = ContentStore::open(
            CasConfig::new(dir.path()).with_grace_period(Duration::ZERO),
        )
        .unwrap();
        let rt = runtime();

        let mut owned = Vec::new();
        let mut unowned = Vec::new();
        for (i, payload) in payloads.iter().enumerate() {
            let stored = rt.block_on(store.store_bytes(payload, None)).unwrap();
            if owned_mask[i] {
                rt.block_on(store.reference(&stored.hash, &format!("owner-{i}"))).unwrap();
                owned.push(stored.hash);
            } else {
                unowned.push(stored.hash);
            }
        }

        let report = rt.block_on(store.garbage_collect()).unwrap();
        prop_assert_eq!(report.deleted, unowned.len());
        prop_assert!(report.errors.is_empty());
        for hash in &owned {
            prop_assert!(rt.block_on(store.contains(hash)));
        }
        for hash in &unowned {
            prop_assert!(!rt.block_on(store.contains(hash)));
        }
    }
}

#[tokio::test]
async fn test_references_survive_reopen_and_protect_objects() {
    let dir = tempdir().expect("tempdir");
    let config = CasConfig::new(dir.path()).with_grace_period(Duration::ZERO);

    let hash = {
        let store = ContentStore::open(config.clone()).expect("open");
        let stored = store.store_bytes(b"persistent", None).await.expect("store");
        store.reference(&stored.hash, "1.acme.mod.sky").await.expect("ref");
        stored.hash
    };

    let store = ContentStore::open(config).expect("reopen");
    assert_eq!(store.reference_count(&hash), 1);
    let report = store.garbage_collect().await.expect("gc");
    assert_eq!(report.deleted, 0);
    assert!(store.contains(&hash).await);
}

/// A reference racing a collection pass either keeps the object alive or is
/// refused; it never lands on a deleted object.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reference_racing_collection_never_dangles() {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(
        ContentStore::open(CasConfig::new(dir.path()).with_grace_period(Duration::ZERO))
            .expect("open"),
    );

    let mut dangling = 0;
    let mut refused = 0;
    for i in 0..200u32 {
        let stored = store
            .store_bytes(format!("race-{i}").as_bytes(), None)
            .await
            .expect("store");
        let hash = stored.hash;

        let collector = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.garbage_collect().await })
        };
        let referencer = {
            let store = Arc::clone(&store);
            let hash = hash.clone();
            tokio::spawn(async move { store.reference(&hash, "owner").await })
        };
        collector.await.expect("join gc").expect("gc");

        match referencer.await.expect("join reference") {
            Ok(_) => {
                if !store.contains(&hash).await {
                    dangling += 1;
                }
            }
            Err(CasError::NotFound(_)) => {
                refused += 1;
                assert_eq!(store.reference_count(&hash), 0);
            }
            Err(e) => panic!("unexpected reference error: {e}"),
        }
        // Leave a clean slate for the next round.
        store.release(&hash, "owner").await.expect("release");
    }

    assert_eq!(dangling, 0, "{refused} references were refused");
}
