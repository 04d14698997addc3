// Property-style tests over randomized operation sequences, covering the
// invariants enumerated in SPEC_FULL.md section 8 (P1-P7).
//
// These don't use a dedicated proptest-style crate (the pack's closest
// analogue, the teacher's own `rand::random()` usage in
// `transaction/wal_manager.rs`, is a plain `rand` dependency, not a shrink-
// capable framework) — instead each test drives `rand` directly over many
// seeded iterations and checks invariants after every step.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use tenant_log_store::family::LogStoreFamily;
use tenant_log_store::journal::testkit::InMemoryJournal;
use tenant_log_store::truncation::TruncationTracker;
use tenant_log_store::types::JournalKey;

mod common;

fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// P1: truncated_upto <= completed_upto <= issued_upto < next_lsn, for a
/// single log under randomized append/complete-in-random-order sequences.
/// P2: after appending n records, issued_upto is at least the last
/// assigned lsn.
#[test]
fn property_frontiers_stay_ordered_under_random_completion_order() {
    common::init_tracing();
    for seed in 0..20u64 {
        let mut rng = seeded(seed);
        let journal = Arc::new(InMemoryJournal::new().with_manual_flush());
        let family = LogStoreFamily::new(journal.clone(), 16);
        let store = family.create_new_log_store(true);

        let n = rng.random_range(1..60);
        let mut assigned = Vec::new();
        for i in 0..n {
            let lsn = store.append_async(vec![i as u8], 0, Box::new(|_, _, _, _| {})).unwrap();
            assigned.push(lsn);
        }
        assert_eq!(*assigned.last().unwrap(), n - 1, "auto-lsn appends must be dense");
        assert!(store.active_upto() >= *assigned.last().unwrap(), "P2 violated");

        let mut order: Vec<(u32, i64)> = assigned.iter().map(|&lsn| (store.store_id(), lsn)).collect();
        order.shuffle(&mut rng);

        for (store_id, lsn) in order {
            journal.complete_batch(&[(store_id, lsn)]);
            let status = store.status();
            assert!(status.truncated_upto_lsn <= store.completed_upto(), "P1: truncated_upto <= completed_upto");
            assert!(store.completed_upto() <= store.active_upto(), "P1: completed_upto <= issued_upto");
            assert!(store.active_upto() < n, "P1: issued_upto < next_lsn");
        }
        assert_eq!(store.completed_upto(), n - 1, "every record completed, frontier must reach the end");
    }
}

/// P5: read_sync returns the exact bytes passed to append_async, for
/// every completed, non-truncated lsn, across random payload sizes and
/// random completion order.
#[test]
fn property_read_sync_round_trips_payload_bytes() {
    common::init_tracing();
    for seed in 0..20u64 {
        let mut rng = seeded(seed);
        let journal = Arc::new(InMemoryJournal::new().with_manual_flush());
        let family = LogStoreFamily::new(journal.clone(), 16);
        let store = family.create_new_log_store(true);

        let n = rng.random_range(1..40);
        let mut payloads = Vec::new();
        for _ in 0..n {
            let len = rng.random_range(0..32);
            let payload: Vec<u8> = (0..len).map(|_| rng.random::<u8>()).collect();
            let lsn = store.append_async(payload.clone(), 0, Box::new(|_, _, _, _| {})).unwrap();
            payloads.push((lsn, payload));
        }

        let mut targets: Vec<(u32, i64)> = payloads.iter().map(|&(lsn, _)| (store.store_id(), lsn)).collect();
        targets.shuffle(&mut rng);
        journal.complete_batch(&targets);

        for (lsn, expected) in &payloads {
            let got = store.read_sync(*lsn).unwrap();
            assert_eq!(&got, expected, "P5: round-trip mismatch at lsn {lsn}");
        }
    }
}

/// P6: truncate(x); truncate(x) again leaves status identical to one call.
#[test]
fn property_truncate_is_idempotent() {
    common::init_tracing();
    for seed in 0..20u64 {
        let mut rng = seeded(seed);
        let journal = Arc::new(InMemoryJournal::new().with_manual_flush());
        let family = LogStoreFamily::new(journal.clone(), 16);
        let store = family.create_new_log_store(true);

        let n = rng.random_range(2..40);
        for i in 0..n {
            store.append_async(vec![i as u8], 0, Box::new(|_, _, _, _| {})).unwrap();
        }
        let targets: Vec<(u32, i64)> = (0..n).map(|lsn| (store.store_id(), lsn)).collect();
        journal.complete_batch(&targets);

        let upto = rng.random_range(0..n);
        store.truncate(upto, true).unwrap();
        let after_first = store.status();
        let sb_after_first = journal.superblock(store.store_id());

        store.truncate(upto, true).unwrap();
        let after_second = store.status();
        let sb_after_second = journal.superblock(store.store_id());

        assert_eq!(after_first, after_second, "P6: repeated truncate at the same point must be a no-op");
        assert_eq!(sb_after_first, sb_after_second);
    }
}

/// P7: rollback to `to_lsn` followed by append_async assigns exactly
/// `to_lsn + 1` (append mode), across random prior append counts and
/// random rollback targets.
#[test]
fn property_rollback_then_append_assigns_to_lsn_plus_one() {
    common::init_tracing();
    for seed in 0..20u64 {
        let mut rng = seeded(seed);
        let journal = Arc::new(InMemoryJournal::new().with_manual_flush());
        let family = LogStoreFamily::new(journal.clone(), 16);
        let store = family.create_new_log_store(true);

        let n = rng.random_range(1..40);
        for i in 0..n {
            store.append_async(vec![i as u8], 0, Box::new(|_, _, _, _| {})).unwrap();
        }
        let targets: Vec<(u32, i64)> = (0..n).map(|lsn| (store.store_id(), lsn)).collect();
        journal.complete_batch(&targets);

        let to_lsn = rng.random_range(-1..n);
        store.rollback_async(to_lsn, Box::new(|_| {})).unwrap();

        let next = store.append_async(vec![0], 0, Box::new(|_, _, _, _| {})).unwrap();
        assert_eq!(next, to_lsn + 1, "P7 violated for to_lsn={to_lsn}");
    }
}

/// P3: truncation barriers stay strictly non-decreasing in seq_num across
/// random batch-completion sizes and counts.
#[test]
fn property_barriers_strictly_non_decreasing() {
    common::init_tracing();
    for seed in 0..20u64 {
        let mut rng = seeded(seed);
        let mut tracker = TruncationTracker::new(0);
        let mut cursor = 0i64;
        let mut last_idx = -1i64;

        for _ in 0..rng.random_range(1..30) {
            let step = rng.random_range(1..10);
            cursor += step;
            last_idx += 1;
            tracker.record_batch_completion(cursor - 1, JournalKey { idx: last_idx, dev_offset: last_idx as u64 });

            let barriers = tracker.barriers();
            for pair in barriers.windows(2) {
                assert!(pair[0].seq_num <= pair[1].seq_num, "P3: barriers must be non-decreasing in seq_num");
            }
        }
    }
}

/// P4: after do_device_truncate, every store's resulting ld_key.idx is
/// >= its previous boundary idx, across random per-store barrier/truncate
/// schedules.
#[test]
fn property_device_truncation_never_regresses_a_stores_boundary() {
    common::init_tracing();
    for seed in 0..20u64 {
        let mut rng = seeded(seed);
        let journal = Arc::new(InMemoryJournal::new().with_manual_flush());
        let family = LogStoreFamily::new(journal.clone(), 16);

        let store_count = rng.random_range(1..4);
        let stores: Vec<_> = (0..store_count).map(|_| family.create_new_log_store(true)).collect();

        let mut prev_idx = vec![-1i64; stores.len()];

        for round in 0..rng.random_range(1..5) {
            for store in &stores {
                let n = rng.random_range(1..6);
                for _ in 0..n {
                    store.append_async(vec![round as u8], 0, Box::new(|_, _, _, _| {})).unwrap();
                }
            }
            for store in &stores {
                let completed = store.active_upto();
                let targets: Vec<(u32, i64)> = (0..=completed)
                    .filter(|lsn| store.status().truncated_upto_lsn < *lsn)
                    .map(|lsn| (store.store_id(), lsn))
                    .collect();
                if !targets.is_empty() {
                    journal.complete_batch(&targets);
                }
                let completed_upto = store.completed_upto();
                if completed_upto >= 0 {
                    store.truncate(completed_upto, true).unwrap();
                }
            }

            family.do_device_truncate(false);

            for (i, store) in stores.iter().enumerate() {
                let idx = store.status().truncated_upto_logdev_key.idx;
                assert!(idx >= prev_idx[i], "P4: store {i} regressed from idx {} to idx {idx}", prev_idx[i]);
                prev_idx[i] = idx;
            }
        }
    }
}
