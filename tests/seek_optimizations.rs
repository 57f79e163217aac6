// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Randomized coverage of the `seek_ge` no-op / `try_seek_using_next`
//! determinism hatch: the externally observed result of a sequence of
//! `seek_ge` calls must be identical whether or not the optimization is
//! taken, since the hatch only changes how the internal iterator is driven,
//! never what it's allowed to land on.

use lsm_cursor::{internal_iter::VecIterator, BytewiseComparer, InternalKV, IterOptions, Iterator, SeqNo, Validity, ValueKind};
use rand::Rng;
use std::sync::Arc;
use test_log::test;

fn fixture() -> Vec<InternalKV> {
    (0..10)
        .map(|i| {
            let key = char::from(b'a' + i).to_string();
            InternalKV::new(key.clone(), 1, ValueKind::Set, key)
        })
        .collect()
}

fn cursor(seed: Option<u64>) -> Iterator {
    Iterator::new(
        Box::new(VecIterator::new(fixture())),
        Arc::new(BytewiseComparer),
        IterOptions::new(SeqNo::MAX),
    )
    .with_seek_opt_disable_seed(seed)
}

#[test]
fn randomized_seek_ge_sequences_agree_with_and_without_the_optimization() {
    let mut rng = rand::rng();

    for trial in 0..64 {
        let mut optimized = cursor(None);
        let mut deoptimized = cursor(Some(trial));

        for _ in 0..20 {
            let key = [b'a' + rng.random_range(0..12)];

            let v1 = optimized.seek_ge(&key);
            let v2 = deoptimized.seek_ge(&key);

            assert_eq!(v1, v2, "validity diverged seeking {:?}", key);
            if v1 == Validity::Valid {
                assert_eq!(optimized.key(), deoptimized.key(), "key diverged seeking {:?}", key);
                assert_eq!(optimized.value(), deoptimized.value(), "value diverged seeking {:?}", key);
            }
        }
    }
}

#[test]
fn seek_ge_noop_path_and_forced_fresh_seek_land_on_the_same_key() {
    let mut optimized = cursor(None);
    let mut deoptimized = cursor(Some(7));

    assert_eq!(optimized.seek_ge(b"c"), Validity::Valid);
    assert_eq!(deoptimized.seek_ge(b"c"), Validity::Valid);
    assert_eq!(optimized.key(), b"c");
    assert_eq!(deoptimized.key(), b"c");

    // Same key again: the optimized path takes the no-op branch, the
    // deoptimized path (depending on the seed/key hash) may re-descend from
    // scratch. Both must agree regardless.
    assert_eq!(optimized.seek_ge(b"c"), Validity::Valid);
    assert_eq!(deoptimized.seek_ge(b"c"), Validity::Valid);
    assert_eq!(optimized.key(), b"c");
    assert_eq!(deoptimized.key(), b"c");

    // A slightly larger key: the optimized path may take try_seek_using_next.
    assert_eq!(optimized.seek_ge(b"e"), Validity::Valid);
    assert_eq!(deoptimized.seek_ge(b"e"), Validity::Valid);
    assert_eq!(optimized.key(), b"e");
    assert_eq!(deoptimized.key(), b"e");
}
