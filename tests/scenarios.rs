// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! End-to-end scenarios, one per literal example worked through in the
//! design notes.

use lsm_cursor::{
    internal_iter::VecIterator,
    range_key::{RangeKeyData, RangeKeySpan, VecRangeKeyStack},
    BytewiseComparer, ConcatMerge, Error, InternalKV, IterOptions, Iterator, KeyTypes, SeqNo,
    Slice, SuffixComparer, Validity, ValueKind,
};
use std::sync::Arc;
use test_log::test;

fn opts() -> IterOptions {
    IterOptions::new(SeqNo::MAX)
}

#[test]
fn merge_chain_concatenates_oldest_to_newest() {
    let mut it = Iterator::new(
        Box::new(VecIterator::new(vec![
            InternalKV::new("a", 8, ValueKind::Merge, "+z"),
            InternalKV::new("a", 7, ValueKind::Merge, "+y"),
            InternalKV::new("a", 6, ValueKind::Set, "x"),
        ])),
        Arc::new(BytewiseComparer),
        opts(),
    )
    .with_merge(Arc::new(ConcatMerge));

    assert_eq!(it.first(), Validity::Valid);
    assert_eq!(it.key(), b"a");
    assert_eq!(it.value(), b"xyz");

    assert_eq!(it.next(), Validity::Exhausted);
    assert!(!it.valid());
}

#[test]
fn delete_hides_an_older_set() {
    let mut it = Iterator::new(
        Box::new(VecIterator::new(vec![
            InternalKV::new("b", 9, ValueKind::Delete, ""),
            InternalKV::new("b", 5, ValueKind::Set, "old"),
        ])),
        Arc::new(BytewiseComparer),
        opts(),
    );

    assert_eq!(it.seek_ge(b"b"), Validity::Exhausted);
}

#[test]
fn forward_resolution_exposes_point_and_covering_range_key() {
    let mut stack = VecRangeKeyStack::new(vec![RangeKeySpan {
        start: "a".into(),
        end: "c".into(),
        keys: vec![RangeKeyData {
            suffix: "@10".into(),
            value: "r".into(),
        }],
    }]);
    stack.seek_covering(b"a");

    let mut it = Iterator::new(
        Box::new(VecIterator::new(vec![InternalKV::new(
            "a",
            3,
            ValueKind::Set,
            "p",
        )])),
        Arc::new(BytewiseComparer),
        opts().with_key_types(KeyTypes::PointsAndRanges),
    )
    .with_range_keys(Box::new(stack));

    assert_eq!(it.first(), Validity::Valid);
    assert_eq!(it.key(), b"a");
    assert_eq!(it.value(), b"p");
    assert_eq!(it.has_point_and_range(), (true, true));
    assert_eq!(it.range_bounds(), Some((b"a".as_slice(), b"c".as_slice())));
    assert_eq!(it.range_keys(), &[RangeKeyData {
        suffix: "@10".into(),
        value: "r".into(),
    }]);
    assert!(it.range_key_changed());

    assert_eq!(it.next(), Validity::Exhausted);
    assert!(it.range_key_changed());
}

#[test]
fn reverse_with_limit_is_overridden_by_a_covering_range_key() {
    let mut stack = VecRangeKeyStack::new(vec![RangeKeySpan {
        start: "a".into(),
        end: "z".into(),
        keys: vec![RangeKeyData {
            suffix: "@5".into(),
            value: "r".into(),
        }],
    }]);
    stack.seek_covering(b"y");

    let mut it = Iterator::new(
        Box::new(VecIterator::new(vec![
            InternalKV::new("a", SeqNo::MAX, ValueKind::RangeKeySet, ""),
            InternalKV::new("y", 2, ValueKind::Set, "p"),
        ])),
        Arc::new(BytewiseComparer),
        opts().with_key_types(KeyTypes::PointsAndRanges),
    )
    .with_range_keys(Box::new(stack));

    assert_eq!(it.seek_lt_with_limit(b"z", Some(b"m")), Validity::Valid);
    assert_eq!(it.key(), b"y");
}

#[test]
fn seek_ge_noop_avoids_stepping_the_internal_iterator() {
    let mut it = Iterator::new(
        Box::new(VecIterator::new(vec![
            InternalKV::new("k", 1, ValueKind::Set, "1"),
            InternalKV::new("m", 1, ValueKind::Set, "2"),
            InternalKV::new("z", 1, ValueKind::Set, "3"),
        ])),
        Arc::new(BytewiseComparer),
        opts(),
    );

    assert_eq!(it.seek_ge(b"k"), Validity::Valid);
    assert_eq!(it.next(), Validity::Valid);
    assert_eq!(it.key(), b"m");

    // No intervening mutation; seek_ge("l") must resolve to the same "m"
    // without any internal repositioning.
    assert_eq!(it.seek_ge(b"l"), Validity::Valid);
    assert_eq!(it.key(), b"m");
}

#[test]
fn next_prefix_under_a_versioned_upper_bound_is_a_contract_violation() {
    let mut it = Iterator::new(
        Box::new(VecIterator::new(vec![InternalKV::new(
            "a@1", 1, ValueKind::Set, "v",
        )])),
        Arc::new(SuffixComparer),
        opts(),
    );

    // "k@50" splits as prefix "k" + suffix "@50": a versioned upper bound.
    it.set_bounds(None, Some(Slice::from(b"k@50".as_slice())));
    assert_eq!(it.first(), Validity::Valid);

    assert_eq!(it.next_prefix(), Validity::Exhausted);
    assert!(!it.valid());
    assert!(matches!(it.error(), Some(Error::ContractViolation(_))));
}

#[test]
fn single_delete_shadow_scan_cancels_exactly_one_older_version() {
    // "c" has a live newest Set, an older SingleDelete, and a single Set
    // beneath that: the SingleDelete cancels the one older version exactly,
    // so a SingleDelete issued for "c" is safe.
    let mut it = Iterator::new(
        Box::new(VecIterator::new(vec![
            InternalKV::new("c", 10, ValueKind::Set, "newest"),
            InternalKV::new("c", 5, ValueKind::SingleDelete, ""),
            InternalKV::new("c", 1, ValueKind::Set, "older"),
        ])),
        Arc::new(BytewiseComparer),
        opts(),
    );

    assert_eq!(it.first(), Validity::Valid);
    assert_eq!(it.key(), b"c");
    assert_eq!(it.value(), b"newest");
    assert!(it.can_deterministically_single_delete().unwrap());

    // A second probe at the same position is a contract violation.
    assert!(it.can_deterministically_single_delete().is_err());
}

#[test]
fn delete_sized_swallows_identically_to_delete() {
    let mut it = Iterator::new(
        Box::new(VecIterator::new(vec![
            InternalKV::new("d", 2, ValueKind::DeleteSized, ""),
            InternalKV::new("d", 1, ValueKind::Set, "shadowed"),
        ])),
        Arc::new(BytewiseComparer),
        opts(),
    );

    assert_eq!(it.first(), Validity::Exhausted);
    assert!(!it.valid());
}
