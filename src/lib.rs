// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The user-facing, bidirectional, MVCC-resolving read cursor of a
//! log-structured merge tree.
//!
//! ##### NOTE
//!
//! > This crate provides the cursor only, not a storage engine: the level
//! > manifest, memtables, on-disk segments, and the merging iterator that
//! > combines them are all collaborators this crate consumes through narrow
//! > traits ([`InternalIterator`], [`Comparer`], [`Merge`], [`RangeKeyStack`],
//! > [`BatchView`]), not code this crate owns.
//!
//! ##### About
//!
//! An LSM-tree stores many versions of the same user key scattered across
//! several sources (an active memtable, sealed memtables, on-disk segments at
//! several levels). A single logical read therefore has to walk a chain of
//! internal records for a key — possibly several `Set`s shadowing each other,
//! a pending chain of `Merge` operands, a tombstone, an interleaved range-key
//! marker — and collapse it into at most one `(key, value)` pair. That
//! reconciliation is this crate's entire job.
//!
//! [`Iterator`] exposes that reconciliation as a cursor: absolute positioning
//! (`seek_ge`, `seek_lt`, `first`, `last`, `seek_prefix_ge`) and relative
//! stepping (`next`, `prev`) in either direction, with best-effort limits,
//! prefix-bounded scanning, live range-key tracking, and a probe
//! ([`Iterator::can_deterministically_single_delete`]) used by compaction to
//! decide whether a `SingleDelete` is safe to emit for a key.
//!
//! # Example usage
//!
//! ```
//! use lsm_cursor::{
//!     internal_iter::VecIterator, BytewiseComparer, InternalKV, IterOptions, Iterator, ValueKind,
//! };
//! use std::sync::Arc;
//!
//! let records = vec![
//!     InternalKV::new("a", 2, ValueKind::Set, "newer"),
//!     InternalKV::new("a", 1, ValueKind::Set, "older"),
//!     InternalKV::new("b", 1, ValueKind::Set, "b-value"),
//! ];
//!
//! let mut iter = Iterator::new(
//!     Box::new(VecIterator::new(records)),
//!     Arc::new(BytewiseComparer),
//!     IterOptions::new(/* snapshot seqno */ u64::MAX),
//! );
//!
//! iter.first();
//! assert!(iter.valid());
//! assert_eq!(iter.key(), b"a");
//! assert_eq!(iter.value(), b"newer");
//!
//! iter.next();
//! assert_eq!(iter.key(), b"b");
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

mod batch_view;
mod binary_search;
mod comparer;
mod error;
pub mod internal_iter;
mod iterator;
mod key;
mod merge;
mod options;
pub mod range_key;
mod slice;
mod stats;

pub use batch_view::{BatchView, NoBatch, BATCH_BIT};
pub use comparer::{immediate_successor_bytes, BytewiseComparer, Comparer, SuffixComparer};
pub use error::{Error, Result};
pub use internal_iter::{InternalIterator, SeekGEFlags, SeekLTFlags, VecIterator};
pub use iterator::{Iterator, Validity};
pub use key::{InternalKV, InternalKey, SeqNo, Trailer, ValueKind};
pub use merge::{ConcatMerge, Merge, ValueMerger};
pub use options::{IterOptions, KeyTypes, SkipPoint};
pub use range_key::{RangeKeyData, RangeKeySpan, RangeKeyStack, VecRangeKeyStack};
pub use slice::Slice;
pub use stats::{IteratorMetrics, IteratorStats, LevelStats, ReadCompactionHint, ReadSampling};
