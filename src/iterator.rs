// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    batch_view::{BatchView, NoBatch, BATCH_BIT},
    comparer::Comparer,
    error::{Error, Result},
    internal_iter::{InternalIterator, SeekGEFlags, SeekLTFlags},
    key::{SeqNo, ValueKind},
    merge::{Merge, ValueMerger},
    options::IterOptions,
    range_key::{RangeKeyData, RangeKeyStack},
    stats::{IteratorMetrics, IteratorStats, ReadCompactionHint, ReadSampling},
    InternalKV, Slice,
};
use std::{cmp::Ordering, sync::Arc};

/// Where the internal iterator sits relative to the exposed key.
///
/// Invariants (spec §3):
/// - `pos ∈ {CurForward, CurReverse}` implies the internal iterator's current
///   record has `user_key == key`.
/// - `pos ∈ {Next, Prev}` implies the internal iterator is strictly past the
///   exposed key (ahead for `Next`, behind for `Prev`).
/// - `validity == AtLimit` iff `pos ∈ {CurForwardPaused, CurReversePaused}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pos {
    CurForward,
    Next,
    Prev,
    CurReverse,
    CurForwardPaused,
    CurReversePaused,
}

/// The externally observable validity of the iterator's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// No record is exposed; iteration has run off an end or an error latched.
    Exhausted,
    /// A record is exposed at `key()`/`value()`.
    Valid,
    /// Paused short of a caller-supplied limit; no record is exposed, but
    /// resuming the same direction picks up where it left off.
    AtLimit,
}

/// Which absolute positioning operation was last performed, used to drive the
/// no-op/`try_seek_using_next` optimizations in §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastPositioningOp {
    Unset,
    SeekGE,
    SeekPrefixGE,
    SeekLT,
    InternalNext,
}

#[derive(Debug, Clone, Default)]
struct RangeKeyState {
    has_range_key: bool,
    range_key_only: bool,
    start: Slice,
    end: Slice,
    keys: Vec<RangeKeyData>,
    updated: bool,
    prev_pos_had_range_key: bool,
}

/// A bidirectional, MVCC-resolving read cursor over a log-structured
/// merge-tree's internal key space.
///
/// Reconciles the possibly many internal records a user key can have
/// (multiple `Set`s, a pending `Merge` chain, tombstones, interleaved range
/// keys) into at most one exposed `(key, value)` pair per call, without
/// copying more than the single record chain needed to answer the current
/// position.
pub struct Iterator {
    opts: IterOptions,
    comparer: Arc<dyn Comparer>,
    merge: Option<Arc<dyn Merge>>,
    inner: Box<dyn InternalIterator>,
    range_key_stack: Option<Box<dyn RangeKeyStack>>,
    batch: Arc<dyn BatchView>,

    cur_kv: Option<InternalKV>,
    key: Slice,
    value: Slice,
    validity: Validity,
    pos: Pos,
    err: Option<Error>,

    has_prefix: bool,
    prefix_or_full_seek_key: Slice,
    last_positioning_op: LastPositioningOp,
    requires_reposition: bool,
    next_prefix_not_permitted_by_upper_bound: bool,

    batch_seq_num: SeqNo,
    batch_just_refreshed: bool,
    batch_observed_len: usize,

    range_key: RangeKeyState,

    read_sampling: ReadSampling,
    stats: IteratorStats,
    read_amp: u32,

    resource_guard: Option<Arc<dyn std::any::Any + Send + Sync>>,
    compaction_hint_sink: Option<Arc<dyn Fn(Vec<ReadCompactionHint>) + Send + Sync>>,
    context: Option<Box<dyn std::any::Any + Send>>,

    /// Testing hook (spec §4.5, "Determinism hatch"): when set, a hash of
    /// this seed and the search key deterministically disables the seek
    /// no-op/`try_seek_using_next` optimizations for that call, so
    /// randomized tests exercise both the fast and slow paths.
    seek_opt_disable_seed: Option<u64>,
}

impl Iterator {
    /// Opens a cursor over `inner`, using `comparer` to order and split keys.
    #[must_use]
    pub fn new(inner: Box<dyn InternalIterator>, comparer: Arc<dyn Comparer>, opts: IterOptions) -> Self {
        log::trace!("opening iterator at snapshot seqno {}", opts.snapshot_seqno());

        Self {
            opts,
            comparer,
            merge: None,
            inner,
            range_key_stack: None,
            batch: Arc::new(NoBatch),
            cur_kv: None,
            key: Slice::empty(),
            value: Slice::empty(),
            validity: Validity::Exhausted,
            pos: Pos::Next,
            err: None,
            has_prefix: false,
            prefix_or_full_seek_key: Slice::empty(),
            last_positioning_op: LastPositioningOp::Unset,
            requires_reposition: false,
            next_prefix_not_permitted_by_upper_bound: false,
            batch_seq_num: 0,
            batch_just_refreshed: false,
            batch_observed_len: 0,
            range_key: RangeKeyState::default(),
            read_sampling: ReadSampling::new(),
            stats: IteratorStats::default(),
            read_amp: 1,
            resource_guard: None,
            compaction_hint_sink: None,
            context: None,
            seek_opt_disable_seed: None,
        }
    }

    /// Attaches a value-merge collaborator, required if any `Merge` records
    /// may be encountered.
    #[must_use]
    pub fn with_merge(mut self, merge: Arc<dyn Merge>) -> Self {
        self.merge = Some(merge);
        self
    }

    /// Attaches a range-key tracking collaborator.
    #[must_use]
    pub fn with_range_keys(mut self, stack: Box<dyn RangeKeyStack>) -> Self {
        self.range_key_stack = Some(stack);
        self
    }

    /// Attaches an indexed mutable batch whose writes this cursor should see
    /// once `set_options` is called (spec §4.6).
    #[must_use]
    pub fn with_batch(mut self, batch: Arc<dyn BatchView>) -> Self {
        self.batch = batch;
        self
    }

    /// Records the number of distinct sources the internal iterator combines,
    /// surfaced via `metrics()`.
    #[must_use]
    pub fn with_read_amp(mut self, read_amp: u32) -> Self {
        self.read_amp = read_amp;
        self
    }

    /// Attaches an opaque resource (a pinned read-state or version
    /// reference) that is kept alive for as long as this cursor exists.
    #[must_use]
    pub fn with_resource_guard(mut self, guard: Arc<dyn std::any::Any + Send + Sync>) -> Self {
        self.resource_guard = Some(guard);
        self
    }

    /// Registers a sink that receives any read-triggered compaction hints
    /// accumulated over the cursor's lifetime, called once from `close`.
    #[must_use]
    pub fn with_compaction_hint_sink(
        mut self,
        sink: Arc<dyn Fn(Vec<ReadCompactionHint>) + Send + Sync>,
    ) -> Self {
        self.compaction_hint_sink = Some(sink);
        self
    }

    #[doc(hidden)]
    #[must_use]
    pub fn with_seek_opt_disable_seed(mut self, seed: Option<u64>) -> Self {
        self.seek_opt_disable_seed = seed;
        self
    }

    // ---------------------------------------------------------------
    // Observational operations
    // ---------------------------------------------------------------

    /// Whether a record is currently exposed.
    #[must_use]
    pub fn valid(&self) -> bool {
        !self.requires_reposition && self.validity == Validity::Valid
    }

    /// The latched error, if any.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// The exposed key. Empty when not `Valid`.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The exposed value, discarding any latched error. Prefer
    /// [`Self::value_and_err`] when error handling matters.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// The exposed value, or the latched error if one occurred while
    /// resolving the current position.
    ///
    /// # Errors
    ///
    /// Returns the latched error, if any.
    pub fn value_and_err(&self) -> std::result::Result<&[u8], &Error> {
        match &self.err {
            Some(err) => Err(err),
            None => Ok(&self.value),
        }
    }

    /// `(has_point, has_range)`: whether the current position exposes a point
    /// key, a covering range key, or both (spec §4.4).
    #[must_use]
    pub fn has_point_and_range(&self) -> (bool, bool) {
        let has_point = self.validity == Validity::Valid && !self.range_key.range_key_only;
        (has_point, self.range_key.has_range_key)
    }

    /// The `[start, end)` of the range key currently covering the position,
    /// if any.
    #[must_use]
    pub fn range_bounds(&self) -> Option<(&[u8], &[u8])> {
        self.range_key
            .has_range_key
            .then(|| (self.range_key.start.as_ref(), self.range_key.end.as_ref()))
    }

    /// The payloads of the range key currently covering the position, sorted
    /// by suffix ascending.
    #[must_use]
    pub fn range_keys(&self) -> &[RangeKeyData] {
        &self.range_key.keys
    }

    /// Whether the most recent positioning operation moved into, out of, or
    /// between distinct range keys (spec §4.4).
    #[must_use]
    pub fn range_key_changed(&self) -> bool {
        self.range_key.updated
    }

    /// A snapshot of cheap metrics about this cursor.
    #[must_use]
    pub fn metrics(&self) -> IteratorMetrics {
        IteratorMetrics {
            read_amp: self.read_amp,
        }
    }

    /// Running positioning-operation counters.
    #[must_use]
    pub fn stats(&self) -> IteratorStats {
        self.stats
    }

    /// Resets the running counters returned by `stats()`.
    pub fn reset_stats(&mut self) {
        self.stats = IteratorStats::default();
    }

    /// Attaches an opaque, caller-defined context value to the cursor.
    pub fn set_context(&mut self, context: Option<Box<dyn std::any::Any + Send>>) {
        self.context = context;
    }

    // ---------------------------------------------------------------
    // Absolute positioning
    // ---------------------------------------------------------------

    fn begin_absolute_seek(&mut self) {
        self.range_key.prev_pos_had_range_key = self.range_key.has_range_key;
        self.range_key.updated = false;
        self.requires_reposition = false;
        self.err = None;
        self.has_prefix = false;
        self.stats.seek_count += 1;
    }

    fn seek_opt_disabled_for(&self, key: &[u8]) -> bool {
        let Some(seed) = self.seek_opt_disable_seed else {
            return false;
        };
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        seed.hash(&mut hasher);
        key.hash(&mut hasher);
        hasher.finish() % 2 == 0
    }

    fn clamp_to_bounds(&self, key: &[u8]) -> Vec<u8> {
        let mut out = key.to_vec();
        if let Some(lower) = self.opts.lower_bound() {
            if self.comparer.compare(&out, lower) == Ordering::Less {
                out = lower.to_vec();
            }
        }
        if let Some(upper) = self.opts.upper_bound() {
            if self.comparer.compare(&out, upper) != Ordering::Less {
                out = upper.to_vec();
            }
        }
        out
    }

    fn bound_shares_prefix(&self, bound: &[u8], prefix: &[u8]) -> bool {
        let split = self.comparer.split(bound);
        bound.get(..split).unwrap_or(bound) == prefix
    }

    /// Seeks to the first visible record with `user_key >= key`.
    #[must_use]
    pub fn seek_ge(&mut self, key: &[u8]) -> Validity {
        self.seek_ge_with_limit(key, None)
    }

    /// Like [`Self::seek_ge`], pausing at `limit` instead of descending
    /// further into the internal iterator's structures if the search would
    /// otherwise cross it.
    pub fn seek_ge_with_limit(&mut self, key: &[u8], limit: Option<&[u8]>) -> Validity {
        self.begin_absolute_seek();

        let clamped = self.clamp_to_bounds(key);
        let mut flags = SeekGEFlags {
            try_seek_using_next: false,
            batch_just_refreshed: self.batch_just_refreshed,
        };
        let mut reuse_position = false;

        if self.last_positioning_op == LastPositioningOp::SeekGE && !self.seek_opt_disabled_for(&clamped) {
            let cmp = self.comparer.compare(&self.prefix_or_full_seek_key, &clamped);
            let cmp_le = cmp != Ordering::Greater;
            let internal_exhausted = self.cur_kv.is_none() && self.validity != Validity::AtLimit;

            let noop = cmp_le
                && !self.batch_just_refreshed
                && (internal_exhausted
                    || (self.validity == Validity::Valid
                        && self.comparer.compare(&clamped, &self.key) != Ordering::Greater
                        && limit.is_none_or(|l| self.comparer.compare(&self.key, l) == Ordering::Less)));

            if noop {
                self.last_positioning_op = LastPositioningOp::SeekGE;
                return self.validity;
            }

            if cmp == Ordering::Less && self.validity != Validity::AtLimit && limit.is_none() {
                flags.try_seek_using_next = true;
            }

            if cmp_le && !self.batch_just_refreshed && self.pos == Pos::CurForwardPaused {
                if let Some(cur) = &self.cur_kv {
                    if self.comparer.compare(&clamped, &cur.key.user_key) != Ordering::Greater {
                        reuse_position = true;
                    }
                }
            }
        }

        if !reuse_position {
            self.cur_kv = self.inner.seek_ge(&clamped, flags);
        }

        let validity = self.run_forward(limit);

        self.prefix_or_full_seek_key = clamped.into();
        self.last_positioning_op = LastPositioningOp::SeekGE;
        self.batch_just_refreshed = false;
        validity
    }

    /// Restricts iteration to the keys sharing `key`'s prefix (per
    /// `Comparer::split`), seeking to the first visible record `>= key`
    /// within that prefix. `Prev`/`PrevWithLimit` are forbidden until the
    /// next absolute positioning call.
    pub fn seek_prefix_ge(&mut self, key: &[u8]) -> Validity {
        self.begin_absolute_seek();

        let split = self.comparer.split(key);
        let prefix: Slice = key.get(..split).unwrap_or(key).to_vec().into();

        if self.opts.lower_bound().is_some_and(|b| !self.bound_shares_prefix(b, &prefix))
            || self.opts.upper_bound().is_some_and(|b| !self.bound_shares_prefix(b, &prefix))
        {
            self.err = Some(Error::ContractViolation(
                "seek_prefix_ge: a configured bound does not share the search key's prefix",
            ));
            self.validity = Validity::Exhausted;
            return self.validity;
        }

        if self.range_key_stack.is_some() && self.comparer.immediate_successor(&prefix).is_none() {
            self.err = Some(Error::ContractViolation(
                "seek_prefix_ge requires Comparer::immediate_successor for this prefix when range keys are enabled",
            ));
            self.validity = Validity::Exhausted;
            return self.validity;
        }

        self.has_prefix = true;

        let mut flags = SeekGEFlags {
            try_seek_using_next: false,
            batch_just_refreshed: self.batch_just_refreshed,
        };

        if self.last_positioning_op == LastPositioningOp::SeekPrefixGE && !self.seek_opt_disabled_for(key) {
            if self.comparer.compare(&self.prefix_or_full_seek_key, &prefix) == Ordering::Less {
                flags.try_seek_using_next = true;
            }
        }

        self.cur_kv = self.inner.seek_prefix_ge(&prefix, key, flags);
        let validity = self.run_forward(None);

        self.prefix_or_full_seek_key = prefix;
        self.last_positioning_op = LastPositioningOp::SeekPrefixGE;
        self.batch_just_refreshed = false;
        validity
    }

    /// Seeks to the last visible record with `user_key < key`.
    #[must_use]
    pub fn seek_lt(&mut self, key: &[u8]) -> Validity {
        self.seek_lt_with_limit(key, None)
    }

    /// Like [`Self::seek_lt`], pausing at `limit` (inclusive: pauses if
    /// `limit > exposed key` and no range key covers the limit) instead of
    /// stepping further back. The no-op optimization is disabled whenever the
    /// cursor is reading over an indexed batch, since the batch may have
    /// grown since the stored seek key was recorded.
    pub fn seek_lt_with_limit(&mut self, key: &[u8], limit: Option<&[u8]>) -> Validity {
        self.begin_absolute_seek();

        let clamped = self.clamp_to_bounds(key);
        let over_batch = !self.batch.is_empty();

        if !over_batch
            && self.last_positioning_op == LastPositioningOp::SeekLT
            && !self.seek_opt_disabled_for(&clamped)
        {
            let cmp = self.comparer.compare(&self.prefix_or_full_seek_key, &clamped);
            let internal_exhausted = self.cur_kv.is_none() && self.validity != Validity::AtLimit;

            let noop = cmp != Ordering::Less
                && !self.batch_just_refreshed
                && (internal_exhausted
                    || (self.validity == Validity::Valid
                        && self.comparer.compare(&self.key, &clamped) == Ordering::Less
                        && limit.is_none_or(|l| self.comparer.compare(l, &self.key) != Ordering::Greater)));

            if noop {
                self.last_positioning_op = LastPositioningOp::SeekLT;
                return self.validity;
            }
        }

        self.cur_kv = self.inner.seek_lt(&clamped, SeekLTFlags::default());
        let validity = self.run_reverse(limit);

        self.prefix_or_full_seek_key = clamped.into();
        self.last_positioning_op = LastPositioningOp::SeekLT;
        self.batch_just_refreshed = false;
        validity
    }

    /// Seeks to the first visible record within bounds.
    pub fn first(&mut self) -> Validity {
        self.begin_absolute_seek();
        self.last_positioning_op = LastPositioningOp::Unset;
        self.cur_kv = self.inner.first();
        let validity = self.run_forward(None);
        self.batch_just_refreshed = false;
        validity
    }

    /// Seeks to the last visible record within bounds.
    pub fn last(&mut self) -> Validity {
        self.begin_absolute_seek();
        self.last_positioning_op = LastPositioningOp::Unset;
        self.cur_kv = self.inner.last();
        let validity = self.run_reverse(None);
        self.batch_just_refreshed = false;
        validity
    }

    // ---------------------------------------------------------------
    // Relative positioning
    // ---------------------------------------------------------------

    /// Steps to the next visible record.
    pub fn next(&mut self) -> Validity {
        self.next_with_limit(None)
    }

    /// Like [`Self::next`], pausing at `limit`. Forbidden together with
    /// prefix mode.
    pub fn next_with_limit(&mut self, limit: Option<&[u8]>) -> Validity {
        if self.has_prefix && limit.is_some() {
            self.err = Some(Error::ContractViolation(
                "next_with_limit is not permitted while in SeekPrefixGE mode",
            ));
            self.validity = Validity::Exhausted;
            return self.validity;
        }
        if self.err.is_some() || self.requires_reposition {
            return Validity::Exhausted;
        }

        self.range_key.prev_pos_had_range_key = self.range_key.has_range_key;
        self.range_key.updated = false;
        self.stats.step_count += 1;

        match self.pos {
            Pos::CurForward | Pos::CurReverse => {
                if self.last_positioning_op == LastPositioningOp::InternalNext {
                    // `can_deterministically_single_delete` already advanced
                    // the internal iterator past the exposed key; resume
                    // resolution from where it left off instead of skipping
                    // past the already-consumed key a second time.
                    self.last_positioning_op = LastPositioningOp::Unset;
                } else {
                    self.next_user_key();
                }
            }
            Pos::CurForwardPaused | Pos::Next => {}
            Pos::CurReversePaused | Pos::Prev => {
                self.cur_kv = self.inner.next();
                self.next_user_key();
            }
        }

        let validity = self.run_forward(limit);
        self.charge_read_sampling();
        validity
    }

    /// Steps to the previous visible record. Forbidden in prefix mode.
    pub fn prev(&mut self) -> Validity {
        self.prev_with_limit(None)
    }

    /// Like [`Self::prev`], pausing at `limit`.
    pub fn prev_with_limit(&mut self, limit: Option<&[u8]>) -> Validity {
        if self.has_prefix {
            self.err = Some(Error::ContractViolation(
                "reverse iteration is not permitted while in SeekPrefixGE mode",
            ));
            self.validity = Validity::Exhausted;
            return self.validity;
        }
        if self.err.is_some() || self.requires_reposition {
            return Validity::Exhausted;
        }

        self.range_key.prev_pos_had_range_key = self.range_key.has_range_key;
        self.range_key.updated = false;
        self.stats.step_count += 1;

        match self.pos {
            Pos::CurReverse | Pos::CurForward => self.prev_user_key(),
            Pos::CurReversePaused | Pos::Prev => {}
            Pos::CurForwardPaused | Pos::Next => {
                self.cur_kv = self.inner.prev();
                self.prev_user_key();
            }
        }

        let validity = self.run_reverse(limit);
        self.charge_read_sampling();
        validity
    }

    /// Skips directly to the first record whose user key is not covered by
    /// the current prefix, without visiting every record in between.
    /// Requires `Comparer::immediate_successor` to exist for the current
    /// prefix, and forbids a versioned upper bound or prefix mode.
    pub fn next_prefix(&mut self) -> Validity {
        if self.has_prefix {
            self.err = Some(Error::ContractViolation(
                "next_prefix is not permitted while in SeekPrefixGE mode",
            ));
            self.validity = Validity::Exhausted;
            return self.validity;
        }
        if self.next_prefix_not_permitted_by_upper_bound {
            self.err = Some(Error::ContractViolation(
                "next_prefix is not permitted with a versioned upper bound",
            ));
            self.validity = Validity::Exhausted;
            return self.validity;
        }
        if self.err.is_some() || self.requires_reposition {
            return Validity::Exhausted;
        }
        if self.validity != Validity::Valid {
            self.validity = Validity::Exhausted;
            return self.validity;
        }

        let split = self.comparer.split(&self.key);
        let prefix = self.key.slice(..split);

        let Some(succ) = self.comparer.immediate_successor(&prefix) else {
            self.cur_kv = None;
            self.validity = Validity::Exhausted;
            return self.validity;
        };

        self.range_key.prev_pos_had_range_key = self.range_key.has_range_key;
        self.range_key.updated = false;
        self.stats.step_count += 1;

        self.cur_kv = self.inner.next_prefix(&succ);
        self.last_positioning_op = LastPositioningOp::Unset;
        let validity = self.run_forward(None);
        self.charge_read_sampling();
        validity
    }

    // ---------------------------------------------------------------
    // Bounds / options / cloning
    // ---------------------------------------------------------------

    /// Restricts iteration to `[lower, upper)`, invalidating the current
    /// position. The cursor reports `Exhausted` until the next absolute
    /// positioning call.
    pub fn set_bounds(&mut self, lower: Option<Slice>, upper: Option<Slice>) {
        self.next_prefix_not_permitted_by_upper_bound = upper
            .as_ref()
            .is_some_and(|u| self.comparer.split(u) < u.len());

        self.opts.lower_bound = lower.clone();
        self.opts.upper_bound = upper.clone();

        self.inner.set_bounds(lower.as_deref(), upper.as_deref());

        self.requires_reposition = true;
        self.last_positioning_op = LastPositioningOp::Unset;
        self.cur_kv = None;
        self.validity = Validity::Exhausted;
        self.pos = Pos::Next;

        log::debug!("set_bounds: lower={lower:?}, upper={upper:?}");
    }

    /// Applies new options, refreshing visibility into an indexed batch if
    /// its length has grown since the last refresh. The cursor reports
    /// `Exhausted` until the next absolute positioning call (spec §4.6).
    pub fn set_options(&mut self, new_opts: IterOptions) {
        let batch_len = self.batch.len();
        if batch_len > self.batch_observed_len {
            self.batch_seq_num = (batch_len as SeqNo) | BATCH_BIT;
            self.batch_just_refreshed = true;
            self.batch_observed_len = batch_len;
        }

        let surface_unchanged = new_opts == self.opts;

        self.opts = new_opts;
        self.requires_reposition = true;
        self.last_positioning_op = if surface_unchanged && !self.batch_just_refreshed {
            self.last_positioning_op
        } else {
            LastPositioningOp::Unset
        };
        self.cur_kv = None;
        self.validity = Validity::Exhausted;

        log::debug!(
            "set_options: surface_unchanged={surface_unchanged}, batch_just_refreshed={}",
            self.batch_just_refreshed
        );
    }

    /// Produces an independent cursor over the same underlying data and
    /// batch view, with a fresh collaborator position.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal iterator collaborator cannot be
    /// cloned.
    pub fn try_clone(&self, opts: Option<IterOptions>) -> Result<Self> {
        Ok(Self {
            opts: opts.unwrap_or_else(|| self.opts.clone()),
            comparer: Arc::clone(&self.comparer),
            merge: self.merge.clone(),
            inner: self.inner.try_clone()?,
            range_key_stack: self.range_key_stack.as_ref().map(|s| s.box_clone()),
            batch: Arc::clone(&self.batch),
            cur_kv: None,
            key: Slice::empty(),
            value: Slice::empty(),
            validity: Validity::Exhausted,
            pos: Pos::Next,
            err: None,
            has_prefix: false,
            prefix_or_full_seek_key: Slice::empty(),
            last_positioning_op: LastPositioningOp::Unset,
            requires_reposition: false,
            next_prefix_not_permitted_by_upper_bound: self.next_prefix_not_permitted_by_upper_bound,
            batch_seq_num: self.batch_seq_num,
            batch_just_refreshed: false,
            batch_observed_len: self.batch.len(),
            range_key: RangeKeyState::default(),
            read_sampling: ReadSampling::new(),
            stats: IteratorStats::default(),
            read_amp: self.read_amp,
            resource_guard: self.resource_guard.clone(),
            compaction_hint_sink: self.compaction_hint_sink.clone(),
            context: None,
            seek_opt_disable_seed: self.seek_opt_disable_seed,
        })
    }

    /// Releases the cursor, flushing any accumulated read-triggered
    /// compaction hints to the sink registered via
    /// [`Self::with_compaction_hint_sink`].
    ///
    /// # Errors
    ///
    /// Returns the latched error, if any, or an error from releasing the
    /// internal iterator collaborator.
    pub fn close(mut self) -> Result<()> {
        let latched = self.err.take();
        let inner_result = self.inner.close();

        let hints = self.read_sampling.drain();
        if let Some(sink) = &self.compaction_hint_sink {
            if !hints.is_empty() {
                sink(hints);
            }
        }

        if let Some(err) = latched {
            return Err(err);
        }
        inner_result
    }

    // ---------------------------------------------------------------
    // can_deterministically_single_delete (spec §4.8)
    // ---------------------------------------------------------------

    /// One-shot probe, callable only immediately after a forward positioning
    /// call left the cursor `Valid`: scans forward from the current record to
    /// determine whether issuing a `SingleDelete` for the exposed key is
    /// guaranteed to shadow at most one older version, without otherwise
    /// altering the cursor's externally observable position.
    ///
    /// # Errors
    ///
    /// Returns a contract violation if called twice at the same position, or
    /// if not currently `Valid`. Returns a corruption error if more than one
    /// `SingleDelete` or a range key shadows the same user key.
    pub fn can_deterministically_single_delete(&mut self) -> Result<bool> {
        if self.validity != Validity::Valid {
            return Err(Error::ContractViolation(
                "can_deterministically_single_delete requires a Valid forward position",
            ));
        }
        if self.last_positioning_op == LastPositioningOp::InternalNext {
            return Err(Error::ContractViolation(
                "can_deterministically_single_delete was already called at this position",
            ));
        }

        let key = self.key.clone();
        let mut single_delete_seen = false;

        let result = loop {
            let Some(kv) = self.inner.next() else {
                break true;
            };

            if kv.key.user_key.as_ref() != key.as_ref() {
                self.cur_kv = Some(kv);
                break true;
            }

            match kv.key.kind() {
                ValueKind::Delete | ValueKind::DeleteSized => {
                    self.cur_kv = Some(kv);
                    break true;
                }
                ValueKind::SingleDelete => {
                    if single_delete_seen {
                        self.cur_kv = Some(kv);
                        return Err(Error::Corruption(
                            "multiple SingleDeletes shadow the same user key".into(),
                        ));
                    }
                    single_delete_seen = true;
                    self.cur_kv = Some(kv);
                }
                ValueKind::Set | ValueKind::SetWithDelete | ValueKind::Merge => {
                    if single_delete_seen {
                        single_delete_seen = false;
                        self.cur_kv = Some(kv);
                    } else {
                        self.cur_kv = Some(kv);
                        break false;
                    }
                }
                ValueKind::RangeKeySet => {
                    self.cur_kv = Some(kv);
                    return Err(Error::Corruption(
                        "a range key shadows the user key probed by can_deterministically_single_delete".into(),
                    ));
                }
            }
        };

        self.last_positioning_op = LastPositioningOp::InternalNext;
        Ok(result)
    }

    // ---------------------------------------------------------------
    // Range-key tracking (spec §4.4)
    // ---------------------------------------------------------------

    fn save_range_key(&mut self) {
        let Some(stack) = self.range_key_stack.as_mut() else {
            return;
        };
        if !stack.take_stale() {
            return;
        }

        match stack.span() {
            None => {
                if self.range_key.has_range_key {
                    self.range_key.updated = true;
                }
                self.range_key.has_range_key = false;
            }
            Some(span) => {
                let same = self.range_key.has_range_key
                    && self.range_key.start.as_ref() == span.start.as_ref()
                    && self.range_key.end.as_ref() == span.end.as_ref();

                if !same {
                    debug_assert!(
                        span.keys.windows(2).all(|w| w[0].suffix.as_ref() <= w[1].suffix.as_ref()),
                        "range key payloads must be sorted by suffix ascending"
                    );
                    self.range_key.start = span.start.clone();
                    self.range_key.end = span.end.clone();
                    self.range_key.keys = match self.opts.range_key_mask_suffix.as_ref() {
                        Some(mask) => span
                            .keys
                            .iter()
                            .filter(|data| data.suffix.as_ref() == mask.as_ref())
                            .cloned()
                            .collect(),
                        None => span.keys.clone(),
                    };
                    self.range_key.updated = true;
                }
                self.range_key.has_range_key = true;
            }
        }
    }

    fn range_key_within_limit(&self, limit: &[u8]) -> bool {
        self.range_key.has_range_key
            && self.comparer.compare(&self.range_key.end, limit) == Ordering::Greater
    }

    fn charge_read_sampling(&mut self) {
        if self.validity != Validity::Valid {
            return;
        }
        if !self.read_sampling.charge(self.key.len(), self.value.len()) {
            return;
        }
        if let Some(level_stats) = self.inner.level_stats() {
            if level_stats.overlapping_files >= 2 {
                self.read_sampling.record_overlap(ReadCompactionHint {
                    start: self.key.clone(),
                    end: self.key.clone(),
                    level: 0,
                    table_id: 0,
                });
            }
        }
    }

    // ---------------------------------------------------------------
    // next_user_key / prev_user_key (spec §4.3)
    // ---------------------------------------------------------------

    /// Advances the internal iterator past every record sharing `cur_kv`'s
    /// user key, landing on the next distinct user key (or exhaustion).
    /// Short-circuits once a record with `seqno == 0` has been seen: no
    /// further record can share that user key.
    fn next_user_key(&mut self) {
        let Some(first) = self.cur_kv.take() else {
            return;
        };

        if first.key.trailer.is_zero_seqno() {
            self.cur_kv = self.inner.next();
            return;
        }

        let user_key = first.key.user_key.clone();
        loop {
            let Some(kv) = self.inner.next() else {
                self.cur_kv = None;
                return;
            };
            if kv.key.user_key.as_ref() != user_key.as_ref() {
                self.cur_kv = Some(kv);
                return;
            }
            if kv.key.trailer.is_zero_seqno() {
                self.cur_kv = self.inner.next();
                return;
            }
        }
    }

    /// Mirror of [`Self::next_user_key`] for backward traversal: steps past
    /// every record sharing `cur_kv`'s user key, landing on the previous
    /// distinct user key.
    fn prev_user_key(&mut self) {
        let Some(first) = self.cur_kv.take() else {
            return;
        };

        let user_key = first.key.user_key.clone();
        loop {
            let Some(kv) = self.inner.prev() else {
                self.cur_kv = None;
                return;
            };
            if kv.key.user_key.as_ref() != user_key.as_ref() {
                self.cur_kv = Some(kv);
                return;
            }
        }
    }

    /// Next-point-at-current-user-key sub-routine (spec §4.1): called right
    /// after consuming a `RangeKeySet`, which is always interleaved as the
    /// first internal record at its user key. Advances one internal step and
    /// classifies what follows to decide whether a live point key coincides
    /// with the range key's start boundary. Returns `Ok(true)` (and records
    /// the resolved value) if it does.
    fn next_point_at_current_user_key(&mut self, user_key: &[u8]) -> Result<bool> {
        let Some(kv) = self.inner.next() else {
            self.cur_kv = None;
            self.pos = Pos::Next;
            return Ok(false);
        };

        if kv.key.user_key.as_ref() != user_key {
            self.cur_kv = Some(kv);
            self.pos = Pos::Next;
            return Ok(false);
        }

        match kv.key.kind() {
            ValueKind::RangeKeySet => Err(Error::Corruption(
                "RangeKeySet must be the first internal record at its user key".into(),
            )),
            ValueKind::Delete | ValueKind::SingleDelete | ValueKind::DeleteSized => {
                self.cur_kv = Some(kv);
                Ok(false)
            }
            ValueKind::Set | ValueKind::SetWithDelete => {
                self.value = kv.value.clone();
                self.cur_kv = Some(kv);
                Ok(true)
            }
            ValueKind::Merge => match self.resolve_forward_merge_chain(kv)? {
                Some(value) => {
                    self.value = value;
                    Ok(true)
                }
                None => Ok(false),
            },
        }
    }

    // ---------------------------------------------------------------
    // Forward resolution engine (spec §4.1)
    // ---------------------------------------------------------------

    fn run_forward(&mut self, limit: Option<&[u8]>) -> Validity {
        let validity = match self.forward_resolve_inner(limit) {
            Ok(validity) => {
                self.validity = validity;
                validity
            }
            Err(err) => {
                self.err = Some(err);
                self.cur_kv = None;
                self.validity = Validity::Exhausted;
                self.validity
            }
        };
        self.finalize_range_key_on_exhaustion();
        validity
    }

    /// §4.4 treats `Exhausted` as "no covering span" for `range_key_changed`
    /// purposes. Nothing on the path to `Exhausted` calls `save_range_key`
    /// (it only runs just before a `Valid` return), so `has_range_key` here
    /// still holds whatever was true when this op began — exactly what
    /// `prev_pos_had_range_key` latched, including across an `AtLimit`
    /// detour in an earlier op. Clears the stale span and flags the
    /// transition so a still-covered position that runs off the end is
    /// observed as exiting the range key rather than silently forgotten.
    fn finalize_range_key_on_exhaustion(&mut self) {
        if self.validity != Validity::Exhausted {
            return;
        }
        if self.range_key.has_range_key || self.range_key.prev_pos_had_range_key {
            self.range_key.updated = true;
        }
        self.range_key.has_range_key = false;
        self.range_key.range_key_only = false;
    }

    fn forward_resolve_inner(&mut self, limit: Option<&[u8]>) -> Result<Validity> {
        loop {
            let Some(kv) = self.cur_kv.clone() else {
                if let Some(err) = self.inner.take_error() {
                    return Err(err);
                }
                self.pos = Pos::Next;
                return Ok(Validity::Exhausted);
            };

            let user_key = kv.key.user_key.clone();

            if self.has_prefix && kv.key.kind() != ValueKind::RangeKeySet {
                let split = self.comparer.split(&user_key);
                if user_key.get(..split).unwrap_or(&user_key) != self.prefix_or_full_seek_key.as_ref() {
                    return Err(Error::Corruption(
                        "internal iterator yielded a key outside the active prefix".into(),
                    ));
                }
            }

            if let Some(limit) = limit {
                if self.comparer.compare(limit, &user_key) != Ordering::Greater {
                    self.pos = Pos::CurForwardPaused;
                    return Ok(Validity::AtLimit);
                }
            }

            if let Some(skip) = self.opts.skip_point.clone() {
                if kv.key.kind() != ValueKind::RangeKeySet && (skip.as_ref())(&user_key) {
                    self.cur_kv = self.inner.next();
                    continue;
                }
            }

            let is_range_key = kv.key.kind() == ValueKind::RangeKeySet;

            if !is_range_key && kv.key.seqno() > self.opts.snapshot_seqno() {
                self.cur_kv = self.inner.next();
                continue;
            }

            if (is_range_key && !self.opts.key_types.wants_ranges())
                || (!is_range_key && !self.opts.key_types.wants_points())
            {
                self.cur_kv = self.inner.next();
                continue;
            }

            match kv.key.kind() {
                ValueKind::RangeKeySet => {
                    self.key = user_key.clone();
                    self.save_range_key();

                    let point_found = self.next_point_at_current_user_key(&user_key)?;
                    self.range_key.range_key_only = !point_found;
                    if !point_found {
                        self.value = Slice::empty();
                    }

                    self.pos = Pos::CurForward;
                    return Ok(Validity::Valid);
                }
                ValueKind::Delete | ValueKind::SingleDelete | ValueKind::DeleteSized => {
                    // The newest record for this user key is a tombstone: the
                    // key is gone, and no older record sharing it can matter.
                    self.next_user_key();
                    continue;
                }
                ValueKind::Set | ValueKind::SetWithDelete => {
                    self.key = user_key;
                    self.value = kv.value.clone();
                    self.range_key.range_key_only = false;
                    self.save_range_key();
                    self.pos = Pos::CurForward;
                    return Ok(Validity::Valid);
                }
                ValueKind::Merge => match self.resolve_forward_merge_chain(kv)? {
                    Some(value) => {
                        self.range_key.range_key_only = false;
                        self.save_range_key();
                        self.value = value;
                        self.pos = Pos::CurForward;
                        return Ok(Validity::Valid);
                    }
                    None => continue,
                },
            }
        }
    }

    /// Resolves a merge chain starting at `seed` (a `Merge` record):
    /// accumulates every older record at the same user key via
    /// `merge_older` until a `Set`/`SetWithDelete` base, a delete, a
    /// different user key, or internal exhaustion is reached, then finishes
    /// the chain. Returns `None` (and leaves `self.cur_kv` positioned at the
    /// terminating record) if the chain resolves to a deletion and the loop
    /// should simply continue forward.
    fn resolve_forward_merge_chain(&mut self, seed: InternalKV) -> Result<Option<Slice>> {
        let user_key = seed.key.user_key.clone();
        let merge = self
            .merge
            .clone()
            .ok_or_else(|| Error::Corruption("a Merge record was encountered with no Merge collaborator configured".into()))?;
        let mut merger = merge.new_merger(&user_key, &seed.value)?;

        let includes_base = loop {
            let Some(kv) = self.inner.next() else {
                self.cur_kv = None;
                break false;
            };

            if kv.key.user_key.as_ref() != user_key.as_ref() {
                self.cur_kv = Some(kv);
                break false;
            }

            match kv.key.kind() {
                ValueKind::Merge => merger.merge_older(&kv.value)?,
                ValueKind::Set | ValueKind::SetWithDelete => {
                    merger.merge_older(&kv.value)?;
                    self.cur_kv = self.inner.next();
                    break true;
                }
                ValueKind::Delete | ValueKind::SingleDelete | ValueKind::DeleteSized => {
                    self.cur_kv = self.inner.next();
                    break false;
                }
                ValueKind::RangeKeySet => {
                    return Err(Error::Corruption(
                        "a RangeKeySet was observed mid merge chain".into(),
                    ));
                }
            }
        };

        self.key = user_key;
        let (value, need_delete) = merger.finish(includes_base)?;
        if need_delete {
            Ok(None)
        } else {
            Ok(Some(value))
        }
    }

    // ---------------------------------------------------------------
    // Reverse resolution engine (spec §4.2)
    // ---------------------------------------------------------------

    fn run_reverse(&mut self, limit: Option<&[u8]>) -> Validity {
        let validity = match self.reverse_resolve_inner(limit) {
            Ok(validity) => {
                self.validity = validity;
                validity
            }
            Err(err) => {
                self.err = Some(err);
                self.cur_kv = None;
                self.validity = Validity::Exhausted;
                self.validity
            }
        };
        self.finalize_range_key_on_exhaustion();
        validity
    }

    /// Finishes an in-progress merge chain at a reverse user-key boundary.
    /// Returns `true` if the caller should mark validity `Exhausted` and
    /// reprocess the already-fetched `kv` fresh as the first record of the
    /// new (previous) user key; `false` if the caller should return
    /// immediately with whatever validity/value is now set.
    fn finalize_reverse_merge(
        &mut self,
        value_merger: &mut Option<Box<dyn ValueMerger>>,
        range_key_boundary: bool,
    ) -> Result<bool> {
        let Some(merger) = value_merger.take() else {
            return Ok(false);
        };

        let (value, need_delete) = merger.finish(true)?;
        if need_delete {
            if range_key_boundary {
                self.range_key.range_key_only = true;
                self.value = Slice::empty();
                return Ok(false);
            }
            self.validity = Validity::Exhausted;
            return Ok(true);
        }

        self.value = value;
        Ok(false)
    }

    fn reverse_resolve_inner(&mut self, limit: Option<&[u8]>) -> Result<Validity> {
        let mut value_merger: Option<Box<dyn ValueMerger>> = None;
        let mut range_key_boundary = false;
        let mut checked_limit = false;
        self.validity = Validity::Exhausted;

        loop {
            let Some(kv) = self.cur_kv.clone() else {
                if let Some(err) = self.inner.take_error() {
                    return Err(err);
                }
                if self.validity == Validity::Valid {
                    self.finalize_reverse_merge(&mut value_merger, range_key_boundary)?;
                }
                self.pos = Pos::Prev;
                return Ok(self.validity);
            };

            let user_key = kv.key.user_key.clone();

            if !checked_limit {
                checked_limit = true;
                if let Some(limit) = limit {
                    if self.comparer.compare(&user_key, limit) == Ordering::Less
                        && !self.range_key_within_limit(limit)
                    {
                        self.pos = Pos::CurReversePaused;
                        return Ok(Validity::AtLimit);
                    }
                }
            }

            if self.validity == Validity::Valid && user_key.as_ref() != self.key.as_ref() {
                if self.finalize_reverse_merge(&mut value_merger, range_key_boundary)? {
                    range_key_boundary = false;
                    continue;
                }
                self.pos = Pos::Prev;
                return Ok(Validity::Valid);
            }

            if let Some(skip) = self.opts.skip_point.clone() {
                if kv.key.kind() != ValueKind::RangeKeySet && (skip.as_ref())(&user_key) {
                    self.cur_kv = self.inner.prev();
                    checked_limit = false;
                    continue;
                }
            }

            let is_range_key = kv.key.kind() == ValueKind::RangeKeySet;

            if !is_range_key && kv.key.seqno() > self.opts.snapshot_seqno() {
                self.cur_kv = self.inner.prev();
                checked_limit = false;
                continue;
            }

            if (is_range_key && !self.opts.key_types.wants_ranges())
                || (!is_range_key && !self.opts.key_types.wants_points())
            {
                self.cur_kv = self.inner.prev();
                checked_limit = false;
                continue;
            }

            match kv.key.kind() {
                ValueKind::RangeKeySet => {
                    let had_live_point = self.validity == Validity::Valid;
                    self.key = user_key;
                    self.save_range_key();
                    self.validity = Validity::Valid;
                    range_key_boundary = true;
                    if !had_live_point {
                        self.range_key.range_key_only = true;
                        self.value = Slice::empty();
                    }
                    self.cur_kv = self.inner.prev();
                    continue;
                }
                ValueKind::Delete | ValueKind::SingleDelete | ValueKind::DeleteSized => {
                    self.value = Slice::empty();
                    self.validity = Validity::Exhausted;
                    value_merger = None;
                    range_key_boundary = false;
                    self.cur_kv = self.inner.prev();
                    checked_limit = false;
                    continue;
                }
                ValueKind::Set | ValueKind::SetWithDelete => {
                    self.key = user_key;
                    self.value = kv.value.clone();
                    self.range_key.range_key_only = false;
                    self.save_range_key();
                    self.validity = Validity::Valid;
                    self.cur_kv = self.inner.prev();
                    continue;
                }
                ValueKind::Merge => {
                    let merge = self.merge.clone().ok_or_else(|| {
                        Error::Corruption(
                            "a Merge record was encountered with no Merge collaborator configured".into(),
                        )
                    })?;

                    if self.validity != Validity::Valid {
                        value_merger = Some(merge.new_merger(&user_key, &kv.value)?);
                        self.key = user_key;
                        self.range_key.range_key_only = false;
                        self.save_range_key();
                        self.validity = Validity::Valid;
                    } else if let Some(merger) = value_merger.as_mut() {
                        merger.merge_newer(&kv.value)?;
                    } else {
                        let mut merger = merge.new_merger(&user_key, &self.value)?;
                        merger.merge_newer(&kv.value)?;
                        value_merger = Some(merger);
                    }
                    self.cur_kv = self.inner.prev();
                    continue;
                }
            }
        }
    }
}
