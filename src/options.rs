// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{key::SeqNo, Slice};
use std::sync::Arc;

/// Which kinds of keys an iterator surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyTypes {
    /// Point keys only; range keys are not interleaved at all.
    #[default]
    PointsOnly,
    /// Range keys only; point keys are skipped.
    RangesOnly,
    /// Both point and range keys.
    PointsAndRanges,
}

impl KeyTypes {
    /// Whether point keys should be surfaced.
    #[must_use]
    pub fn wants_points(self) -> bool {
        matches!(self, Self::PointsOnly | Self::PointsAndRanges)
    }

    /// Whether range keys should be surfaced.
    #[must_use]
    pub fn wants_ranges(self) -> bool {
        matches!(self, Self::RangesOnly | Self::PointsAndRanges)
    }
}

/// A predicate letting the caller skip point keys the cursor would otherwise
/// expose, without affecting range-key tracking (spec §4.1 step 3 / §4.2
/// step 3).
pub type SkipPoint = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Effective configuration of an `Iterator`.
///
/// Cheap to clone: bounds and the skip predicate are reference-counted.
#[derive(Clone, Default)]
pub struct IterOptions {
    pub(crate) lower_bound: Option<Slice>,
    pub(crate) upper_bound: Option<Slice>,
    pub(crate) key_types: KeyTypes,
    pub(crate) skip_point: Option<SkipPoint>,
    /// Only range keys whose suffix matches this mask are surfaced, if set.
    pub(crate) range_key_mask_suffix: Option<Slice>,
    /// The snapshot sequence number: records with `seqno > snapshot_seqno`
    /// are invisible to this iterator regardless of what the internal
    /// iterator yields.
    pub(crate) snapshot_seqno: SeqNo,
}

impl std::fmt::Debug for IterOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IterOptions")
            .field("lower_bound", &self.lower_bound)
            .field("upper_bound", &self.upper_bound)
            .field("key_types", &self.key_types)
            .field("has_skip_point", &self.skip_point.is_some())
            .field("range_key_mask_suffix", &self.range_key_mask_suffix)
            .field("snapshot_seqno", &self.snapshot_seqno)
            .finish()
    }
}

impl PartialEq for IterOptions {
    fn eq(&self, other: &Self) -> bool {
        self.lower_bound == other.lower_bound
            && self.upper_bound == other.upper_bound
            && self.key_types == other.key_types
            && self.range_key_mask_suffix == other.range_key_mask_suffix
            && self.snapshot_seqno == other.snapshot_seqno
            // `skip_point` is intentionally excluded: closures have no
            // meaningful equality, and `set_options`'s fast path (§4.6) only
            // needs to compare the observable surface.
    }
}

impl IterOptions {
    /// Creates options with a snapshot sequence number and no bounds.
    #[must_use]
    pub fn new(snapshot_seqno: SeqNo) -> Self {
        Self {
            snapshot_seqno,
            ..Self::default()
        }
    }

    /// Restricts iteration to `[lower, upper)`.
    #[must_use]
    pub fn with_bounds(mut self, lower: Option<Slice>, upper: Option<Slice>) -> Self {
        self.lower_bound = lower;
        self.upper_bound = upper;
        self
    }

    /// Sets which key types are surfaced.
    #[must_use]
    pub fn with_key_types(mut self, key_types: KeyTypes) -> Self {
        self.key_types = key_types;
        self
    }

    /// Sets a predicate used to skip point keys without affecting range-key
    /// tracking.
    #[must_use]
    pub fn with_skip_point(mut self, skip_point: SkipPoint) -> Self {
        self.skip_point = Some(skip_point);
        self
    }

    /// Restricts visible range keys to a single suffix.
    #[must_use]
    pub fn with_range_key_mask(mut self, suffix: Slice) -> Self {
        self.range_key_mask_suffix = Some(suffix);
        self
    }

    /// Lower bound, if any.
    #[must_use]
    pub fn lower_bound(&self) -> Option<&[u8]> {
        self.lower_bound.as_deref()
    }

    /// Upper bound, if any.
    #[must_use]
    pub fn upper_bound(&self) -> Option<&[u8]> {
        self.upper_bound.as_deref()
    }

    /// The snapshot sequence number.
    #[must_use]
    pub fn snapshot_seqno(&self) -> SeqNo {
        self.snapshot_seqno
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn key_types_wants() {
        assert!(KeyTypes::PointsOnly.wants_points());
        assert!(!KeyTypes::PointsOnly.wants_ranges());
        assert!(KeyTypes::PointsAndRanges.wants_points());
        assert!(KeyTypes::PointsAndRanges.wants_ranges());
    }

    #[test]
    fn equal_bounds_are_equal_regardless_of_skip_point() {
        let a = IterOptions::new(5).with_skip_point(Arc::new(|_| false));
        let b = IterOptions::new(5);
        assert_eq!(a, b);
    }
}
