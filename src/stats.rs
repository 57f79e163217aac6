// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Slice;

/// A read-triggered compaction hint, enqueued when a key has been sought
/// across enough overlapping files to suggest they should be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCompactionHint {
    /// Start of the hinted key range.
    pub start: Slice,
    /// End of the hinted key range.
    pub end: Slice,
    /// Level the hinted file lives on.
    pub level: u8,
    /// Identifier of the hinted file/table, opaque to this crate.
    pub table_id: u64,
}

/// Per-level statistics the internal iterator collaborator may optionally
/// expose so the cursor can drive read sampling (spec §5).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelStats {
    /// How many distinct files at this level overlap the current key.
    pub overlapping_files: u32,
}

/// Running counters surfaced through `Iterator::stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IteratorStats {
    /// Number of absolute positioning calls (`seek_ge`, `seek_lt`, `first`, `last`).
    pub seek_count: u64,
    /// Number of relative positioning calls (`next`, `prev`).
    pub step_count: u64,
    /// Total bytes (key + value) observed at `Valid` positions.
    pub bytes_read: u64,
}

/// A snapshot of cheap, externally meaningful iterator metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IteratorMetrics {
    /// Read amplification: number of distinct sources (levels/memtables/etc.)
    /// the merging iterator is combining.
    pub read_amp: u32,
}

/// Drives read-triggered compaction hints (spec §5).
///
/// Charges `key.len() + value.len()` bytes per `Valid` positioning op against
/// a randomized threshold; each time the threshold is crossed, the caller is
/// expected to consult `LevelStats` for the current key and, if at least two
/// files overlap, call [`Self::record_overlap`].
pub struct ReadSampling {
    bytes_since_last_sample: u64,
    next_sample_at: u64,
    allowed_seeks: i32,
    initial_allowed_seeks: i32,
    pending: Vec<ReadCompactionHint>,
}

const DEFAULT_SAMPLE_PERIOD_BYTES: u64 = 1024 * 1024;
const DEFAULT_ALLOWED_SEEKS: i32 = 32;

impl ReadSampling {
    /// Creates a sampler with the default sampling period and allowed-seeks
    /// budget, jittered by `rand` so that many concurrently opened iterators
    /// don't all sample at the same byte offset.
    #[must_use]
    pub fn new() -> Self {
        use rand::Rng;
        let jitter = rand::rng().random_range(0..DEFAULT_SAMPLE_PERIOD_BYTES);

        Self {
            bytes_since_last_sample: 0,
            next_sample_at: DEFAULT_SAMPLE_PERIOD_BYTES.saturating_sub(jitter).max(1),
            allowed_seeks: DEFAULT_ALLOWED_SEEKS,
            initial_allowed_seeks: DEFAULT_ALLOWED_SEEKS,
            pending: Vec::new(),
        }
    }

    /// Charges `key_len + value_len` bytes; returns `true` if the caller
    /// should now consult `LevelStats` and possibly call
    /// [`Self::record_overlap`].
    pub fn charge(&mut self, key_len: usize, value_len: usize) -> bool {
        self.bytes_since_last_sample += (key_len + value_len) as u64;

        if self.bytes_since_last_sample >= self.next_sample_at {
            self.bytes_since_last_sample = 0;
            true
        } else {
            false
        }
    }

    /// Records that the sampled key lies within at least two overlapping
    /// files; decrements the hinted file's `allowed_seeks` and enqueues a
    /// compaction hint once it reaches zero, refilling the budget.
    pub fn record_overlap(&mut self, hint: ReadCompactionHint) {
        self.allowed_seeks -= 1;

        if self.allowed_seeks <= 0 {
            self.allowed_seeks = self.initial_allowed_seeks;
            self.pending.push(hint);
        }
    }

    /// Drains all pending hints, to be merged into the engine's queue at
    /// `Iterator::close`.
    pub fn drain(&mut self) -> Vec<ReadCompactionHint> {
        std::mem::take(&mut self.pending)
    }
}

impl Default for ReadSampling {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn record_overlap_enqueues_after_budget_exhausted() {
        let mut sampling = ReadSampling {
            bytes_since_last_sample: 0,
            next_sample_at: 1,
            allowed_seeks: 2,
            initial_allowed_seeks: 2,
            pending: Vec::new(),
        };

        let hint = ReadCompactionHint {
            start: "a".into(),
            end: "z".into(),
            level: 1,
            table_id: 42,
        };

        sampling.record_overlap(hint.clone());
        assert!(sampling.drain().is_empty());

        sampling.record_overlap(hint.clone());
        assert_eq!(sampling.drain(), vec![hint]);
    }

    #[test]
    fn charge_fires_once_threshold_crossed() {
        let mut sampling = ReadSampling {
            bytes_since_last_sample: 0,
            next_sample_at: 10,
            allowed_seeks: 1,
            initial_allowed_seeks: 1,
            pending: Vec::new(),
        };

        assert!(!sampling.charge(4, 4));
        assert!(sampling.charge(1, 1));
    }
}
