// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{binary_search::partition_point, InternalKV, Result};

/// Flags accompanying a forward seek.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeekGEFlags {
    /// Hint that the caller believes the target is close ahead of the current
    /// position and the seek may be satisfiable by stepping forward instead
    /// of descending into the collaborator's index structures from scratch.
    pub try_seek_using_next: bool,

    /// Set when an indexed batch was just refreshed by `set_options`; tells
    /// the collaborator to ignore any `try_seek_using_next` hint, since the
    /// underlying data may have grown since the last position was valid.
    pub batch_just_refreshed: bool,
}

/// Flags accompanying a backward seek.
///
/// Currently carries no fields; kept distinct from [`SeekGEFlags`] because
/// the two directions diverge (`SeekLT` has no seek-using-next optimization).
#[derive(Debug, Clone, Copy, Default)]
pub struct SeekLTFlags {
    _private: (),
}

/// Ordered bidirectional cursor over internal key-value records, implemented
/// by a lower layer (merging/level/memtable/sstable/batch iterators) that
/// this crate treats as an out-of-scope collaborator.
///
/// Ordering contract: user keys ascending; within a user key, records sorted
/// by trailer strictly descending (newest first).
pub trait InternalIterator: Send {
    /// Seeks to the first record with `user_key >= key`.
    fn seek_ge(&mut self, key: &[u8], flags: SeekGEFlags) -> Option<InternalKV>;

    /// Seeks to the first record `>= key` whose user key falls within
    /// `prefix`'s domain. The collaborator is permitted (but not required) to
    /// use `prefix` to skip whole blocks/files.
    fn seek_prefix_ge(&mut self, prefix: &[u8], key: &[u8], flags: SeekGEFlags) -> Option<InternalKV>;

    /// Seeks to the last record with `user_key < key`.
    fn seek_lt(&mut self, key: &[u8], flags: SeekLTFlags) -> Option<InternalKV>;

    /// Seeks to the first record within bounds.
    fn first(&mut self) -> Option<InternalKV>;

    /// Seeks to the last record within bounds.
    fn last(&mut self) -> Option<InternalKV>;

    /// Steps to the next record.
    fn next(&mut self) -> Option<InternalKV>;

    /// Steps to the previous record.
    fn prev(&mut self) -> Option<InternalKV>;

    /// Steps directly to the first record whose user key is `>= succ_key`,
    /// skipping the remainder of the current prefix without visiting every
    /// record in between. `succ_key` is the caller's `Comparer::immediate_successor`
    /// of the current prefix.
    fn next_prefix(&mut self, succ_key: &[u8]) -> Option<InternalKV>;

    /// Restricts the iterator to `[lower, upper)`, invalidating its position.
    fn set_bounds(&mut self, lower: Option<&[u8]>, upper: Option<&[u8]>);

    /// Takes the latched error, if any, clearing it.
    fn take_error(&mut self) -> Option<crate::Error>;

    /// Releases any resources held by the collaborator.
    ///
    /// # Errors
    ///
    /// Returns an error if releasing resources failed.
    fn close(&mut self) -> Result<()>;

    /// Produces an independent cursor over the same underlying data,
    /// positioned at the start. Used by `Iterator::clone`.
    ///
    /// # Errors
    ///
    /// Returns an error if the collaborator cannot be cloned (e.g. it owns a
    /// resource that forbids a second concurrent view).
    fn try_clone(&self) -> Result<Box<dyn InternalIterator>>;

    /// Per-level overlap statistics for whatever key the collaborator is
    /// currently positioned at, used to drive read-triggered compaction
    /// hints (spec §5). Collaborators that don't track this return `None`.
    fn level_stats(&self) -> Option<crate::stats::LevelStats> {
        None
    }
}

/// An in-memory, sorted `InternalIterator` over a fixed `Vec<InternalKV>`.
///
/// Used by this crate's own tests as a stand-in for the real merging
/// iterator: records must already be supplied in the ordering contract
/// `InternalIterator` requires (callers typically build this from several
/// sources pre-merged by key).
#[derive(Debug, Clone)]
pub struct VecIterator {
    records: Vec<InternalKV>,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    /// Index of the current record. `-1` means positioned before the first
    /// record, `records.len()` means positioned after the last — distinct
    /// sentinels so that stepping in the opposite direction after running off
    /// either end resumes from the correct side instead of collapsing both
    /// boundaries into one "nowhere" state.
    pos: isize,
}

impl VecIterator {
    /// Builds a collaborator from already-sorted records (ascending user key,
    /// descending trailer within a user key).
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `records` is not sorted per the
    /// `InternalIterator` ordering contract.
    #[must_use]
    pub fn new(records: Vec<InternalKV>) -> Self {
        debug_assert!(
            records.windows(2).all(|w| w[0].key <= w[1].key),
            "VecIterator requires pre-sorted input"
        );

        Self {
            records,
            lower: None,
            upper: None,
            pos: -1,
        }
    }

    fn in_bounds(&self, user_key: &[u8]) -> bool {
        self.lower.as_deref().is_none_or(|l| user_key >= l)
            && self.upper.as_deref().is_none_or(|u| user_key < u)
    }

    fn at(&self, idx: isize) -> Option<InternalKV> {
        let idx = usize::try_from(idx).ok()?;
        let record = self.records.get(idx)?;
        self.in_bounds(&record.key.user_key).then(|| record.clone())
    }
}

impl InternalIterator for VecIterator {
    fn seek_ge(&mut self, key: &[u8], _flags: SeekGEFlags) -> Option<InternalKV> {
        let idx = partition_point(&self.records, |kv| &*kv.key.user_key < key);
        self.pos = idx as isize;
        self.at(self.pos)
    }

    fn seek_prefix_ge(&mut self, _prefix: &[u8], key: &[u8], flags: SeekGEFlags) -> Option<InternalKV> {
        self.seek_ge(key, flags)
    }

    fn seek_lt(&mut self, key: &[u8], _flags: SeekLTFlags) -> Option<InternalKV> {
        let idx = partition_point(&self.records, |kv| &*kv.key.user_key < key);
        self.pos = idx as isize - 1;
        self.at(self.pos)
    }

    fn first(&mut self) -> Option<InternalKV> {
        let idx = match &self.lower {
            Some(lower) => partition_point(&self.records, |kv| *kv.key.user_key < **lower),
            None => 0,
        };
        self.pos = idx as isize;
        self.at(self.pos)
    }

    fn last(&mut self) -> Option<InternalKV> {
        let idx = match &self.upper {
            Some(upper) => partition_point(&self.records, |kv| *kv.key.user_key < **upper),
            None => self.records.len(),
        };
        self.pos = idx as isize - 1;
        self.at(self.pos)
    }

    fn next(&mut self) -> Option<InternalKV> {
        self.pos += 1;
        self.at(self.pos)
    }

    fn prev(&mut self) -> Option<InternalKV> {
        self.pos -= 1;
        self.at(self.pos)
    }

    fn next_prefix(&mut self, succ_key: &[u8]) -> Option<InternalKV> {
        self.seek_ge(succ_key, SeekGEFlags::default())
    }

    fn set_bounds(&mut self, lower: Option<&[u8]>, upper: Option<&[u8]>) {
        self.lower = lower.map(<[u8]>::to_vec);
        self.upper = upper.map(<[u8]>::to_vec);
        self.pos = -1;
    }

    fn take_error(&mut self) -> Option<crate::Error> {
        None
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn InternalIterator>> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ValueKind;
    use test_log::test;

    fn fixture() -> VecIterator {
        VecIterator::new(vec![
            InternalKV::new("a", 5, ValueKind::Set, "1"),
            InternalKV::new("b", 3, ValueKind::Set, "2"),
            InternalKV::new("c", 1, ValueKind::Set, "3"),
        ])
    }

    #[test]
    fn seek_ge_lands_on_or_after() {
        let mut it = fixture();
        assert_eq!(&*it.seek_ge(b"b", SeekGEFlags::default()).unwrap().key.user_key, b"b");
        assert_eq!(&*it.seek_ge(b"ba", SeekGEFlags::default()).unwrap().key.user_key, b"c");
        assert!(it.seek_ge(b"z", SeekGEFlags::default()).is_none());
    }

    #[test]
    fn seek_lt_lands_strictly_before() {
        let mut it = fixture();
        assert_eq!(&*it.seek_lt(b"b", SeekLTFlags::default()).unwrap().key.user_key, b"a");
        assert!(it.seek_lt(b"a", SeekLTFlags::default()).is_none());
    }

    #[test]
    fn forward_and_backward_traversal() {
        let mut it = fixture();
        assert_eq!(&*it.first().unwrap().key.user_key, b"a");
        assert_eq!(&*it.next().unwrap().key.user_key, b"b");
        assert_eq!(&*it.next().unwrap().key.user_key, b"c");
        assert!(it.next().is_none());

        let mut it = fixture();
        assert_eq!(&*it.last().unwrap().key.user_key, b"c");
        assert_eq!(&*it.prev().unwrap().key.user_key, b"b");
        assert_eq!(&*it.prev().unwrap().key.user_key, b"a");
        assert!(it.prev().is_none());
    }

    #[test]
    fn bounds_restrict_visibility() {
        let mut it = fixture();
        it.set_bounds(Some(b"b"), Some(b"c"));
        assert_eq!(&*it.first().unwrap().key.user_key, b"b");
        assert!(it.next().is_none());
    }
}
