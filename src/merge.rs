// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Result, Slice};

/// Accumulates a single merge chain for one user key.
///
/// Fed newest-to-oldest during forward resolution (§4.1/§4.7: seeded from the
/// newest `Merge` record, then `merge_older` for every older record in the
/// chain) and oldest-to-newest during reverse resolution (§4.2: seeded from
/// the oldest record seen, then `merge_newer` for every record encountered
/// walking backward, which are progressively newer).
pub trait ValueMerger: Send {
    /// Folds in a value known to be newer than everything folded in so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be merged (e.g. malformed payload).
    fn merge_newer(&mut self, value: &[u8]) -> Result<()>;

    /// Folds in a value known to be older than everything folded in so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be merged (e.g. malformed payload).
    fn merge_older(&mut self, value: &[u8]) -> Result<()>;

    /// Finalizes the chain.
    ///
    /// `includes_base` is `true` when the chain terminated at a `Set` /
    /// `SetWithDelete` record (a concrete base value) rather than running off
    /// the start of the keyspace or a delete. Returns the resolved value and
    /// whether the chain resolves to a deletion (`need_delete`) — e.g. a
    /// merge operator that recognizes a "delete" sentinel payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the accumulated state cannot be finalized.
    fn finish(self: Box<Self>, includes_base: bool) -> Result<(Slice, bool)>;
}

/// Factory for a [`ValueMerger`], seeded with the first value observed in a
/// chain (the newest value in forward resolution, the oldest in reverse).
pub trait Merge: Send + Sync {
    /// Creates a new merger seeded with `value` for the merge chain at `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if a merger cannot be constructed for this key/value.
    fn new_merger(&self, key: &[u8], value: &[u8]) -> Result<Box<dyn ValueMerger>>;
}

/// A merge operator that concatenates operand values in oldest-to-newest
/// order, with no special "delete" sentinel.
///
/// Used by tests and the scenario in spec.md §8 item 1: a chain of
/// `Merge("+y")`, `Merge("+z")` over a base `Set("x")` concatenates, oldest
/// first, to `"xyz"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcatMerge;

impl Merge for ConcatMerge {
    fn new_merger(&self, _key: &[u8], value: &[u8]) -> Result<Box<dyn ValueMerger>> {
        Ok(Box::new(ConcatMerger {
            // Values pushed via `merge_older` go to the front; the seed value
            // starts as the single (and therefore both oldest and newest)
            // element.
            parts: std::collections::VecDeque::from([value.to_vec()]),
        }))
    }
}

struct ConcatMerger {
    parts: std::collections::VecDeque<Vec<u8>>,
}

impl ValueMerger for ConcatMerger {
    fn merge_newer(&mut self, value: &[u8]) -> Result<()> {
        self.parts.push_back(value.to_vec());
        Ok(())
    }

    fn merge_older(&mut self, value: &[u8]) -> Result<()> {
        self.parts.push_front(value.to_vec());
        Ok(())
    }

    fn finish(self: Box<Self>, _includes_base: bool) -> Result<(Slice, bool)> {
        let mut out = Vec::new();
        for part in self.parts {
            out.extend_from_slice(&part);
        }
        Ok((out.into(), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn concat_merge_orders_oldest_to_newest() -> Result<()> {
        let merge = ConcatMerge;

        // Forward resolution is seeded with the newest value first, then
        // feeds progressively older ones via `merge_older`.
        let mut merger = merge.new_merger(b"a", b"z")?;
        merger.merge_older(b"y")?;
        merger.merge_older(b"x")?;

        let (value, need_delete) = merger.finish(true)?;
        assert_eq!(&*value, b"xyz");
        assert!(!need_delete);

        Ok(())
    }

    #[test]
    fn concat_merge_reverse_direction_via_merge_newer() -> Result<()> {
        let merge = ConcatMerge;

        // Reverse resolution is seeded with the oldest value first, then
        // feeds progressively newer ones via `merge_newer`.
        let mut merger = merge.new_merger(b"a", b"x")?;
        merger.merge_newer(b"y")?;
        merger.merge_newer(b"z")?;

        let (value, _) = merger.finish(true)?;
        assert_eq!(&*value, b"xyz");

        Ok(())
    }
}
