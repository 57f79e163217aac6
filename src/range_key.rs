// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Slice;

/// One `(suffix, value)` payload within a range-key span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeKeyData {
    /// The version/suffix this payload was set at.
    pub suffix: Slice,
    /// The payload itself.
    pub value: Slice,
}

/// A covering range-key span `[start, end)` and the payloads set over it,
/// sorted by `suffix` ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeKeySpan {
    /// Inclusive start of the span.
    pub start: Slice,
    /// Exclusive end of the span.
    pub end: Slice,
    /// Payloads, sorted by suffix ascending.
    pub keys: Vec<RangeKeyData>,
}

/// Interleaving fragment-iterator collaborator: when range keys are enabled,
/// produces a synthetic `RangeKeySet` internal record at the start boundary
/// of every overlapping span, and exposes whichever span currently covers the
/// iterator's position.
pub trait RangeKeyStack: Send {
    /// The span currently covering the iterator's position, if any.
    fn span(&self) -> Option<&RangeKeySpan>;

    /// Drains the "span may have changed" latch.
    ///
    /// Returns `true` at most once per change; the cursor calls this from
    /// `save_range_key` to decide whether it needs to re-materialize its
    /// owned copy of the span.
    fn take_stale(&mut self) -> bool;

    /// Produces an independent cursor over the same spans, used by
    /// `Iterator::clone`.
    fn box_clone(&self) -> Box<dyn RangeKeyStack>;
}

/// A `RangeKeyStack` test double driven by a fixed, pre-sorted list of spans.
///
/// Positioned independently of any `InternalIterator`; tests drive it in
/// lockstep with the point-key fixture by calling `seek_covering`/`advance`
/// at the same moments the `Iterator` core would consult the real
/// interleaving collaborator.
#[derive(Debug, Clone)]
pub struct VecRangeKeyStack {
    spans: Vec<RangeKeySpan>,
    current: Option<usize>,
    stale: bool,
}

impl VecRangeKeyStack {
    /// Builds a stack from spans sorted by `start` ascending and
    /// non-overlapping (the interleaving collaborator guarantees this).
    #[must_use]
    pub fn new(spans: Vec<RangeKeySpan>) -> Self {
        Self {
            spans,
            current: None,
            stale: false,
        }
    }

    /// Positions the stack at the span covering `key`, if any.
    pub fn seek_covering(&mut self, key: &[u8]) {
        let found = self
            .spans
            .iter()
            .position(|span| &*span.start <= key && key < &*span.end);

        if found != self.current {
            self.stale = true;
        }
        self.current = found;
    }

    /// Clears the covering span (used when stepping off the end of a span
    /// with no replacement).
    pub fn clear(&mut self) {
        if self.current.is_some() {
            self.stale = true;
        }
        self.current = None;
    }
}

impl RangeKeyStack for VecRangeKeyStack {
    fn span(&self) -> Option<&RangeKeySpan> {
        self.current.and_then(|idx| self.spans.get(idx))
    }

    fn take_stale(&mut self) -> bool {
        std::mem::take(&mut self.stale)
    }

    fn box_clone(&self) -> Box<dyn RangeKeyStack> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn span(start: &str, end: &str) -> RangeKeySpan {
        RangeKeySpan {
            start: start.into(),
            end: end.into(),
            keys: vec![RangeKeyData {
                suffix: "@1".into(),
                value: "v".into(),
            }],
        }
    }

    #[test]
    fn seek_covering_finds_overlapping_span() {
        let mut stack = VecRangeKeyStack::new(vec![span("a", "c"), span("m", "z")]);

        stack.seek_covering(b"b");
        assert_eq!(stack.span().unwrap().start.as_ref(), b"a");
        assert!(stack.take_stale());
        assert!(!stack.take_stale());

        stack.seek_covering(b"d");
        assert!(stack.span().is_none());
        assert!(stack.take_stale());
    }

    #[test]
    fn reseeking_into_the_same_span_does_not_mark_stale() {
        let mut stack = VecRangeKeyStack::new(vec![span("a", "c")]);
        stack.seek_covering(b"a");
        assert!(stack.take_stale());

        stack.seek_covering(b"b");
        assert!(!stack.take_stale());
    }
}
