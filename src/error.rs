// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Represents errors that can occur while driving an [`crate::Iterator`]
#[derive(Debug)]
pub enum Error {
    /// The internal iterator yielded data that violates the contract it owes the
    /// cursor: an unrecognized key kind, a `RangeKeySet` seen mid-user-key, range
    /// keys out of suffix order, or a `RangeKeySet` ordering violation against a
    /// `Merge` record.
    Corruption(String),

    /// The caller asked the cursor to do something its current state forbids:
    /// stepping backwards in prefix mode, calling `next_prefix` under a versioned
    /// upper bound, switching direction through `can_deterministically_single_delete`,
    /// calling it twice at the same position, or seeking a prefix whose bound
    /// doesn't share the search key's prefix.
    ContractViolation(&'static str),

    /// A `ValueMerger` reported an error while resolving a merge chain
    Merge(Box<dyn std::error::Error + Send + Sync>),

    /// The `InternalIterator` collaborator reported an error
    Internal(Box<dyn std::error::Error + Send + Sync>),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
            Self::ContractViolation(msg) => write!(f, "contract violation: {msg}"),
            Self::Merge(err) => write!(f, "merge error: {err}"),
            Self::Internal(err) => write!(f, "internal iterator error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Merge(err) | Self::Internal(err) => Some(err.as_ref()),
            Self::Corruption(_) | Self::ContractViolation(_) => None,
        }
    }
}

/// Cursor result
pub type Result<T> = std::result::Result<T, Error>;
