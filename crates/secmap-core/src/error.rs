use thiserror::Error;

use crate::store::StoreError;

/// Validation and contract errors exposed by `secmap-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("cusip cannot be empty")]
    EmptyCusip,
    #[error("cusip must be 8 or 9 characters, got {len}: '{value}'")]
    CusipLength { value: String, len: usize },
    #[error("cusip contains invalid character '{ch}' at index {index}")]
    CusipInvalidChar { ch: char, index: usize },

    #[error("symbol cannot be empty")]
    EmptySymbol,
    #[error("symbol length {len} exceeds max {max}")]
    SymbolTooLong { len: usize, max: usize },
    #[error("symbol contains invalid character '{ch}' at index {index}")]
    SymbolInvalidChar { ch: char, index: usize },

    #[error("'{field}' bounds are inverted: min {min} > max {max}")]
    InvertedBounds {
        field: &'static str,
        min: String,
        max: String,
    },
    #[error("'{field}' initial value {initial} is outside [{min}, {max}]")]
    InitialOutOfBounds {
        field: &'static str,
        initial: String,
        min: String,
        max: String,
    },
    #[error("field '{field}' must be positive")]
    NonPositiveValue { field: &'static str },
    #[error("field '{field}' must be finite")]
    NonFiniteValue { field: &'static str },
}

/// Run-level error. Per-call lookup failures never surface here; they end up as
/// unresolved results instead.
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to read from store: {0}")]
    StoreRead(#[source] StoreError),

    #[error("store write failed, run aborted: {0}")]
    StoreWrite(#[source] StoreError),
}
