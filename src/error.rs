//! Error types for the least-squares engine.
//!
//! Failures fall into three families: invalid caller input (rejected before
//! any state is mutated), numerical failure of a factorization (Cholesky
//! only; QR and SVD degrade instead of failing), and internally inconsistent
//! update requests.

use thiserror::Error;

/// A comprehensive error type for solver construction, updates and solves.
#[derive(Error, Debug)]
pub enum SolverError {
    #[error("the target sample has {found} entries but the design proxy holds {expected} observations")]
    TargetSizeMismatch { found: usize, expected: usize },

    #[error("the weight vector has {found} entries; expected 0 (uniform) or {expected}")]
    WeightSizeMismatch { found: usize, expected: usize },

    #[error("weight {value} at observation {index} is not strictly positive and finite")]
    NonPositiveWeight { index: usize, value: f64 },

    #[error("the right-hand side has {found} entries but the sample has {expected} observations")]
    RhsSizeMismatch { found: usize, expected: usize },

    #[error("{kind} index {index} appears more than once")]
    DuplicateIndex { kind: IndexKind, index: usize },

    #[error("{kind} index {index} is out of range for a candidate set of size {size}")]
    IndexOutOfRange {
        kind: IndexKind,
        index: usize,
        size: usize,
    },

    #[error("{kind} index {index} marked as conserved or removed is not part of the current model")]
    NotCurrentIndex { kind: IndexKind, index: usize },

    #[error("{kind} index {index} marked as added is already part of the current model")]
    AlreadyCurrentIndex { kind: IndexKind, index: usize },

    #[error(
        "{kind} index {index} appears in more than one of the added/conserved/removed sets of an update"
    )]
    ConflictingUpdate { kind: IndexKind, index: usize },

    #[error(
        "the QR strategy needs at least as many active observations as basis functions (rows = {rows}, columns = {cols})"
    )]
    UnderdeterminedSystem { rows: usize, cols: usize },

    #[error(
        "the Gram matrix is not positive definite (near-collinear or duplicated basis columns): {detail}"
    )]
    NotPositiveDefinite { detail: String },

    #[error("the underlying matrix decomposition driver failed: {0}")]
    DecompositionFailed(ndarray_linalg::error::LinalgError),
}

/// Whether an index refers to a basis column or an observation row.
///
/// `update` accepts both flavors; error messages carry the distinction so a
/// misrouted row/column update is diagnosable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Basis,
    Row,
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexKind::Basis => write!(f, "basis"),
            IndexKind::Row => write!(f, "observation"),
        }
    }
}
