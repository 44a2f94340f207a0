//! The design proxy: the solver's only view of the candidate basis.
//!
//! The engine never evaluates basis functions itself. It asks a
//! [`DesignProxy`] for the design-matrix columns of a chosen index subset and
//! treats the result as opaque data. Basis enumeration, functional evaluation
//! and evaluation caching all live behind this trait; a proxy is shared
//! read-only across solver instances (one per cross-validation fold), so
//! implementors own their interior synchronization.

use ndarray::{Array2, Axis};

/// Evaluates design-matrix columns for a fixed sample of input points.
///
/// `compute_design` must be deterministic and side-effect-free: the same
/// index list always yields the same columns, rows ordered like the sample.
pub trait DesignProxy: Send + Sync {
    /// Number of observations (rows of every returned design matrix).
    fn sample_size(&self) -> usize;

    /// Size of the full candidate basis; valid indices are `0..basis_size()`.
    fn basis_size(&self) -> usize;

    /// Design columns for `indices`, over the whole sample.
    ///
    /// Shape: `(sample_size(), indices.len())`, column `j` evaluating basis
    /// function `indices[j]`.
    fn compute_design(&self, indices: &[usize]) -> Array2<f64>;
}

/// A proxy over a fully materialized candidate design matrix.
///
/// Covers the common case where the caller has already evaluated every
/// candidate basis function on the sample; `compute_design` is then a plain
/// column selection. Also the fixture proxy used throughout the test suite.
#[derive(Debug, Clone)]
pub struct MatrixProxy {
    design: Array2<f64>,
}

impl MatrixProxy {
    /// Wraps the full `(n_observations, n_candidates)` design matrix.
    pub fn new(design: Array2<f64>) -> Self {
        Self { design }
    }

    /// The full candidate design matrix.
    pub fn design(&self) -> &Array2<f64> {
        &self.design
    }
}

impl DesignProxy for MatrixProxy {
    fn sample_size(&self) -> usize {
        self.design.nrows()
    }

    fn basis_size(&self) -> usize {
        self.design.ncols()
    }

    fn compute_design(&self, indices: &[usize]) -> Array2<f64> {
        self.design.select(Axis(1), indices)
    }
}
