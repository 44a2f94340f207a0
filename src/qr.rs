//! QR strategy: factor the weighted design matrix directly as M = Q·R.
//!
//! The Gram matrix is never formed, so the condition number of the problem
//! is not squared. The middle ground between Cholesky's speed and SVD's
//! robustness. Ill-conditioning is never an error here: a near-rank-deficient
//! design yields small diagonal entries in R and an ill-conditioned but
//! defined inverse, which downstream cross-validation detects through a
//! growing Gram-inverse trace.
//!
//! Growing the active set re-orthogonalizes only the appended columns
//! against the existing Q (modified Gram–Schmidt with one
//! re-orthogonalization pass, O(N·p) per column). Removing columns or
//! changing rows is a full Householder recompute, the same growth/shrink
//! asymmetry as the Cholesky strategy.

use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use ndarray_linalg::{Diag, QR, SolveTriangular, UPLO};

use crate::error::SolverError;
use crate::method::{FitState, LeastSquaresSolver};
use crate::proxy::DesignProxy;

struct QrFactor {
    /// Orthonormal columns, active rows × p.
    q: Array2<f64>,
    /// Square upper-triangular R, p × p.
    r: Array2<f64>,
    /// Lazily computed R⁻¹.
    r_inv: Option<Array2<f64>>,
}

/// Least-squares solver maintaining a thin QR factorization of the weighted
/// design matrix.
pub struct QrMethod {
    state: FitState,
    factor: Option<QrFactor>,
}

impl QrMethod {
    pub fn new(
        proxy: Arc<dyn DesignProxy>,
        targets: Array1<f64>,
        weight: Option<Array1<f64>>,
        indices: Vec<usize>,
    ) -> Result<Self, SolverError> {
        Ok(Self::from_state(FitState::new(
            proxy, targets, weight, indices,
        )?))
    }

    pub fn from_state(state: FitState) -> Self {
        Self {
            state,
            factor: None,
        }
    }

    fn build_factor(&self) -> Result<QrFactor, SolverError> {
        let rows = self.state.active_rows();
        let cols = self.state.active_columns();
        if rows < cols {
            return Err(SolverError::UnderdeterminedSystem { rows, cols });
        }
        let design = self.state.weighted_design(false);
        log::debug!("QR: factoring {rows}x{cols} weighted design from scratch");
        let (q, r) = design.qr().map_err(SolverError::DecompositionFailed)?;
        Ok(QrFactor { q, r, r_inv: None })
    }

    fn factor(&mut self) -> Result<&QrFactor, SolverError> {
        if self.factor.is_none() {
            self.factor = Some(self.build_factor()?);
        }
        Ok(self.factor.as_ref().unwrap())
    }

    fn factor_mut(&mut self) -> Result<&mut QrFactor, SolverError> {
        if self.factor.is_none() {
            self.factor = Some(self.build_factor()?);
        }
        Ok(self.factor.as_mut().unwrap())
    }

    /// Orthogonalizes one appended weighted column against Q and extends R.
    ///
    /// Returns false when the residual norm collapses (the new column lies
    /// in the span of the current ones to machine precision); the caller
    /// then falls back to a full Householder rebuild, which handles the
    /// degeneracy through small R pivots.
    fn append_column(factor: &mut QrFactor, column: ArrayView1<'_, f64>) -> bool {
        let p = factor.q.ncols();
        let mut v = column.to_owned();
        let mut coeffs = Array1::zeros(p);
        // One re-orthogonalization pass keeps Q orthonormal in practice
        // ("twice is enough").
        for _ in 0..2 {
            for k in 0..p {
                let proj = factor.q.column(k).dot(&v);
                coeffs[k] += proj;
                v.scaled_add(-proj, &factor.q.column(k));
            }
        }
        let column_norm = column.dot(&column).sqrt();
        let residual_norm = v.dot(&v).sqrt();
        if residual_norm <= column_norm * f64::EPSILON * (factor.q.nrows() as f64) {
            log::debug!(
                "QR: appended column is numerically in the current span (residual {residual_norm:.3e})"
            );
            return false;
        }
        v /= residual_norm;

        let appended = v.insert_axis(Axis(1));
        factor.q = ndarray::concatenate(Axis(1), &[factor.q.view(), appended.view()])
            .expect("row counts agree by construction");
        let mut r = Array2::zeros((p + 1, p + 1));
        r.slice_mut(s![..p, ..p]).assign(&factor.r);
        r.slice_mut(s![..p, p]).assign(&coeffs);
        r[(p, p)] = residual_norm;
        factor.r = r;
        factor.r_inv = None;
        true
    }

    fn r_inverse(factor: &mut QrFactor) -> Result<&Array2<f64>, SolverError> {
        if factor.r_inv.is_none() {
            let identity = Array2::eye(factor.r.nrows());
            let inv = factor
                .r
                .solve_triangular(UPLO::Upper, Diag::NonUnit, &identity)
                .map_err(SolverError::DecompositionFailed)?;
            factor.r_inv = Some(inv);
        }
        Ok(factor.r_inv.as_ref().unwrap())
    }
}

impl LeastSquaresSolver for QrMethod {
    fn state(&self) -> &FitState {
        &self.state
    }

    /// Preferred entry point: z = Qᵗ·(√W·rhs), then back-solve R·x = z.
    fn solve(&mut self, rhs: ArrayView1<'_, f64>) -> Result<Array1<f64>, SolverError> {
        let b = self.state.weighted_rhs(rhs)?;
        let factor = self.factor()?;
        let z = factor.q.t().dot(&b);
        factor
            .r
            .solve_triangular(UPLO::Upper, Diag::NonUnit, &z)
            .map_err(SolverError::DecompositionFailed)
    }

    /// Same computation as [`solve`](Self::solve); exposed for contract
    /// parity with the normal-equation strategies.
    fn solve_normal(&mut self, rhs: ArrayView1<'_, f64>) -> Result<Array1<f64>, SolverError> {
        self.solve(rhs)
    }

    fn gram_inverse(&mut self) -> Result<Array2<f64>, SolverError> {
        let factor = self.factor_mut()?;
        let r_inv = Self::r_inverse(factor)?;
        Ok(r_inv.dot(&r_inv.t()))
    }

    fn gram_inverse_trace(&mut self) -> Result<f64, SolverError> {
        // trace(R⁻¹R⁻ᵗ) = ‖R⁻¹‖²_F.
        let factor = self.factor_mut()?;
        let r_inv = Self::r_inverse(factor)?;
        Ok(r_inv.iter().map(|v| v * v).sum())
    }

    fn update(
        &mut self,
        added: &[usize],
        conserved: &[usize],
        removed: &[usize],
        row: bool,
    ) -> Result<(), SolverError> {
        let plan = self.state.plan_update(added, conserved, removed, row)?;

        if let Some(factor) = self.factor.as_mut() {
            if !row && plan.pure_growth {
                if self.state.active_rows() < factor.q.ncols() + plan.appended.len() {
                    return Err(SolverError::UnderdeterminedSystem {
                        rows: self.state.active_rows(),
                        cols: factor.q.ncols() + plan.appended.len(),
                    });
                }
                log::debug!(
                    "QR: incrementally orthogonalizing {} appended columns",
                    plan.appended.len()
                );
                for &index in &plan.appended {
                    let column = self.state.weighted_columns(&[index], false);
                    if !Self::append_column(factor, column.column(0)) {
                        log::debug!("QR: falling back to full rebuild for index {index}");
                        self.factor = None;
                        break;
                    }
                }
            } else {
                log::debug!("QR: column removal or row change, discarding factor for rebuild");
                self.factor = None;
            }
        }

        self.state.apply_update(&plan, row);
        Ok(())
    }

    fn trash_decomposition(&mut self) {
        self.factor = None;
    }
}
