//! Cholesky strategy: factor the weighted Gram matrix as G = L·Lᵗ.
//!
//! The cheapest strategy per solve (O(p²) given L) and the only one with an
//! O(p²) incremental path for both appended basis columns and appended
//! observation rows. The price is strictness: a Gram matrix that is not
//! positive definite (duplicated or near-collinear basis columns) fails
//! with [`SolverError::NotPositiveDefinite`], where QR and SVD would return
//! a degraded but defined answer.
//!
//! Growth/shrink asymmetry: appending columns extends L one row at a time
//! via the rank-extension formula, and removing a trailing suffix of the
//! active set truncates L in place; removing anything else breaks the
//! triangular structure and forces a full refactorization of the surviving
//! Gram submatrix.

use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use ndarray_linalg::{Cholesky, Diag, SolveTriangular, UPLO};

use crate::error::SolverError;
use crate::method::{FitState, LeastSquaresSolver};
use crate::proxy::DesignProxy;

struct CholeskyFactor {
    /// Lower-triangular L with G = L·Lᵗ, ordered like `current_indices`.
    lower: Array2<f64>,
    /// Weighted design the factor was built from; kept for incremental
    /// cross products and appended alongside L.
    design: Array2<f64>,
    /// Lazily computed L⁻¹ (triangular inversion is O(p³), done once).
    lower_inv: Option<Array2<f64>>,
}

/// Least-squares solver maintaining a Cholesky factor of the weighted Gram
/// matrix.
pub struct CholeskyMethod {
    state: FitState,
    factor: Option<CholeskyFactor>,
}

impl CholeskyMethod {
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

    fn build_factor(&self) -> Result<CholeskyFactor, SolverError> {
        let design = self.state.weighted_design(false);
        let gram = design.t().dot(&design);
        log::debug!(
            "Cholesky: factoring {}x{} Gram matrix from scratch",
            gram.nrows(),
            gram.ncols()
        );
        let lower = gram.cholesky(UPLO::Lower).map_err(|e| {
            SolverError::NotPositiveDefinite {
                detail: e.to_string(),
            }
        })?;
        Ok(CholeskyFactor {
            lower,
            design,
            lower_inv: None,
        })
    }

    fn factor(&mut self) -> Result<&CholeskyFactor, SolverError> {
        if self.factor.is_none() {
            self.factor = Some(self.build_factor()?);
        }
        Ok(self.factor.as_ref().unwrap())
    }

    fn factor_mut(&mut self) -> Result<&mut CholeskyFactor, SolverError> {
        if self.factor.is_none() {
            self.factor = Some(self.build_factor()?);
        }
        Ok(self.factor.as_mut().unwrap())
    }

    /// Extends L by one row/column for each appended basis index.
    ///
    /// For a new weighted column m: solve L·v = Mᵗm, then the new diagonal
    /// entry is √(mᵗm − vᵗv). A non-positive pivot means the extended Gram
    /// matrix is no longer positive definite.
    fn extend_columns(
        factor: &mut CholeskyFactor,
        state: &FitState,
        appended: &[usize],
    ) -> Result<(), SolverError> {
        for &index in appended {
            let column = state.weighted_columns(&[index], false);
            let column = column.column(0);
            let p = factor.lower.nrows();
            let cross = factor.design.t().dot(&column);
            let diag_term = column.dot(&column);

            let v = if p == 0 {
                Array1::zeros(0)
            } else {
                factor
                    .lower
                    .solve_triangular(UPLO::Lower, Diag::NonUnit, &cross)
                    .map_err(SolverError::DecompositionFailed)?
            };
            let pivot = diag_term - v.dot(&v);
            if pivot <= 0.0 || !pivot.is_finite() {
                return Err(SolverError::NotPositiveDefinite {
                    detail: format!(
                        "appending basis index {index} produced extension pivot {pivot:.3e}"
                    ),
                });
            }

            let mut lower = Array2::zeros((p + 1, p + 1));
            lower.slice_mut(s![..p, ..p]).assign(&factor.lower);
            lower.slice_mut(s![p, ..p]).assign(&v);
            lower[(p, p)] = pivot.sqrt();
            factor.lower = lower;
            factor.design = ndarray::concatenate(
                Axis(1),
                &[factor.design.view(), column.insert_axis(Axis(1))],
            )
            .expect("row counts agree by construction");
        }
        factor.lower_inv = None;
        Ok(())
    }

    /// Rank-one update of L for each appended observation row
    /// (G ← G + x·xᵗ), the streaming-sample counterpart of column growth.
    fn extend_rows(factor: &mut CholeskyFactor, state: &FitState, appended: &[usize]) {
        let indices = state.current_indices().to_vec();
        let full = state.weighted_columns(&indices, true);
        let p = factor.lower.nrows();
        for &row in appended {
            let mut x = full.row(row).to_owned();
            // Givens-style cholupdate: O(p²) per row.
            for k in 0..p {
                let lkk = factor.lower[(k, k)];
                let r = lkk.hypot(x[k]);
                let c = r / lkk;
                let s_val = x[k] / lkk;
                factor.lower[(k, k)] = r;
                for i in (k + 1)..p {
                    let lik = (factor.lower[(i, k)] + s_val * x[i]) / c;
                    x[i] = c * x[i] - s_val * lik;
                    factor.lower[(i, k)] = lik;
                }
            }
            factor.design = ndarray::concatenate(
                Axis(0),
                &[factor.design.view(), full.row(row).insert_axis(Axis(0))],
            )
            .expect("column counts agree by construction");
        }
        factor.lower_inv = None;
    }

    fn lower_inverse(factor: &mut CholeskyFactor) -> Result<&Array2<f64>, SolverError> {
        if factor.lower_inv.is_none() {
            let identity = Array2::eye(factor.lower.nrows());
            let inv = factor
                .lower
                .solve_triangular(UPLO::Lower, Diag::NonUnit, &identity)
                .map_err(SolverError::DecompositionFailed)?;
            factor.lower_inv = Some(inv);
        }
        Ok(factor.lower_inv.as_ref().unwrap())
    }
}

impl LeastSquaresSolver for CholeskyMethod {
    fn state(&self) -> &FitState {
        &self.state
    }

    fn solve_normal(&mut self, rhs: ArrayView1<'_, f64>) -> Result<Array1<f64>, SolverError> {
        let b = self.state.weighted_rhs(rhs)?;
        let factor = self.factor()?;
        let c = factor.design.t().dot(&b);
        let y = factor
            .lower
            .solve_triangular(UPLO::Lower, Diag::NonUnit, &c)
            .map_err(SolverError::DecompositionFailed)?;
        let upper = factor.lower.t().to_owned();
        upper
            .solve_triangular(UPLO::Upper, Diag::NonUnit, &y)
            .map_err(SolverError::DecompositionFailed)
    }

    fn gram_inverse(&mut self) -> Result<Array2<f64>, SolverError> {
        let factor = self.factor_mut()?;
        let lower_inv = Self::lower_inverse(factor)?;
        Ok(lower_inv.t().dot(lower_inv))
    }

    fn gram_inverse_trace(&mut self) -> Result<f64, SolverError> {
        // trace(G⁻¹) = trace(L⁻ᵗL⁻¹) = ‖L⁻¹‖²_F.
        let factor = self.factor_mut()?;
        let lower_inv = Self::lower_inverse(factor)?;
        Ok(lower_inv.iter().map(|v| v * v).sum())
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
            if row {
                if plan.pure_growth {
                    log::debug!(
                        "Cholesky: rank-one updating for {} appended rows",
                        plan.appended.len()
                    );
                    Self::extend_rows(factor, &self.state, &plan.appended);
                } else {
                    log::debug!("Cholesky: row removal, discarding factor for full rebuild");
                    self.factor = None;
                }
            } else if plan.is_prefix {
                if plan.retained < factor.lower.nrows() {
                    log::debug!(
                        "Cholesky: truncating factor from {} to {} columns",
                        factor.lower.nrows(),
                        plan.retained
                    );
                    factor.lower = factor.lower.slice(s![..plan.retained, ..plan.retained]).to_owned();
                    factor.design = factor.design.slice(s![.., ..plan.retained]).to_owned();
                    factor.lower_inv = None;
                }
                if !plan.appended.is_empty() {
                    log::debug!(
                        "Cholesky: extending factor by {} appended columns",
                        plan.appended.len()
                    );
                    if let Err(e) = Self::extend_columns(factor, &self.state, &plan.appended) {
                        // A partially extended factor is unusable; drop it so
                        // the active set stays untouched by the failed update.
                        self.factor = None;
                        return Err(e);
                    }
                }
            } else {
                log::debug!("Cholesky: non-trailing removal, discarding factor for full rebuild");
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
