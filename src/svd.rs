//! SVD strategy: factor the weighted design matrix as M = U·Σ·Vᵗ.
//!
//! The robust end of the strategy spectrum. Every solve goes through the
//! truncated pseudo-inverse, so a rank-deficient or over-parameterized basis
//! still yields a bounded-norm least-squares solution instead of an error.
//! The price: there is no cheap incremental path for column or row changes,
//! so every `update` recomputes the decomposition from scratch.
//!
//! Singular values below `truncation_factor · ε · σmax` are treated as zero.
//! The default factor is the active row count (the usual LAPACK-style
//! relative threshold); `with_truncation_factor` overrides it.

use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView1, s};
use ndarray_linalg::{JobSvd, SVDDC};

use crate::error::SolverError;
use crate::method::{FitState, LeastSquaresSolver};
use crate::proxy::DesignProxy;

struct SvdFactor {
    /// Thin U: active rows × min(rows, p).
    u: Array2<f64>,
    /// Singular values, descending.
    sigma: Array1<f64>,
    /// Vᵗ: min(rows, p) × p.
    vt: Array2<f64>,
    /// Number of singular values above the truncation cutoff.
    retained: usize,
}

/// Least-squares solver maintaining a truncated singular value
/// decomposition of the weighted design matrix.
pub struct SvdMethod {
    state: FitState,
    factor: Option<SvdFactor>,
    truncation_factor: Option<f64>,
}

impl SvdMethod {
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
            truncation_factor: None,
        }
    }

    /// Overrides the relative truncation factor (default: active row count).
    /// The cutoff applied is `factor · ε · σmax`.
    pub fn with_truncation_factor(mut self, factor: f64) -> Self {
        self.truncation_factor = Some(factor);
        self.factor = None;
        self
    }

    /// The truncation factor in effect.
    pub fn truncation_factor(&self) -> f64 {
        self.truncation_factor
            .unwrap_or(self.state.active_rows() as f64)
    }

    fn build_factor(&self) -> Result<SvdFactor, SolverError> {
        let design = self.state.weighted_design(false);
        log::debug!(
            "SVD: decomposing {}x{} weighted design from scratch",
            design.nrows(),
            design.ncols()
        );
        let (u, sigma, vt) = design
            .svddc(JobSvd::Some)
            .map_err(SolverError::DecompositionFailed)?;
        // JobSvd::Some always produces both singular vector sets.
        let u = u.unwrap();
        let vt = vt.unwrap();

        let sigma_max = sigma.first().copied().unwrap_or(0.0);
        let cutoff = self.truncation_factor() * f64::EPSILON * sigma_max;
        // Values are sorted descending, so retention is a prefix.
        let retained = sigma.iter().take_while(|&&v| v > cutoff).count();
        if retained < sigma.len() {
            log::warn!(
                "SVD: truncating {} of {} singular values below {cutoff:.3e}",
                sigma.len() - retained,
                sigma.len()
            );
        }
        Ok(SvdFactor {
            u,
            sigma,
            vt,
            retained,
        })
    }

    fn factor(&mut self) -> Result<&SvdFactor, SolverError> {
        if self.factor.is_none() {
            self.factor = Some(self.build_factor()?);
        }
        Ok(self.factor.as_ref().unwrap())
    }
}

impl LeastSquaresSolver for SvdMethod {
    fn state(&self) -> &FitState {
        &self.state
    }

    /// x = V·Σ⁺·Uᵗ·(√W·rhs) with truncated pseudo-inversion of Σ.
    fn solve(&mut self, rhs: ArrayView1<'_, f64>) -> Result<Array1<f64>, SolverError> {
        let b = self.state.weighted_rhs(rhs)?;
        let factor = self.factor()?;
        let mut z = factor.u.t().dot(&b);
        for (k, value) in z.iter_mut().enumerate() {
            if k < factor.retained {
                *value /= factor.sigma[k];
            } else {
                *value = 0.0;
            }
        }
        Ok(factor.vt.t().dot(&z))
    }

    fn solve_normal(&mut self, rhs: ArrayView1<'_, f64>) -> Result<Array1<f64>, SolverError> {
        self.solve(rhs)
    }

    /// G⁻¹ = V·Σ⁻²·Vᵗ over the retained singular values.
    fn gram_inverse(&mut self) -> Result<Array2<f64>, SolverError> {
        let factor = self.factor()?;
        let mut scaled = factor.vt.slice(s![..factor.retained, ..]).to_owned();
        for (k, mut row) in scaled.rows_mut().into_iter().enumerate() {
            row /= factor.sigma[k];
        }
        Ok(scaled.t().dot(&scaled))
    }

    fn gram_inverse_trace(&mut self) -> Result<f64, SolverError> {
        let factor = self.factor()?;
        Ok(factor
            .sigma
            .iter()
            .take(factor.retained)
            .map(|&v| 1.0 / (v * v))
            .sum())
    }

    /// H = U·Uᵗ over the retained columns, cheaper than the generic
    /// M·G⁻¹·Mᵗ formula.
    fn hat_matrix(&mut self) -> Result<Array2<f64>, SolverError> {
        let factor = self.factor()?;
        let u_retained = factor.u.slice(s![.., ..factor.retained]);
        Ok(u_retained.dot(&u_retained.t()))
    }

    /// Row-wise sum of squared retained U entries, O(N·p).
    fn hat_diagonal(&mut self) -> Result<Array1<f64>, SolverError> {
        let factor = self.factor()?;
        let u_retained = factor.u.slice(s![.., ..factor.retained]);
        Ok(u_retained.map_axis(ndarray::Axis(1), |row| row.dot(&row)))
    }

    fn update(
        &mut self,
        added: &[usize],
        conserved: &[usize],
        removed: &[usize],
        row: bool,
    ) -> Result<(), SolverError> {
        let plan = self.state.plan_update(added, conserved, removed, row)?;
        // No incremental SVD path exists under column/row edits; robustness
        // is bought with a full recomputation on the next access.
        if self.factor.is_some() {
            log::debug!("SVD: active set changed, discarding decomposition");
            self.factor = None;
        }
        self.state.apply_update(&plan, row);
        Ok(())
    }

    fn trash_decomposition(&mut self) {
        self.factor = None;
    }
}
