//! Base state and contract shared by the three factorization strategies.
//!
//! `FitState` owns everything the strategies have in common: the design
//! proxy handle, the target sample, the (optional) observation weights and
//! the active index/row sets. The [`LeastSquaresSolver`] trait defines the
//! contract the model-selection driver programs against; its default methods
//! implement the generic formulas (hat matrix, leverage, trace) in terms of
//! `gram_inverse`, and each strategy overrides the ones it can compute more
//! cheaply from its own factor.
//!
//! Cache discipline: a strategy's factor is an explicit `Option`, either
//! `None` (empty) or `Some` (built, consistent with the current index/row
//! sets).
//! Solve-family and Gram-inverse calls take `&mut self` because the first
//! such call after construction, an invalidating `update` or a
//! `trash_decomposition` rebuilds the factor.

use std::collections::HashSet;
use std::sync::Arc;

use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{IndexKind, SolverError};
use crate::proxy::DesignProxy;

/// Sample, weight and active-set bookkeeping shared by every strategy.
pub struct FitState {
    proxy: Arc<dyn DesignProxy>,
    targets: Array1<f64>,
    /// Weight vector as supplied by the caller; empty means uniform.
    weight: Array1<f64>,
    /// Cached √weight, present only on the non-uniform path.
    sqrt_weight: Option<Array1<f64>>,
    current_indices: Vec<usize>,
    initial_indices: Vec<usize>,
    current_rows: Vec<usize>,
}

impl FitState {
    /// Validates all inputs and establishes the initial active set.
    ///
    /// Nothing is retained if any check fails: malformed weights, a target
    /// sample that does not match the proxy, and duplicate or out-of-range
    /// indices are all rejected here, before any solver exists.
    pub fn new(
        proxy: Arc<dyn DesignProxy>,
        targets: Array1<f64>,
        weight: Option<Array1<f64>>,
        indices: Vec<usize>,
    ) -> Result<Self, SolverError> {
        let n = proxy.sample_size();
        if targets.len() != n {
            return Err(SolverError::TargetSizeMismatch {
                found: targets.len(),
                expected: n,
            });
        }

        let weight = weight.unwrap_or_else(|| Array1::zeros(0));
        if !weight.is_empty() && weight.len() != n {
            return Err(SolverError::WeightSizeMismatch {
                found: weight.len(),
                expected: n,
            });
        }
        for (index, &value) in weight.iter().enumerate() {
            if !(value.is_finite() && value > 0.0) {
                return Err(SolverError::NonPositiveWeight { index, value });
            }
        }
        // An explicitly uniform weight vector takes the same unscaled path as
        // an absent one, so the two are exactly (not just approximately)
        // equivalent.
        let uniform = weight.is_empty() || weight.iter().all(|&w| w == weight[0]);
        let sqrt_weight = if uniform {
            None
        } else {
            Some(weight.mapv(f64::sqrt))
        };

        validate_index_list(IndexKind::Basis, &indices, proxy.basis_size())?;

        Ok(Self {
            proxy,
            targets,
            weight,
            sqrt_weight,
            initial_indices: indices.clone(),
            current_indices: indices,
            current_rows: (0..n).collect(),
        })
    }

    /// Rebuilds a state from a persisted snapshot over a live proxy.
    ///
    /// Equivalent to `trash_decomposition()` followed by reconstruction: the
    /// factor is never persisted, only the data needed to rebuild it.
    pub fn restore(
        proxy: Arc<dyn DesignProxy>,
        snapshot: SolverSnapshot,
    ) -> Result<Self, SolverError> {
        let weight = if snapshot.weight.is_empty() {
            None
        } else {
            Some(snapshot.weight)
        };
        let mut state = Self::new(proxy, snapshot.targets, weight, snapshot.initial_indices)?;
        validate_index_list(
            IndexKind::Basis,
            &snapshot.current_indices,
            state.proxy.basis_size(),
        )?;
        validate_index_list(IndexKind::Row, &snapshot.current_rows, state.sample_size())?;
        state.current_indices = snapshot.current_indices;
        state.current_rows = snapshot.current_rows;
        Ok(state)
    }

    /// Captures the persistable part of the state (indices, sample, weights).
    pub fn snapshot(&self) -> SolverSnapshot {
        SolverSnapshot {
            current_indices: self.current_indices.clone(),
            initial_indices: self.initial_indices.clone(),
            current_rows: self.current_rows.clone(),
            targets: self.targets.clone(),
            weight: self.weight.clone(),
        }
    }

    pub fn proxy(&self) -> &Arc<dyn DesignProxy> {
        &self.proxy
    }

    pub fn targets(&self) -> &Array1<f64> {
        &self.targets
    }

    /// The weight vector as supplied; empty on the uniform fast path.
    pub fn weight(&self) -> &Array1<f64> {
        &self.weight
    }

    pub fn has_uniform_weight(&self) -> bool {
        self.sqrt_weight.is_none()
    }

    pub fn current_indices(&self) -> &[usize] {
        &self.current_indices
    }

    pub fn initial_indices(&self) -> &[usize] {
        &self.initial_indices
    }

    pub fn current_rows(&self) -> &[usize] {
        &self.current_rows
    }

    /// Total number of observations in the sample.
    pub fn sample_size(&self) -> usize {
        self.targets.len()
    }

    /// Number of observations currently active (rows of the design).
    pub fn active_rows(&self) -> usize {
        self.current_rows.len()
    }

    /// Number of basis functions currently active (columns of the design).
    pub fn active_columns(&self) -> usize {
        self.current_indices.len()
    }

    fn rows_are_trivial(&self) -> bool {
        self.current_rows.len() == self.sample_size()
            && self.current_rows.iter().copied().eq(0..self.sample_size())
    }

    /// Weighted design columns for an arbitrary index list.
    ///
    /// Asks the proxy for the raw columns, restricts to the active rows
    /// unless `whole`, and row-scales by √weight on the non-uniform path.
    /// This is the expensive primitive every strategy wraps; the proxy is
    /// expected to cache the underlying basis evaluations.
    pub fn weighted_columns(&self, indices: &[usize], whole: bool) -> Array2<f64> {
        let full = self.proxy.compute_design(indices);
        let (mut design, rows): (Array2<f64>, Option<&[usize]>) =
            if whole || self.rows_are_trivial() {
                (full, None)
            } else {
                (
                    full.select(ndarray::Axis(0), &self.current_rows),
                    Some(&self.current_rows),
                )
            };
        if let Some(sw) = &self.sqrt_weight {
            match rows {
                None => {
                    for (mut row, &w) in design.rows_mut().into_iter().zip(sw.iter()) {
                        row *= w;
                    }
                }
                Some(rows) => {
                    for (mut row, &r) in design.rows_mut().into_iter().zip(rows.iter()) {
                        row *= sw[r];
                    }
                }
            }
        }
        design
    }

    /// Weighted design for the current index set over the active rows.
    pub fn weighted_design(&self, whole: bool) -> Array2<f64> {
        self.weighted_columns(&self.current_indices, whole)
    }

    /// √weight-scales a full-sample right-hand side and restricts it to the
    /// active rows, validating its size first.
    pub fn weighted_rhs(&self, rhs: ArrayView1<'_, f64>) -> Result<Array1<f64>, SolverError> {
        if rhs.len() != self.sample_size() {
            return Err(SolverError::RhsSizeMismatch {
                found: rhs.len(),
                expected: self.sample_size(),
            });
        }
        let mut b = if self.rows_are_trivial() {
            rhs.to_owned()
        } else {
            Array1::from_iter(self.current_rows.iter().map(|&r| rhs[r]))
        };
        if let Some(sw) = &self.sqrt_weight {
            for (v, &r) in b.iter_mut().zip(self.current_rows.iter()) {
                *v *= sw[r];
            }
        }
        Ok(b)
    }

    /// Validates an update request and describes the resulting active set,
    /// without mutating anything.
    pub(crate) fn plan_update(
        &self,
        added: &[usize],
        conserved: &[usize],
        removed: &[usize],
        row: bool,
    ) -> Result<UpdatePlan, SolverError> {
        let (kind, active, range) = if row {
            (IndexKind::Row, &self.current_rows, self.sample_size())
        } else {
            (
                IndexKind::Basis,
                &self.current_indices,
                self.proxy.basis_size(),
            )
        };

        check_unique(kind, added)?;
        check_unique(kind, conserved)?;
        check_unique(kind, removed)?;

        // An index may appear in at most one of the three sets; anything
        // else means the caller's bookkeeping has diverged from ours.
        let added_set: HashSet<usize> = added.iter().copied().collect();
        let conserved_set: HashSet<usize> = conserved.iter().copied().collect();
        for &index in removed {
            if added_set.contains(&index) || conserved_set.contains(&index) {
                return Err(SolverError::ConflictingUpdate { kind, index });
            }
        }
        if let Some(&index) = conserved.iter().find(|i| added_set.contains(*i)) {
            return Err(SolverError::ConflictingUpdate { kind, index });
        }

        let active_set: HashSet<usize> = active.iter().copied().collect();
        for &index in conserved.iter().chain(removed.iter()) {
            if !active_set.contains(&index) {
                return Err(SolverError::NotCurrentIndex { kind, index });
            }
        }
        for &index in added {
            if index >= range {
                return Err(SolverError::IndexOutOfRange { kind, index, size: range });
            }
            if active_set.contains(&index) {
                return Err(SolverError::AlreadyCurrentIndex { kind, index });
            }
        }

        // Conserved entries keep their original relative order regardless of
        // the order the caller listed them in.
        let retained: Vec<usize> = active
            .iter()
            .copied()
            .filter(|i| conserved_set.contains(i))
            .collect();
        let is_prefix = active[..retained.len()] == retained[..];
        let pure_growth = retained.len() == active.len();
        let retained_len = retained.len();
        let mut new_active = retained;
        new_active.extend_from_slice(added);

        Ok(UpdatePlan {
            new_active,
            retained: retained_len,
            appended: added.to_vec(),
            is_prefix,
            pure_growth,
        })
    }

    /// Installs the active set a validated plan describes.
    pub(crate) fn apply_update(&mut self, plan: &UpdatePlan, row: bool) {
        if row {
            self.current_rows = plan.new_active.clone();
        } else {
            self.current_indices = plan.new_active.clone();
        }
    }
}

/// The outcome of update validation: the new active set plus the structural
/// facts the strategies use to choose between an incremental refactorization
/// and a full rebuild.
pub(crate) struct UpdatePlan {
    pub new_active: Vec<usize>,
    /// Number of leading entries of the old active set that survive.
    pub retained: usize,
    /// The added indices, in the order given.
    pub appended: Vec<usize>,
    /// True when the surviving entries are exactly a prefix of the old
    /// order, so a triangular factor can be truncated rather than rebuilt.
    pub is_prefix: bool,
    /// True when nothing was dropped (pure growth).
    pub pure_growth: bool,
}

/// Serialized solver state: indices, sample and weights only.
///
/// The cached decomposition is deliberately never persisted; restoring a
/// snapshot behaves like `trash_decomposition()` followed by reconstruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverSnapshot {
    pub current_indices: Vec<usize>,
    pub initial_indices: Vec<usize>,
    pub current_rows: Vec<usize>,
    pub targets: Array1<f64>,
    pub weight: Array1<f64>,
}

fn check_unique(kind: IndexKind, list: &[usize]) -> Result<(), SolverError> {
    if let Some(&index) = list.iter().duplicates().next() {
        return Err(SolverError::DuplicateIndex { kind, index });
    }
    Ok(())
}

fn validate_index_list(
    kind: IndexKind,
    indices: &[usize],
    range: usize,
) -> Result<(), SolverError> {
    check_unique(kind, indices)?;
    for &index in indices {
        if index >= range {
            return Err(SolverError::IndexOutOfRange {
                kind,
                index,
                size: range,
            });
        }
    }
    Ok(())
}

/// The contract every factorization strategy implements.
///
/// `solve`, `solve_normal` and the Gram-inverse family take `&mut self`
/// because they lazily (re)build the cached factor; `update` mutates the
/// active set and refactorizes incrementally where the strategy supports it.
pub trait LeastSquaresSolver {
    /// Shared sample/weight/index state.
    fn state(&self) -> &FitState;

    /// Solves the weighted least-squares problem min ‖√W(M·x − rhs)‖ for the
    /// current index set. `rhs` spans the full sample.
    ///
    /// The default routes through the normal equations; strategies that
    /// factor the design matrix directly (QR, SVD) override this to avoid
    /// squaring the condition number.
    fn solve(&mut self, rhs: ArrayView1<'_, f64>) -> Result<Array1<f64>, SolverError> {
        self.solve_normal(rhs)
    }

    /// Solves the weighted normal equations G·x = Mᵗ·W·rhs.
    fn solve_normal(&mut self, rhs: ArrayView1<'_, f64>) -> Result<Array1<f64>, SolverError>;

    /// (Weighted MᵗM)⁻¹, derived from the cached factor.
    fn gram_inverse(&mut self) -> Result<Array2<f64>, SolverError>;

    /// trace(G⁻¹), consumed by corrected leave-one-out criteria.
    fn gram_inverse_trace(&mut self) -> Result<f64, SolverError> {
        Ok(self.gram_inverse()?.diag().sum())
    }

    /// The hat/projection matrix M·G⁻¹·Mᵗ over the active rows.
    fn hat_matrix(&mut self) -> Result<Array2<f64>, SolverError> {
        let gram_inverse = self.gram_inverse()?;
        let design = self.state().weighted_design(false);
        Ok(design.dot(&gram_inverse).dot(&design.t()))
    }

    /// Diagonal of the hat matrix (leverage scores) without materializing
    /// the full N×N projection; the default is the per-row quadratic form
    /// xᵢᵗ·G⁻¹·xᵢ, parallelized over rows.
    fn hat_diagonal(&mut self) -> Result<Array1<f64>, SolverError> {
        let gram_inverse = self.gram_inverse()?;
        let design = self.state().weighted_design(false);
        let mut diag = Array1::zeros(design.nrows());
        Zip::from(&mut diag)
            .and(design.rows())
            .par_for_each(|h, x| *h = x.dot(&gram_inverse.dot(&x)));
        Ok(diag)
    }

    /// Replaces the active set with `conserved` (original relative order)
    /// followed by `added`, dropping `removed`, and refactorizes: in place
    /// where the strategy has an incremental path for the requested change,
    /// from scratch otherwise. With `row = true` the three sets refer to
    /// observation rows instead of basis columns (streaming samples).
    ///
    /// Validation is complete before any mutation: on an invalid-argument or
    /// inconsistency error the active set and the cached factor are
    /// untouched. A numerical failure during an incremental refactorization
    /// (Cholesky only) also leaves the active set unchanged but discards the
    /// factor.
    fn update(
        &mut self,
        added: &[usize],
        conserved: &[usize],
        removed: &[usize],
        row: bool,
    ) -> Result<(), SolverError>;

    /// Discards the cached factor; the next solve-family call rebuilds it.
    fn trash_decomposition(&mut self);

    fn current_indices(&self) -> &[usize] {
        self.state().current_indices()
    }

    fn initial_indices(&self) -> &[usize] {
        self.state().initial_indices()
    }
}
