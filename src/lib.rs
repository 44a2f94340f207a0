//! # stepfit: incremental weighted least-squares engine
//!
//! The solving core behind adaptive/sparse metamodel construction (basis
//! selection for polynomial-chaos-type regression). A stepwise search driver
//! repeatedly edits the active set of candidate basis functions; this crate
//! keeps a factorization of the corresponding weighted design matrix alive
//! across those edits and answers the least-squares and cross-validation
//! queries the driver needs:
//!
//! - [`LeastSquaresSolver::solve`] / [`LeastSquaresSolver::solve_normal`]:
//!   coefficients for the current active set;
//! - [`LeastSquaresSolver::update`]: add/conserve/remove basis columns (or,
//!   with `row = true`, observation rows), refactorizing incrementally where
//!   possible;
//! - [`LeastSquaresSolver::gram_inverse`], `hat_matrix`, `hat_diagonal`,
//!   `gram_inverse_trace`: the leverage/trace statistics leave-one-out and
//!   corrected-fit criteria consume.
//!
//! Three interchangeable strategies trade update cost against robustness:
//!
//! | Strategy | Factors | Growth | Shrink | Failure mode |
//! |---|---|---|---|---|
//! | [`CholeskyMethod`] | G = LLᵗ | O(p²)/column, O(p²)/row | truncate trailing, else rebuild | errors on non-PD Gram |
//! | [`QrMethod`] | M = QR | O(N·p)/column | rebuild | never; degrades |
//! | [`SvdMethod`] | M = UΣVᵗ | rebuild | rebuild | never; truncated pseudo-inverse |
//!
//! Basis evaluation lives behind the [`DesignProxy`] trait; the engine only
//! ever asks for design-matrix columns. Each solver instance is
//! single-owner; share the proxy (not the solver) across parallel
//! cross-validation folds.
//!
//! ```
//! use std::sync::Arc;
//! use ndarray::array;
//! use stepfit::{CholeskyMethod, DesignProxy, LeastSquaresSolver, MatrixProxy};
//!
//! let proxy: Arc<dyn DesignProxy> = Arc::new(MatrixProxy::new(array![
//!     [1.0, 0.0],
//!     [1.0, 1.0],
//!     [1.0, 2.0],
//!     [1.0, 3.0],
//! ]));
//! let y = array![0.9, 3.1, 5.0, 7.1];
//! let mut solver = CholeskyMethod::new(proxy, y.clone(), None, vec![0, 1])?;
//! let coefficients = solver.solve(y.view())?;
//! assert_eq!(coefficients.len(), 2);
//! # Ok::<(), stepfit::SolverError>(())
//! ```

#![deny(dead_code)]
#![deny(unused_imports)]

pub mod cholesky;
pub mod error;
pub mod method;
pub mod proxy;
pub mod qr;
pub mod svd;

pub use cholesky::CholeskyMethod;
pub use error::{IndexKind, SolverError};
pub use method::{FitState, LeastSquaresSolver, SolverSnapshot};
pub use proxy::{DesignProxy, MatrixProxy};
pub use qr::QrMethod;
pub use svd::SvdMethod;
