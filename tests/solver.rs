//! Cross-strategy integration properties of the least-squares engine.
//!
//! Every test drives the engine the way the stepwise model-selection loop
//! does: construct over a shared design proxy, edit the active set through
//! `update`, and read coefficients and leverage/trace statistics back.

use std::sync::Arc;

use approx::assert_relative_eq;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use stepfit::{
    CholeskyMethod, DesignProxy, FitState, LeastSquaresSolver, MatrixProxy, QrMethod, SolverError,
    SolverSnapshot, SvdMethod,
};

/// Captures the engine's rebuild/fallback tracing in test output.
fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Random Gaussian candidate design: well-conditioned with overwhelming
/// probability at these shapes.
fn gaussian_proxy(seed: u64, n: usize, candidates: usize) -> Arc<dyn DesignProxy> {
    init_logs();
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let design = Array2::from_shape_fn((n, candidates), |_| normal.sample(&mut rng));
    Arc::new(MatrixProxy::new(design))
}

fn noisy_targets(seed: u64, n: usize) -> Array1<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array1::from_shape_fn(n, |_| rng.gen_range(-2.0..2.0))
}

fn all_methods(
    proxy: &Arc<dyn DesignProxy>,
    y: &Array1<f64>,
    weight: Option<Array1<f64>>,
    indices: &[usize],
) -> Vec<Box<dyn LeastSquaresSolver>> {
    vec![
        Box::new(
            CholeskyMethod::new(
                Arc::clone(proxy),
                y.clone(),
                weight.clone(),
                indices.to_vec(),
            )
            .unwrap(),
        ),
        Box::new(
            QrMethod::new(
                Arc::clone(proxy),
                y.clone(),
                weight.clone(),
                indices.to_vec(),
            )
            .unwrap(),
        ),
        Box::new(SvdMethod::new(Arc::clone(proxy), y.clone(), weight, indices.to_vec()).unwrap()),
    ]
}

#[test]
fn three_strategies_agree_on_well_conditioned_designs() {
    for seed in [7, 42, 1234] {
        let proxy = gaussian_proxy(seed, 50, 6);
        let y = noisy_targets(seed ^ 0xDEAD, 50);
        let mut methods = all_methods(&proxy, &y, None, &[0, 1, 2, 3, 4]);

        let reference = methods[0].solve(y.view()).unwrap();
        let reference_trace = methods[0].gram_inverse_trace().unwrap();
        for method in &mut methods[1..] {
            let x = method.solve(y.view()).unwrap();
            for (&a, &b) in x.iter().zip(reference.iter()) {
                assert_relative_eq!(a, b, max_relative = 1e-8, epsilon = 1e-12);
            }
            assert_relative_eq!(
                method.gram_inverse_trace().unwrap(),
                reference_trace,
                max_relative = 1e-8
            );
        }
    }
}

#[test]
fn solve_normal_agrees_with_solve_across_strategies() {
    let proxy = gaussian_proxy(5, 30, 4);
    let y = noisy_targets(6, 30);
    for method in &mut all_methods(&proxy, &y, None, &[0, 1, 2, 3]) {
        let a = method.solve(y.view()).unwrap();
        let b = method.solve_normal(y.view()).unwrap();
        for (&u, &v) in a.iter().zip(b.iter()) {
            assert_relative_eq!(u, v, max_relative = 1e-9);
        }
    }
}

#[test]
fn trash_decomposition_is_idempotent() {
    let proxy = gaussian_proxy(11, 25, 4);
    let y = noisy_targets(12, 25);
    for method in &mut all_methods(&proxy, &y, None, &[0, 1, 2]) {
        let before = method.solve(y.view()).unwrap();
        method.trash_decomposition();
        let after = method.solve(y.view()).unwrap();
        for (&a, &b) in before.iter().zip(after.iter()) {
            assert_relative_eq!(a, b, max_relative = 1e-12);
        }
    }
}

#[test]
fn incremental_adds_match_fresh_construction() {
    let proxy = gaussian_proxy(21, 40, 6);
    let y = noisy_targets(22, 40);
    let final_set = [0, 1, 2, 3, 4];

    for strategy in 0..3usize {
        let build = |indices: &[usize]| -> Box<dyn LeastSquaresSolver> {
            let mut methods = all_methods(&proxy, &y, None, indices);
            methods.remove(strategy)
        };
        let mut grown = build(&[0]);
        // Force a factor so each later update exercises the incremental path.
        grown.solve(y.view()).unwrap();
        let mut conserved: Vec<usize> = vec![0];
        for &index in &final_set[1..] {
            grown.update(&[index], &conserved, &[], false).unwrap();
            conserved.push(index);
        }
        assert_eq!(grown.current_indices(), &final_set[..]);

        let mut fresh = build(&final_set);
        let xg = grown.solve(y.view()).unwrap();
        let xf = fresh.solve(y.view()).unwrap();
        for (&a, &b) in xg.iter().zip(xf.iter()) {
            assert_relative_eq!(a, b, max_relative = 1e-8, epsilon = 1e-12);
        }
        assert_relative_eq!(
            grown.gram_inverse_trace().unwrap(),
            fresh.gram_inverse_trace().unwrap(),
            max_relative = 1e-8
        );
    }
}

#[test]
fn explicit_uniform_weights_match_implicit_fast_path() {
    let n = 30;
    let proxy = gaussian_proxy(31, n, 4);
    let y = noisy_targets(32, n);
    let uniform = Array1::from_elem(n, 1.0 / n as f64);

    let mut implicit = all_methods(&proxy, &y, None, &[0, 1, 2]);
    let mut explicit = all_methods(&proxy, &y, Some(uniform), &[0, 1, 2]);
    for (a, b) in implicit.iter_mut().zip(explicit.iter_mut()) {
        assert_eq!(a.solve(y.view()).unwrap(), b.solve(y.view()).unwrap());
        assert_eq!(
            a.gram_inverse_trace().unwrap(),
            b.gram_inverse_trace().unwrap()
        );
    }
}

#[test]
fn non_uniform_weights_agree_across_strategies() {
    let n = 30;
    let proxy = gaussian_proxy(41, n, 4);
    let y = noisy_targets(42, n);
    let mut rng = StdRng::seed_from_u64(43);
    let weight = Array1::from_shape_fn(n, |_| rng.gen_range(0.1..2.0));

    let mut methods = all_methods(&proxy, &y, Some(weight), &[0, 1, 2, 3]);
    let reference = methods[0].solve(y.view()).unwrap();
    for method in &mut methods[1..] {
        let x = method.solve(y.view()).unwrap();
        for (&a, &b) in x.iter().zip(reference.iter()) {
            assert_relative_eq!(a, b, max_relative = 1e-8, epsilon = 1e-12);
        }
    }
}

#[test]
fn rank_deficient_design_splits_the_strategies() {
    init_logs();
    // Two exactly duplicated candidate columns.
    let mut rng = StdRng::seed_from_u64(51);
    let base = Array1::from_shape_fn(20, |_| rng.gen_range(-1.0..1.0));
    let design = Array2::from_shape_fn((20, 2), |(i, _)| base[i]);
    let proxy: Arc<dyn DesignProxy> = Arc::new(MatrixProxy::new(design));
    let y: Array1<f64> = &base * 3.0;

    let mut cholesky =
        CholeskyMethod::new(Arc::clone(&proxy), y.clone(), None, vec![0, 1]).unwrap();
    assert!(matches!(
        cholesky.solve(y.view()),
        Err(SolverError::NotPositiveDefinite { .. })
    ));

    let mut svd = SvdMethod::new(proxy, y.clone(), None, vec![0, 1]).unwrap();
    let x = svd.solve(y.view()).unwrap();
    assert!(x.iter().all(|v| v.is_finite()));
    let norm = x.dot(&x).sqrt();
    assert!(norm < 10.0, "pseudo-inverse solution should stay bounded, got norm {norm}");
}

#[test]
fn leverage_scores_are_valid_across_random_designs() {
    for seed in [61, 62, 63, 64] {
        let proxy = gaussian_proxy(seed, 35, 5);
        let y = noisy_targets(seed + 100, 35);
        let p = 4;
        for method in &mut all_methods(&proxy, &y, None, &[0, 1, 2, 3]) {
            let diag = method.hat_diagonal().unwrap();
            assert_eq!(diag.len(), 35);
            for &h in diag.iter() {
                assert!((-1e-10..=1.0 + 1e-10).contains(&h), "leverage {h} out of [0,1]");
            }
            // trace(H) equals the number of active basis functions.
            assert_relative_eq!(diag.sum(), p as f64, max_relative = 1e-8);

            let hat = method.hat_matrix().unwrap();
            for i in 0..diag.len() {
                assert_relative_eq!(hat[(i, i)], diag[i], max_relative = 1e-8, epsilon = 1e-12);
            }
        }
    }
}

#[test]
fn all_strategies_recover_generating_coefficients() {
    init_logs();
    // y = 2.0·b0 + 1.5·b1 − 0.7·b2 + small Gaussian noise, N = 10.
    let n = 10;
    let mut rng = StdRng::seed_from_u64(71);
    let x_points = Array1::from_shape_fn(n, |i| -1.0 + 2.0 * i as f64 / (n - 1) as f64)
        .mapv(|v| v + rng.gen_range(-0.01..0.01));
    let design = Array2::from_shape_fn((n, 3), |(i, j)| x_points[i].powi(j as i32));
    let proxy: Arc<dyn DesignProxy> = Arc::new(MatrixProxy::new(design.clone()));

    let truth = [2.0, 1.5, -0.7];
    let noise = Normal::new(0.0, 1e-3).unwrap();
    let y = Array1::from_shape_fn(n, |i| {
        truth[0] * design[(i, 0)]
            + truth[1] * design[(i, 1)]
            + truth[2] * design[(i, 2)]
            + noise.sample(&mut rng)
    });

    let mut methods = all_methods(&proxy, &y, None, &[0, 1, 2]);
    let mut traces = Vec::new();
    for method in &mut methods {
        let x = method.solve(y.view()).unwrap();
        for (&estimate, &expected) in x.iter().zip(truth.iter()) {
            assert_relative_eq!(estimate, expected, max_relative = 0.01);
        }
        traces.push(method.gram_inverse_trace().unwrap());
    }
    for &trace in &traces[1..] {
        assert_relative_eq!(trace, traces[0], max_relative = 1e-6);
    }
}

#[test]
fn update_validation_is_fail_fast() {
    let proxy = gaussian_proxy(81, 20, 5);
    let y = noisy_targets(82, 20);
    let mut method = QrMethod::new(Arc::clone(&proxy), y.clone(), None, vec![0, 1]).unwrap();
    method.solve(y.view()).unwrap();
    let before = method.current_indices().to_vec();

    let cases: Vec<(Vec<usize>, Vec<usize>, Vec<usize>)> = vec![
        (vec![1], vec![0], vec![]),       // added already current
        (vec![2], vec![0, 3], vec![]),    // conserved not current
        (vec![2], vec![0], vec![3]),      // removed not current
        (vec![2, 2], vec![0, 1], vec![]), // duplicate in added
        (vec![9], vec![0, 1], vec![]),    // out of candidate range
        (vec![2], vec![1], vec![1]),      // conserved and removed overlap
    ];
    for (added, conserved, removed) in cases {
        assert!(
            method.update(&added, &conserved, &removed, false).is_err(),
            "expected rejection for added={added:?} conserved={conserved:?} removed={removed:?}"
        );
        assert_eq!(method.current_indices(), &before[..], "state must be untouched");
    }
    // The factor survived all the failed updates.
    method.solve(y.view()).unwrap();
}

#[test]
fn row_updates_match_a_solver_built_on_the_subsample() {
    let n = 24;
    let proxy = gaussian_proxy(91, n, 4);
    let y = noisy_targets(92, n);
    let kept: Vec<usize> = (0..16).collect();
    let dropped: Vec<usize> = (16..n).collect();

    for strategy in 0..3usize {
        let mut sub = all_methods(&proxy, &y, None, &[0, 1, 2]).remove(strategy);
        sub.update(&[], &kept, &dropped, true).unwrap();
        let x_sub = sub.solve(y.view()).unwrap();

        // Fresh solver over a proxy holding only the kept observations.
        let full = proxy.compute_design(&[0, 1, 2, 3]);
        let sub_design = full.select(ndarray::Axis(0), &kept);
        let sub_proxy: Arc<dyn DesignProxy> = Arc::new(MatrixProxy::new(sub_design));
        let y_sub = Array1::from_iter(kept.iter().map(|&r| y[r]));
        let mut fresh = all_methods(&sub_proxy, &y_sub, None, &[0, 1, 2]).remove(strategy);
        let x_fresh = fresh.solve(y_sub.view()).unwrap();

        for (&a, &b) in x_sub.iter().zip(x_fresh.iter()) {
            assert_relative_eq!(a, b, max_relative = 1e-9, epsilon = 1e-12);
        }
    }
}

#[test]
fn snapshot_round_trip_restores_an_equivalent_solver() {
    let proxy = gaussian_proxy(101, 20, 5);
    let y = noisy_targets(102, 20);
    let mut method = SvdMethod::new(Arc::clone(&proxy), y.clone(), None, vec![0, 1, 2]).unwrap();
    method.update(&[3], &[0, 2], &[1], false).unwrap();
    let expected = method.solve(y.view()).unwrap();

    let json = serde_json::to_string(&method.state().snapshot()).unwrap();
    let snapshot: SolverSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(snapshot.current_indices, vec![0, 2, 3]);
    assert_eq!(snapshot.initial_indices, vec![0, 1, 2]);

    let mut restored = SvdMethod::from_state(FitState::restore(proxy, snapshot).unwrap());
    assert_eq!(restored.current_indices(), &[0, 2, 3]);
    let x = restored.solve(y.view()).unwrap();
    for (&a, &b) in x.iter().zip(expected.iter()) {
        assert_relative_eq!(a, b, max_relative = 1e-12);
    }
}

#[test]
fn rhs_size_is_validated() {
    let proxy = gaussian_proxy(111, 15, 3);
    let y = noisy_targets(112, 15);
    let short = Array1::zeros(7);
    for method in &mut all_methods(&proxy, &y, None, &[0, 1]) {
        assert!(matches!(
            method.solve(short.view()),
            Err(SolverError::RhsSizeMismatch {
                found: 7,
                expected: 15
            })
        ));
    }
}

#[test]
fn construction_rejects_malformed_inputs() {
    let proxy = gaussian_proxy(121, 10, 4);
    let y = noisy_targets(122, 10);

    let bad_weight = Array1::from_elem(10, -1.0);
    assert!(matches!(
        CholeskyMethod::new(Arc::clone(&proxy), y.clone(), Some(bad_weight), vec![0]),
        Err(SolverError::NonPositiveWeight { .. })
    ));

    let short_weight = Array1::from_elem(3, 0.5);
    assert!(matches!(
        QrMethod::new(Arc::clone(&proxy), y.clone(), Some(short_weight), vec![0]),
        Err(SolverError::WeightSizeMismatch {
            found: 3,
            expected: 10
        })
    ));

    assert!(matches!(
        SvdMethod::new(Arc::clone(&proxy), y.clone(), None, vec![0, 0]),
        Err(SolverError::DuplicateIndex { .. })
    ));

    assert!(matches!(
        SvdMethod::new(Arc::clone(&proxy), y.clone(), None, vec![0, 7]),
        Err(SolverError::IndexOutOfRange { .. })
    ));

    let short_targets = Array1::zeros(4);
    assert!(matches!(
        CholeskyMethod::new(proxy, short_targets, None, vec![0]),
        Err(SolverError::TargetSizeMismatch { .. })
    ));
}
