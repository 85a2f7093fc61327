//! Bundle adjustment micro benchmarks on a synthetic scene
//!
//! A ring of cameras observes a cloud of points without noise; the solver is
//! seeded with perturbed poses and tracks.
//!
//! ## Usage
//!
//! ```bash
//! cargo bench --bench bundle_adjustment_benchmark
//! ```
//!
//! ## Measured
//! - Residual evaluation
//! - Jacobian evaluation
//! - One Levenberg-Marquardt iteration per linear solver

use std::hint::black_box;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sfm_solver::bundle::{
    BAState, BundleAdjustment, CameraState, InternalCalibrationState, TrackState,
};
use sfm_solver::core::{OptimizationProblem, State};
use sfm_solver::linalg::{LinearSolverType, Vector, rotation_matrix_y, translation_matrix};
use sfm_solver::optimizer::{LevenbergMarquardt, LevenbergMarquardtConfig};
use sfm_solver::scene::{Camera, KeyPoint, Scene};

const NUM_CAMERAS: usize = 12;
const NUM_TRACKS: usize = 500;

/// Ground truth, a noise-free scene and a perturbed starting state
fn synthetic_problem() -> (BundleAdjustment, BAState) {
    let mut rng = StdRng::seed_from_u64(0);

    let cameras: Vec<CameraState> = (0..NUM_CAMERAS)
        .map(|i| {
            let angle = 0.5 * (i as f64 / NUM_CAMERAS as f64 - 0.5);
            CameraState {
                h: translation_matrix(0.0, 0.0, 6.0)
                    * rotation_matrix_y(angle)
                    * translation_matrix(0.0, 0.0, -6.0),
            }
        })
        .collect();
    let tracks: Vec<TrackState> = (0..NUM_TRACKS)
        .map(|_| {
            TrackState::new(Vector::<4>::new(
                rng.random_range(-2.0..2.0),
                rng.random_range(-2.0..2.0),
                rng.random_range(4.0..8.0),
                1.0,
            ))
        })
        .collect();
    let truth = BAState {
        internal_calibs: vec![InternalCalibrationState::new(
            1000.0,
            Vector::<2>::new(320.0, 240.0),
        )],
        cameras,
        tracks,
    };

    let mut scene = Scene::new(1, NUM_TRACKS);
    for c in 0..NUM_CAMERAS {
        scene.cameras.push(Camera::new(0));
        for t in 0..NUM_TRACKS {
            // Each camera sees roughly half of the points
            if (t + c) % 2 == 0 || t % 5 == 0 {
                let location = truth.project(&scene, c, t);
                scene.cameras[c].keypoints.push(KeyPoint::new(location, t));
            }
        }
    }

    let mut problem = BundleAdjustment::new(scene).expect("valid synthetic scene");
    problem.fix_internal_calib(0).expect("calibration exists");
    problem.fix_camera(0).expect("camera exists");

    let mut initial = truth.clone();
    for camera in initial.cameras.iter_mut().skip(1) {
        camera.h = rotation_matrix_y(rng.random_range(-0.01..0.01))
            * translation_matrix(
                rng.random_range(-0.05..0.05),
                rng.random_range(-0.05..0.05),
                rng.random_range(-0.05..0.05),
            )
            * camera.h;
    }
    for track in &mut initial.tracks {
        let noise = Vector::<4>::new(
            rng.random_range(-0.01..0.01),
            rng.random_range(-0.01..0.01),
            rng.random_range(-0.01..0.01),
            0.0,
        );
        *track = TrackState::new(track.location + noise);
    }

    (problem, initial)
}

fn bench_evaluation(c: &mut Criterion) {
    let (problem, state) = synthetic_problem();
    let mut group = c.benchmark_group("evaluation");

    let mut residuals = vec![0.0; problem.num_residuals()];
    group.bench_function("residuals", |b| {
        b.iter(|| state.compute_residuals(black_box(&problem), &mut residuals))
    });

    let mut jacobi = problem.create_jacobi_matrix();
    group.bench_function("jacobian", |b| {
        b.iter(|| state.compute_jacobi_matrix(black_box(&problem), &mut jacobi))
    });

    group.finish();
}

fn bench_lm_iteration(c: &mut Criterion) {
    let (problem, initial) = synthetic_problem();
    let mut group = c.benchmark_group("lm_iteration");
    group.sample_size(20);

    for (name, solver) in [
        ("cg", LinearSolverType::ConjugateGradient),
        ("pcg", LinearSolverType::PreconditionedConjugateGradient),
        ("sparse_cholesky", LinearSolverType::SparseCholesky),
    ] {
        let config = LevenbergMarquardtConfig::new().with_linear_solver_type(solver);
        group.bench_function(name, |b| {
            b.iter_batched(
                || {
                    LevenbergMarquardt::with_config(&problem, initial.clone(), config.clone())
                        .expect("valid configuration")
                },
                |mut lm| black_box(lm.iterate(&problem).expect("iteration succeeds")),
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_evaluation, bench_lm_iteration);
criterion_main!(benches);
