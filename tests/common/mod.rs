//! Shared utilities for bundle adjustment integration tests
//!
//! Builds noise-free synthetic scenes from a ground-truth [`BAState`] and
//! perturbs states with seeded random noise.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sfm_solver::bundle::{BAState, CameraState, InternalCalibrationState, TrackState};
use sfm_solver::linalg::{
    Matrix, Vector, hom2eucl_point, rotation_matrix_x, rotation_matrix_y, rotation_matrix_z,
    translation_matrix,
};
use sfm_solver::scene::{Camera, KeyPoint, Scene};

/// Seeded generator so every test run sees the same noise
pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// `K = [[1000, 0, 320], [0, 1000, 240], [0, 0, 1]]`
pub fn reference_calibration() -> InternalCalibrationState {
    InternalCalibrationState::new(1000.0, Vector::<2>::new(320.0, 240.0))
}

/// Points in front of the cameras: x, y in ±1.5 m, depth 4 to 8 m
pub fn generate_tracks(n: usize, rng: &mut StdRng) -> Vec<TrackState> {
    (0..n)
        .map(|_| {
            let x = rng.random_range(-1.5..1.5);
            let y = rng.random_range(-1.5..1.5);
            let z = rng.random_range(4.0..8.0);
            TrackState::new(Vector::<4>::new(x, y, z, 1.0))
        })
        .collect()
}

/// Two cameras, the second translated by one unit along X
pub fn two_camera_truth(num_tracks: usize, rng: &mut StdRng) -> BAState {
    BAState {
        internal_calibs: vec![reference_calibration()],
        cameras: vec![
            CameraState::default(),
            CameraState {
                h: translation_matrix(-1.0, 0.0, 0.0),
            },
        ],
        tracks: generate_tracks(num_tracks, rng),
    }
}

/// Three cameras on a short arc, all converging slightly on the scene
pub fn three_camera_truth(num_tracks: usize, rng: &mut StdRng) -> BAState {
    BAState {
        internal_calibs: vec![reference_calibration()],
        cameras: vec![
            CameraState::default(),
            CameraState {
                h: rotation_matrix_y(-0.08) * translation_matrix(-0.8, 0.1, 0.0),
            },
            CameraState {
                h: rotation_matrix_x(0.05)
                    * rotation_matrix_y(0.1)
                    * translation_matrix(0.7, -0.2, 0.3),
            },
        ],
        tracks: generate_tracks(num_tracks, rng),
    }
}

/// Every camera observes every track at its exact projection.
///
/// `calib_of_camera[c]` is the internal calibration of camera `c`.
pub fn observe_all(truth: &BAState, calib_of_camera: &[usize]) -> Scene {
    let mut scene = Scene::new(truth.internal_calibs.len(), truth.tracks.len());
    scene.cameras = calib_of_camera.iter().map(|&k| Camera::new(k)).collect();
    for c in 0..scene.cameras.len() {
        for t in 0..truth.tracks.len() {
            let location = truth.project(&scene, c, t);
            scene.cameras[c].keypoints.push(KeyPoint::new(location, t));
        }
    }
    scene
}

/// Bounds of the random perturbation applied by [`perturb`]
#[derive(Debug, Clone, Copy)]
pub struct Perturbation {
    /// Maximum absolute rotation per axis in radians
    pub rotation: f64,
    /// Maximum absolute translation per axis
    pub translation: f64,
    /// Maximum relative change per Euclidean track coordinate
    pub track: f64,
}

/// Perturbs the poses of `cameras` and all tracks, intrinsics are kept
pub fn perturb(truth: &BAState, cameras: &[usize], p: Perturbation, rng: &mut StdRng) -> BAState {
    let mut state = truth.clone();
    let mut sample = |bound: f64| {
        if bound > 0.0 {
            rng.random_range(-bound..bound)
        } else {
            0.0
        }
    };

    for &c in cameras {
        let delta = rotation_matrix_z(sample(p.rotation))
            * rotation_matrix_y(sample(p.rotation))
            * rotation_matrix_x(sample(p.rotation))
            * translation_matrix(
                sample(p.translation),
                sample(p.translation),
                sample(p.translation),
            );
        state.cameras[c].h = delta * state.cameras[c].h;
    }

    for track in &mut state.tracks {
        let e = hom2eucl_point(&track.location);
        let noisy = Vector::<4>::new(
            e[0] * (1.0 + sample(p.track)),
            e[1] * (1.0 + sample(p.track)),
            e[2] * (1.0 + sample(p.track)),
            1.0,
        );
        *track = TrackState::new(noisy);
    }
    state
}

/// Maximum element-wise difference of two matrices relative to `b`
pub fn relative_difference<const R: usize, const C: usize>(
    a: &Matrix<R, C>,
    b: &Matrix<R, C>,
) -> f64 {
    (a - b).norm() / b.norm().max(1e-12)
}

/// Camera center in world coordinates
pub fn camera_center(h: &Matrix<4, 4>) -> Vector<3> {
    let r = h.fixed_view::<3, 3>(0, 0);
    let t = h.fixed_view::<3, 1>(0, 3);
    -(r.transpose() * t)
}
