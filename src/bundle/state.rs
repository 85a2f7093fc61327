//! Bundle adjustment parameter snapshot and the reprojection model.
//!
//! Projection of track `t` into camera `c`:
//!
//! ```text
//! v = dropLastRow(H) · X      camera space, homogeneous
//! u = K · v                   image, homogeneous
//! x = (u0 / u2, u1 / u2)      pixels
//! ```
//!
//! The Jacobian blocks stored per observation are derivatives of the
//! *weighted predicted* pixel position with respect to the update
//! parameters, i.e. the negative derivative of the residual.

use rayon::prelude::*;

use crate::bundle::jacobian::RowBlock;
use crate::bundle::{BAJacobiMatrix, BundleAdjustment, NumUpdateParams};
use crate::core::{OptimizationProblem, State};
use crate::linalg::{
    Matrix, Vector, drop_last_row, hom2eucl, renormalize, rotation_matrix_x, rotation_matrix_y,
    rotation_matrix_z, translation_matrix,
};
use crate::scene::{Scene, SceneError};

/// Intrinsics of one calibration group
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InternalCalibrationState {
    /// `[[f, s, cx], [0, f, cy], [0, 0, 1]]`
    pub k: Matrix<3, 3>,
}

impl InternalCalibrationState {
    pub fn new(focal_length: f64, principal_point: Vector<2>) -> Self {
        Self {
            k: Matrix::<3, 3>::new(
                focal_length,
                0.0,
                principal_point[0],
                0.0,
                focal_length,
                principal_point[1],
                0.0,
                0.0,
                1.0,
            ),
        }
    }
}

impl Default for InternalCalibrationState {
    fn default() -> Self {
        Self {
            k: Matrix::<3, 3>::identity(),
        }
    }
}

/// World to camera transform of one camera
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraState {
    pub h: Matrix<4, 4>,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            h: Matrix::<4, 4>::identity(),
        }
    }
}

/// Homogeneous world position of one track, kept at unit norm
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackState {
    pub location: Vector<4>,
}

impl TrackState {
    /// Normalizes `location` on construction
    pub fn new(location: Vector<4>) -> Self {
        Self {
            location: renormalize(&location),
        }
    }
}

impl Default for TrackState {
    fn default() -> Self {
        Self {
            location: Vector::<4>::new(0.0, 0.0, 0.0, 1.0),
        }
    }
}

/// All optimization variables of a bundle adjustment problem
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BAState {
    pub internal_calibs: Vec<InternalCalibrationState>,
    pub cameras: Vec<CameraState>,
    pub tracks: Vec<TrackState>,
}

impl BAState {
    /// A state sized for `scene` with identity calibrations and poses and
    /// all tracks at the origin
    pub fn for_scene(scene: &Scene) -> Self {
        Self {
            internal_calibs: vec![InternalCalibrationState::default(); scene.num_internal_calibs],
            cameras: vec![CameraState::default(); scene.cameras.len()],
            tracks: vec![TrackState::default(); scene.num_tracks],
        }
    }

    /// Checks that every parameter group has one entry per scene element
    pub fn check_sizes(&self, scene: &Scene) -> Result<(), SceneError> {
        let groups = [
            (
                "internal calibrations",
                scene.num_internal_calibs,
                self.internal_calibs.len(),
            ),
            ("cameras", scene.cameras.len(), self.cameras.len()),
            ("tracks", scene.num_tracks, self.tracks.len()),
        ];
        for (what, expected, actual) in groups {
            if expected != actual {
                return Err(SceneError::StateSizeMismatch {
                    what,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// `K · dropLastRow(H)` for a camera
    pub fn projection_matrix(&self, scene: &Scene, camera_idx: usize) -> Matrix<3, 4> {
        let calib = &self.internal_calibs[scene.cameras[camera_idx].internal_calib_idx];
        calib.k * drop_last_row(&self.cameras[camera_idx].h)
    }

    fn projection_matrices(&self, scene: &Scene) -> Vec<Matrix<3, 4>> {
        (0..scene.cameras.len())
            .map(|c| self.projection_matrix(scene, c))
            .collect()
    }

    /// Predicted pixel position of a track in a camera
    pub fn project(&self, scene: &Scene, camera_idx: usize, track_idx: usize) -> Vector<2> {
        hom2eucl(&(self.projection_matrix(scene, camera_idx) * self.tracks[track_idx].location))
    }
}

/// Derivatives of the predicted pixel position for one observation
fn observation_jacobian(
    k: &Matrix<3, 3>,
    h: &Matrix<4, 4>,
    location: &Vector<4>,
    weight: f64,
) -> RowBlock {
    let p = drop_last_row(h);
    let v = p * location;
    let u = k * v;
    let w = location[3];

    let inv_u2 = 1.0 / u[2];
    let j_hom2eucl = Matrix::<2, 3>::new(
        inv_u2,
        0.0,
        -u[0] * inv_u2 * inv_u2,
        0.0,
        inv_u2,
        -u[1] * inv_u2 * inv_u2,
    );

    // Relative focal length scales K00 and K11, the other two scale K02 and K12
    let du_d_delta_k = Matrix::<3, 3>::new(
        k[(0, 0)] * v[0],
        k[(0, 2)] * v[2],
        0.0,
        k[(1, 1)] * v[1],
        0.0,
        k[(1, 2)] * v[2],
        0.0,
        0.0,
        0.0,
    );

    // Infinitesimal camera-local rotation (cross product form) then translation
    #[rustfmt::skip]
    let dv_d_delta_h = Matrix::<3, 6>::new(
        0.0,   v[2], -v[1], w,   0.0, 0.0,
        -v[2], 0.0,  v[0],  0.0, w,   0.0,
        v[1],  -v[0], 0.0,  0.0, 0.0, w,
    );

    let j_camera_space = j_hom2eucl * k;

    RowBlock {
        j_internal_calib: j_hom2eucl * du_d_delta_k * weight,
        j_camera: j_camera_space * dv_d_delta_h * weight,
        j_track: j_camera_space * p * weight,
        ..RowBlock::default()
    }
}

/// Zeroes the Jacobian columns of locked parameters
fn mask_fixed_columns(row: &mut RowBlock, fixed: &[bool], offsets: [usize; 3]) {
    let [calib, camera, track] = offsets;
    for i in 0..NumUpdateParams::INTERNAL_CALIB {
        if fixed[calib + i] {
            row.j_internal_calib.column_mut(i).fill(0.0);
        }
    }
    for i in 0..NumUpdateParams::CAMERA {
        if fixed[camera + i] {
            row.j_camera.column_mut(i).fill(0.0);
        }
    }
    for i in 0..NumUpdateParams::TRACK {
        if fixed[track + i] {
            row.j_track.column_mut(i).fill(0.0);
        }
    }
}

impl State for BAState {
    type Problem = BundleAdjustment;

    fn compute_residuals(&self, problem: &BundleAdjustment, residuals: &mut [f64]) {
        debug_assert_eq!(residuals.len(), problem.num_residuals());
        let scene = problem.scene();
        let projections = self.projection_matrices(scene);

        residuals
            .par_chunks_mut(2)
            .zip(problem.observations().par_iter())
            .for_each(|(r, obs)| {
                let kp = &scene.cameras[obs.camera_idx].keypoints[obs.keypoint_idx];
                let predicted =
                    hom2eucl(&(projections[obs.camera_idx] * self.tracks[obs.track_idx].location));
                r[0] = kp.weight * (kp.location[0] - predicted[0]);
                r[1] = kp.weight * (kp.location[1] - predicted[1]);
            });
    }

    fn compute_jacobi_matrix(&self, problem: &BundleAdjustment, dst: &mut BAJacobiMatrix) {
        debug_assert_eq!(dst.rows().len(), problem.observations().len());
        let scene = problem.scene();
        let fixed = problem.fixed_mask();

        dst.rows_mut()
            .par_iter_mut()
            .zip(problem.observations().par_iter())
            .for_each(|(row, obs)| {
                let kp = &scene.cameras[obs.camera_idx].keypoints[obs.keypoint_idx];
                let block = observation_jacobian(
                    &self.internal_calibs[obs.internal_calib_idx].k,
                    &self.cameras[obs.camera_idx].h,
                    &self.tracks[obs.track_idx].location,
                    kp.weight,
                );
                row.j_internal_calib = block.j_internal_calib;
                row.j_camera = block.j_camera;
                row.j_track = block.j_track;

                if let Some(fixed) = fixed {
                    let offsets = [
                        problem.internal_calib_offset(obs.internal_calib_idx),
                        problem.camera_offset(obs.camera_idx),
                        problem.track_offset(obs.track_idx),
                    ];
                    mask_fixed_columns(row, fixed, offsets);
                }
            });
    }

    fn update(&self, problem: &BundleAdjustment, delta: &[f64], dst: &mut BAState) {
        debug_assert_eq!(delta.len(), problem.num_update_parameters());
        let step = |i: usize| if problem.is_fixed(i) { 0.0 } else { delta[i] };

        dst.internal_calibs.clone_from(&self.internal_calibs);
        for (i, calib) in dst.internal_calibs.iter_mut().enumerate() {
            let o = problem.internal_calib_offset(i);
            let k = &mut calib.k;
            k[(0, 0)] += step(o) * k[(0, 0)];
            k[(1, 1)] += step(o) * k[(1, 1)];
            k[(0, 2)] += step(o + 1) * k[(0, 2)];
            k[(1, 2)] += step(o + 2) * k[(1, 2)];
            k[(2, 2)] = 1.0;
        }

        dst.cameras.clone_from(&self.cameras);
        for (i, camera) in dst.cameras.iter_mut().enumerate() {
            let o = problem.camera_offset(i);
            let delta_h = rotation_matrix_z(step(o + 2))
                * rotation_matrix_y(step(o + 1))
                * rotation_matrix_x(step(o))
                * translation_matrix(step(o + 3), step(o + 4), step(o + 5));
            camera.h = delta_h * camera.h;
        }

        dst.tracks.clone_from(&self.tracks);
        for (i, track) in dst.tracks.iter_mut().enumerate() {
            let o = problem.track_offset(i);
            let increment = Vector::<4>::new(step(o), step(o + 1), step(o + 2), step(o + 3));
            track.location = renormalize(&(track.location + increment));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Camera, KeyPoint};

    const TOLERANCE: f64 = 1e-9;

    /// Two cameras looking down +Z, the second shifted along X
    fn synthetic_problem() -> (BundleAdjustment, BAState) {
        let calib = InternalCalibrationState::new(800.0, Vector::<2>::new(320.0, 240.0));
        let cameras = vec![
            CameraState::default(),
            CameraState {
                h: translation_matrix(-0.5, 0.0, 0.0) * rotation_matrix_y(0.05),
            },
        ];
        let points = [
            Vector::<4>::new(0.1, 0.2, 4.0, 1.0),
            Vector::<4>::new(-0.4, 0.1, 5.0, 1.0),
            Vector::<4>::new(0.3, -0.3, 6.0, 1.0),
        ];
        let tracks: Vec<TrackState> = points.iter().map(|p| TrackState::new(*p)).collect();
        let state = BAState {
            internal_calibs: vec![calib],
            cameras,
            tracks,
        };

        let mut scene = Scene::new(1, points.len());
        for c in 0..2 {
            scene.cameras.push(Camera::new(0));
            for t in 0..points.len() {
                let location = state.project(&scene, c, t);
                scene.cameras[c].keypoints.push(KeyPoint::new(location, t));
            }
        }
        (BundleAdjustment::new(scene).unwrap(), state)
    }

    #[test]
    fn test_residuals_vanish_at_ground_truth() {
        let (problem, state) = synthetic_problem();
        let mut residuals = vec![1.0; problem.num_residuals()];
        state.compute_residuals(&problem, &mut residuals);
        assert!(residuals.iter().all(|r| r.abs() < TOLERANCE));
    }

    #[test]
    fn test_residuals_are_weighted_and_ordered() {
        let (problem, state) = synthetic_problem();
        let mut scene = problem.into_scene();
        scene.cameras[1].keypoints[2].location += Vector::<2>::new(3.0, -4.0);
        scene.cameras[1].keypoints[2].weight = 0.5;
        let problem = BundleAdjustment::new(scene).unwrap();

        let mut residuals = vec![0.0; problem.num_residuals()];
        state.compute_residuals(&problem, &mut residuals);

        // camera 1, keypoint 2 is the last pair
        assert!((residuals[10] - 1.5).abs() < TOLERANCE);
        assert!((residuals[11] + 2.0).abs() < TOLERANCE);
        assert!(residuals[..10].iter().all(|r| r.abs() < TOLERANCE));
    }

    #[test]
    fn test_check_sizes_reports_first_mismatch() {
        let (problem, state) = synthetic_problem();
        assert!(state.check_sizes(problem.scene()).is_ok());

        let mut short = state.clone();
        short.cameras.pop();
        short.tracks.pop();
        assert!(matches!(
            short.check_sizes(problem.scene()),
            Err(SceneError::StateSizeMismatch {
                what: "cameras",
                expected: 2,
                actual: 1
            })
        ));

        let mut extra = state;
        extra.internal_calibs.push(extra.internal_calibs[0]);
        assert!(matches!(
            extra.check_sizes(problem.scene()),
            Err(SceneError::StateSizeMismatch {
                what: "internal calibrations",
                expected: 1,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_zero_update_is_identity() {
        let (problem, state) = synthetic_problem();
        let mut dst = BAState::default();
        state.update(
            &problem,
            &vec![0.0; problem.num_update_parameters()],
            &mut dst,
        );

        assert_eq!(dst.internal_calibs, state.internal_calibs);
        assert_eq!(dst.cameras, state.cameras);
        for (a, b) in dst.tracks.iter().zip(&state.tracks) {
            assert!((a.location - b.location).norm() < 1e-15);
        }
    }

    #[test]
    fn test_update_does_not_touch_source() {
        let (problem, state) = synthetic_problem();
        let before = state.clone();
        let delta = vec![0.01; problem.num_update_parameters()];
        let mut dst = state.clone();

        state.update(&problem, &delta, &mut dst);

        assert_eq!(state, before);
        assert_ne!(dst, state);
    }

    #[test]
    fn test_intrinsics_update_is_relative() {
        let (problem, state) = synthetic_problem();
        let mut delta = vec![0.0; problem.num_update_parameters()];
        delta[0] = 0.1;
        delta[1] = -0.5;
        delta[2] = 0.25;

        let mut dst = state.clone();
        state.update(&problem, &delta, &mut dst);

        let k = dst.internal_calibs[0].k;
        assert!((k[(0, 0)] - 880.0).abs() < TOLERANCE);
        assert!((k[(1, 1)] - 880.0).abs() < TOLERANCE);
        assert!((k[(0, 2)] - 160.0).abs() < TOLERANCE);
        assert!((k[(1, 2)] - 300.0).abs() < TOLERANCE);
        assert_eq!(k[(2, 2)], 1.0);
    }

    #[test]
    fn test_camera_update_composes_on_the_left() {
        let (problem, state) = synthetic_problem();
        let mut delta = vec![0.0; problem.num_update_parameters()];
        let o = problem.camera_offset(1);
        delta[o] = 0.02;
        delta[o + 1] = -0.01;
        delta[o + 2] = 0.03;
        delta[o + 3] = 0.1;
        delta[o + 4] = 0.2;
        delta[o + 5] = -0.3;

        let mut dst = state.clone();
        state.update(&problem, &delta, &mut dst);

        let expected = rotation_matrix_z(0.03)
            * rotation_matrix_y(-0.01)
            * rotation_matrix_x(0.02)
            * translation_matrix(0.1, 0.2, -0.3)
            * state.cameras[1].h;
        assert!((dst.cameras[1].h - expected).norm() < TOLERANCE);
        assert_eq!(dst.cameras[0], state.cameras[0]);
    }

    #[test]
    fn test_track_update_renormalizes() {
        let (problem, state) = synthetic_problem();
        let delta: Vec<f64> = (0..problem.num_update_parameters())
            .map(|i| 0.05 * (i as f64).sin())
            .collect();

        let mut dst = state.clone();
        state.update(&problem, &delta, &mut dst);

        for track in &dst.tracks {
            assert!((track.location.norm() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_fixed_parameters_are_not_updated() {
        let (mut problem, state) = synthetic_problem();
        problem.fix_camera(0).unwrap();
        problem.fix_internal_calib(0).unwrap();

        let delta = vec![0.1; problem.num_update_parameters()];
        let mut dst = state.clone();
        state.update(&problem, &delta, &mut dst);

        assert_eq!(dst.cameras[0], state.cameras[0]);
        assert_eq!(dst.internal_calibs[0], state.internal_calibs[0]);
        assert_ne!(dst.cameras[1], state.cameras[1]);
    }

    #[test]
    fn test_fixed_parameters_have_zero_columns() {
        let (mut problem, state) = synthetic_problem();
        problem.fix_camera(1).unwrap();
        let mut jacobi = problem.create_jacobi_matrix();
        state.compute_jacobi_matrix(&problem, &mut jacobi);

        let mut diag = vec![0.0; problem.num_update_parameters()];
        crate::core::JacobiMatrix::compute_diag_jtj(&jacobi, &mut diag);

        let o = problem.camera_offset(1);
        assert!(diag[o..o + 6].iter().all(|&d| d == 0.0));
        assert!(diag[problem.camera_offset(0)..o].iter().any(|&d| d > 0.0));
    }
}
