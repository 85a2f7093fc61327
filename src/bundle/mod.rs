//! Bundle adjustment as an [`OptimizationProblem`].
//!
//! Jointly refines internal calibrations, camera poses and track positions so
//! that reprojected tracks match their keypoints. The update vector is laid
//! out as
//!
//! ```text
//! [internal calib 0..n][camera 0..m][track 0..k]
//!  3 params each        6 each       4 each
//! ```
//!
//! Residuals come in `(x, y)` pairs, cameras in order, keypoints in order
//! within a camera. The Jacobian operator uses the same row order.

use tracing::info;

use crate::core::OptimizationProblem;
use crate::scene::{Scene, SceneError};

pub mod jacobian;
pub mod runner;
pub mod seed;
pub mod state;

pub use jacobian::{BAJacobiMatrix, RowBlock};
pub use runner::{BundleAdjustmentResult, RunConfig, run_bundle_adjustment};
pub use seed::{TriangulationReport, triangulate_linear, triangulate_tracks};
pub use state::{BAState, CameraState, InternalCalibrationState, TrackState};

/// Number of update parameters per parameter group
pub struct NumUpdateParams;

impl NumUpdateParams {
    /// Relative focal length, relative principal point x, relative principal point y
    pub const INTERNAL_CALIB: usize = 3;
    /// Rotation about camera X, Y, Z then translation along camera X, Y, Z
    pub const CAMERA: usize = 6;
    /// Homogeneous X, Y, Z, W
    pub const TRACK: usize = 4;
}

/// One keypoint observation with the indices needed to gather its parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub camera_idx: usize,
    pub keypoint_idx: usize,
    pub internal_calib_idx: usize,
    pub track_idx: usize,
}

/// Result of one outlier downweighting round
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownweightSummary {
    /// Weighted distance above which keypoints were downweighted
    pub threshold: f64,
    pub min: f64,
    pub median: f64,
    pub max: f64,
    /// Number of keypoints whose weight was halved
    pub downweighted: usize,
}

/// The bundle adjustment problem: a validated scene plus parameter locks.
#[derive(Debug, Clone)]
pub struct BundleAdjustment {
    scene: Scene,
    observations: Vec<Observation>,
    camera_offset: usize,
    track_offset: usize,
    num_update_parameters: usize,
    fixed: Vec<bool>,
    num_fixed: usize,
}

impl BundleAdjustment {
    /// Validates the scene and precomputes the observation list.
    pub fn new(scene: Scene) -> Result<Self, SceneError> {
        scene.validate()?;

        let observations = scene
            .cameras
            .iter()
            .enumerate()
            .flat_map(|(camera_idx, camera)| {
                camera
                    .keypoints
                    .iter()
                    .enumerate()
                    .map(move |(keypoint_idx, kp)| Observation {
                        camera_idx,
                        keypoint_idx,
                        internal_calib_idx: camera.internal_calib_idx,
                        track_idx: kp.track_idx,
                    })
            })
            .collect();

        let camera_offset = scene.num_internal_calibs * NumUpdateParams::INTERNAL_CALIB;
        let track_offset = camera_offset + scene.cameras.len() * NumUpdateParams::CAMERA;
        let num_update_parameters = track_offset + scene.num_tracks * NumUpdateParams::TRACK;

        Ok(Self {
            scene,
            observations,
            camera_offset,
            track_offset,
            num_update_parameters,
            fixed: vec![false; num_update_parameters],
            num_fixed: 0,
        })
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn into_scene(self) -> Scene {
        self.scene
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// First update parameter of an internal calibration
    pub fn internal_calib_offset(&self, calib_idx: usize) -> usize {
        calib_idx * NumUpdateParams::INTERNAL_CALIB
    }

    /// First update parameter of a camera
    pub fn camera_offset(&self, camera_idx: usize) -> usize {
        self.camera_offset + camera_idx * NumUpdateParams::CAMERA
    }

    /// First update parameter of a track
    pub fn track_offset(&self, track_idx: usize) -> usize {
        self.track_offset + track_idx * NumUpdateParams::TRACK
    }

    /// Locks a single update parameter at its current value
    pub fn fix_parameter(&mut self, index: usize) -> Result<(), SceneError> {
        if index >= self.num_update_parameters {
            return Err(SceneError::StateSizeMismatch {
                what: "update parameter index",
                expected: self.num_update_parameters,
                actual: index,
            });
        }
        if !self.fixed[index] {
            self.fixed[index] = true;
            self.num_fixed += 1;
        }
        Ok(())
    }

    /// Locks all parameters of an internal calibration
    pub fn fix_internal_calib(&mut self, calib_idx: usize) -> Result<(), SceneError> {
        if calib_idx >= self.scene.num_internal_calibs {
            return Err(SceneError::StateSizeMismatch {
                what: "internal calibration index",
                expected: self.scene.num_internal_calibs,
                actual: calib_idx,
            });
        }
        let offset = self.internal_calib_offset(calib_idx);
        (offset..offset + NumUpdateParams::INTERNAL_CALIB).try_for_each(|i| self.fix_parameter(i))
    }

    /// Locks the pose of a camera
    pub fn fix_camera(&mut self, camera_idx: usize) -> Result<(), SceneError> {
        if camera_idx >= self.scene.cameras.len() {
            return Err(SceneError::StateSizeMismatch {
                what: "camera index",
                expected: self.scene.cameras.len(),
                actual: camera_idx,
            });
        }
        let offset = self.camera_offset(camera_idx);
        (offset..offset + NumUpdateParams::CAMERA).try_for_each(|i| self.fix_parameter(i))
    }

    pub fn is_fixed(&self, index: usize) -> bool {
        self.fixed.get(index).copied().unwrap_or(false)
    }

    pub fn num_fixed_parameters(&self) -> usize {
        self.num_fixed
    }

    pub(crate) fn fixed_mask(&self) -> Option<&[bool]> {
        (self.num_fixed > 0).then_some(self.fixed.as_slice())
    }

    /// Checks that a state has one entry per calibration, camera and track
    pub fn check_state(&self, state: &BAState) -> Result<(), SceneError> {
        state.check_sizes(&self.scene)
    }

    /// Halves the weight of keypoints with a large residual.
    ///
    /// The threshold is twice the weighted distance at the 2/3 quantile. Only
    /// keypoint weights in the scene change, `state` is only read.
    pub fn downweight_outlier_keypoints(&mut self, state: &BAState) -> DownweightSummary {
        let mut residuals = vec![0.0; self.num_residuals()];
        crate::core::State::compute_residuals(state, self, &mut residuals);

        let distances: Vec<f64> = residuals
            .chunks_exact(2)
            .map(|r| r[0].hypot(r[1]))
            .collect();
        if distances.is_empty() {
            return DownweightSummary {
                threshold: 0.0,
                min: 0.0,
                median: 0.0,
                max: 0.0,
                downweighted: 0,
            };
        }

        let mut sorted = distances.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let min = sorted[0];
        let max = sorted[sorted.len() - 1];
        let median = sorted[sorted.len() / 2];
        let threshold = sorted[sorted.len() * 2 / 3] * 2.0;

        let mut downweighted = 0;
        let mut distance = distances.iter();
        for camera in &mut self.scene.cameras {
            for kp in &mut camera.keypoints {
                if distance.next().is_some_and(|&d| d > threshold) {
                    kp.weight *= 0.5;
                    downweighted += 1;
                }
            }
        }

        info!(
            "Distances min {:.4}, median {:.4}, max {:.4}, threshold {:.4}: {} downweighted",
            min, median, max, threshold, downweighted
        );

        DownweightSummary {
            threshold,
            min,
            median,
            max,
            downweighted,
        }
    }

    /// Weighted RMS reprojection distance in pixels for a total squared error
    pub fn reprojection_stddev(&self, error: f64) -> f64 {
        let sum_squared_weights: f64 = self
            .scene
            .observations()
            .map(|(_, kp)| kp.weight * kp.weight)
            .sum();
        if sum_squared_weights > 0.0 {
            (error / sum_squared_weights).sqrt()
        } else {
            0.0
        }
    }
}

impl OptimizationProblem for BundleAdjustment {
    type State = BAState;
    type Jacobi = BAJacobiMatrix;

    fn num_update_parameters(&self) -> usize {
        self.num_update_parameters
    }

    fn num_residuals(&self) -> usize {
        2 * self.observations.len()
    }

    fn create_jacobi_matrix(&self) -> BAJacobiMatrix {
        BAJacobiMatrix::new(self)
    }

    fn validate_state(&self, state: &BAState) -> Result<(), String> {
        self.check_state(state).map_err(|e| e.to_string())
    }
}
