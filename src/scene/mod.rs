//! Static scene topology: cameras, their keypoint observations and the
//! counts that size the parameter vector.
//!
//! A [`Scene`] does not change during an optimization run, with one exception:
//! keypoint weights are lowered by outlier downweighting.

use thiserror::Error;

use crate::linalg::Vector;

pub mod tracks;

pub use tracks::TrackBuilder;

/// Scene specific error types
#[derive(Debug, Clone, Error)]
pub enum SceneError {
    /// A keypoint refers to a track that does not exist
    #[error(
        "camera {camera}, keypoint {keypoint}: track index {track} out of range (num_tracks = {num_tracks})"
    )]
    TrackIndexOutOfRange {
        camera: usize,
        keypoint: usize,
        track: usize,
        num_tracks: usize,
    },

    /// A camera refers to an internal calibration that does not exist
    #[error(
        "camera {camera}: internal calibration index {calib} out of range (num_internal_calibs = {num_internal_calibs})"
    )]
    InternalCalibIndexOutOfRange {
        camera: usize,
        calib: usize,
        num_internal_calibs: usize,
    },

    /// Keypoint weights must be finite and non-negative
    #[error("camera {camera}, keypoint {keypoint}: invalid weight {weight}")]
    InvalidWeight {
        camera: usize,
        keypoint: usize,
        weight: f64,
    },

    /// A state or parameter group does not fit the scene
    #[error("{what}: expected {expected}, got {actual}")]
    StateSizeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Image index out of range while building tracks
    #[error("image index {image} out of range (num_images = {num_images})")]
    InvalidImageIndex { image: usize, num_images: usize },

    /// Keypoint index out of range while building tracks
    #[error(
        "image {image}: keypoint index {keypoint} out of range (num_keypoints = {num_keypoints})"
    )]
    InvalidKeypointIndex {
        image: usize,
        keypoint: usize,
        num_keypoints: usize,
    },
}

/// A 2D observation of a track in one image.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPoint {
    /// Pixel position
    pub location: Vector<2>,
    /// Index of the observed track
    pub track_idx: usize,
    /// Residual weight, lowered for suspected outliers
    pub weight: f64,
}

impl KeyPoint {
    pub fn new(location: Vector<2>, track_idx: usize) -> Self {
        Self {
            location,
            track_idx,
            weight: 1.0,
        }
    }
}

/// One image: which calibration group it belongs to and what it observes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Camera {
    pub internal_calib_idx: usize,
    pub keypoints: Vec<KeyPoint>,
}

impl Camera {
    pub fn new(internal_calib_idx: usize) -> Self {
        Self {
            internal_calib_idx,
            keypoints: Vec::new(),
        }
    }
}

/// Cameras plus the group counts that size the parameter vector
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scene {
    pub cameras: Vec<Camera>,
    pub num_internal_calibs: usize,
    pub num_tracks: usize,
}

impl Scene {
    pub fn new(num_internal_calibs: usize, num_tracks: usize) -> Self {
        Self {
            cameras: Vec::new(),
            num_internal_calibs,
            num_tracks,
        }
    }

    /// Total number of keypoint observations over all cameras
    pub fn num_keypoints(&self) -> usize {
        self.cameras.iter().map(|c| c.keypoints.len()).sum()
    }

    /// Two residuals (x, y) per keypoint
    pub fn num_residuals(&self) -> usize {
        2 * self.num_keypoints()
    }

    /// Checks every index and weight. Called before any optimization.
    pub fn validate(&self) -> Result<(), SceneError> {
        for (camera_idx, camera) in self.cameras.iter().enumerate() {
            if camera.internal_calib_idx >= self.num_internal_calibs {
                return Err(SceneError::InternalCalibIndexOutOfRange {
                    camera: camera_idx,
                    calib: camera.internal_calib_idx,
                    num_internal_calibs: self.num_internal_calibs,
                });
            }
            for (kp_idx, kp) in camera.keypoints.iter().enumerate() {
                if kp.track_idx >= self.num_tracks {
                    return Err(SceneError::TrackIndexOutOfRange {
                        camera: camera_idx,
                        keypoint: kp_idx,
                        track: kp.track_idx,
                        num_tracks: self.num_tracks,
                    });
                }
                if !kp.weight.is_finite() || kp.weight < 0.0 {
                    return Err(SceneError::InvalidWeight {
                        camera: camera_idx,
                        keypoint: kp_idx,
                        weight: kp.weight,
                    });
                }
            }
        }
        Ok(())
    }

    /// Iterates `(camera_idx, keypoint)` in residual order
    pub fn observations(&self) -> impl Iterator<Item = (usize, &KeyPoint)> + '_ {
        self.cameras
            .iter()
            .enumerate()
            .flat_map(|(c, camera)| camera.keypoints.iter().map(move |kp| (c, kp)))
    }
}
