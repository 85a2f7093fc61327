//! Error types for the sfm-solver library
//!
//! This module provides the main error and result types used throughout the library.
//! All errors use the `thiserror` crate for automatic trait implementations.

use crate::{linalg::LinAlgError, optimizer::OptimizerError, scene::SceneError};
use thiserror::Error;

/// Main result type used throughout the sfm-solver library
pub type SfmResult<T> = Result<T, SfmError>;

/// Main error type for the sfm-solver library
#[derive(Debug, Clone, Error)]
pub enum SfmError {
    /// Linear algebra related errors
    #[error("Linear algebra error: {0}")]
    LinearAlgebra(String),

    /// Malformed scene topology or a state that does not fit the scene
    #[error("Scene error: {0}")]
    Scene(String),

    /// Solver related errors
    #[error("Solver error: {0}")]
    Solver(String),
}

impl From<LinAlgError> for SfmError {
    fn from(err: LinAlgError) -> Self {
        SfmError::LinearAlgebra(err.to_string())
    }
}

impl From<SceneError> for SfmError {
    fn from(err: SceneError) -> Self {
        SfmError::Scene(err.to_string())
    }
}

impl From<OptimizerError> for SfmError {
    fn from(err: OptimizerError) -> Self {
        SfmError::Solver(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sfm_error_display() {
        let error = SfmError::LinearAlgebra("Matrix is singular".to_string());
        assert_eq!(
            error.to_string(),
            "Linear algebra error: Matrix is singular"
        );
    }

    #[test]
    fn test_sfm_error_from_scene() {
        let scene_error = SceneError::TrackIndexOutOfRange {
            camera: 1,
            keypoint: 4,
            track: 12,
            num_tracks: 10,
        };
        let sfm_error = SfmError::from(scene_error);

        match sfm_error {
            SfmError::Scene(msg) => assert!(msg.contains("track index 12")),
            _ => panic!("Expected scene error"),
        }
    }

    #[test]
    fn test_sfm_error_from_optimizer() {
        let err = OptimizerError::DimensionMismatch {
            what: "residuals",
            expected: 8,
            actual: 6,
        };
        match SfmError::from(err) {
            SfmError::Solver(msg) => assert!(msg.contains("residuals")),
            _ => panic!("Expected solver error"),
        }
    }

    #[test]
    fn test_sfm_result_propagates_with_question_mark() {
        fn solve() -> Result<f64, LinAlgError> {
            Err(LinAlgError::InvalidInput("empty system".to_string()))
        }
        fn scaled() -> SfmResult<f64> {
            let x = solve()?;
            Ok(2.0 * x)
        }
        match scaled() {
            Err(SfmError::LinearAlgebra(msg)) => assert!(msg.contains("empty system")),
            other => panic!("Expected linear algebra error, got {other:?}"),
        }
    }
}
