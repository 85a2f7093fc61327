//! Linear algebra utilities for bundle adjustment.
//!
//! This module provides:
//! - Fixed-size dense matrices and vectors (nalgebra `SMatrix`, stack allocated)
//! - Homogeneous transform builders and projective helpers
//! - A matrix-free (preconditioned) conjugate gradient solver
//! - A sparse Cholesky solver for the damped normal equations (faer)

use nalgebra::SMatrix;
use thiserror::Error;

pub mod cholesky;
pub mod conjugate_gradient;

pub use cholesky::SparseCholeskySolver;
pub use conjugate_gradient::{CgOutcome, ConjugateGradient, LinearOperator};

/// Dense fixed-size matrix with `R` rows and `C` columns
pub type Matrix<const R: usize, const C: usize> = SMatrix<f64, R, C>;

/// Dense fixed-size column vector
pub type Vector<const R: usize> = SMatrix<f64, R, 1>;

/// Type alias for sparse matrices using faer
pub type SparseMatrix = faer::sparse::SparseColMat<usize, f64>;

/// Strategy for solving the damped normal equations
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinearSolverType {
    /// Matrix-free conjugate gradient
    #[default]
    ConjugateGradient,
    /// Matrix-free conjugate gradient with a Jacobi preconditioner
    PreconditionedConjugateGradient,
    /// Materialized Jacobian and sparse Cholesky factorization
    SparseCholesky,
}

impl std::fmt::Display for LinearSolverType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinearSolverType::ConjugateGradient => write!(f, "Conjugate Gradient"),
            LinearSolverType::PreconditionedConjugateGradient => {
                write!(f, "Preconditioned Conjugate Gradient")
            }
            LinearSolverType::SparseCholesky => write!(f, "Sparse Cholesky"),
        }
    }
}

/// Linear algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Invalid input provided to a solver
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operand sizes do not agree
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Matrix is singular or not positive definite
    #[error("Matrix is singular or not positive definite")]
    SingularMatrix,

    /// Failed to build or convert a sparse matrix
    #[error("Matrix conversion failed: {0}")]
    MatrixConversion(String),

    /// Numeric factorization failed
    #[error("Factorization failed: {0}")]
    FactorizationFailed(String),
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Homogeneous rotation about the X axis by `angle` radians
pub fn rotation_matrix_x(angle: f64) -> Matrix<4, 4> {
    let (s, c) = angle.sin_cos();
    Matrix::<4, 4>::new(
        1.0, 0.0, 0.0, 0.0, //
        0.0, c, -s, 0.0, //
        0.0, s, c, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    )
}

/// Homogeneous rotation about the Y axis by `angle` radians
pub fn rotation_matrix_y(angle: f64) -> Matrix<4, 4> {
    let (s, c) = angle.sin_cos();
    Matrix::<4, 4>::new(
        c, 0.0, s, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        -s, 0.0, c, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    )
}

/// Homogeneous rotation about the Z axis by `angle` radians
pub fn rotation_matrix_z(angle: f64) -> Matrix<4, 4> {
    let (s, c) = angle.sin_cos();
    Matrix::<4, 4>::new(
        c, -s, 0.0, 0.0, //
        s, c, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    )
}

/// Homogeneous translation by `(x, y, z)`
pub fn translation_matrix(x: f64, y: f64, z: f64) -> Matrix<4, 4> {
    Matrix::<4, 4>::new(
        1.0, 0.0, 0.0, x, //
        0.0, 1.0, 0.0, y, //
        0.0, 0.0, 1.0, z, //
        0.0, 0.0, 0.0, 1.0,
    )
}

/// Removes the last row of a homogeneous 4x4 transform, giving the 3x4 map
/// from homogeneous world points to homogeneous camera-space points.
pub fn drop_last_row(h: &Matrix<4, 4>) -> Matrix<3, 4> {
    h.fixed_rows::<3>(0).into_owned()
}

/// Homogeneous image point to Euclidean pixel coordinates.
///
/// No guard against `p[2] == 0`; the result is then non-finite.
pub fn hom2eucl(p: &Vector<3>) -> Vector<2> {
    Vector::<2>::new(p[0] / p[2], p[1] / p[2])
}

/// Homogeneous world point to Euclidean 3D coordinates.
pub fn hom2eucl_point(p: &Vector<4>) -> Vector<3> {
    Vector::<3>::new(p[0] / p[3], p[1] / p[3], p[2] / p[3])
}

/// Scales a homogeneous 4-vector to unit Euclidean norm.
///
/// A zero vector is returned unchanged.
pub fn renormalize(p: &Vector<4>) -> Vector<4> {
    let norm = p.norm();
    if norm > 0.0 { p / norm } else { *p }
}

/// Sum of squared entries of a residual vector
pub fn squared_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-12;

    #[test]
    fn test_renormalize_is_idempotent() {
        let samples = [
            Vector::<4>::new(1.0, 2.0, 3.0, 4.0),
            Vector::<4>::new(-0.3, 1e-4, 7.5, 0.0),
            Vector::<4>::new(1e6, -2e6, 3e5, 1.0),
        ];
        for p in samples {
            let once = renormalize(&p);
            let twice = renormalize(&once);
            assert!((once.norm() - 1.0).abs() < TOLERANCE);
            assert!((once - twice).norm() < TOLERANCE);
        }
    }

    #[test]
    fn test_renormalize_keeps_points_at_infinity() {
        let p = renormalize(&Vector::<4>::new(0.0, 3.0, 4.0, 0.0));
        assert!((p - Vector::<4>::new(0.0, 0.6, 0.8, 0.0)).norm() < TOLERANCE);
    }

    #[test]
    fn test_rotations_are_orthonormal() {
        for r in [
            rotation_matrix_x(0.3),
            rotation_matrix_y(-1.2),
            rotation_matrix_z(2.5),
        ] {
            let rtr = r.transpose() * r;
            assert!((rtr - Matrix::<4, 4>::identity()).norm() < TOLERANCE);
            assert!((r.determinant() - 1.0).abs() < TOLERANCE);
        }
    }

    #[test]
    fn test_rotation_directions() {
        // Right-handed: X rotates Y into Z, Y rotates Z into X, Z rotates X into Y.
        let x = Vector::<4>::new(1.0, 0.0, 0.0, 1.0);
        let y = Vector::<4>::new(0.0, 1.0, 0.0, 1.0);
        let z = Vector::<4>::new(0.0, 0.0, 1.0, 1.0);
        let quarter = std::f64::consts::FRAC_PI_2;

        assert!((rotation_matrix_x(quarter) * y - z).norm() < TOLERANCE);
        assert!((rotation_matrix_y(quarter) * z - x).norm() < TOLERANCE);
        assert!((rotation_matrix_z(quarter) * x - y).norm() < TOLERANCE);
    }

    #[test]
    fn test_translation_and_drop_last_row() {
        let h = translation_matrix(1.0, -2.0, 3.0);
        let p = Vector::<4>::new(0.5, 0.5, 0.5, 2.0);
        let v = drop_last_row(&h) * p;
        assert!((v - Vector::<3>::new(2.5, -3.5, 6.5)).norm() < TOLERANCE);
    }

    #[test]
    fn test_hom2eucl() {
        let p = hom2eucl(&Vector::<3>::new(4.0, 6.0, 2.0));
        assert!((p - Vector::<2>::new(2.0, 3.0)).norm() < TOLERANCE);

        let q = hom2eucl_point(&Vector::<4>::new(2.0, 4.0, 6.0, 2.0));
        assert!((q - Vector::<3>::new(1.0, 2.0, 3.0)).norm() < TOLERANCE);

        assert!(!hom2eucl(&Vector::<3>::new(1.0, 1.0, 0.0))[0].is_finite());
    }

    #[test]
    fn test_squared_norm() {
        assert_eq!(squared_norm(&[3.0, 4.0]), 25.0);
        assert_eq!(squared_norm(&[]), 0.0);
    }
}
