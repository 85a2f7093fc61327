//! Optimization solvers for nonlinear least squares problems.
//!
//! This module provides the Levenberg-Marquardt driver, generic over any
//! [`crate::core::OptimizationProblem`], together with its error and status
//! types.

use std::fmt;

use thiserror::Error;

pub mod levenberg_marquardt;

pub use levenberg_marquardt::{IterationOutcome, LevenbergMarquardt, LevenbergMarquardtConfig};

/// Optimizer specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// Operator or vector sizes disagree with the problem
    #[error("{what} dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The initial state does not fit the problem
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The damped normal equations could not be solved
    #[error("Linear solver failed: {0}")]
    LinearSolver(String),

    /// Configuration values out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Why an optimization run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// The iteration budget was used up
    MaxIterationsReached,
    /// Damping exceeded its limit, no further progress is possible
    DampingLimitReached,
}

impl fmt::Display for OptimizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::DampingLimitReached => write!(f, "Damping limit reached"),
        }
    }
}
