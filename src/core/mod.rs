//! Core optimization components for the sfm-solver library
//!
//! This module contains the abstract contract between the generic
//! Levenberg-Marquardt driver and a concrete residual model:
//! - [`OptimizationProblem`]: sizes and the Jacobian factory
//! - [`State`]: a parameter snapshot that evaluates residuals and Jacobians
//! - [`JacobiMatrix`]: a matrix-free Jacobian operator

pub mod problem;

pub use problem::{JacobiMatrix, OptimizationProblem, State};
