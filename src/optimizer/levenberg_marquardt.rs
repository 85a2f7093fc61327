//! Levenberg-Marquardt algorithm implementation.
//!
//! Each call to [`LevenbergMarquardt::iterate`] performs one trial step:
//!
//! 1. Linearize at the current state: `J`, `g = Jᵗr` and `D = diag(JᵗJ)`.
//! 2. Solve the damped normal equations `(JᵗJ + λD) δ = g`.
//! 3. Evaluate `state ⊞ δ`. If its squared error is finite and lower, keep it
//!    and shrink `λ`; otherwise discard it and grow `λ`.
//!
//! Scaling the damping by `D` (Marquardt scaling) gives every parameter its
//! own natural scale. The linear system is solved matrix-free with conjugate
//! gradients by default; see [`LinearSolverType`] for the alternatives.
//!
//! Termination is left to the caller, see
//! [`crate::bundle::run_bundle_adjustment`] for the canonical policy.

use nalgebra::DVector;
use tracing::debug;

use crate::core::{JacobiMatrix, OptimizationProblem, State};
use crate::linalg::{
    ConjugateGradient, LinAlgError, LinearOperator, LinearSolverType, SparseCholeskySolver,
    squared_norm,
};
use crate::optimizer::{OptimizerError, OptimizerResult};

/// Configuration parameters for the Levenberg-Marquardt driver.
#[derive(Debug, Clone, PartialEq)]
pub struct LevenbergMarquardtConfig {
    /// Damping before the first iteration
    pub initial_damping: f64,
    /// Damping multiplier after an accepted step
    pub damping_decrease_factor: f64,
    /// Damping multiplier after a rejected step
    pub damping_increase_factor: f64,
    /// Conjugate gradient iteration cap
    pub max_cg_iterations: usize,
    /// Conjugate gradient tolerance on the squared residual norm
    pub cg_tolerance: f64,
    /// How the damped normal equations are solved
    pub linear_solver_type: LinearSolverType,
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        Self {
            initial_damping: 1.0,
            damping_decrease_factor: 0.9,
            damping_increase_factor: 2.0,
            max_cg_iterations: 100,
            cg_tolerance: 1e-8,
            linear_solver_type: LinearSolverType::default(),
        }
    }
}

impl LevenbergMarquardtConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_damping(mut self, damping: f64) -> Self {
        self.initial_damping = damping;
        self
    }

    /// Set the damping multipliers for rejected and accepted steps
    pub fn with_damping_factors(mut self, increase: f64, decrease: f64) -> Self {
        self.damping_increase_factor = increase;
        self.damping_decrease_factor = decrease;
        self
    }

    pub fn with_max_cg_iterations(mut self, max_cg_iterations: usize) -> Self {
        self.max_cg_iterations = max_cg_iterations;
        self
    }

    pub fn with_cg_tolerance(mut self, cg_tolerance: f64) -> Self {
        self.cg_tolerance = cg_tolerance;
        self
    }

    pub fn with_linear_solver_type(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    /// Rejects values for which the damping strategy makes no sense
    pub fn validate(&self) -> OptimizerResult<()> {
        if !(self.initial_damping.is_finite() && self.initial_damping > 0.0) {
            return Err(OptimizerError::InvalidConfig(format!(
                "initial damping must be positive, got {}",
                self.initial_damping
            )));
        }
        if !(self.damping_decrease_factor > 0.0 && self.damping_decrease_factor < 1.0) {
            return Err(OptimizerError::InvalidConfig(format!(
                "damping decrease factor must be in (0, 1), got {}",
                self.damping_decrease_factor
            )));
        }
        if !(self.damping_increase_factor > 1.0 && self.damping_increase_factor.is_finite()) {
            return Err(OptimizerError::InvalidConfig(format!(
                "damping increase factor must be greater than 1, got {}",
                self.damping_increase_factor
            )));
        }
        if self.max_cg_iterations == 0 {
            return Err(OptimizerError::InvalidConfig(
                "max_cg_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// What happened during one call to [`LevenbergMarquardt::iterate`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationOutcome {
    /// Whether the candidate state replaced the current one
    pub accepted: bool,
    /// Squared error of the current state after the iteration
    pub error: f64,
    /// Squared error of the candidate state
    pub candidate_error: f64,
    /// Damping after the iteration
    pub damping: f64,
    /// Conjugate gradient iterations (zero for the direct solver)
    pub cg_iterations: usize,
    /// Euclidean norm of the update vector
    pub update_norm: f64,
}

/// `x ↦ JᵗJx + λ·D·x` through two passes over the Jacobian operator
struct DampedNormalOperator<'a, J: JacobiMatrix> {
    jacobi: &'a J,
    diagonal: &'a [f64],
    damping: f64,
    scratch: &'a mut [f64],
}

impl<J: JacobiMatrix> LinearOperator for DampedNormalOperator<'_, J> {
    fn dim(&self) -> usize {
        self.diagonal.len()
    }

    fn apply(&mut self, dst: &mut [f64], src: &[f64]) {
        self.jacobi.multiply(self.scratch, src);
        self.jacobi.transposed_multiply(dst, self.scratch);
        for ((d, &diag), &s) in dst.iter_mut().zip(self.diagonal).zip(src) {
            *d += self.damping * diag * s;
        }
    }
}

/// Levenberg-Marquardt driver over an [`OptimizationProblem`].
///
/// Keeps the current state and a candidate buffer and swaps them when a step
/// is accepted. The problem is passed to every call instead of being owned,
/// so the caller may change the problem definition (e.g. keypoint weights)
/// between iterations; call [`LevenbergMarquardt::refresh`] afterwards.
pub struct LevenbergMarquardt<P: OptimizationProblem> {
    config: LevenbergMarquardtConfig,
    state: P::State,
    candidate: P::State,
    jacobi: P::Jacobi,
    residuals: Vec<f64>,
    candidate_residuals: Vec<f64>,
    gradient: DVector<f64>,
    diag_jtj: Vec<f64>,
    scratch: Vec<f64>,
    last_error: f64,
    damping: f64,
    iterations: usize,
    successful_steps: usize,
    unsuccessful_steps: usize,
}

impl<P: OptimizationProblem> LevenbergMarquardt<P> {
    /// Create a driver with the default configuration.
    pub fn new(problem: &P, initial_state: P::State) -> OptimizerResult<Self> {
        Self::with_config(problem, initial_state, LevenbergMarquardtConfig::default())
    }

    /// Create a driver with the given configuration.
    ///
    /// Evaluates the residuals of `initial_state` once to seed the error.
    pub fn with_config(
        problem: &P,
        initial_state: P::State,
        config: LevenbergMarquardtConfig,
    ) -> OptimizerResult<Self> {
        config.validate()?;
        problem
            .validate_state(&initial_state)
            .map_err(OptimizerError::InvalidState)?;

        let num_residuals = problem.num_residuals();
        let num_update_parameters = problem.num_update_parameters();
        let jacobi = problem.create_jacobi_matrix();
        if jacobi.num_residuals() != num_residuals {
            return Err(OptimizerError::DimensionMismatch {
                what: "jacobian rows",
                expected: num_residuals,
                actual: jacobi.num_residuals(),
            });
        }
        if jacobi.num_update_parameters() != num_update_parameters {
            return Err(OptimizerError::DimensionMismatch {
                what: "jacobian columns",
                expected: num_update_parameters,
                actual: jacobi.num_update_parameters(),
            });
        }

        let mut residuals = vec![0.0; num_residuals];
        initial_state.compute_residuals(problem, &mut residuals);
        let last_error = squared_norm(&residuals);

        Ok(Self {
            damping: config.initial_damping,
            config,
            candidate: initial_state.clone(),
            state: initial_state,
            jacobi,
            residuals,
            candidate_residuals: vec![0.0; num_residuals],
            gradient: DVector::zeros(num_update_parameters),
            diag_jtj: vec![0.0; num_update_parameters],
            scratch: vec![0.0; num_residuals],
            last_error,
            iterations: 0,
            successful_steps: 0,
            unsuccessful_steps: 0,
        })
    }

    /// Performs one linearize / solve / trial-step cycle.
    pub fn iterate(&mut self, problem: &P) -> OptimizerResult<IterationOutcome> {
        self.state.compute_jacobi_matrix(problem, &mut self.jacobi);
        self.jacobi
            .transposed_multiply(self.gradient.as_mut_slice(), &self.residuals);
        self.jacobi.compute_diag_jtj(&mut self.diag_jtj);

        let (update, cg_iterations) = self.solve_damped_system()?;

        self.state
            .update(problem, update.as_slice(), &mut self.candidate);
        self.candidate
            .compute_residuals(problem, &mut self.candidate_residuals);
        let candidate_error = squared_norm(&self.candidate_residuals);

        // NaN / Inf never counts as an improvement
        let accepted = candidate_error.is_finite() && candidate_error < self.last_error;
        if accepted {
            std::mem::swap(&mut self.state, &mut self.candidate);
            std::mem::swap(&mut self.residuals, &mut self.candidate_residuals);
            self.last_error = candidate_error;
            self.damping *= self.config.damping_decrease_factor;
            self.successful_steps += 1;
        } else {
            self.damping *= self.config.damping_increase_factor;
            self.unsuccessful_steps += 1;
        }
        self.iterations += 1;

        let update_norm = update.norm();
        debug!(
            "Iteration {}: error {:.6e} -> {:.6e}, damping {:.3e}, cg {}, |dx| {:.3e} [{}]",
            self.iterations,
            self.last_error,
            candidate_error,
            self.damping,
            cg_iterations,
            update_norm,
            if accepted { "ACCEPTED" } else { "REJECTED" }
        );

        Ok(IterationOutcome {
            accepted,
            error: self.last_error,
            candidate_error,
            damping: self.damping,
            cg_iterations,
            update_norm,
        })
    }

    fn solve_damped_system(&mut self) -> OptimizerResult<(DVector<f64>, usize)> {
        let linear_solver_error = |e: LinAlgError| OptimizerError::LinearSolver(e.to_string());

        match self.config.linear_solver_type {
            LinearSolverType::ConjugateGradient
            | LinearSolverType::PreconditionedConjugateGradient => {
                let inverse_preconditioner = (self.config.linear_solver_type
                    == LinearSolverType::PreconditionedConjugateGradient)
                    .then(|| {
                        DVector::from_iterator(
                            self.diag_jtj.len(),
                            self.diag_jtj.iter().map(|&d| {
                                let m = d * (1.0 + self.damping);
                                if m > 0.0 { 1.0 / m } else { 1.0 }
                            }),
                        )
                    });

                let mut operator = DampedNormalOperator {
                    jacobi: &self.jacobi,
                    diagonal: &self.diag_jtj,
                    damping: self.damping,
                    scratch: &mut self.scratch,
                };
                let cg =
                    ConjugateGradient::new(self.config.max_cg_iterations, self.config.cg_tolerance);
                let (update, outcome) = cg
                    .solve(&mut operator, &self.gradient, inverse_preconditioner.as_ref())
                    .map_err(linear_solver_error)?;
                Ok((update, outcome.iterations))
            }
            LinearSolverType::SparseCholesky => {
                let jacobian = self.jacobi.to_sparse().map_err(linear_solver_error)?;
                let update = SparseCholeskySolver::new()
                    .solve_augmented_equation(&jacobian, &self.gradient, self.damping)
                    .map_err(linear_solver_error)?;
                Ok((update, 0))
            }
        }
    }

    /// Recomputes the cached residuals and error of the current state.
    ///
    /// Needed after the problem definition changed between iterations, so
    /// that the next accept/reject test compares errors of the same model.
    pub fn refresh(&mut self, problem: &P) {
        self.state.compute_residuals(problem, &mut self.residuals);
        self.last_error = squared_norm(&self.residuals);
    }

    /// Sum of squared residuals of the current state
    pub fn last_error(&self) -> f64 {
        self.last_error
    }

    pub fn damping(&self) -> f64 {
        self.damping
    }

    /// The best state found so far
    pub fn state(&self) -> &P::State {
        &self.state
    }

    pub fn into_state(self) -> P::State {
        self.state
    }

    pub fn residuals(&self) -> &[f64] {
        &self.residuals
    }

    pub fn config(&self) -> &LevenbergMarquardtConfig {
        &self.config
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn successful_steps(&self) -> usize {
        self.successful_steps
    }

    pub fn unsuccessful_steps(&self) -> usize {
        self.unsuccessful_steps
    }
}
