//! Optimization problem abstraction.
//!
//! The driver only ever sees three things: the problem (fixed topology and
//! sizes), a state (the current values of all parameters) and a Jacobian
//! operator that can be multiplied with vectors. Parameters live in a flat
//! *update space* of length [`OptimizationProblem::num_update_parameters`];
//! how an update vector is composed onto a state is up to the state.

use faer::sparse::{SparseColMat, Triplet};

use crate::linalg::{LinAlgError, LinAlgResult, SparseMatrix};

/// Matrix-free Jacobian of the residual vector with respect to the update
/// parameters.
///
/// Row `i` belongs to residual `i` as produced by [`State::compute_residuals`].
pub trait JacobiMatrix: Send + Sync {
    /// Number of rows
    fn num_residuals(&self) -> usize;

    /// Number of columns
    fn num_update_parameters(&self) -> usize;

    /// `dst = J · src`
    ///
    /// `src` has length `num_update_parameters`, `dst` has length `num_residuals`.
    fn multiply(&self, dst: &mut [f64], src: &[f64]);

    /// `dst = Jᵗ · src`
    ///
    /// `src` has length `num_residuals`, `dst` has length `num_update_parameters`.
    fn transposed_multiply(&self, dst: &mut [f64], src: &[f64]);

    /// Diagonal of `JᵗJ`, one entry per update parameter
    fn compute_diag_jtj(&self, dst: &mut [f64]);

    /// Materialize the operator as a sparse matrix.
    ///
    /// The default implementation probes one column at a time and is only
    /// meant for small problems and diagnostics.
    fn to_sparse(&self) -> LinAlgResult<SparseMatrix> {
        let rows = self.num_residuals();
        let cols = self.num_update_parameters();

        let mut unit = vec![0.0; cols];
        let mut column = vec![0.0; rows];
        let mut triplets = Vec::new();
        for c in 0..cols {
            unit[c] = 1.0;
            self.multiply(&mut column, &unit);
            unit[c] = 0.0;
            for (r, &value) in column.iter().enumerate() {
                if value != 0.0 {
                    triplets.push(Triplet::new(r, c, value));
                }
            }
        }

        SparseColMat::try_new_from_triplets(rows, cols, &triplets)
            .map_err(|e| LinAlgError::MatrixConversion(format!("{e:?}")))
    }
}

/// A least squares problem: fixed topology plus a factory for its Jacobian
/// operator.
pub trait OptimizationProblem {
    /// Parameter snapshot type
    type State: State<Problem = Self>;
    /// Jacobian operator type
    type Jacobi: JacobiMatrix;

    /// Length of the update vector
    fn num_update_parameters(&self) -> usize;

    /// Length of the residual vector
    fn num_residuals(&self) -> usize;

    /// Creates an operator whose sparsity matches this problem
    fn create_jacobi_matrix(&self) -> Self::Jacobi;

    /// Checks that a state belongs to this problem before optimizing it
    fn validate_state(&self, _state: &Self::State) -> Result<(), String> {
        Ok(())
    }
}

/// A snapshot of all optimization variables.
///
/// States are values: evaluating never mutates `self` and [`State::update`]
/// writes into a distinct destination. `Clone` must produce an independent
/// deep copy.
pub trait State: Clone + Send + Sync {
    type Problem: OptimizationProblem;

    /// Fills `residuals` (length `num_residuals`) with the signed errors
    fn compute_residuals(&self, problem: &Self::Problem, residuals: &mut [f64]);

    /// Evaluates the local derivatives at this state into `dst`.
    ///
    /// `dst` must come from `problem.create_jacobi_matrix()`.
    fn compute_jacobi_matrix(
        &self,
        problem: &Self::Problem,
        dst: &mut <Self::Problem as OptimizationProblem>::Jacobi,
    );

    /// Writes `self ⊞ delta` into `dst`; `self` is left untouched.
    fn update(&self, problem: &Self::Problem, delta: &[f64], dst: &mut Self);
}
