use std::ops::Mul;

use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers;
use faer::sparse::{SparseColMat, Triplet};
use nalgebra::DVector;

use crate::linalg::{LinAlgError, LinAlgResult, SparseMatrix};

/// Direct solver for the damped normal equations on a materialized Jacobian.
///
/// Solves `(JᵗJ + λ·D) x = g` with a sparse LLᵗ factorization, where `D` is
/// `diag(JᵗJ)` with zero entries replaced by one so that parameters without
/// any observation stay regularized.
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver;

impl SparseCholeskySolver {
    pub fn new() -> Self {
        SparseCholeskySolver
    }

    /// Builds `JᵗJ + damping·D` as a sparse column major matrix
    pub fn damped_normal_matrix(
        &self,
        jacobian: &SparseMatrix,
        damping: f64,
    ) -> LinAlgResult<SparseMatrix> {
        let n = jacobian.ncols();
        let hessian = jacobian
            .as_ref()
            .transpose()
            .to_col_major()
            .map_err(|e| LinAlgError::MatrixConversion(format!("{e:?}")))?
            .mul(jacobian.as_ref());

        let symbolic = hessian.symbolic();
        let mut triplets = Vec::new();
        let mut diagonal = vec![0.0; n];
        for (col, diag) in diagonal.iter_mut().enumerate() {
            let row_indices = symbolic.row_idx_of_col_raw(col);
            for (&row, &value) in row_indices.iter().zip(hessian.val_of_col(col)) {
                if row == col {
                    *diag += value;
                }
                triplets.push(Triplet::new(row, col, value));
            }
        }
        for (i, d) in diagonal.iter().enumerate() {
            let scale = if *d > 0.0 { *d } else { 1.0 };
            triplets.push(Triplet::new(i, i, damping * scale));
        }

        SparseColMat::try_new_from_triplets(n, n, &triplets)
            .map_err(|e| LinAlgError::MatrixConversion(format!("{e:?}")))
    }

    /// Solve `(JᵗJ + damping·D) x = rhs`
    pub fn solve_augmented_equation(
        &self,
        jacobian: &SparseMatrix,
        rhs: &DVector<f64>,
        damping: f64,
    ) -> LinAlgResult<DVector<f64>> {
        let n = jacobian.ncols();
        if rhs.len() != n {
            return Err(LinAlgError::DimensionMismatch {
                expected: n,
                actual: rhs.len(),
            });
        }
        if rhs.iter().any(|v| !v.is_finite()) {
            return Err(LinAlgError::InvalidInput(
                "right hand side contains non-finite values".into(),
            ));
        }

        let augmented_hessian = self.damped_normal_matrix(jacobian, damping)?;

        let sym = solvers::SymbolicLlt::try_new(augmented_hessian.symbolic(), faer::Side::Lower)
            .map_err(|e| LinAlgError::FactorizationFailed(format!("{e:?}")))?;
        let cholesky =
            solvers::Llt::try_new_with_symbolic(sym, augmented_hessian.as_ref(), faer::Side::Lower)
                .map_err(|_| LinAlgError::SingularMatrix)?;

        let gradient = faer::Mat::<f64>::from_fn(n, 1, |i, _| rhs[i]);
        let dx = cholesky.solve(gradient);

        Ok(DVector::from_fn(n, |i, _| dx[(i, 0)]))
    }
}
