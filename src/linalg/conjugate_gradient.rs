//! Matrix-free Conjugate Gradient for symmetric positive (semi-)definite systems
//!
//! The system matrix is never formed: it is only accessed through
//! [`LinearOperator::apply`]. This is what lets the Levenberg-Marquardt driver
//! solve `(JᵗJ + λ·diag(JᵗJ)) δ = Jᵗr` with two passes over the block Jacobian
//! per iteration.
//!
//! # Preconditioner
//!
//! An optional Jacobi preconditioner is passed as the *inverse* diagonal,
//! `z = M⁻¹ r` is then an element-wise product.

use crate::linalg::{LinAlgError, LinAlgResult};
use nalgebra::DVector;

/// A square linear map `dst = A · src` that is only available as a product.
pub trait LinearOperator {
    /// Number of rows (and columns) of the operator
    fn dim(&self) -> usize;

    /// Computes `dst = A · src`. May use internal scratch space.
    fn apply(&mut self, dst: &mut [f64], src: &[f64]);
}

/// How a conjugate gradient solve ended
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CgOutcome {
    /// Number of CG iterations performed
    pub iterations: usize,
    /// Squared norm of the final residual `b - A·x`
    pub residual_norm_squared: f64,
    /// True when the residual fell below the tolerance
    pub converged: bool,
}

/// Conjugate gradient solver with an iteration cap and a tolerance on the
/// squared residual norm.
#[derive(Debug, Clone, Copy)]
pub struct ConjugateGradient {
    max_iterations: usize,
    tolerance: f64,
}

impl Default for ConjugateGradient {
    fn default() -> Self {
        Self::new(100, 1e-8)
    }
}

impl ConjugateGradient {
    pub fn new(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_iterations,
            tolerance,
        }
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Solve `A·x = b` starting from `x = 0`.
    ///
    /// If `‖b‖²` is already below the tolerance a zero solution is returned.
    /// Hitting the iteration cap is not an error, the best iterate is returned
    /// with `converged == false`. A non-positive curvature `pᵗAp` also ends the
    /// iteration early.
    ///
    /// # Arguments
    /// * `operator` - The system matrix as a product
    /// * `b` - Right hand side
    /// * `inverse_preconditioner` - Optional inverse Jacobi diagonal `M⁻¹`
    pub fn solve<A: LinearOperator>(
        &self,
        operator: &mut A,
        b: &DVector<f64>,
        inverse_preconditioner: Option<&DVector<f64>>,
    ) -> LinAlgResult<(DVector<f64>, CgOutcome)> {
        let n = operator.dim();
        if b.len() != n {
            return Err(LinAlgError::DimensionMismatch {
                expected: n,
                actual: b.len(),
            });
        }
        if let Some(m_inv) = inverse_preconditioner
            && m_inv.len() != n
        {
            return Err(LinAlgError::DimensionMismatch {
                expected: n,
                actual: m_inv.len(),
            });
        }

        let mut x = DVector::<f64>::zeros(n);

        // r = b - A*x (x starts at 0, so r = b)
        let mut r = b.clone();
        let mut residual_norm_squared = r.norm_squared();
        if !residual_norm_squared.is_finite() {
            return Err(LinAlgError::InvalidInput(
                "right hand side contains non-finite values".into(),
            ));
        }
        if residual_norm_squared <= self.tolerance {
            return Ok((
                x,
                CgOutcome {
                    iterations: 0,
                    residual_norm_squared,
                    converged: true,
                },
            ));
        }

        let precondition = |r: &DVector<f64>| match inverse_preconditioner {
            Some(m_inv) => r.component_mul(m_inv),
            None => r.clone(),
        };

        let mut z = precondition(&r);
        let mut p = z.clone();
        let mut rz_old = r.dot(&z);
        let mut ap = DVector::<f64>::zeros(n);

        let mut iterations = 0;
        let mut converged = false;
        while iterations < self.max_iterations {
            operator.apply(ap.as_mut_slice(), p.as_slice());

            let p_ap = p.dot(&ap);
            if !p_ap.is_finite() || p_ap <= 0.0 {
                break;
            }

            let alpha = rz_old / p_ap;
            x.axpy(alpha, &p, 1.0);
            r.axpy(-alpha, &ap, 1.0);
            iterations += 1;

            residual_norm_squared = r.norm_squared();
            if residual_norm_squared < self.tolerance {
                converged = true;
                break;
            }

            z = precondition(&r);
            let rz_new = r.dot(&z);
            let beta = rz_new / rz_old;

            // p = z + beta * p
            p.axpy(1.0, &z, beta);
            rz_old = rz_new;
        }

        Ok((
            x,
            CgOutcome {
                iterations,
                residual_norm_squared,
                converged,
            },
        ))
    }
}
