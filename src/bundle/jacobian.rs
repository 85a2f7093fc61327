//! Block structured, matrix-free Jacobian for bundle adjustment.
//!
//! Each observation owns one two-row block with three dense sub-blocks
//! (intrinsics, pose, track). Storage and every product are linear in the
//! number of observations; the full matrix is never formed.

use faer::sparse::{SparseColMat, Triplet};
use rayon::prelude::*;

use crate::bundle::{BundleAdjustment, NumUpdateParams};
use crate::core::{JacobiMatrix, OptimizationProblem};
use crate::linalg::{LinAlgError, LinAlgResult, Matrix, SparseMatrix, Vector};

/// Jacobian blocks of one (camera, keypoint) observation plus the column
/// offsets of the parameter groups it touches
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBlock {
    pub internal_calib_offset: usize,
    pub camera_offset: usize,
    pub track_offset: usize,
    pub j_internal_calib: Matrix<2, 3>,
    pub j_camera: Matrix<2, 6>,
    pub j_track: Matrix<2, 4>,
}

impl RowBlock {
    fn apply(&self, src: &[f64]) -> Vector<2> {
        let c = self.internal_calib_offset;
        let h = self.camera_offset;
        let t = self.track_offset;
        self.j_internal_calib
            * Vector::<3>::from_column_slice(&src[c..c + NumUpdateParams::INTERNAL_CALIB])
            + self.j_camera * Vector::<6>::from_column_slice(&src[h..h + NumUpdateParams::CAMERA])
            + self.j_track * Vector::<4>::from_column_slice(&src[t..t + NumUpdateParams::TRACK])
    }
}

/// Block Jacobian of a [`BundleAdjustment`] problem.
///
/// The sparsity pattern (which blocks exist and where they scatter to) is
/// fixed at construction; [`crate::core::State::compute_jacobi_matrix`]
/// only refreshes the block values.
#[derive(Debug, Clone)]
pub struct BAJacobiMatrix {
    rows: Vec<RowBlock>,
    num_update_parameters: usize,
}

impl BAJacobiMatrix {
    pub fn new(problem: &BundleAdjustment) -> Self {
        let rows = problem
            .observations()
            .iter()
            .map(|obs| RowBlock {
                internal_calib_offset: problem.internal_calib_offset(obs.internal_calib_idx),
                camera_offset: problem.camera_offset(obs.camera_idx),
                track_offset: problem.track_offset(obs.track_idx),
                ..RowBlock::default()
            })
            .collect();

        Self {
            rows,
            num_update_parameters: problem.num_update_parameters(),
        }
    }

    pub fn rows(&self) -> &[RowBlock] {
        &self.rows
    }

    pub(crate) fn rows_mut(&mut self) -> &mut [RowBlock] {
        &mut self.rows
    }
}

impl JacobiMatrix for BAJacobiMatrix {
    fn num_residuals(&self) -> usize {
        2 * self.rows.len()
    }

    fn num_update_parameters(&self) -> usize {
        self.num_update_parameters
    }

    fn multiply(&self, dst: &mut [f64], src: &[f64]) {
        debug_assert_eq!(dst.len(), self.num_residuals());
        debug_assert_eq!(src.len(), self.num_update_parameters);

        dst.par_chunks_mut(2)
            .zip(self.rows.par_iter())
            .for_each(|(d, row)| {
                let r = row.apply(src);
                d[0] = r[0];
                d[1] = r[1];
            });
    }

    fn transposed_multiply(&self, dst: &mut [f64], src: &[f64]) {
        debug_assert_eq!(dst.len(), self.num_update_parameters);
        debug_assert_eq!(src.len(), self.num_residuals());

        dst.fill(0.0);
        for (row, s) in self.rows.iter().zip(src.chunks_exact(2)) {
            let s = Vector::<2>::new(s[0], s[1]);

            let g = row.j_internal_calib.tr_mul(&s);
            add_to(dst, row.internal_calib_offset, g.as_slice());
            let g = row.j_camera.tr_mul(&s);
            add_to(dst, row.camera_offset, g.as_slice());
            let g = row.j_track.tr_mul(&s);
            add_to(dst, row.track_offset, g.as_slice());
        }
    }

    fn compute_diag_jtj(&self, dst: &mut [f64]) {
        debug_assert_eq!(dst.len(), self.num_update_parameters);

        dst.fill(0.0);
        for row in &self.rows {
            for (i, col) in row.j_internal_calib.column_iter().enumerate() {
                dst[row.internal_calib_offset + i] += col.norm_squared();
            }
            for (i, col) in row.j_camera.column_iter().enumerate() {
                dst[row.camera_offset + i] += col.norm_squared();
            }
            for (i, col) in row.j_track.column_iter().enumerate() {
                dst[row.track_offset + i] += col.norm_squared();
            }
        }
    }

    /// Emits every block entry as a triplet
    fn to_sparse(&self) -> LinAlgResult<SparseMatrix> {
        let mut triplets = Vec::with_capacity(self.rows.len() * 2 * 13);
        for (r, row) in self.rows.iter().enumerate() {
            for i in 0..2 {
                let residual = 2 * r + i;
                for (j, &value) in row.j_internal_calib.row(i).iter().enumerate() {
                    triplets.push(Triplet::new(residual, row.internal_calib_offset + j, value));
                }
                for (j, &value) in row.j_camera.row(i).iter().enumerate() {
                    triplets.push(Triplet::new(residual, row.camera_offset + j, value));
                }
                for (j, &value) in row.j_track.row(i).iter().enumerate() {
                    triplets.push(Triplet::new(residual, row.track_offset + j, value));
                }
            }
        }

        SparseColMat::try_new_from_triplets(
            self.num_residuals(),
            self.num_update_parameters,
            &triplets,
        )
        .map_err(|e| LinAlgError::MatrixConversion(format!("{e:?}")))
    }
}

fn add_to(dst: &mut [f64], offset: usize, values: &[f64]) {
    for (d, v) in dst[offset..offset + values.len()].iter_mut().zip(values) {
        *d += v;
    }
}
