//! Initial track positions by linear triangulation.
//!
//! Given intrinsics and poses, every track seen by at least two cameras is
//! triangulated from its first two observations with the homogeneous DLT
//! system. The solution is the right singular vector of the smallest
//! singular value, scaled to unit norm with non-negative `w`.

use tracing::{debug, warn};

use crate::bundle::BAState;
use crate::linalg::{Matrix, Vector, renormalize};
use crate::scene::{Scene, SceneError};

/// Outcome of [`triangulate_tracks`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriangulationReport {
    /// Number of tracks whose location was replaced
    pub triangulated: usize,
    /// Tracks observed by fewer than two cameras or with a degenerate system
    pub skipped: Vec<usize>,
}

/// Triangulates one point from two projection matrices and its pixel
/// positions in both images.
///
/// Returns `None` if the decomposition fails or produces non-finite values.
pub fn triangulate_linear(
    p1: &Matrix<3, 4>,
    p2: &Matrix<3, 4>,
    x1: &Vector<2>,
    x2: &Vector<2>,
) -> Option<Vector<4>> {
    let mut a = Matrix::<4, 4>::zeros();
    a.set_row(0, &(p1.row(2) * x1[0] - p1.row(0)));
    a.set_row(1, &(p1.row(2) * x1[1] - p1.row(1)));
    a.set_row(2, &(p2.row(2) * x2[0] - p2.row(0)));
    a.set_row(3, &(p2.row(2) * x2[1] - p2.row(1)));

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.total_cmp(b))?;

    let mut point = v_t.row(min_idx).transpose();
    if point[3] < 0.0 {
        point = -point;
    }
    let point = renormalize(&point);
    point.iter().all(|v| v.is_finite()).then_some(point)
}

/// Replaces every track location that can be triangulated from the current
/// calibrations and poses in `state`.
pub fn triangulate_tracks(
    scene: &Scene,
    state: &mut BAState,
) -> Result<TriangulationReport, SceneError> {
    scene.validate()?;
    state.check_sizes(scene)?;

    // First two observations of every track, from distinct cameras
    let mut first_views: Vec<Vec<(usize, Vector<2>)>> = vec![Vec::new(); scene.num_tracks];
    for (camera_idx, kp) in scene.observations() {
        let views = &mut first_views[kp.track_idx];
        if views.len() < 2 && views.iter().all(|(c, _)| *c != camera_idx) {
            views.push((camera_idx, kp.location));
        }
    }

    let projections: Vec<Matrix<3, 4>> = (0..scene.cameras.len())
        .map(|c| state.projection_matrix(scene, c))
        .collect();

    let mut report = TriangulationReport::default();
    for (track_idx, views) in first_views.iter().enumerate() {
        let point = match views.as_slice() {
            [(c1, x1), (c2, x2)] => {
                triangulate_linear(&projections[*c1], &projections[*c2], x1, x2)
            }
            _ => None,
        };
        match point {
            Some(location) => {
                state.tracks[track_idx].location = location;
                report.triangulated += 1;
            }
            None => report.skipped.push(track_idx),
        }
    }

    debug!("Triangulated {} tracks", report.triangulated);
    if !report.skipped.is_empty() {
        warn!(
            "{} of {} tracks could not be triangulated",
            report.skipped.len(),
            scene.num_tracks
        );
    }
    Ok(report)
}
