//! Track formation from pairwise keypoint matches.
//!
//! Keypoints are nodes, matches are undirected edges. Every connected
//! component becomes one track, unless it contains two keypoints of the same
//! image (an inconsistent chain of matches), in which case it is dropped.

use tracing::{debug, info, warn};

use crate::linalg::Vector;
use crate::scene::{Camera, KeyPoint, Scene, SceneError};

/// Builds a [`Scene`] from per-image keypoints and pairwise matches.
///
/// All cameras share internal calibration 0 and every keypoint starts with
/// weight one.
///
/// # Example
/// ```
/// use sfm_solver::linalg::Vector;
/// use sfm_solver::scene::TrackBuilder;
///
/// let kp = |x: f64, y: f64| Vector::<2>::new(x, y);
/// let mut builder = TrackBuilder::new(vec![
///     vec![kp(10.0, 10.0), kp(20.0, 20.0)],
///     vec![kp(11.0, 10.0), kp(21.0, 20.0)],
/// ]);
/// builder.add_matches(0, 1, &[(0, 0), (1, 1)]).unwrap();
///
/// let scene = builder.build();
/// assert_eq!(scene.num_tracks, 2);
/// assert_eq!(scene.cameras[1].keypoints.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct TrackBuilder {
    keypoints: Vec<Vec<Vector<2>>>,
    /// adjacency: image -> keypoint -> matched (image, keypoint)
    matches: Vec<Vec<Vec<(usize, usize)>>>,
    min_pair_matches: usize,
    min_keypoints_warning: usize,
}

impl TrackBuilder {
    pub fn new(keypoints: Vec<Vec<Vector<2>>>) -> Self {
        let matches = keypoints
            .iter()
            .map(|kps| vec![Vec::new(); kps.len()])
            .collect();
        Self {
            keypoints,
            matches,
            min_pair_matches: 0,
            min_keypoints_warning: 100,
        }
    }

    /// Image pairs with fewer matches than this are ignored
    pub fn with_min_pair_matches(mut self, min_pair_matches: usize) -> Self {
        self.min_pair_matches = min_pair_matches;
        self
    }

    /// Cameras ending up with fewer keypoints than this are reported
    pub fn with_min_keypoints_warning(mut self, min_keypoints_warning: usize) -> Self {
        self.min_keypoints_warning = min_keypoints_warning;
        self
    }

    pub fn num_images(&self) -> usize {
        self.keypoints.len()
    }

    /// Registers the matches between two images.
    ///
    /// Returns `Ok(false)` if the pair was ignored for having too few matches.
    pub fn add_matches(
        &mut self,
        image_a: usize,
        image_b: usize,
        matches: &[(usize, usize)],
    ) -> Result<bool, SceneError> {
        for image in [image_a, image_b] {
            if image >= self.keypoints.len() {
                return Err(SceneError::InvalidImageIndex {
                    image,
                    num_images: self.keypoints.len(),
                });
            }
        }
        for &(kp_a, kp_b) in matches {
            self.check_keypoint(image_a, kp_a)?;
            self.check_keypoint(image_b, kp_b)?;
        }

        if matches.len() < self.min_pair_matches {
            debug!(
                "Ignoring image pair ({image_a}, {image_b}): {} matches < {}",
                matches.len(),
                self.min_pair_matches
            );
            return Ok(false);
        }

        for &(kp_a, kp_b) in matches {
            self.matches[image_a][kp_a].push((image_b, kp_b));
            self.matches[image_b][kp_b].push((image_a, kp_a));
        }
        Ok(true)
    }

    fn check_keypoint(&self, image: usize, keypoint: usize) -> Result<(), SceneError> {
        let num_keypoints = self.keypoints[image].len();
        if keypoint >= num_keypoints {
            return Err(SceneError::InvalidKeypointIndex {
                image,
                keypoint,
                num_keypoints,
            });
        }
        Ok(())
    }

    /// Forms tracks and emits the scene
    pub fn build(&self) -> Scene {
        let num_images = self.keypoints.len();
        let mut scene = Scene::new(1, 0);
        scene.cameras = (0..num_images).map(|_| Camera::new(0)).collect();

        let mut handled: Vec<Vec<bool>> = self
            .keypoints
            .iter()
            .map(|kps| vec![false; kps.len()])
            .collect();
        let mut images_spanned = vec![false; num_images];
        let mut stack = Vec::new();
        let mut component = Vec::new();
        let mut dropped = 0usize;

        for image in 0..num_images {
            for kp in 0..self.keypoints[image].len() {
                if self.matches[image][kp].is_empty() || handled[image][kp] {
                    continue;
                }

                let mut valid = true;
                stack.push((image, kp));
                while let Some((i, k)) = stack.pop() {
                    if handled[i][k] {
                        continue;
                    }
                    handled[i][k] = true;

                    // Appearing twice in one image
                    if images_spanned[i] {
                        valid = false;
                    }
                    images_spanned[i] = true;
                    component.push((i, k));

                    stack.extend(
                        self.matches[i][k]
                            .iter()
                            .copied()
                            .filter(|&(mi, mk)| !handled[mi][mk]),
                    );
                }

                if valid {
                    let track_idx = scene.num_tracks;
                    for &(i, k) in &component {
                        scene.cameras[i]
                            .keypoints
                            .push(KeyPoint::new(self.keypoints[i][k], track_idx));
                    }
                    scene.num_tracks += 1;
                } else {
                    dropped += 1;
                }

                for &(i, _) in &component {
                    images_spanned[i] = false;
                }
                component.clear();
            }
        }

        info!(
            "Formed {} tracks ({} inconsistent groups dropped)",
            scene.num_tracks, dropped
        );

        for (idx, camera) in scene.cameras.iter().enumerate() {
            if camera.keypoints.len() < self.min_keypoints_warning {
                warn!(
                    "Camera {idx} is connected with only {} keypoints, this might be too unstable",
                    camera.keypoints.len()
                );
            }
        }

        scene
    }
}
