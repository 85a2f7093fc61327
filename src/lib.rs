//! Structure from motion bundle adjustment.
//!
//! Jointly refines camera intrinsics, camera poses and homogeneous 3D tracks
//! by minimizing the weighted reprojection error with a matrix-free
//! Levenberg-Marquardt solver.
//!
//! ```no_run
//! use sfm_solver::bundle::{BAState, BundleAdjustment, RunConfig, run_bundle_adjustment};
//! use sfm_solver::scene::Scene;
//!
//! # fn load() -> (Scene, BAState) { unimplemented!() }
//! let (scene, initial_state) = load();
//! let mut problem = BundleAdjustment::new(scene)?;
//! problem.fix_camera(0)?;
//! let result = run_bundle_adjustment(&mut problem, initial_state, &RunConfig::default())?;
//! println!("{result}");
//! # Ok::<(), sfm_solver::SfmError>(())
//! ```

pub mod bundle;
pub mod core;
pub mod error;
pub mod linalg;
pub mod logger;
pub mod optimizer;
pub mod scene;

pub use bundle::{BAState, BundleAdjustment, RunConfig, run_bundle_adjustment};
pub use error::{SfmError, SfmResult};
pub use logger::{init_logger, init_logger_with_level, init_test_logger};
pub use optimizer::{LevenbergMarquardt, LevenbergMarquardtConfig, OptimizationStatus};
pub use scene::{Camera, KeyPoint, Scene};
