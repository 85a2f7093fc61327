//! Canonical bundle adjustment loop: iterate until the iteration budget is
//! used up or damping exceeds its limit, downweighting outliers periodically.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::bundle::{BAState, BundleAdjustment};
use crate::error::SfmResult;
use crate::optimizer::{LevenbergMarquardt, LevenbergMarquardtConfig, OptimizationStatus};

/// Termination and reweighting policy for [`run_bundle_adjustment`]
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Maximum number of LM iterations
    pub max_iterations: usize,
    /// Stop once damping exceeds this value
    pub max_damping: f64,
    /// Downweight outliers after every n-th iteration, `None` disables
    pub downweight_interval: Option<usize>,
    /// Driver configuration
    pub optimizer: LevenbergMarquardtConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            max_damping: 1e6,
            downweight_interval: Some(10),
            optimizer: LevenbergMarquardtConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_max_damping(mut self, max_damping: f64) -> Self {
        self.max_damping = max_damping;
        self
    }

    pub fn with_downweight_interval(mut self, interval: Option<usize>) -> Self {
        self.downweight_interval = interval;
        self
    }

    pub fn with_optimizer_config(mut self, optimizer: LevenbergMarquardtConfig) -> Self {
        self.optimizer = optimizer;
        self
    }
}

/// Final state and statistics of a bundle adjustment run
#[derive(Debug, Clone)]
pub struct BundleAdjustmentResult {
    pub state: BAState,
    pub status: OptimizationStatus,
    /// Squared error of the initial state (with the initial weights)
    pub initial_error: f64,
    /// Squared error of the final state (with the final weights)
    pub final_error: f64,
    /// Weighted RMS reprojection distance of the final state in pixels
    pub final_reprojection_stddev: f64,
    pub iterations: usize,
    pub successful_steps: usize,
    pub unsuccessful_steps: usize,
    pub final_damping: f64,
    /// Total number of keypoint weights halved
    pub downweighted_keypoints: usize,
    pub elapsed_time: Duration,
}

impl fmt::Display for BundleAdjustmentResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Bundle Adjustment Summary ===")?;
        writeln!(f, "Status:                    {}", self.status)?;
        writeln!(f, "Initial error:             {:.6e}", self.initial_error)?;
        writeln!(f, "Final error:               {:.6e}", self.final_error)?;
        writeln!(
            f,
            "Reprojection stddev:       {:.4} px",
            self.final_reprojection_stddev
        )?;
        writeln!(f, "Total iterations:          {}", self.iterations)?;
        writeln!(
            f,
            "Successful steps:          {} ({:.1}%)",
            self.successful_steps,
            100.0 * self.successful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(
            f,
            "Unsuccessful steps:        {} ({:.1}%)",
            self.unsuccessful_steps,
            100.0 * self.unsuccessful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(f, "Final damping parameter:   {:.6e}", self.final_damping)?;
        writeln!(
            f,
            "Downweighted keypoints:    {}",
            self.downweighted_keypoints
        )?;
        writeln!(f, "Total time:                {:?}", self.elapsed_time)?;
        Ok(())
    }
}

/// Runs Levenberg-Marquardt on `problem` starting from `initial_state`.
///
/// Outlier downweighting modifies the keypoint weights of `problem`; the
/// cached error of the driver is refreshed after each round.
pub fn run_bundle_adjustment(
    problem: &mut BundleAdjustment,
    initial_state: BAState,
    config: &RunConfig,
) -> SfmResult<BundleAdjustmentResult> {
    problem.check_state(&initial_state)?;
    let start_time = Instant::now();

    let mut lm =
        LevenbergMarquardt::with_config(&*problem, initial_state, config.optimizer.clone())?;
    let initial_error = lm.last_error();
    info!(
        "Bundle adjustment: {} cameras, {} tracks, {} keypoints, initial error {:.6e} ({:.4} px)",
        problem.scene().cameras.len(),
        problem.scene().num_tracks,
        problem.scene().num_keypoints(),
        initial_error,
        problem.reprojection_stddev(initial_error)
    );

    let mut status = OptimizationStatus::MaxIterationsReached;
    let mut downweighted_keypoints = 0;
    for iteration in 1..=config.max_iterations {
        lm.iterate(problem)?;
        debug!(
            "Iteration {iteration}: reprojection stddev {:.4} px",
            problem.reprojection_stddev(lm.last_error())
        );

        if lm.damping() > config.max_damping {
            status = OptimizationStatus::DampingLimitReached;
            break;
        }

        if let Some(interval) = config.downweight_interval
            && interval > 0
            && iteration % interval == 0
        {
            let summary = problem.downweight_outlier_keypoints(lm.state());
            downweighted_keypoints += summary.downweighted;
            lm.refresh(problem);
        }
    }

    let final_error = lm.last_error();
    let result = BundleAdjustmentResult {
        status,
        initial_error,
        final_error,
        final_reprojection_stddev: problem.reprojection_stddev(final_error),
        iterations: lm.iterations(),
        successful_steps: lm.successful_steps(),
        unsuccessful_steps: lm.unsuccessful_steps(),
        final_damping: lm.damping(),
        downweighted_keypoints,
        elapsed_time: start_time.elapsed(),
        state: lm.into_state(),
    };
    info!(
        "Bundle adjustment finished after {} iterations: {}, final error {:.6e}",
        result.iterations, result.status, result.final_error
    );
    Ok(result)
}
