//! Logging setup for applications, tests and benchmarks built on sfm-solver
//!
//! Without `RUST_LOG`, only this crate logs at the requested level and every
//! other target is limited to WARN. With `RUST_LOG` set, its directives win.

use tracing::Level;
use tracing_subscriber::EnvFilter;

const CRATE_TARGET: &str = "sfm_solver";

/// Installs the standard subscriber at INFO
///
/// # Example
/// ```no_run
/// use sfm_solver::init_logger;
///
/// init_logger();
/// tracing::info!("Reconstruction started");
/// ```
///
/// Per-iteration solver output is at DEBUG:
/// ```bash
/// RUST_LOG=sfm_solver::optimizer=debug cargo test
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Installs the standard subscriber with `default_level` for this crate.
///
/// Later calls leave an already installed subscriber in place.
pub fn init_logger_with_level(default_level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .try_init();
}

/// Subscriber for `cargo test`: output goes through the test harness capture
pub fn init_test_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(Level::DEBUG))
        .with_test_writer()
        .without_time()
        .compact()
        .try_init();
}

fn env_filter(default_level: Level) -> EnvFilter {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(format!("warn,{CRATE_TARGET}={default_level}")),
    }
}
