//! Command line entry point for the wick trading engine.

pub mod app;
pub mod telemetry;

pub use app::run as run_app;
