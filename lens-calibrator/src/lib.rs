//! Multi-image checkerboard lens calibration.
//!
//! Images are spread over a pool of corner finder workers, the detected
//! corner grids of each calibration are gathered on one calibrate worker,
//! and the solved intrinsics are delivered to the caller through
//! [`poller::EventReceiver`] callbacks when it polls.
//!
//! - [`solver::LensSolver`] is the entry point
//! - [`distributor::WorkDistributor`] routes work between the pools
//! - [`vision::VisionLibrary`] abstracts the detection and solve backend

pub mod config;
pub mod distributor;
pub mod error;
pub mod export;
pub mod job;
pub mod media_stream;
pub mod poller;
pub mod result;
pub mod solver;
pub mod telemetry;
pub mod vision;
pub mod work_unit;
pub mod worker;

#[cfg(test)]
mod testing;

pub use error::{CalibratorError, Result};
pub use solver::{LensSolver, TextureArrayZoomPair, TextureFolderZoomPair};
