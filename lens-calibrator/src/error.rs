//! Error types for the calibration pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::job::JobId;

/// Errors returned by the caller-facing API.
#[derive(Error, Debug)]
pub enum CalibratorError {
    #[error("No workers requested; at least one corner finder and one calibrate worker are required")]
    NoWorkers,
    #[error("Invalid texture at index {index}: {reason}")]
    InvalidTexture { index: usize, reason: String },
    #[error("Invalid zoom level {0}; expected a normalized value in [0, 1]")]
    InvalidZoom(f32),
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("No calibration images found in folder: {}", .0.display())]
    EmptyFolder(PathBuf),
    #[error("Media stream job {0} is already registered")]
    StreamAlreadyRegistered(JobId),
    #[error("Failed to spawn worker thread: {0}")]
    ThreadSpawn(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Vision(#[from] VisionError),
}

/// Errors reported by a [`crate::vision::VisionLibrary`] backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VisionError {
    #[error("Checkerboard pattern not found")]
    PatternNotFound,
    #[error("Lens calibration failed: {0}")]
    SolveFailed(String),
    #[error("Vision backend unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, CalibratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CalibratorError::InvalidZoom(1.5);
        assert!(err.to_string().contains("1.5"));

        let err = CalibratorError::InvalidTexture {
            index: 2,
            reason: "too small".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid texture at index 2: too small");
    }

    #[test]
    fn test_vision_error_is_transparent() {
        let err: CalibratorError = VisionError::PatternNotFound.into();
        assert_eq!(err.to_string(), "Checkerboard pattern not found");
    }
}
