//! Vision library contract.
//!
//! Corner detection and the camera-matrix solve are delegated to a
//! [`VisionLibrary`] implementation. Workers only see this trait, so a
//! backend can be swapped without touching the scheduling code.

use image::RgbaImage;

use crate::config::{CalibrationParameters, ChessboardSearchParameters};
use crate::error::VisionError;
use crate::work_unit::{GridSize, ResizeParameters};

#[cfg(feature = "opencv")]
mod opencv_impl;

#[cfg(feature = "opencv")]
pub use opencv_impl::OpenCvVision;

/// Intrinsics and distortion solved from a set of corner grids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationOutput {
    /// RMS reprojection error.
    pub error: f32,
    pub fov_x: f32,
    pub fov_y: f32,
    pub focal_length_mm: f32,
    pub aspect_ratio: f32,
    pub sensor_size_mm_x: f32,
    pub sensor_size_mm_y: f32,
    pub principal_pixel_point_x: f32,
    pub principal_pixel_point_y: f32,
    pub resolution_x: u32,
    pub resolution_y: u32,
    pub k1: f32,
    pub k2: f32,
    pub p1: f32,
    pub p2: f32,
    pub k3: f32,
    pub k4: f32,
    pub k5: f32,
    pub k6: f32,
}

/// Checkerboard detection and lens solve backend.
pub trait VisionLibrary: Send + Sync {
    /// Find the inner corners of the checkerboard.
    ///
    /// `image` is at source resolution; the backend searches at
    /// `resize.resize_x` x `resize.resize_y` and returns flattened `x, y`
    /// pairs in that search resolution, `2 * cols * rows` floats long.
    fn detect_corners(
        &self,
        resize: &ResizeParameters,
        search: &ChessboardSearchParameters,
        image: &RgbaImage,
        debug: bool,
    ) -> Result<Vec<f32>, VisionError>;

    /// Solve intrinsics from `image_count` concatenated corner grids in
    /// native resolution.
    #[allow(clippy::too_many_arguments)]
    fn calibrate_lens(
        &self,
        resize: &ResizeParameters,
        calibration: &CalibrationParameters,
        corners: &[f32],
        square_size_mm: f32,
        grid: GridSize,
        image_count: usize,
        debug: bool,
    ) -> Result<CalibrationOutput, VisionError>;
}

/// Physical sensor size derived from its diagonal and the image aspect.
pub fn sensor_size_from_diagonal(diagonal_mm: f32, width: u32, height: u32) -> (f32, f32) {
    let w = width as f32;
    let h = height as f32;
    let d = (w * w + h * h).sqrt();
    if d == 0.0 {
        return (0.0, 0.0);
    }
    (diagonal_mm * w / d, diagonal_mm * h / d)
}

/// Backend used when the crate is built without a vision library.
pub struct UnavailableVision;

impl VisionLibrary for UnavailableVision {
    fn detect_corners(
        &self,
        _resize: &ResizeParameters,
        _search: &ChessboardSearchParameters,
        _image: &RgbaImage,
        _debug: bool,
    ) -> Result<Vec<f32>, VisionError> {
        Err(VisionError::Unavailable(
            "OpenCV feature not enabled. Build with --features opencv".to_string(),
        ))
    }

    fn calibrate_lens(
        &self,
        _resize: &ResizeParameters,
        _calibration: &CalibrationParameters,
        _corners: &[f32],
        _square_size_mm: f32,
        _grid: GridSize,
        _image_count: usize,
        _debug: bool,
    ) -> Result<CalibrationOutput, VisionError> {
        Err(VisionError::Unavailable(
            "OpenCV feature not enabled. Build with --features opencv".to_string(),
        ))
    }
}
