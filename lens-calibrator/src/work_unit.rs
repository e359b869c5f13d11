//! Work units passed between the distributor and its workers.
//!
//! Every unit carries a [`BaseParameters`] correlation key so results can be
//! traced back to their job and calibration regardless of which worker
//! produced them.

use std::fmt;
use std::path::PathBuf;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::config::{CalibrationParameters, ChessboardSearchParameters};
use crate::job::{CalibrationId, JobId};

/// Correlation key shared by every unit of one calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseParameters {
    pub job_id: JobId,
    pub calibration_id: CalibrationId,
    pub friendly_name: String,
    pub zoom_level: f32,
}

impl fmt::Display for BaseParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(Job: {}, Calibration: {}, Name: \"{}\", Zoom: {:.3})",
            self.job_id, self.calibration_id, self.friendly_name, self.zoom_level
        )
    }
}

/// Source, search and native resolutions for one image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeParameters {
    pub source_x: u32,
    pub source_y: u32,
    pub resize_x: u32,
    pub resize_y: u32,
    pub native_x: u32,
    pub native_y: u32,
}

impl ResizeParameters {
    /// Search resolution is `floor(source * resize_percentage)` when resizing,
    /// the source resolution otherwise.
    pub fn compute(source_x: u32, source_y: u32, search: &ChessboardSearchParameters) -> Self {
        let (resize_x, resize_y) = if search.resize {
            (
                (source_x as f32 * search.resize_percentage).floor() as u32,
                (source_y as f32 * search.resize_percentage).floor() as u32,
            )
        } else {
            (source_x, source_y)
        };

        Self {
            source_x,
            source_y,
            resize_x,
            resize_y,
            native_x: search.native_full_resolution_x,
            native_y: search.native_full_resolution_y,
        }
    }

    /// Factor mapping search-resolution coordinates back to native resolution.
    pub fn native_scale(&self) -> (f32, f32) {
        let axis = |native: u32, resize: u32| {
            if resize == 0 {
                1.0
            } else {
                native as f32 / resize as f32
            }
        };
        (axis(self.native_x, self.resize_x), axis(self.native_y, self.resize_y))
    }
}

/// Inner corner grid dimensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridSize {
    pub cols: u32,
    pub rows: u32,
}

impl GridSize {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self { cols, rows }
    }

    pub fn corner_count(&self) -> usize {
        (self.cols as usize).saturating_mul(self.rows as usize)
    }
}

impl fmt::Display for GridSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Image on disk to search for a checkerboard.
#[derive(Debug, Clone)]
pub struct TextureFileWorkUnit {
    pub base: BaseParameters,
    pub search: ChessboardSearchParameters,
    pub path: PathBuf,
}

/// In-memory RGBA image to search for a checkerboard.
#[derive(Debug, Clone)]
pub struct PixelArrayWorkUnit {
    pub base: BaseParameters,
    pub search: ChessboardSearchParameters,
    pub image: RgbaImage,
}

/// Detected corners for one image, or nothing if detection failed.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationPointsWorkUnit {
    pub base: BaseParameters,
    /// Flattened `x, y` pairs in native resolution.
    pub corners: Vec<f32>,
    pub grid: GridSize,
    pub square_size_mm: f32,
    pub resize: ResizeParameters,
}

impl CalibrationPointsWorkUnit {
    /// Placeholder forwarded when detection fails so image counting stays correct.
    pub fn empty(base: BaseParameters, resize: ResizeParameters) -> Self {
        Self {
            base,
            corners: Vec::new(),
            grid: GridSize::default(),
            square_size_mm: 0.0,
            resize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.corners.is_empty()
    }
}

/// Signal that every image of a calibration has been queued.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrateLatch {
    pub base: BaseParameters,
    pub calibration: CalibrationParameters,
    pub resize: ResizeParameters,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_parameters_floor() {
        let search = ChessboardSearchParameters {
            resize_percentage: 0.5,
            ..Default::default()
        };
        let resize = ResizeParameters::compute(1921, 1081, &search);
        assert_eq!((resize.resize_x, resize.resize_y), (960, 540));
        assert_eq!((resize.native_x, resize.native_y), (1920, 1080));
        assert_eq!(resize.native_scale(), (2.0, 2.0));
    }

    #[test]
    fn test_resize_disabled_keeps_source() {
        let search = ChessboardSearchParameters {
            resize: false,
            native_full_resolution_x: 3840,
            native_full_resolution_y: 2160,
            ..Default::default()
        };
        let resize = ResizeParameters::compute(1920, 1080, &search);
        assert_eq!((resize.resize_x, resize.resize_y), (1920, 1080));
        assert_eq!(resize.native_scale(), (2.0, 2.0));
    }

    #[test]
    fn test_zero_resize_scale_is_identity() {
        assert_eq!(ResizeParameters::default().native_scale(), (1.0, 1.0));
    }

    #[test]
    fn test_empty_points_unit() {
        let base = BaseParameters {
            job_id: JobId::new(),
            calibration_id: CalibrationId::new(),
            friendly_name: "wide".to_string(),
            zoom_level: 0.0,
        };
        let unit = CalibrationPointsWorkUnit::empty(base, ResizeParameters::default());
        assert!(unit.is_empty());
        assert_eq!(unit.grid.corner_count(), 0);
    }

    #[test]
    fn test_grid_corner_count_is_computed_in_usize() {
        assert_eq!(GridSize::new(12, 8).corner_count(), 96);
        assert_eq!(GridSize::new(70_000, 70_000).corner_count(), 4_900_000_000);
        assert_eq!(GridSize::new(u32::MAX, 1).corner_count(), u32::MAX as usize);
    }
}
