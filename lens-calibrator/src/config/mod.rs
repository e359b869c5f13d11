//! Configuration and serialization module.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Solver-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Number of corner finder workers started by default.
    pub corner_worker_count: usize,
    /// Number of calibrate workers started by default.
    pub calibrate_worker_count: usize,
    /// Tear the worker pools down once every registered job has finished.
    pub shut_down_workers_after_completed_tasks: bool,
    /// Upper bound on live worker threads across both pools.
    pub max_worker_threads: usize,
    /// Verbose per-work-unit logging.
    pub debug: bool,
    /// Root directory for worker artifacts.
    pub output_root: PathBuf,
    /// Default checkerboard search parameters.
    pub search: ChessboardSearchParameters,
    /// Default lens calibration parameters.
    pub calibration: CalibrationParameters,
    /// Default media stream snapshot schedule.
    pub media_stream: MediaStreamParameters,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            corner_worker_count: 3,
            calibrate_worker_count: 1,
            shut_down_workers_after_completed_tasks: true,
            max_worker_threads: 64,
            debug: false,
            output_root: default_output_root(),
            search: ChessboardSearchParameters::default(),
            calibration: CalibrationParameters::default(),
            media_stream: MediaStreamParameters::default(),
        }
    }
}

impl SolverConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
    }
}

/// Default artifact directory under the platform data dir.
pub fn default_output_root() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("lens-calibrator"))
        .unwrap_or_else(|| PathBuf::from("lens-calibrator"))
}

/// Checkerboard search parameters handed to corner detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChessboardSearchParameters {
    /// Native full resolution width the detected corners are mapped back to.
    pub native_full_resolution_x: u32,
    /// Native full resolution height.
    pub native_full_resolution_y: u32,
    /// Fraction of the source resolution used while searching.
    pub resize_percentage: f32,
    /// Search on a downscaled copy of the image.
    pub resize: bool,
    pub flip_x: bool,
    pub flip_y: bool,
    /// Slower, more thorough detection.
    pub exhaustive_search: bool,
    /// Physical size of one checkerboard square.
    pub square_size_mm: f32,
    /// Inner corner count along X.
    pub corner_count_x: u32,
    /// Inner corner count along Y.
    pub corner_count_y: u32,
    /// Save an image with the detected corners marked.
    pub write_corner_visualization_to_file: bool,
    /// Explicit visualization path; indexed inside the worker directory when empty.
    pub corner_visualization_output_path: Option<PathBuf>,
}

impl Default for ChessboardSearchParameters {
    fn default() -> Self {
        Self {
            native_full_resolution_x: 1920,
            native_full_resolution_y: 1080,
            resize_percentage: 0.5,
            resize: true,
            flip_x: false,
            flip_y: false,
            exhaustive_search: false,
            square_size_mm: 12.7,
            corner_count_x: 12,
            corner_count_y: 8,
            write_corner_visualization_to_file: false,
            corner_visualization_output_path: None,
        }
    }
}

impl ChessboardSearchParameters {
    /// Number of floats a successful detection yields (x, y per corner).
    pub fn corner_float_count(&self) -> usize {
        (self.corner_count_x as usize)
            .saturating_mul(self.corner_count_y as usize)
            .saturating_mul(2)
    }
}

/// Lens calibration parameters carried by the latch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationParameters {
    /// Sensor diagonal, used to derive the physical sensor size.
    pub sensor_diagonal_size_mm: f32,
    pub initial_principal_point_native_pixel_position_x: f32,
    pub initial_principal_point_native_pixel_position_y: f32,
    pub use_initial_intrinsic_values: bool,
    pub keep_principal_pixel_position_fixed: bool,
    pub keep_aspect_ratio_fixed: bool,
    pub lens_has_tangential_distortion: bool,
    pub fix_radial_distortion_coefficient_k1: bool,
    pub fix_radial_distortion_coefficient_k2: bool,
    pub fix_radial_distortion_coefficient_k3: bool,
    pub fix_radial_distortion_coefficient_k4: bool,
    pub fix_radial_distortion_coefficient_k5: bool,
    pub fix_radial_distortion_coefficient_k6: bool,
    pub use_rational_model: bool,
    /// Persist each result as a JSON record.
    pub write_calibration_result_to_file: bool,
    /// Explicit record path; indexed inside the worker directory when empty.
    pub calibration_result_output_path: Option<PathBuf>,
}

impl Default for CalibrationParameters {
    fn default() -> Self {
        Self {
            sensor_diagonal_size_mm: 9.960_784,
            initial_principal_point_native_pixel_position_x: 0.0,
            initial_principal_point_native_pixel_position_y: 0.0,
            use_initial_intrinsic_values: false,
            keep_principal_pixel_position_fixed: false,
            keep_aspect_ratio_fixed: true,
            lens_has_tangential_distortion: false,
            fix_radial_distortion_coefficient_k1: false,
            fix_radial_distortion_coefficient_k2: false,
            fix_radial_distortion_coefficient_k3: false,
            fix_radial_distortion_coefficient_k4: false,
            fix_radial_distortion_coefficient_k5: false,
            fix_radial_distortion_coefficient_k6: false,
            use_rational_model: false,
            write_calibration_result_to_file: false,
            calibration_result_output_path: None,
        }
    }
}

/// Snapshot schedule for media stream calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaStreamParameters {
    /// Snapshots to take before the stream is released.
    pub expected_stream_snapshot_count: usize,
    /// Seconds between snapshots.
    pub stream_snapshot_interval_secs: f32,
    /// Normalized zoom level of the streamed lens.
    pub zoom_level: f32,
}

impl Default for MediaStreamParameters {
    fn default() -> Self {
        Self {
            expected_stream_snapshot_count: 50,
            stream_snapshot_interval_secs: 2.0,
            zoom_level: 0.0,
        }
    }
}

impl MediaStreamParameters {
    /// Snapshot interval. Values too large for a [`Duration`] never come due.
    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f32(self.stream_snapshot_interval_secs.max(0.0))
            .unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SolverConfig::default();
        assert_eq!(config.corner_worker_count, 3);
        assert_eq!(config.calibrate_worker_count, 1);
        assert!(config.shut_down_workers_after_completed_tasks);
        assert_eq!(config.search.corner_count_x, 12);
        assert_eq!(config.search.corner_count_y, 8);
        assert_eq!(config.search.corner_float_count(), 192);
        assert!(config.calibration.keep_aspect_ratio_fixed);
        assert_eq!(config.media_stream.expected_stream_snapshot_count, 50);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "corner_worker_count": 6, "search": { "corner_count_x": 9 } }"#;
        let config: SolverConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.corner_worker_count, 6);
        assert_eq!(config.calibrate_worker_count, 1);
        assert_eq!(config.search.corner_count_x, 9);
        assert_eq!(config.search.corner_count_y, 8);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = SolverConfig::default();
        config.debug = true;
        config.media_stream.stream_snapshot_interval_secs = 0.5;
        config.save(&path).unwrap();

        let loaded = SolverConfig::load(&path).unwrap();
        assert!(loaded.debug);
        assert_eq!(loaded.media_stream.interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_interval_out_of_range() {
        let mut stream = MediaStreamParameters {
            stream_snapshot_interval_secs: 1.0e20,
            ..Default::default()
        };
        assert_eq!(stream.interval(), Duration::MAX);

        stream.stream_snapshot_interval_secs = f32::INFINITY;
        assert_eq!(stream.interval(), Duration::MAX);

        stream.stream_snapshot_interval_secs = -3.0;
        assert_eq!(stream.interval(), Duration::ZERO);
    }

    #[test]
    fn test_corner_float_count_does_not_overflow() {
        let search = ChessboardSearchParameters {
            corner_count_x: 70_000,
            corner_count_y: 70_000,
            ..Default::default()
        };
        assert_eq!(search.corner_float_count(), 70_000usize * 70_000 * 2);

        let search = ChessboardSearchParameters {
            corner_count_x: u32::MAX,
            corner_count_y: u32::MAX,
            ..Default::default()
        };
        assert!(search.corner_float_count() > 0);
    }
}
