//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbaImage;
use parking_lot::{Condvar, Mutex};

use crate::config::{CalibrationParameters, ChessboardSearchParameters};
use crate::error::VisionError;
use crate::job::{CalibrationId, JobId, JobInfo};
use crate::poller::EventReceiver;
use crate::result::CalibrationResult;
use crate::vision::{CalibrationOutput, VisionLibrary};
use crate::work_unit::{BaseParameters, GridSize, ResizeParameters};

/// Blocks detection until opened.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
    }
}

/// Arguments of one `calibrate_lens` call.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrateCall {
    pub corner_floats: usize,
    pub square_size_mm: f32,
    pub grid: GridSize,
    pub image_count: usize,
    pub resize: ResizeParameters,
}

/// Vision library returning synthetic corner grids.
#[derive(Default)]
pub struct ScriptedVision {
    /// Detection outcomes consumed in call order; success once exhausted.
    detections: Mutex<VecDeque<bool>>,
    gate: Option<Arc<Gate>>,
    solve_error: Option<VisionError>,
    detect_calls: AtomicUsize,
    calibrate_calls: Mutex<Vec<CalibrateCall>>,
}

impl ScriptedVision {
    pub fn with_detections(outcomes: impl IntoIterator<Item = bool>) -> Self {
        Self {
            detections: Mutex::new(outcomes.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn gated(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn failing_solve(mut self) -> Self {
        self.solve_error = Some(VisionError::SolveFailed("scripted".to_string()));
        self
    }

    pub fn detect_calls(&self) -> usize {
        self.detect_calls.load(Ordering::SeqCst)
    }

    pub fn calibrate_calls(&self) -> Vec<CalibrateCall> {
        self.calibrate_calls.lock().clone()
    }
}

impl VisionLibrary for ScriptedVision {
    fn detect_corners(
        &self,
        _resize: &ResizeParameters,
        search: &ChessboardSearchParameters,
        _image: &RgbaImage,
        _debug: bool,
    ) -> Result<Vec<f32>, VisionError> {
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        self.detect_calls.fetch_add(1, Ordering::SeqCst);

        let found = self.detections.lock().pop_front().unwrap_or(true);
        if !found {
            return Err(VisionError::PatternNotFound);
        }

        Ok(synthetic_corners(search.corner_count_x, search.corner_count_y))
    }

    fn calibrate_lens(
        &self,
        resize: &ResizeParameters,
        _calibration: &CalibrationParameters,
        corners: &[f32],
        square_size_mm: f32,
        grid: GridSize,
        image_count: usize,
        _debug: bool,
    ) -> Result<CalibrationOutput, VisionError> {
        self.calibrate_calls.lock().push(CalibrateCall {
            corner_floats: corners.len(),
            square_size_mm,
            grid,
            image_count,
            resize: *resize,
        });

        if let Some(error) = &self.solve_error {
            return Err(error.clone());
        }

        Ok(CalibrationOutput {
            error: 0.25,
            fov_x: 60.0,
            fov_y: 40.0,
            focal_length_mm: 1000.0,
            aspect_ratio: 1.0,
            principal_pixel_point_x: resize.native_x as f32 / 2.0,
            principal_pixel_point_y: resize.native_y as f32 / 2.0,
            resolution_x: resize.native_x,
            resolution_y: resize.native_y,
            ..Default::default()
        })
    }
}

/// Row-major grid with 10 px spacing.
pub fn synthetic_corners(cols: u32, rows: u32) -> Vec<f32> {
    (0..rows)
        .flat_map(|y| (0..cols).map(move |x| (x, y)))
        .flat_map(|(x, y)| [x as f32 * 10.0, y as f32 * 10.0])
        .collect()
}

/// Receiver that records every callback.
#[derive(Default)]
pub struct RecordingReceiver {
    results: Mutex<Vec<CalibrationResult>>,
    finished: Mutex<Vec<JobInfo>>,
}

impl RecordingReceiver {
    pub fn results(&self) -> Vec<CalibrationResult> {
        self.results.lock().clone()
    }

    pub fn finished(&self) -> Vec<JobInfo> {
        self.finished.lock().clone()
    }
}

impl EventReceiver for RecordingReceiver {
    fn on_calibration_result(&self, result: &CalibrationResult) {
        self.results.lock().push(result.clone());
    }

    fn on_job_finished(&self, job: &JobInfo) {
        self.finished.lock().push(job.clone());
    }
}

pub fn base_parameters(job_id: JobId, calibration_id: CalibrationId) -> BaseParameters {
    BaseParameters {
        job_id,
        calibration_id,
        friendly_name: "test".to_string(),
        zoom_level: 0.5,
    }
}

/// Small RGBA image for pixel-array units.
pub fn test_image() -> RgbaImage {
    RgbaImage::from_pixel(64, 48, image::Rgba([128, 128, 128, 255]))
}

/// Re-check `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
