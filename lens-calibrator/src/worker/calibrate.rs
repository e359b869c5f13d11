//! Calibrate worker.
//!
//! Corner sets accumulate per calibration ID until a [`CalibrateLatch`]
//! arrives; the latch drains every queued set for that calibration, merges
//! them and runs the lens solve once.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use thiserror::Error;

use super::{CalibrationResultSink, WorkerBehavior, WorkerKind, WorkerScope};
use crate::export::CalibrationExporter;
use crate::job::CalibrationId;
use crate::result::CalibrationResult;
use crate::work_unit::{CalibrateLatch, CalibrationPointsWorkUnit, GridSize};

/// Work accepted by a calibrate worker.
#[derive(Debug)]
pub enum CalibrateInput {
    Points(CalibrationPointsWorkUnit),
    Latch(CalibrateLatch),
}

#[derive(Debug, Default)]
pub struct CalibrateQueue {
    points: HashMap<CalibrationId, VecDeque<CalibrationPointsWorkUnit>>,
    latches: VecDeque<CalibrateLatch>,
}

/// A latch with every corner set queued for its calibration.
#[derive(Debug)]
pub struct CalibrateBatch {
    pub latch: CalibrateLatch,
    pub units: Vec<CalibrationPointsWorkUnit>,
}

/// Corner sets of one calibration concatenated for the solve.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedCorners {
    pub corners: Vec<f32>,
    pub grid: GridSize,
    pub square_size_mm: f32,
    pub image_count: usize,
}

/// Corner sets within one calibration disagree.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchIntegrityError {
    #[error("corner grid {found} does not match {expected}")]
    GridMismatch { expected: GridSize, found: GridSize },
    #[error("square size {found}mm does not match {expected}mm")]
    SquareSizeMismatch { expected: f32, found: f32 },
    #[error("unit holds {found} corner values, grid {grid} needs {expected}")]
    CornerCountMismatch {
        grid: GridSize,
        expected: usize,
        found: usize,
    },
}

/// Concatenate non-empty corner sets in queue order. Empty sets are skipped
/// and not counted; every other set must share grid and square size.
pub fn merge_calibration_points(
    units: &[CalibrationPointsWorkUnit],
) -> Result<MergedCorners, BatchIntegrityError> {
    let mut merged = MergedCorners {
        corners: Vec::new(),
        grid: GridSize::default(),
        square_size_mm: 0.0,
        image_count: 0,
    };

    for unit in units.iter().filter(|u| !u.is_empty()) {
        if merged.image_count == 0 {
            merged.grid = unit.grid;
            merged.square_size_mm = unit.square_size_mm;
        } else if unit.grid != merged.grid {
            return Err(BatchIntegrityError::GridMismatch {
                expected: merged.grid,
                found: unit.grid,
            });
        } else if unit.square_size_mm != merged.square_size_mm {
            return Err(BatchIntegrityError::SquareSizeMismatch {
                expected: merged.square_size_mm,
                found: unit.square_size_mm,
            });
        }

        let expected = unit.grid.corner_count().saturating_mul(2);
        if unit.corners.len() != expected {
            return Err(BatchIntegrityError::CornerCountMismatch {
                grid: unit.grid,
                expected,
                found: unit.corners.len(),
            });
        }

        merged.corners.extend_from_slice(&unit.corners);
        merged.image_count += 1;
    }

    Ok(merged)
}

/// Lens solve behavior.
pub struct Calibrate {
    sink: Arc<dyn CalibrationResultSink>,
}

impl Calibrate {
    pub fn new(sink: Arc<dyn CalibrationResultSink>) -> Self {
        Self { sink }
    }

    fn solve(&self, batch: &CalibrateBatch, scope: &WorkerScope<'_>) -> Option<CalibrationResult> {
        let latch = &batch.latch;
        let skipped = batch.units.iter().filter(|u| u.is_empty()).count();
        if skipped > 0 {
            log::info!(
                "Worker ({}): {}: Skipping {} of {} images with no detected corners.",
                scope.id(),
                latch.base,
                skipped,
                batch.units.len()
            );
        }

        let merged = match merge_calibration_points(&batch.units) {
            Ok(merged) => merged,
            Err(e) => {
                log::error!(
                    "Worker ({}): {}: Inconsistent calibration batch, not solving: {}",
                    scope.id(),
                    latch.base,
                    e
                );
                return Some(CalibrationResult::failed(latch.base.clone()));
            }
        };

        if merged.image_count == 0 {
            log::error!(
                "Worker ({}): {}: No corners were found in any of the {} images.",
                scope.id(),
                latch.base,
                batch.units.len()
            );
            return Some(CalibrationResult::failed(latch.base.clone()));
        }

        if scope.should_exit() {
            return None;
        }

        log::info!(
            "Worker ({}): {}: Calibrating from {} images of a {} grid.",
            scope.id(),
            latch.base,
            merged.image_count,
            merged.grid
        );

        let output = match scope.vision().calibrate_lens(
            &latch.resize,
            &latch.calibration,
            &merged.corners,
            merged.square_size_mm,
            merged.grid,
            merged.image_count,
            scope.debug(),
        ) {
            Ok(output) => output,
            Err(e) => {
                log::error!("Worker ({}): {}: {}", scope.id(), latch.base, e);
                return Some(CalibrationResult::failed(latch.base.clone()));
            }
        };

        let result = CalibrationResult::solved(
            latch.base.clone(),
            &output,
            (latch.resize.native_x, latch.resize.native_y),
            merged.image_count,
        );

        log::info!(
            "Worker ({}): Completed camera calibration at zoom level {} with solve error {}: \
             fov ({}, {}), sensor {}x{}mm, focal length {}mm, principal point ({}, {}), aspect ratio {}",
            scope.id(),
            latch.base.zoom_level,
            output.error,
            output.fov_x,
            output.fov_y,
            output.sensor_size_mm_x,
            output.sensor_size_mm_y,
            output.focal_length_mm,
            output.principal_pixel_point_x,
            output.principal_pixel_point_y,
            output.aspect_ratio
        );

        Some(result)
    }
}

impl WorkerBehavior for Calibrate {
    type Input = CalibrateInput;
    type Queue = CalibrateQueue;
    type Batch = CalibrateBatch;

    const KIND: WorkerKind = WorkerKind::Calibrate;

    fn enqueue(queue: &mut Self::Queue, input: Self::Input) {
        match input {
            CalibrateInput::Points(unit) => queue
                .points
                .entry(unit.base.calibration_id)
                .or_default()
                .push_back(unit),
            CalibrateInput::Latch(latch) => queue.latches.push_back(latch),
        }
    }

    /// Calibrations with queued corner sets.
    fn work_load(queue: &Self::Queue) -> usize {
        queue.points.len()
    }

    fn has_work(queue: &Self::Queue) -> bool {
        !queue.latches.is_empty()
    }

    fn take(queue: &mut Self::Queue) -> Option<Self::Batch> {
        let latch = queue.latches.pop_front()?;
        let units = queue
            .points
            .remove(&latch.base.calibration_id)
            .map(Vec::from)
            .unwrap_or_default();
        Some(CalibrateBatch { latch, units })
    }

    fn process(&self, batch: Self::Batch, scope: &WorkerScope<'_>) {
        if scope.debug() {
            log::debug!(
                "Worker ({}): {}: Dequeued latch with {} queued corner sets.",
                scope.id(),
                batch.latch.base,
                batch.units.len()
            );
        }

        let Some(result) = self.solve(&batch, scope) else {
            return;
        };

        let calibration = &batch.latch.calibration;
        if result.success && calibration.write_calibration_result_to_file {
            match CalibrationExporter::export_json_indexed(
                &result,
                calibration.calibration_result_output_path.as_deref(),
                scope.output_dir(),
            ) {
                Ok(path) => log::info!(
                    "Worker ({}): Wrote calibration result to \"{}\".",
                    scope.id(),
                    path.display()
                ),
                Err(e) => log::error!(
                    "Worker ({}): Failed to write calibration result: {}",
                    scope.id(),
                    e
                ),
            }
        }

        if scope.should_exit() {
            return;
        }
        self.sink.send_calibration_result(result);
    }
}
