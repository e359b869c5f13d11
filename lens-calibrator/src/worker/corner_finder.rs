//! Corner finder worker.
//!
//! Pulls images (files first, then in-memory pixel arrays), runs checkerboard
//! detection and forwards one [`CalibrationPointsWorkUnit`] per image. A
//! failed detection still forwards an empty unit so that image counting
//! downstream reaches its expected total.

use std::collections::VecDeque;
use std::sync::Arc;

use image::{Rgba, RgbaImage};

use super::{CalibrationPointsSink, WorkerBehavior, WorkerKind, WorkerScope};
use crate::config::ChessboardSearchParameters;
use crate::export::{generate_indexed_file_path, CalibrationExporter};
use crate::work_unit::{
    BaseParameters, CalibrationPointsWorkUnit, GridSize, PixelArrayWorkUnit, ResizeParameters,
    TextureFileWorkUnit,
};

/// Work accepted by a corner finder.
#[derive(Debug)]
pub enum CornerFinderInput {
    TextureFile(TextureFileWorkUnit),
    PixelArray(PixelArrayWorkUnit),
}

#[derive(Debug, Default)]
pub struct CornerFinderQueue {
    texture_files: VecDeque<TextureFileWorkUnit>,
    pixel_arrays: VecDeque<PixelArrayWorkUnit>,
}

/// Checkerboard detection behavior.
pub struct CornerFinder {
    sink: Arc<dyn CalibrationPointsSink>,
}

impl CornerFinder {
    pub fn new(sink: Arc<dyn CalibrationPointsSink>) -> Self {
        Self { sink }
    }

    fn forward(&self, unit: CalibrationPointsWorkUnit, scope: &WorkerScope<'_>) {
        if scope.should_exit() {
            return;
        }
        if scope.debug() {
            log::debug!(
                "Worker ({}): {}: Queuing {}calibration points work unit.",
                scope.id(),
                unit.base,
                if unit.is_empty() { "EMPTY " } else { "" }
            );
        }
        self.sink.send_calibration_points(unit);
    }

    fn write_visualization(
        &self,
        image: &RgbaImage,
        corners: &[f32],
        resize: &ResizeParameters,
        search: &ChessboardSearchParameters,
        scope: &WorkerScope<'_>,
    ) {
        let marked = mark_corners(image, corners, resize);
        let path = match &search.corner_visualization_output_path {
            Some(path) if !path.as_os_str().is_empty() => Ok(path.clone()),
            _ => generate_indexed_file_path(scope.output_dir(), "corner-visualization", "png"),
        };

        match path.and_then(|path| CalibrationExporter::export_image(&marked, &path).map(|_| path)) {
            Ok(path) => log::info!(
                "Worker ({}): Wrote corner visualization to \"{}\".",
                scope.id(),
                path.display()
            ),
            Err(e) => log::warn!(
                "Worker ({}): Failed to write corner visualization: {}",
                scope.id(),
                e
            ),
        }
    }
}

impl WorkerBehavior for CornerFinder {
    type Input = CornerFinderInput;
    type Queue = CornerFinderQueue;
    type Batch = CornerFinderInput;

    const KIND: WorkerKind = WorkerKind::CornerFinder;

    fn enqueue(queue: &mut Self::Queue, input: Self::Input) {
        match input {
            CornerFinderInput::TextureFile(unit) => queue.texture_files.push_back(unit),
            CornerFinderInput::PixelArray(unit) => queue.pixel_arrays.push_back(unit),
        }
    }

    fn work_load(queue: &Self::Queue) -> usize {
        queue.texture_files.len() + queue.pixel_arrays.len()
    }

    fn take(queue: &mut Self::Queue) -> Option<Self::Batch> {
        queue
            .texture_files
            .pop_front()
            .map(CornerFinderInput::TextureFile)
            .or_else(|| queue.pixel_arrays.pop_front().map(CornerFinderInput::PixelArray))
    }

    fn process(&self, batch: Self::Batch, scope: &WorkerScope<'_>) {
        let (base, search, image) = match batch {
            CornerFinderInput::TextureFile(unit) => {
                if scope.debug() {
                    log::debug!(
                        "Worker ({}): {}: Dequeued texture file \"{}\".",
                        scope.id(),
                        unit.base,
                        unit.path.display()
                    );
                }
                match image::open(&unit.path) {
                    Ok(image) => (unit.base, unit.search, image.to_rgba8()),
                    Err(e) => {
                        log::warn!(
                            "Worker ({}): {}: Unable to load \"{}\": {}",
                            scope.id(),
                            unit.base,
                            unit.path.display(),
                            e
                        );
                        let resize = ResizeParameters::compute(0, 0, &unit.search);
                        self.forward(CalibrationPointsWorkUnit::empty(unit.base, resize), scope);
                        return;
                    }
                }
            }
            CornerFinderInput::PixelArray(unit) => {
                if scope.debug() {
                    log::debug!(
                        "Worker ({}): {}: Dequeued pixel array of resolution ({}, {}).",
                        scope.id(),
                        unit.base,
                        unit.image.width(),
                        unit.image.height()
                    );
                }
                (unit.base, unit.search, unit.image)
            }
        };

        let unit = detect(&base, &search, &image, scope);
        if !unit.is_empty() && search.write_corner_visualization_to_file {
            let resize = ResizeParameters::compute(image.width(), image.height(), &search);
            let search_space = to_search_space(&unit.corners, &resize);
            self.write_visualization(&image, &search_space, &resize, &search, scope);
        }

        self.forward(unit, scope);
    }
}

/// Run detection and map the corners to native resolution.
fn detect(
    base: &BaseParameters,
    search: &ChessboardSearchParameters,
    image: &RgbaImage,
    scope: &WorkerScope<'_>,
) -> CalibrationPointsWorkUnit {
    let resize = ResizeParameters::compute(image.width(), image.height(), search);

    let corners = match scope.vision().detect_corners(&resize, search, image, scope.debug()) {
        Ok(corners) if corners.len() == search.corner_float_count() => corners,
        Ok(corners) => {
            log::warn!(
                "Worker ({}): {}: Expected {} corner values but detection returned {}.",
                scope.id(),
                base,
                search.corner_float_count(),
                corners.len()
            );
            return CalibrationPointsWorkUnit::empty(base.clone(), resize);
        }
        Err(e) => {
            if scope.debug() {
                log::debug!("Worker ({}): {}: {}", scope.id(), base, e);
            }
            return CalibrationPointsWorkUnit::empty(base.clone(), resize);
        }
    };

    CalibrationPointsWorkUnit {
        base: base.clone(),
        corners: to_native(corners, &resize),
        grid: GridSize::new(search.corner_count_x, search.corner_count_y),
        square_size_mm: search.square_size_mm,
        resize,
    }
}

/// Scale search-resolution corners up to native resolution.
pub fn to_native(mut corners: Vec<f32>, resize: &ResizeParameters) -> Vec<f32> {
    let (sx, sy) = resize.native_scale();
    for pair in corners.chunks_exact_mut(2) {
        pair[0] *= sx;
        pair[1] *= sy;
    }
    corners
}

fn to_search_space(native: &[f32], resize: &ResizeParameters) -> Vec<f32> {
    let (sx, sy) = resize.native_scale();
    native
        .chunks_exact(2)
        .flat_map(|p| [p[0] / sx, p[1] / sy])
        .collect()
}

/// Copy of `image` with a cross drawn at each search-space corner.
fn mark_corners(image: &RgbaImage, corners: &[f32], resize: &ResizeParameters) -> RgbaImage {
    let mut marked = image.clone();
    let (width, height) = marked.dimensions();
    let to_source_x = if resize.resize_x == 0 { 1.0 } else { resize.source_x as f32 / resize.resize_x as f32 };
    let to_source_y = if resize.resize_y == 0 { 1.0 } else { resize.source_y as f32 / resize.resize_y as f32 };
    let red = Rgba([255, 0, 0, 255]);

    for pair in corners.chunks_exact(2) {
        let cx = (pair[0] * to_source_x).round() as i64;
        let cy = (pair[1] * to_source_y).round() as i64;
        for offset in -3i64..=3 {
            for (x, y) in [(cx + offset, cy), (cx, cy + offset)] {
                if x >= 0 && y >= 0 && (x as u32) < width && (y as u32) < height {
                    marked.put_pixel(x as u32, y as u32, red);
                }
            }
        }
    }
    marked
}
