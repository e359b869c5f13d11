//! Caller-facing lens solver.
//!
//! Validates submissions, registers jobs with the [`WorkDistributor`] and
//! feeds it image files, in-memory textures or live frame sources. Results
//! come back through [`LensSolver::poll`] on the caller's thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use image::RgbaImage;

use crate::config::{
    CalibrationParameters, ChessboardSearchParameters, MediaStreamParameters, SolverConfig,
};
use crate::distributor::WorkDistributor;
use crate::error::{CalibratorError, Result};
use crate::export::image_files_in_folder;
use crate::job::{JobInfo, JobType};
use crate::media_stream::{FrameSource, MediaStreamWorkUnit};
use crate::poller::{EventReceiver, PollSummary};
use crate::vision::VisionLibrary;
use crate::work_unit::{BaseParameters, PixelArrayWorkUnit, TextureFileWorkUnit};
use crate::worker::{CornerFinderInput, WorkerContext};

/// Smallest accepted texture edge, exclusive.
const MIN_TEXTURE_EDGE: u32 = 3;

/// Largest accepted checkerboard corner count per axis.
const MAX_CORNERS_PER_AXIS: u32 = 1024;

/// A folder of checkerboard images taken at one zoom level.
#[derive(Debug, Clone)]
pub struct TextureFolderZoomPair {
    pub absolute_folder_path: PathBuf,
    pub zoom_level: f32,
    pub use_folder: bool,
}

impl TextureFolderZoomPair {
    pub fn new(absolute_folder_path: impl Into<PathBuf>, zoom_level: f32) -> Self {
        Self {
            absolute_folder_path: absolute_folder_path.into(),
            zoom_level,
            use_folder: true,
        }
    }
}

/// In-memory checkerboard images taken at one zoom level.
#[derive(Debug, Clone)]
pub struct TextureArrayZoomPair {
    pub textures: Vec<RgbaImage>,
    pub zoom_level: f32,
    pub use_array: bool,
}

impl TextureArrayZoomPair {
    pub fn new(textures: Vec<RgbaImage>, zoom_level: f32) -> Self {
        Self {
            textures,
            zoom_level,
            use_array: true,
        }
    }
}

pub struct LensSolver {
    distributor: WorkDistributor,
}

impl LensSolver {
    pub fn new(context: WorkerContext) -> Self {
        Self {
            distributor: WorkDistributor::new(context),
        }
    }

    /// Build a solver from a configuration. Workers are not started yet.
    pub fn from_config(vision: Arc<dyn VisionLibrary>, config: &SolverConfig) -> Self {
        let context = WorkerContext::new(vision, config.output_root.clone());
        context.set_debug(config.debug);
        let solver = Self::new(context);
        solver
            .distributor
            .set_max_worker_threads(config.max_worker_threads);
        solver
    }

    pub fn distributor(&self) -> &WorkDistributor {
        &self.distributor
    }

    pub fn context(&self) -> &WorkerContext {
        self.distributor.context()
    }

    pub fn start_workers(
        &self,
        corner_workers: usize,
        calibrate_workers: usize,
        shut_down_after_completed_tasks: bool,
    ) -> Result<()> {
        if corner_workers == 0 || calibrate_workers == 0 {
            return Err(CalibratorError::NoWorkers);
        }

        self.distributor
            .set_auto_shutdown(shut_down_after_completed_tasks);
        self.distributor
            .prepare_workers(corner_workers, calibrate_workers)
    }

    pub fn stop_workers(&self) {
        self.distributor.stop_background_workers();
    }

    fn ensure_workers(&self) -> Result<()> {
        if self.distributor.corner_worker_count() == 0
            || self.distributor.calibrate_worker_count() == 0
        {
            log::error!("Lens Solver: No workers are running, call start_workers first.");
            return Err(CalibratorError::NoWorkers);
        }
        Ok(())
    }

    /// Calibrate one lens per folder. Every image in a folder belongs to
    /// that folder's calibration.
    pub fn process_texture_folders(
        &self,
        receiver: Arc<dyn EventReceiver>,
        folders: &[TextureFolderZoomPair],
        search: &ChessboardSearchParameters,
        calibration: &CalibrationParameters,
    ) -> Result<JobInfo> {
        self.ensure_workers()?;
        validate_search(search)?;
        validate_calibration(calibration)?;

        let mut batches = Vec::new();
        for pair in folders.iter().filter(|pair| pair.use_folder) {
            validate_zoom(pair.zoom_level)?;
            let files = image_files_in_folder(&pair.absolute_folder_path)?;
            if files.is_empty() {
                return Err(CalibratorError::EmptyFolder(pair.absolute_folder_path.clone()));
            }
            batches.push((pair, files));
        }
        if batches.is_empty() {
            return Err(CalibratorError::InvalidParameters(
                "no texture folders are enabled".to_string(),
            ));
        }

        let counts: Vec<usize> = batches.iter().map(|(_, files)| files.len()).collect();
        self.distributor.submit_job(
            &counts,
            JobType::OneTime,
            receiver,
            calibration.clone(),
            |job| {
                let mut units = Vec::new();
                for ((pair, files), calibration_id) in batches.into_iter().zip(&job.calibration_ids)
                {
                    let base = BaseParameters {
                        job_id: job.job_id,
                        calibration_id: *calibration_id,
                        friendly_name: folder_name(&pair.absolute_folder_path),
                        zoom_level: pair.zoom_level,
                    };
                    log::info!(
                        "Lens Solver: {}: Queuing {} images from \"{}\".",
                        base,
                        files.len(),
                        pair.absolute_folder_path.display()
                    );

                    units.extend(files.into_iter().map(|path| {
                        CornerFinderInput::TextureFile(TextureFileWorkUnit {
                            base: base.clone(),
                            search: search.clone(),
                            path,
                        })
                    }));
                }
                units
            },
        )
    }

    /// Calibrate one lens per texture array.
    pub fn process_texture_arrays(
        &self,
        receiver: Arc<dyn EventReceiver>,
        arrays: Vec<TextureArrayZoomPair>,
        search: &ChessboardSearchParameters,
        calibration: &CalibrationParameters,
    ) -> Result<JobInfo> {
        self.ensure_workers()?;
        validate_search(search)?;
        validate_calibration(calibration)?;

        let arrays: Vec<TextureArrayZoomPair> =
            arrays.into_iter().filter(|array| array.use_array).collect();
        if arrays.is_empty() {
            return Err(CalibratorError::InvalidParameters(
                "no texture arrays are enabled".to_string(),
            ));
        }
        for array in &arrays {
            validate_zoom(array.zoom_level)?;
            validate_textures(&array.textures)?;
        }

        let counts: Vec<usize> = arrays.iter().map(|array| array.textures.len()).collect();
        self.distributor.submit_job(
            &counts,
            JobType::OneTime,
            receiver,
            calibration.clone(),
            |job| {
                let mut units = Vec::new();
                for (index, (array, calibration_id)) in
                    arrays.into_iter().zip(&job.calibration_ids).enumerate()
                {
                    let base = BaseParameters {
                        job_id: job.job_id,
                        calibration_id: *calibration_id,
                        friendly_name: format!("Texture Array {}", index),
                        zoom_level: array.zoom_level,
                    };
                    log::info!(
                        "Lens Solver: {}: Queuing {} textures.",
                        base,
                        array.textures.len()
                    );

                    units.extend(array.textures.into_iter().map(|image| {
                        CornerFinderInput::PixelArray(PixelArrayWorkUnit {
                            base: base.clone(),
                            search: search.clone(),
                            image,
                        })
                    }));
                }
                units
            },
        )
    }

    /// Calibrate from frames sampled off a live source. Snapshots are taken
    /// from [`Self::poll`].
    pub fn start_media_stream_calibration(
        &self,
        receiver: Arc<dyn EventReceiver>,
        source: Arc<dyn FrameSource>,
        search: &ChessboardSearchParameters,
        calibration: &CalibrationParameters,
        stream: &MediaStreamParameters,
    ) -> Result<JobInfo> {
        self.ensure_workers()?;
        validate_search(search)?;
        validate_calibration(calibration)?;
        validate_zoom(stream.zoom_level)?;
        validate_stream(stream)?;

        self.distributor.submit_stream_job(
            stream.expected_stream_snapshot_count,
            receiver,
            calibration.clone(),
            source,
            |job| MediaStreamWorkUnit {
                base: BaseParameters {
                    job_id: job.job_id,
                    calibration_id: job.calibration_ids.first().copied().unwrap_or_default(),
                    friendly_name: "Media Stream".to_string(),
                    zoom_level: stream.zoom_level,
                },
                search: search.clone(),
                stream: stream.clone(),
            },
        )
    }

    /// Take due stream snapshots, then deliver results and finished jobs.
    pub fn poll(&self) -> PollSummary {
        self.distributor.poll_media_streams();
        self.distributor.poll()
    }
}

fn folder_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn is_positive(value: f32) -> bool {
    value.is_finite() && value > 0.0
}

fn validate_zoom(zoom_level: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&zoom_level) {
        return Err(CalibratorError::InvalidZoom(zoom_level));
    }
    Ok(())
}

fn validate_search(search: &ChessboardSearchParameters) -> Result<()> {
    let corners = 1..=MAX_CORNERS_PER_AXIS;
    if !corners.contains(&search.corner_count_x) || !corners.contains(&search.corner_count_y) {
        return Err(CalibratorError::InvalidParameters(format!(
            "checkerboard corner count must be between 1 and {} per axis, got {}x{}",
            MAX_CORNERS_PER_AXIS, search.corner_count_x, search.corner_count_y
        )));
    }
    if !is_positive(search.square_size_mm) {
        return Err(CalibratorError::InvalidParameters(format!(
            "checkerboard square size must be positive, got {} mm",
            search.square_size_mm
        )));
    }
    if search.resize && !is_positive(search.resize_percentage) {
        return Err(CalibratorError::InvalidParameters(format!(
            "resize percentage must be positive, got {}",
            search.resize_percentage
        )));
    }
    if search.native_full_resolution_x == 0 || search.native_full_resolution_y == 0 {
        return Err(CalibratorError::InvalidParameters(
            "native resolution must be positive".to_string(),
        ));
    }
    Ok(())
}

fn validate_calibration(calibration: &CalibrationParameters) -> Result<()> {
    if !is_positive(calibration.sensor_diagonal_size_mm) {
        return Err(CalibratorError::InvalidParameters(format!(
            "sensor diagonal must be positive, got {} mm",
            calibration.sensor_diagonal_size_mm
        )));
    }
    Ok(())
}

fn validate_stream(stream: &MediaStreamParameters) -> Result<()> {
    if stream.expected_stream_snapshot_count == 0 {
        return Err(CalibratorError::InvalidParameters(
            "snapshot count must be positive".to_string(),
        ));
    }
    let interval = stream.stream_snapshot_interval_secs;
    if interval < 0.0 || Duration::try_from_secs_f32(interval).is_err() {
        return Err(CalibratorError::InvalidParameters(format!(
            "snapshot interval must be a non-negative number of seconds, got {}",
            interval
        )));
    }
    Ok(())
}

fn validate_textures(textures: &[RgbaImage]) -> Result<()> {
    let Some(first) = textures.first() else {
        return Err(CalibratorError::InvalidParameters(
            "texture array is empty".to_string(),
        ));
    };

    for (index, texture) in textures.iter().enumerate() {
        let (width, height) = texture.dimensions();
        if width <= MIN_TEXTURE_EDGE || height <= MIN_TEXTURE_EDGE {
            return Err(CalibratorError::InvalidTexture {
                index,
                reason: format!("resolution {}x{} is too small", width, height),
            });
        }
        if texture.dimensions() != first.dimensions() {
            return Err(CalibratorError::InvalidTexture {
                index,
                reason: format!(
                    "resolution {}x{} differs from {}x{}",
                    width,
                    height,
                    first.width(),
                    first.height()
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        base_parameters, test_image, wait_until, RecordingReceiver, ScriptedVision,
    };
    use crate::work_unit::{CalibrationPointsWorkUnit, ResizeParameters};

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn solver() -> (LensSolver, Arc<ScriptedVision>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let vision = Arc::new(ScriptedVision::default());
        let context = WorkerContext::new(vision.clone(), dir.path());
        (LensSolver::new(context), vision, dir)
    }

    fn run_to_completion(solver: &LensSolver, receiver: &RecordingReceiver, jobs: usize) {
        assert!(wait_until(TIMEOUT, || {
            solver.poll();
            receiver.finished().len() == jobs
        }));
    }

    #[test]
    fn test_submissions_require_workers() {
        let (solver, _vision, _dir) = solver();
        assert!(matches!(
            solver.start_workers(0, 1, true),
            Err(CalibratorError::NoWorkers)
        ));

        let receiver = Arc::new(RecordingReceiver::default());
        let result = solver.process_texture_arrays(
            receiver,
            vec![TextureArrayZoomPair::new(vec![test_image()], 0.0)],
            &ChessboardSearchParameters::default(),
            &CalibrationParameters::default(),
        );
        assert!(matches!(result, Err(CalibratorError::NoWorkers)));
        assert_eq!(solver.distributor().job_count(), 0);
    }

    #[test]
    fn test_validation_has_no_job_side_effects() {
        let (solver, _vision, _dir) = solver();
        solver.start_workers(1, 1, false).unwrap();
        let receiver = Arc::new(RecordingReceiver::default());
        let search = ChessboardSearchParameters::default();
        let calibration = CalibrationParameters::default();

        let result = solver.process_texture_arrays(
            receiver.clone(),
            vec![TextureArrayZoomPair::new(vec![test_image()], 1.5)],
            &search,
            &calibration,
        );
        assert!(matches!(result, Err(CalibratorError::InvalidZoom(_))));

        let tiny = RgbaImage::new(3, 3);
        let result = solver.process_texture_arrays(
            receiver.clone(),
            vec![TextureArrayZoomPair::new(vec![test_image(), tiny], 0.0)],
            &search,
            &calibration,
        );
        assert!(matches!(
            result,
            Err(CalibratorError::InvalidTexture { index: 1, .. })
        ));

        let other = RgbaImage::new(32, 32);
        let result = solver.process_texture_arrays(
            receiver.clone(),
            vec![TextureArrayZoomPair::new(vec![test_image(), other], 0.0)],
            &search,
            &calibration,
        );
        assert!(matches!(
            result,
            Err(CalibratorError::InvalidTexture { index: 1, .. })
        ));

        let bad_search = ChessboardSearchParameters {
            square_size_mm: 0.0,
            ..Default::default()
        };
        let result = solver.process_texture_arrays(
            receiver.clone(),
            vec![TextureArrayZoomPair::new(vec![test_image()], 0.0)],
            &bad_search,
            &calibration,
        );
        assert!(matches!(result, Err(CalibratorError::InvalidParameters(_))));

        let huge_board = ChessboardSearchParameters {
            corner_count_x: 70_000,
            corner_count_y: 70_000,
            ..Default::default()
        };
        let result = solver.process_texture_arrays(
            receiver.clone(),
            vec![TextureArrayZoomPair::new(vec![test_image()], 0.0)],
            &huge_board,
            &calibration,
        );
        assert!(matches!(result, Err(CalibratorError::InvalidParameters(_))));

        let disabled = TextureArrayZoomPair {
            use_array: false,
            ..TextureArrayZoomPair::new(vec![test_image()], 0.0)
        };
        let result =
            solver.process_texture_arrays(receiver, vec![disabled], &search, &calibration);
        assert!(matches!(result, Err(CalibratorError::InvalidParameters(_))));

        assert_eq!(solver.distributor().job_count(), 0);
        solver.stop_workers();
    }

    #[test]
    fn test_texture_arrays_one_result_per_zoom_level() {
        let (solver, vision, _dir) = solver();
        solver.start_workers(2, 2, true).unwrap();
        let receiver = Arc::new(RecordingReceiver::default());

        let job = solver
            .process_texture_arrays(
                receiver.clone(),
                vec![
                    TextureArrayZoomPair::new(vec![test_image(); 3], 0.0),
                    TextureArrayZoomPair::new(vec![test_image(); 2], 1.0),
                ],
                &ChessboardSearchParameters::default(),
                &CalibrationParameters::default(),
            )
            .unwrap();
        assert_eq!(job.job_type, JobType::OneTime);
        assert_eq!(job.calibration_ids.len(), 2);

        run_to_completion(&solver, &receiver, 1);
        assert_eq!(vision.detect_calls(), 5);

        let mut counts: Vec<usize> = receiver.results().iter().map(|r| r.image_count).collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![2, 3]);
        assert!(solver.context().wait_for_shutdown(TIMEOUT));
    }

    #[test]
    fn test_texture_folders() {
        let (solver, _vision, dir) = solver();
        solver.start_workers(2, 1, true).unwrap();
        let receiver = Arc::new(RecordingReceiver::default());

        let folder = dir.path().join("zoom-wide");
        std::fs::create_dir_all(&folder).unwrap();
        for i in 0..3 {
            test_image().save(folder.join(format!("shot-{}.png", i))).unwrap();
        }
        std::fs::write(folder.join("notes.txt"), "not an image").unwrap();

        let empty = dir.path().join("empty");
        std::fs::create_dir_all(&empty).unwrap();
        let result = solver.process_texture_folders(
            receiver.clone(),
            &[TextureFolderZoomPair::new(&empty, 0.0)],
            &ChessboardSearchParameters::default(),
            &CalibrationParameters::default(),
        );
        assert!(matches!(result, Err(CalibratorError::EmptyFolder(_))));

        let skipped = TextureFolderZoomPair {
            use_folder: false,
            ..TextureFolderZoomPair::new(&empty, 0.0)
        };
        solver
            .process_texture_folders(
                receiver.clone(),
                &[TextureFolderZoomPair::new(&folder, 0.25), skipped],
                &ChessboardSearchParameters::default(),
                &CalibrationParameters::default(),
            )
            .unwrap();

        run_to_completion(&solver, &receiver, 1);
        let results = receiver.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].base.friendly_name, "zoom-wide");
        assert_eq!(results[0].base.zoom_level, 0.25);
        assert_eq!(results[0].image_count, 3);
    }

    struct StaticSource;

    impl FrameSource for StaticSource {
        fn capture_frame(&self) -> Option<RgbaImage> {
            Some(test_image())
        }
    }

    #[test]
    fn test_media_stream_calibration() {
        let (solver, vision, _dir) = solver();
        solver.start_workers(1, 1, true).unwrap();
        let receiver = Arc::new(RecordingReceiver::default());
        let stream = MediaStreamParameters {
            expected_stream_snapshot_count: 3,
            stream_snapshot_interval_secs: 0.0,
            zoom_level: 0.5,
        };

        let job = solver
            .start_media_stream_calibration(
                receiver.clone(),
                Arc::new(StaticSource),
                &ChessboardSearchParameters::default(),
                &CalibrationParameters::default(),
                &stream,
            )
            .unwrap();
        assert_eq!(job.job_type, JobType::Continuous);

        run_to_completion(&solver, &receiver, 1);
        assert_eq!(vision.detect_calls(), 3);
        assert_eq!(receiver.results()[0].image_count, 3);
    }

    #[test]
    fn test_media_stream_validation() {
        let (solver, _vision, _dir) = solver();
        solver.start_workers(1, 1, false).unwrap();
        let receiver = Arc::new(RecordingReceiver::default());

        let stream = MediaStreamParameters {
            expected_stream_snapshot_count: 0,
            ..Default::default()
        };
        let result = solver.start_media_stream_calibration(
            receiver.clone(),
            Arc::new(StaticSource),
            &ChessboardSearchParameters::default(),
            &CalibrationParameters::default(),
            &stream,
        );
        assert!(matches!(result, Err(CalibratorError::InvalidParameters(_))));

        for interval in [f32::NAN, f32::INFINITY, -1.0, 1.0e20] {
            let stream = MediaStreamParameters {
                stream_snapshot_interval_secs: interval,
                ..Default::default()
            };
            let result = solver.start_media_stream_calibration(
                receiver.clone(),
                Arc::new(StaticSource),
                &ChessboardSearchParameters::default(),
                &CalibrationParameters::default(),
                &stream,
            );
            assert!(
                matches!(result, Err(CalibratorError::InvalidParameters(_))),
                "interval {} was accepted",
                interval
            );
        }
        assert_eq!(solver.distributor().job_count(), 0);
        solver.stop_workers();
    }

    #[test]
    fn test_submission_racing_auto_shutdown_is_never_stranded() {
        for _ in 0..100 {
            let (solver, _vision, _dir) = solver();
            solver.start_workers(1, 1, true).unwrap();
            let receiver = Arc::new(RecordingReceiver::default());

            let first = solver.distributor().register_job(
                &[1],
                1,
                JobType::OneTime,
                receiver.clone(),
                CalibrationParameters::default(),
            );
            let last_image = CalibrationPointsWorkUnit::empty(
                base_parameters(first.job_id, first.calibration_ids[0]),
                ResizeParameters::default(),
            );

            let second = std::thread::scope(|scope| {
                scope.spawn(|| solver.distributor().queue_calibrate_work_unit(last_image));
                solver.process_texture_arrays(
                    receiver.clone(),
                    vec![TextureArrayZoomPair::new(vec![test_image(); 2], 0.0)],
                    &ChessboardSearchParameters::default(),
                    &CalibrationParameters::default(),
                )
            });

            match second {
                Ok(job) => {
                    assert!(
                        wait_until(TIMEOUT, || {
                            solver.poll();
                            receiver.finished().contains(&job)
                        }),
                        "accepted job {} never finished",
                        job.job_id
                    );
                }
                Err(CalibratorError::NoWorkers) => {}
                Err(err) => panic!("unexpected error: {}", err),
            }
            assert!(wait_until(TIMEOUT, || {
                solver.poll();
                receiver.finished().contains(&first)
            }));
            assert_eq!(solver.distributor().job_count(), 0);
            solver.stop_workers();
            assert!(solver.context().wait_for_shutdown(TIMEOUT));
        }
    }
}
