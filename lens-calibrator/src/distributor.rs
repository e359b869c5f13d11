//! Work distributor.
//!
//! The hub between the caller and the two worker pools. It owns the pools,
//! dispatches images to the least-loaded corner finder, routes corner sets to
//! the calibrate worker bound to their calibration ID, latches that worker
//! once every expected image has been counted, and correlates solved results
//! back to their job.
//!
//! All hub state sits behind one lock. Dispatch only does map lookups, a
//! small sort and a queue push, while detection and solving happen on the
//! worker threads without touching this lock.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use image::RgbaImage;
use parking_lot::Mutex;

use crate::config::CalibrationParameters;
use crate::error::{CalibratorError, Result};
use crate::job::{CalibrationId, Job, JobId, JobInfo, JobType};
use crate::media_stream::{FrameSource, MediaStream, MediaStreamWorkUnit};
use crate::poller::{EventQueue, EventReceiver, PollSummary};
use crate::result::CalibrationResult;
use crate::work_unit::{
    CalibrateLatch, CalibrationPointsWorkUnit, PixelArrayWorkUnit, TextureFileWorkUnit,
};
use crate::worker::{
    Calibrate, CalibrateInput, CalibrationPointsSink, CalibrationResultSink, CornerFinder,
    CornerFinderInput, Worker, WorkerBehavior, WorkerContext, WorkerId,
};

/// Default cap on live workers across both pools.
pub const DEFAULT_MAX_WORKER_THREADS: usize = 64;

/// Re-sort `ids` ascending by load and return the least-loaded one.
pub fn sort_by_load(ids: &mut [WorkerId], load: impl FnMut(&WorkerId) -> usize) -> Option<WorkerId> {
    ids.sort_by_cached_key(load);
    ids.first().copied()
}

fn least_loaded<B: WorkerBehavior>(
    ids: &mut [WorkerId],
    workers: &HashMap<WorkerId, Worker<B>>,
) -> Option<WorkerId> {
    sort_by_load(ids, |id| {
        workers.get(id).map(Worker::work_load).unwrap_or(usize::MAX)
    })
}

fn new_job(
    expected_image_counts: &[usize],
    expected_result_count: usize,
    job_type: JobType,
    receiver: Arc<dyn EventReceiver>,
    calibration: CalibrationParameters,
) -> Job {
    let info = JobInfo {
        job_type,
        job_id: JobId::new(),
        calibration_ids: expected_image_counts
            .iter()
            .map(|_| CalibrationId::new())
            .collect(),
    };

    log::info!(
        "Work Distributor: Registered {} job {} with {} calibrations expecting {} results.",
        job_type,
        info.job_id,
        info.calibration_ids.len(),
        expected_result_count
    );

    Job::new(
        info,
        expected_image_counts,
        expected_result_count,
        receiver,
        calibration,
    )
}

/// Handle to the hub. Cloning shares the same distributor.
#[derive(Clone)]
pub struct WorkDistributor {
    shared: Arc<Shared>,
}

struct Shared {
    context: WorkerContext,
    events: EventQueue,
    state: Mutex<DistributorState>,
}

struct DistributorState {
    corner_workers: HashMap<WorkerId, Worker<CornerFinder>>,
    corner_worker_ids: Vec<WorkerId>,
    calibrate_workers: HashMap<WorkerId, Worker<Calibrate>>,
    calibrate_worker_ids: Vec<WorkerId>,
    jobs: HashMap<JobId, Job>,
    calibration_worker_lut: HashMap<CalibrationId, WorkerId>,
    media_streams: HashMap<JobId, MediaStream>,
    auto_shutdown: bool,
    max_worker_threads: usize,
}

impl DistributorState {
    fn new() -> Self {
        Self {
            corner_workers: HashMap::new(),
            corner_worker_ids: Vec::new(),
            calibrate_workers: HashMap::new(),
            calibrate_worker_ids: Vec::new(),
            jobs: HashMap::new(),
            calibration_worker_lut: HashMap::new(),
            media_streams: HashMap::new(),
            auto_shutdown: true,
            max_worker_threads: DEFAULT_MAX_WORKER_THREADS,
        }
    }

    fn worker_count(&self) -> usize {
        self.corner_workers.len() + self.calibrate_workers.len()
    }

    fn stop_corner_workers(&mut self) {
        for worker in self.corner_workers.values() {
            worker.close();
        }
        if !self.corner_workers.is_empty() {
            log::info!(
                "Work Distributor: Closed {} corner finder workers.",
                self.corner_workers.len()
            );
        }
        self.corner_workers.clear();
        self.corner_worker_ids.clear();
    }

    fn stop_calibrate_workers(&mut self) {
        for worker in self.calibrate_workers.values() {
            worker.close();
        }
        if !self.calibrate_workers.is_empty() {
            log::info!(
                "Work Distributor: Closed {} calibrate workers.",
                self.calibrate_workers.len()
            );
        }
        self.calibrate_workers.clear();
        self.calibrate_worker_ids.clear();
        self.calibration_worker_lut.clear();
    }

    fn stop_all(&mut self) {
        self.stop_corner_workers();
        self.stop_calibrate_workers();
        self.jobs.clear();
        self.media_streams.clear();
    }

    fn all_images_counted(&self) -> bool {
        self.jobs.values().all(Job::all_images_counted)
    }

    fn ensure_pools(&self) -> Result<()> {
        if self.corner_workers.is_empty() || self.calibrate_workers.is_empty() {
            log::error!("Work Distributor: Both worker pools must be running to accept a job.");
            return Err(CalibratorError::NoWorkers);
        }
        Ok(())
    }

    fn remove_job(&mut self, job_id: JobId) -> Option<Job> {
        let job = self.jobs.remove(&job_id)?;
        for id in &job.info.calibration_ids {
            self.calibration_worker_lut.remove(id);
        }
        self.media_streams.remove(&job_id);
        Some(job)
    }

    fn insert_stream(
        &mut self,
        unit: MediaStreamWorkUnit,
        source: Arc<dyn FrameSource>,
        debug: bool,
    ) -> Result<()> {
        let job_id = unit.base.job_id;
        if self.media_streams.contains_key(&job_id) {
            log::error!(
                "Work Distributor: (FATAL) Media stream job {} is already registered.",
                job_id
            );
            return Err(CalibratorError::StreamAlreadyRegistered(job_id));
        }

        if debug {
            log::debug!("Work Distributor: {}: Queued media stream for calibration.", unit.base);
        }
        self.media_streams.insert(job_id, MediaStream::new(unit, source));
        Ok(())
    }

    fn queue_corner_input(&mut self, input: CornerFinderInput) -> bool {
        let Some(id) = least_loaded(&mut self.corner_worker_ids, &self.corner_workers) else {
            log::error!("Work Distributor: No corner finder workers are running.");
            return false;
        };
        let Some(worker) = self.corner_workers.get(&id) else {
            log::error!("Work Distributor: No corner finder worker registered with ID: {}.", id);
            return false;
        };
        worker.queue(input);
        true
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.state.get_mut().stop_all();
    }
}

/// Weak back-reference handed to workers as their output sink.
#[derive(Clone)]
struct DistributorLink(Weak<Shared>);

impl DistributorLink {
    fn upgrade(&self) -> Option<WorkDistributor> {
        self.0.upgrade().map(|shared| WorkDistributor { shared })
    }
}

impl CalibrationPointsSink for DistributorLink {
    fn send_calibration_points(&self, unit: CalibrationPointsWorkUnit) {
        if let Some(distributor) = self.upgrade() {
            distributor.queue_calibrate_work_unit(unit);
        }
    }
}

impl CalibrationResultSink for DistributorLink {
    fn send_calibration_result(&self, result: CalibrationResult) {
        if let Some(distributor) = self.upgrade() {
            distributor.queue_calibration_result(result);
        }
    }
}

impl WorkDistributor {
    pub fn new(context: WorkerContext) -> Self {
        Self {
            shared: Arc::new(Shared {
                context,
                events: EventQueue::new(),
                state: Mutex::new(DistributorState::new()),
            }),
        }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.shared.context
    }

    fn link(&self) -> DistributorLink {
        DistributorLink(Arc::downgrade(&self.shared))
    }

    /// Tear the pools down once every job has finished.
    pub fn set_auto_shutdown(&self, enabled: bool) {
        self.shared.state.lock().auto_shutdown = enabled;
    }

    pub fn set_max_worker_threads(&self, max: usize) {
        self.shared.state.lock().max_worker_threads = max;
    }

    /// Start `corner_workers` corner finders and `calibrate_workers` calibrators.
    pub fn prepare_workers(&self, corner_workers: usize, calibrate_workers: usize) -> Result<()> {
        let mut state = self.shared.state.lock();

        let requested = state.worker_count() + corner_workers + calibrate_workers;
        if requested > state.max_worker_threads {
            log::error!(
                "Work Distributor: Cannot run {} workers, the limit is {}.",
                requested,
                state.max_worker_threads
            );
            return Err(CalibratorError::InvalidParameters(format!(
                "{} workers requested, at most {} may run",
                requested, state.max_worker_threads
            )));
        }

        for _ in 0..corner_workers {
            let worker = Worker::spawn(CornerFinder::new(Arc::new(self.link())), &self.shared.context)?;
            log::info!("Work Distributor: Started corner finder worker: {}.", worker.id());
            state.corner_worker_ids.push(worker.id());
            state.corner_workers.insert(worker.id(), worker);
        }

        for _ in 0..calibrate_workers {
            let worker = Worker::spawn(Calibrate::new(Arc::new(self.link())), &self.shared.context)?;
            log::info!("Work Distributor: Started calibrate worker: {}.", worker.id());
            state.calibrate_worker_ids.push(worker.id());
            state.calibrate_workers.insert(worker.id(), worker);
        }

        Ok(())
    }

    /// Register a job with one calibration per entry of `expected_image_counts`.
    pub fn register_job(
        &self,
        expected_image_counts: &[usize],
        expected_result_count: usize,
        job_type: JobType,
        receiver: Arc<dyn EventReceiver>,
        calibration: CalibrationParameters,
    ) -> JobInfo {
        let job = new_job(
            expected_image_counts,
            expected_result_count,
            job_type,
            receiver,
            calibration,
        );
        let info = job.info.clone();
        self.shared.state.lock().jobs.insert(info.job_id, job);
        info
    }

    /// Register a job and queue all of its images in one step.
    ///
    /// Fails with [`CalibratorError::NoWorkers`] and leaves no job behind if
    /// either pool is empty. `units` builds the corner finder inputs once the
    /// job and calibration IDs exist.
    pub fn submit_job(
        &self,
        expected_image_counts: &[usize],
        job_type: JobType,
        receiver: Arc<dyn EventReceiver>,
        calibration: CalibrationParameters,
        units: impl FnOnce(&JobInfo) -> Vec<CornerFinderInput>,
    ) -> Result<JobInfo> {
        let mut state = self.shared.state.lock();
        state.ensure_pools()?;

        let job = new_job(
            expected_image_counts,
            expected_image_counts.len(),
            job_type,
            receiver,
            calibration,
        );
        let info = job.info.clone();
        state.jobs.insert(info.job_id, job);

        for input in units(&info) {
            if !state.queue_corner_input(input) {
                state.remove_job(info.job_id);
                return Err(CalibratorError::NoWorkers);
            }
        }
        Ok(info)
    }

    /// Register a continuous job and its media stream in one step.
    pub fn submit_stream_job(
        &self,
        expected_snapshot_count: usize,
        receiver: Arc<dyn EventReceiver>,
        calibration: CalibrationParameters,
        source: Arc<dyn FrameSource>,
        unit: impl FnOnce(&JobInfo) -> MediaStreamWorkUnit,
    ) -> Result<JobInfo> {
        let mut state = self.shared.state.lock();
        state.ensure_pools()?;

        let job = new_job(
            &[expected_snapshot_count],
            1,
            JobType::Continuous,
            receiver,
            calibration,
        );
        let info = job.info.clone();
        state.insert_stream(unit(&info), source, self.shared.context.debug())?;
        state.jobs.insert(info.job_id, job);
        Ok(info)
    }

    /// Hand an image file to the least-loaded corner finder.
    pub fn queue_texture_file_work_unit(&self, unit: TextureFileWorkUnit) -> bool {
        if self.shared.context.debug() {
            log::debug!(
                "Work Distributor: {}: Queuing texture file \"{}\".",
                unit.base,
                unit.path.display()
            );
        }
        self.shared
            .state
            .lock()
            .queue_corner_input(CornerFinderInput::TextureFile(unit))
    }

    /// Hand an in-memory image to the least-loaded corner finder.
    pub fn queue_pixel_array_work_unit(&self, unit: PixelArrayWorkUnit) -> bool {
        if self.shared.context.debug() {
            log::debug!(
                "Work Distributor: {}: Queuing pixel array of resolution ({}, {}).",
                unit.base,
                unit.image.width(),
                unit.image.height()
            );
        }
        self.shared
            .state
            .lock()
            .queue_corner_input(CornerFinderInput::PixelArray(unit))
    }

    /// Route a corner set to the calibrate worker bound to its calibration,
    /// count it, and latch the worker once every expected image has arrived.
    pub fn queue_calibrate_work_unit(&self, unit: CalibrationPointsWorkUnit) {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        if state.calibrate_workers.is_empty() {
            log::error!("Work Distributor: No calibrate workers are running.");
            return;
        }

        let job_id = unit.base.job_id;
        let calibration_id = unit.base.calibration_id;

        let Some(job) = state.jobs.get_mut(&job_id) else {
            log::error!("Work Distributor: No registered job with ID: {}.", job_id);
            return;
        };
        let Some(counts) = job.image_counts.get_mut(&calibration_id) else {
            log::error!(
                "Work Distributor: Job {} has no calibration with ID: {}.",
                job_id,
                calibration_id
            );
            return;
        };
        if counts.is_complete() {
            log::warn!(
                "Work Distributor: {}: All {} images were already counted, ignoring extra corner set.",
                unit.base,
                counts.expected
            );
            return;
        }

        let worker_id = match state.calibration_worker_lut.get(&calibration_id) {
            Some(id) => *id,
            None => {
                let Some(id) =
                    least_loaded(&mut state.calibrate_worker_ids, &state.calibrate_workers)
                else {
                    log::error!("Work Distributor: No calibrate worker IDs are registered.");
                    return;
                };
                state.calibration_worker_lut.insert(calibration_id, id);
                id
            }
        };

        let Some(worker) = state.calibrate_workers.get(&worker_id) else {
            log::error!(
                "Work Distributor: No calibrate worker registered with ID: {}.",
                worker_id
            );
            return;
        };

        let latch = CalibrateLatch {
            base: unit.base.clone(),
            calibration: job.calibration.clone(),
            resize: unit.resize,
        };
        worker.queue(CalibrateInput::Points(unit));

        if !counts.increment() {
            return;
        }

        if self.shared.context.debug() {
            log::debug!(
                "Work Distributor: {}: All {} images counted, latching calibrate worker {}.",
                latch.base,
                counts.expected,
                worker_id
            );
        }
        worker.queue(CalibrateInput::Latch(latch));

        if state.auto_shutdown && !state.corner_workers.is_empty() && state.all_images_counted() {
            log::info!("Work Distributor: Every image has been processed, closing corner finders.");
            state.stop_corner_workers();
        }
    }

    /// Deliver a result to its job and finish the job when complete.
    pub fn queue_calibration_result(&self, result: CalibrationResult) {
        let mut state = self.shared.state.lock();
        let job_id = result.base.job_id;

        let Some(job) = state.jobs.get_mut(&job_id) else {
            log::error!(
                "Work Distributor: Received a result for unknown job with ID: {}.",
                job_id
            );
            return;
        };

        self.shared.events.push_result(Arc::clone(&job.receiver), result);
        if !job.record_result() {
            return;
        }

        let Some(job) = state.remove_job(job_id) else {
            return;
        };
        self.shared
            .events
            .push_job_finished(job.receiver, job.info, job.start_time.elapsed());

        if state.auto_shutdown && state.jobs.is_empty() {
            log::info!("Work Distributor: All jobs finished, shutting down workers.");
            state.stop_all();
        }
    }

    /// Track a streaming job. Registering the same job twice is a caller bug.
    pub fn queue_media_stream_work_unit(
        &self,
        unit: MediaStreamWorkUnit,
        source: Arc<dyn FrameSource>,
    ) -> Result<()> {
        self.shared
            .state
            .lock()
            .insert_stream(unit, source, self.shared.context.debug())
    }

    /// Take a snapshot from every stream whose interval has elapsed.
    pub fn poll_media_streams(&self) -> usize {
        self.poll_media_streams_at(Instant::now())
    }

    /// [`Self::poll_media_streams`] against an explicit clock.
    pub fn poll_media_streams_at(&self, now: Instant) -> usize {
        let due: Vec<(JobId, Arc<dyn FrameSource>)> = {
            let state = self.shared.state.lock();
            state
                .media_streams
                .iter()
                .filter(|(_, stream)| stream.is_due(now))
                .map(|(id, stream)| (*id, stream.source()))
                .collect()
        };

        // Capture outside the lock; a slow source must not stall dispatch.
        let frames: Vec<(JobId, RgbaImage)> = due
            .into_iter()
            .filter_map(|(id, source)| source.capture_frame().map(|frame| (id, frame)))
            .collect();

        let mut state = self.shared.state.lock();
        let mut queued = 0;
        for (job_id, frame) in frames {
            let Some(stream) = state.media_streams.get(&job_id) else {
                continue;
            };
            let unit = stream.snapshot_unit(frame);
            if !state.queue_corner_input(CornerFinderInput::PixelArray(unit)) {
                continue;
            }
            queued += 1;

            let Some(stream) = state.media_streams.get_mut(&job_id) else {
                continue;
            };
            if stream.record_snapshot(now) {
                log::info!(
                    "Work Distributor: {}: Took all {} snapshots, releasing media stream.",
                    stream.unit.base,
                    stream.snapshots_taken()
                );
                state.media_streams.remove(&job_id);
            }
        }
        queued
    }

    /// Deliver queued results and job completions on the calling thread.
    pub fn poll(&self) -> PollSummary {
        self.shared.events.poll()
    }

    pub fn stop_background_workers(&self) {
        log::info!("Work Distributor: Stopping all background workers.");
        self.shared.state.lock().stop_all();
    }

    pub fn stop_find_corner_workers(&self) {
        self.shared.state.lock().stop_corner_workers();
    }

    pub fn stop_calibration_workers(&self) {
        self.shared.state.lock().stop_calibrate_workers();
    }

    pub fn corner_worker_count(&self) -> usize {
        self.shared.state.lock().corner_workers.len()
    }

    pub fn calibrate_worker_count(&self) -> usize {
        self.shared.state.lock().calibrate_workers.len()
    }

    pub fn job_count(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }

    pub fn has_job(&self, job_id: JobId) -> bool {
        self.shared.state.lock().jobs.contains_key(&job_id)
    }

    /// Calibrate worker a calibration is bound to, if any.
    pub fn calibration_worker(&self, calibration_id: CalibrationId) -> Option<WorkerId> {
        self.shared
            .state
            .lock()
            .calibration_worker_lut
            .get(&calibration_id)
            .copied()
    }

    pub fn media_stream_count(&self) -> usize {
        self.shared.state.lock().media_streams.len()
    }

    /// Current (expected, counted) images for a calibration.
    pub fn image_counts(&self, job_id: JobId, calibration_id: CalibrationId) -> Option<(usize, usize)> {
        self.shared
            .state
            .lock()
            .jobs
            .get(&job_id)
            .and_then(|job| job.image_counts.get(&calibration_id))
            .map(|counts| (counts.expected, counts.current))
    }
}
