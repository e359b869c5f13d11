//! Job registry types.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CalibrationParameters;
use crate::poller::EventReceiver;

/// Unique identifier for a calibration job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates every image of one zoom level within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CalibrationId(pub Uuid);

impl CalibrationId {
    pub fn new() -> Self {
        CalibrationId(Uuid::new_v4())
    }
}

impl Default for CalibrationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CalibrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a job is fed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    /// A fixed set of images submitted up front.
    OneTime,
    /// Snapshots taken from a media stream over time.
    Continuous,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::OneTime => write!(f, "OneTime"),
            JobType::Continuous => write!(f, "Continuous"),
        }
    }
}

/// Correlation handle returned to the caller when a job is registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_type: JobType,
    pub job_id: JobId,
    pub calibration_ids: Vec<CalibrationId>,
}

/// Expected and processed image counts for one calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageCounts {
    pub expected: usize,
    pub current: usize,
}

impl ImageCounts {
    pub fn new(expected: usize) -> Self {
        Self { expected, current: 0 }
    }

    /// Count one more image. Returns `true` only on the increment that reaches
    /// the expected count; increments past that point are ignored.
    pub fn increment(&mut self) -> bool {
        if self.is_complete() {
            return false;
        }
        self.current += 1;
        self.current == self.expected
    }

    pub fn is_complete(&self) -> bool {
        self.current >= self.expected
    }
}

/// A registered job, owned by the distributor.
pub struct Job {
    pub info: JobInfo,
    pub receiver: Arc<dyn EventReceiver>,
    pub calibration: CalibrationParameters,
    pub expected_result_count: usize,
    pub current_result_count: usize,
    pub image_counts: HashMap<CalibrationId, ImageCounts>,
    pub start_time: Instant,
}

impl Job {
    pub fn new(
        info: JobInfo,
        image_counts: &[usize],
        expected_result_count: usize,
        receiver: Arc<dyn EventReceiver>,
        calibration: CalibrationParameters,
    ) -> Self {
        let image_counts = info
            .calibration_ids
            .iter()
            .zip(image_counts)
            .map(|(id, expected)| (*id, ImageCounts::new(*expected)))
            .collect();

        Self {
            info,
            receiver,
            calibration,
            expected_result_count,
            current_result_count: 0,
            image_counts,
            start_time: Instant::now(),
        }
    }

    /// Count one delivered result. Returns `true` when the job just completed.
    pub fn record_result(&mut self) -> bool {
        if self.current_result_count >= self.expected_result_count {
            return false;
        }
        self.current_result_count += 1;
        self.current_result_count == self.expected_result_count
    }

    /// Whether every calibration in this job has seen all of its images.
    pub fn all_images_counted(&self) -> bool {
        self.image_counts.values().all(ImageCounts::is_complete)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("info", &self.info)
            .field("expected_result_count", &self.expected_result_count)
            .field("current_result_count", &self.current_result_count)
            .field("image_counts", &self.image_counts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingReceiver;

    fn job(counts: &[usize], results: usize) -> Job {
        let info = JobInfo {
            job_type: JobType::OneTime,
            job_id: JobId::new(),
            calibration_ids: counts.iter().map(|_| CalibrationId::new()).collect(),
        };
        Job::new(
            info,
            counts,
            results,
            Arc::new(RecordingReceiver::default()),
            CalibrationParameters::default(),
        )
    }

    #[test]
    fn test_image_counts_reach_expected_once() {
        let mut counts = ImageCounts::new(3);
        assert!(!counts.increment());
        assert!(!counts.increment());
        assert!(counts.increment());
        assert!(!counts.increment());
        assert_eq!(counts.current, 3);
    }

    #[test]
    fn test_result_count_never_exceeds_expected() {
        let mut job = job(&[2, 2], 2);
        assert!(!job.record_result());
        assert!(job.record_result());
        assert!(!job.record_result());
        assert_eq!(job.current_result_count, 2);
    }

    #[test]
    fn test_all_images_counted() {
        let mut job = job(&[1, 2], 2);
        let ids = job.info.calibration_ids.clone();
        assert!(!job.all_images_counted());

        job.image_counts.get_mut(&ids[0]).unwrap().increment();
        job.image_counts.get_mut(&ids[1]).unwrap().increment();
        assert!(!job.all_images_counted());

        job.image_counts.get_mut(&ids[1]).unwrap().increment();
        assert!(job.all_images_counted());
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
        assert_ne!(CalibrationId::new(), CalibrationId::new());
    }
}
