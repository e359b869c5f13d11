//! Caller-side event delivery.
//!
//! Workers finish on their own threads; the distributor pushes results and
//! job completions into an [`EventQueue`], and the caller drains it with
//! [`EventQueue::poll`] so [`EventReceiver`] callbacks run on the caller's thread.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::job::JobInfo;
use crate::result::CalibrationResult;

/// Callbacks for one job's owner.
pub trait EventReceiver: Send + Sync {
    fn on_calibration_result(&self, result: &CalibrationResult);
    fn on_job_finished(&self, job: &JobInfo);
}

/// Queued event paired with the receiver it is addressed to.
pub enum OutputEvent {
    CalibrationResult {
        receiver: Arc<dyn EventReceiver>,
        result: CalibrationResult,
    },
    JobFinished {
        receiver: Arc<dyn EventReceiver>,
        job: JobInfo,
        elapsed: Duration,
    },
}

/// What one [`EventQueue::poll`] call delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub results: usize,
    pub finished_jobs: usize,
}

/// Multi-producer queue drained on the caller's thread.
#[derive(Clone)]
pub struct EventQueue {
    tx: Sender<OutputEvent>,
    rx: Receiver<OutputEvent>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn push_result(&self, receiver: Arc<dyn EventReceiver>, result: CalibrationResult) {
        let _ = self.tx.send(OutputEvent::CalibrationResult { receiver, result });
    }

    pub fn push_job_finished(&self, receiver: Arc<dyn EventReceiver>, job: JobInfo, elapsed: Duration) {
        let _ = self.tx.send(OutputEvent::JobFinished {
            receiver,
            job,
            elapsed,
        });
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Deliver every queued event (non-blocking).
    pub fn poll(&self) -> PollSummary {
        let mut summary = PollSummary::default();
        while let Ok(event) = self.rx.try_recv() {
            match event {
                OutputEvent::CalibrationResult { receiver, result } => {
                    receiver.on_calibration_result(&result);
                    summary.results += 1;
                }
                OutputEvent::JobFinished {
                    receiver,
                    job,
                    elapsed,
                } => {
                    log::info!(
                        "Job {} finished in {:.2}s ({} calibrations)",
                        job.job_id,
                        elapsed.as_secs_f64(),
                        job.calibration_ids.len()
                    );
                    receiver.on_job_finished(&job);
                    summary.finished_jobs += 1;
                }
            }
        }
        summary
    }
}

/// Event forwarded by [`ChannelEventReceiver`].
#[derive(Debug, Clone)]
pub enum ReceivedEvent {
    CalibrationResult(CalibrationResult),
    JobFinished(JobInfo),
}

/// Receiver that forwards callbacks into a channel.
pub struct ChannelEventReceiver {
    tx: Sender<ReceivedEvent>,
}

impl ChannelEventReceiver {
    pub fn new() -> (Arc<Self>, Receiver<ReceivedEvent>) {
        let (tx, rx) = unbounded();
        (Arc::new(Self { tx }), rx)
    }
}

impl EventReceiver for ChannelEventReceiver {
    fn on_calibration_result(&self, result: &CalibrationResult) {
        let _ = self.tx.send(ReceivedEvent::CalibrationResult(result.clone()));
    }

    fn on_job_finished(&self, job: &JobInfo) {
        let _ = self.tx.send(ReceivedEvent::JobFinished(job.clone()));
    }
}
