//! Background workers.
//!
//! Every worker runs the same scheduling loop on its own named thread: block
//! on a condvar until work is queued or the worker is closed, take a batch
//! under the worker's private lock, then process the batch with the lock
//! released. What a worker queues and how it processes a batch is supplied
//! by a [`WorkerBehavior`].
//!
//! - [`corner_finder::CornerFinder`] detects checkerboard corners per image.
//! - [`calibrate::Calibrate`] merges corner sets and solves the lens.

pub mod calibrate;
pub mod corner_finder;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::error::{CalibratorError, Result};
use crate::result::CalibrationResult;
use crate::vision::VisionLibrary;
use crate::work_unit::CalibrationPointsWorkUnit;

pub use calibrate::{Calibrate, CalibrateInput};
pub use corner_finder::{CornerFinder, CornerFinderInput};

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        WorkerId(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two worker pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    CornerFinder,
    Calibrate,
}

impl WorkerKind {
    fn thread_prefix(self) -> &'static str {
        match self {
            WorkerKind::CornerFinder => "corner-finder",
            WorkerKind::Calibrate => "calibrate",
        }
    }
}

/// Something that can be woken when a token is cancelled.
pub trait Wake: Send + Sync {
    fn wake(&self);
}

/// Shared "stop everything" signal.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    listeners: Mutex<Vec<Weak<dyn Wake>>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancel and wake every registered listener. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let listeners: Vec<_> = self.inner.listeners.lock().drain(..).collect();
        for listener in listeners.iter().filter_map(Weak::upgrade) {
            listener.wake();
        }
    }

    /// Register a listener; it is woken at once if already cancelled.
    pub fn register(&self, listener: Weak<dyn Wake>) {
        if self.is_cancelled() {
            if let Some(listener) = listener.upgrade() {
                listener.wake();
            }
            return;
        }
        let mut listeners = self.inner.listeners.lock();
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(listener);
    }
}

/// Live worker threads per pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunningWorkers {
    pub corner_finders: usize,
    pub calibrators: usize,
}

impl RunningWorkers {
    pub fn total(&self) -> usize {
        self.corner_finders + self.calibrators
    }

    fn slot(&mut self, kind: WorkerKind) -> &mut usize {
        match kind {
            WorkerKind::CornerFinder => &mut self.corner_finders,
            WorkerKind::Calibrate => &mut self.calibrators,
        }
    }
}

/// Application-owned state shared by every worker of a distributor.
#[derive(Clone)]
pub struct WorkerContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    token: CancellationToken,
    vision: Arc<dyn VisionLibrary>,
    output_root: PathBuf,
    debug: AtomicBool,
    running: Mutex<RunningWorkers>,
    running_changed: Condvar,
}

impl WorkerContext {
    pub fn new(vision: Arc<dyn VisionLibrary>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                token: CancellationToken::new(),
                vision,
                output_root: output_root.into(),
                debug: AtomicBool::new(false),
                running: Mutex::new(RunningWorkers::default()),
                running_changed: Condvar::new(),
            }),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub fn vision(&self) -> &dyn VisionLibrary {
        self.inner.vision.as_ref()
    }

    pub fn output_root(&self) -> &Path {
        &self.inner.output_root
    }

    pub fn debug(&self) -> bool {
        self.inner.debug.load(Ordering::Relaxed)
    }

    pub fn set_debug(&self, debug: bool) {
        self.inner.debug.store(debug, Ordering::Relaxed);
    }

    /// Signal every worker sharing this context to exit. Terminal for the context.
    pub fn shutdown_all(&self) {
        log::warn!("Shutting down all workers");
        self.inner.token.cancel();
    }

    pub fn should_exit_all(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn running_workers(&self) -> RunningWorkers {
        *self.inner.running.lock()
    }

    pub fn workers_running(&self) -> bool {
        self.running_workers().total() > 0
    }

    /// Block until every worker thread has exited. Returns `false` on timeout.
    pub fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut running = self.inner.running.lock();
        while running.total() > 0 {
            if self
                .inner
                .running_changed
                .wait_until(&mut running, deadline)
                .timed_out()
            {
                return running.total() == 0;
            }
        }
        true
    }

    /// Directory for a worker's debug artifacts.
    pub fn worker_output_dir(&self, id: WorkerId) -> PathBuf {
        self.inner
            .output_root
            .join("CalibrationVisualizations")
            .join(format!("Worker-{}", id))
    }

    fn count_worker(&self, kind: WorkerKind) {
        *self.inner.running.lock().slot(kind) += 1;
        self.inner.running_changed.notify_all();
    }

    fn uncount_worker(&self, kind: WorkerKind) {
        {
            let mut running = self.inner.running.lock();
            let slot = running.slot(kind);
            *slot = slot.saturating_sub(1);
        }
        self.inner.running_changed.notify_all();
    }
}

/// Receives detected corner sets from corner finder workers.
pub trait CalibrationPointsSink: Send + Sync {
    fn send_calibration_points(&self, unit: CalibrationPointsWorkUnit);
}

/// Receives solved results from calibrate workers.
pub trait CalibrationResultSink: Send + Sync {
    fn send_calibration_result(&self, result: CalibrationResult);
}

/// What a worker queues and how it processes one batch.
pub trait WorkerBehavior: Send + Sync + 'static {
    type Input: Send + 'static;
    type Queue: Default + Send + 'static;
    type Batch: Send + 'static;

    const KIND: WorkerKind;

    fn enqueue(queue: &mut Self::Queue, input: Self::Input);

    /// Load used for least-loaded dispatch.
    fn work_load(queue: &Self::Queue) -> usize;

    /// Must agree with [`WorkerBehavior::take`] returning `Some`.
    fn has_work(queue: &Self::Queue) -> bool {
        Self::work_load(queue) > 0
    }

    fn take(queue: &mut Self::Queue) -> Option<Self::Batch>;

    /// Runs on the worker thread without the queue lock held.
    fn process(&self, batch: Self::Batch, scope: &WorkerScope<'_>);
}

/// View of the running worker handed to [`WorkerBehavior::process`].
pub struct WorkerScope<'a> {
    id: WorkerId,
    context: &'a WorkerContext,
    closing: &'a AtomicBool,
    output_dir: &'a Path,
}

impl WorkerScope<'_> {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn vision(&self) -> &dyn VisionLibrary {
        self.context.vision()
    }

    pub fn debug(&self) -> bool {
        self.context.debug()
    }

    pub fn output_dir(&self) -> &Path {
        self.output_dir
    }

    /// Closed by its owner or by a context-wide shutdown.
    pub fn should_exit(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.context.should_exit_all()
    }
}

struct WorkerShared<B: WorkerBehavior> {
    id: WorkerId,
    behavior: B,
    queue: Mutex<B::Queue>,
    work_available: Condvar,
    closing: AtomicBool,
    context: WorkerContext,
    output_dir: PathBuf,
}

impl<B: WorkerBehavior> WorkerShared<B> {
    fn should_exit(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.context.should_exit_all()
    }
}

impl<B: WorkerBehavior> Wake for WorkerShared<B> {
    fn wake(&self) {
        let _queue = self.queue.lock();
        self.work_available.notify_all();
    }
}

/// Handle to a running worker. Cloning shares the same worker.
pub struct Worker<B: WorkerBehavior> {
    shared: Arc<WorkerShared<B>>,
}

impl<B: WorkerBehavior> Clone for Worker<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: WorkerBehavior> Worker<B> {
    /// Start a worker thread running `behavior`.
    pub fn spawn(behavior: B, context: &WorkerContext) -> Result<Self> {
        let id = WorkerId::new();
        let shared = Arc::new(WorkerShared {
            id,
            behavior,
            queue: Mutex::new(B::Queue::default()),
            work_available: Condvar::new(),
            closing: AtomicBool::new(false),
            context: context.clone(),
            output_dir: context.worker_output_dir(id),
        });

        let listener: Weak<dyn Wake> = Arc::downgrade(&shared) as Weak<dyn Wake>;
        context.token().register(listener);

        context.count_worker(B::KIND);
        let thread_shared = Arc::clone(&shared);
        let short_id: String = id.to_string().chars().take(8).collect();
        std::thread::Builder::new()
            .name(format!("{}-{}", B::KIND.thread_prefix(), short_id))
            .spawn(move || run(thread_shared))
            .map_err(|e| {
                context.uncount_worker(B::KIND);
                CalibratorError::ThreadSpawn(e.to_string())
            })?;

        Ok(Self { shared })
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    pub fn work_load(&self) -> usize {
        B::work_load(&self.shared.queue.lock())
    }

    /// Queue input and wake the worker.
    pub fn queue(&self, input: B::Input) {
        let mut queue = self.shared.queue.lock();
        B::enqueue(&mut queue, input);
        self.shared.work_available.notify_one();
    }

    /// Ask the worker to exit after its current batch. Does not block.
    pub fn close(&self) {
        self.shared.closing.store(true, Ordering::Release);
        self.shared.wake();
    }

    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    pub fn output_dir(&self) -> &Path {
        &self.shared.output_dir
    }
}

/// Uncounts the worker however the thread ends.
struct RunningGuard {
    id: WorkerId,
    kind: WorkerKind,
    context: WorkerContext,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            log::error!("Worker ({}): panicked while processing work", self.id);
        }
        log::info!("Worker ({}): exited", self.id);
        self.context.uncount_worker(self.kind);
    }
}

fn run<B: WorkerBehavior>(shared: Arc<WorkerShared<B>>) {
    let _guard = RunningGuard {
        id: shared.id,
        kind: B::KIND,
        context: shared.context.clone(),
    };
    log::info!("Worker ({}): started {:?} worker", shared.id, B::KIND);

    let scope = WorkerScope {
        id: shared.id,
        context: &shared.context,
        closing: &shared.closing,
        output_dir: &shared.output_dir,
    };

    loop {
        let batch = {
            let mut queue = shared.queue.lock();
            while !shared.should_exit() && !B::has_work(&queue) {
                shared.work_available.wait(&mut queue);
            }
            if shared.should_exit() {
                break;
            }
            B::take(&mut queue)
        };

        if let Some(batch) = batch {
            shared.behavior.process(batch, &scope);
        }
    }
}
