//! Media stream snapshot scheduling.
//!
//! A continuous job samples frames from a [`FrameSource`] at a fixed
//! interval and feeds each one into the corner finder pool as a pixel-array
//! unit, until the configured number of snapshots has been taken.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use image::RgbaImage;

use crate::config::{ChessboardSearchParameters, MediaStreamParameters};
use crate::export::image_files_in_folder;
use crate::work_unit::{BaseParameters, PixelArrayWorkUnit};

/// Supplies live frames.
pub trait FrameSource: Send + Sync {
    /// Current frame, or `None` if no frame is available right now.
    fn capture_frame(&self) -> Option<RgbaImage>;
}

/// Parameters of one streamed calibration.
#[derive(Debug, Clone)]
pub struct MediaStreamWorkUnit {
    pub base: BaseParameters,
    pub search: ChessboardSearchParameters,
    pub stream: MediaStreamParameters,
}

/// A registered stream and its snapshot progress.
pub struct MediaStream {
    pub unit: MediaStreamWorkUnit,
    source: Arc<dyn FrameSource>,
    last_snapshot: Option<Instant>,
    snapshots_taken: usize,
}

impl MediaStream {
    pub fn new(unit: MediaStreamWorkUnit, source: Arc<dyn FrameSource>) -> Self {
        Self {
            unit,
            source,
            last_snapshot: None,
            snapshots_taken: 0,
        }
    }

    pub fn source(&self) -> Arc<dyn FrameSource> {
        Arc::clone(&self.source)
    }

    pub fn snapshots_taken(&self) -> usize {
        self.snapshots_taken
    }

    /// The first snapshot is due immediately, later ones once the interval has elapsed.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_snapshot {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.unit.stream.interval(),
        }
    }

    /// Record a queued snapshot. Returns `true` once the expected count is reached.
    pub fn record_snapshot(&mut self, now: Instant) -> bool {
        self.last_snapshot = Some(now);
        self.snapshots_taken += 1;
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.snapshots_taken >= self.unit.stream.expected_stream_snapshot_count
    }

    /// Package a captured frame for the corner finder pool.
    pub fn snapshot_unit(&self, frame: RgbaImage) -> PixelArrayWorkUnit {
        PixelArrayWorkUnit {
            base: self.unit.base.clone(),
            search: self.unit.search.clone(),
            image: frame,
        }
    }
}

/// Frame source reading the most recently written image in a folder, e.g.
/// a capture device's drop directory.
pub struct FolderFrameSource {
    folder: PathBuf,
}

impl FolderFrameSource {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }

    fn newest_image(&self) -> Option<PathBuf> {
        let files = match image_files_in_folder(&self.folder) {
            Ok(files) => files,
            Err(e) => {
                log::warn!("Unable to read frame folder \"{}\": {}", self.folder.display(), e);
                return None;
            }
        };

        files
            .into_iter()
            .max_by_key(|path| modified(path).unwrap_or(SystemTime::UNIX_EPOCH))
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl FrameSource for FolderFrameSource {
    fn capture_frame(&self) -> Option<RgbaImage> {
        let path = self.newest_image()?;
        match image::open(&path) {
            Ok(image) => Some(image.to_rgba8()),
            Err(e) => {
                log::warn!("Unable to load frame \"{}\": {}", path.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CalibrationId, JobId};
    use crate::testing::{base_parameters, test_image};
    use std::time::Duration;

    struct StaticSource;

    impl FrameSource for StaticSource {
        fn capture_frame(&self) -> Option<RgbaImage> {
            Some(test_image())
        }
    }

    fn stream(count: usize, interval: f32) -> MediaStream {
        MediaStream::new(
            MediaStreamWorkUnit {
                base: base_parameters(JobId::new(), CalibrationId::new()),
                search: ChessboardSearchParameters::default(),
                stream: MediaStreamParameters {
                    expected_stream_snapshot_count: count,
                    stream_snapshot_interval_secs: interval,
                    zoom_level: 0.0,
                },
            },
            Arc::new(StaticSource),
        )
    }

    #[test]
    fn test_snapshot_schedule() {
        let mut stream = stream(2, 1.0);
        let start = Instant::now();
        assert!(stream.is_due(start));

        assert!(!stream.record_snapshot(start));
        assert!(!stream.is_due(start + Duration::from_millis(500)));
        assert!(stream.is_due(start + Duration::from_secs(1)));

        assert!(stream.record_snapshot(start + Duration::from_secs(1)));
        assert!(stream.is_complete());
        assert_eq!(stream.snapshots_taken(), 2);
    }

    #[test]
    fn test_snapshot_unit_carries_stream_parameters() {
        let stream = stream(1, 0.0);
        let frame = stream.source().capture_frame().unwrap();
        let unit = stream.snapshot_unit(frame);
        assert_eq!(unit.base, stream.unit.base);
        assert_eq!(unit.image.dimensions(), (64, 48));
    }

    #[test]
    fn test_folder_frame_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = FolderFrameSource::new(dir.path());
        assert!(source.capture_frame().is_none());

        test_image().save(dir.path().join("frame-0.png")).unwrap();
        let frame = source.capture_frame().unwrap();
        assert_eq!(frame.dimensions(), (64, 48));
    }
}
