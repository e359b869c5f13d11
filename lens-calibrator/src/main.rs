//! Lens Calibrator
//!
//! Calibrates one lens per folder of checkerboard images and prints the
//! solved intrinsics as JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use lens_calibrator::config::{default_output_root, SolverConfig};
use lens_calibrator::export::validate_folder;
use lens_calibrator::media_stream::FolderFrameSource;
use lens_calibrator::poller::{ChannelEventReceiver, ReceivedEvent};
use lens_calibrator::telemetry::{init_logging, LogConfig};
use lens_calibrator::vision::VisionLibrary;
use lens_calibrator::{LensSolver, TextureFolderZoomPair};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Checkerboard lens calibration.
#[derive(Debug, Parser)]
#[command(author, version, about = "Multi-image checkerboard lens calibration")]
struct Args {
    /// Image folders, each optionally followed by `@ZOOM` with ZOOM in [0, 1].
    #[arg(value_name = "FOLDER[@ZOOM]")]
    folders: Vec<String>,

    /// JSON solver configuration. Defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of corner finder workers.
    #[arg(long)]
    corner_workers: Option<usize>,

    /// Number of calibrate workers.
    #[arg(long)]
    calibrate_workers: Option<usize>,

    /// Root folder for results and visualizations.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Write every solved calibration to a JSON file.
    #[arg(long)]
    write_results: bool,

    /// Verbose worker logging.
    #[arg(long)]
    debug: bool,

    /// Additionally calibrate from the newest image in this folder, sampled
    /// on the configured snapshot schedule.
    #[arg(long)]
    stream_folder: Option<PathBuf>,
}

#[cfg(feature = "opencv")]
fn vision_backend() -> anyhow::Result<Arc<dyn VisionLibrary>> {
    Ok(Arc::new(lens_calibrator::vision::OpenCvVision::new()))
}

#[cfg(not(feature = "opencv"))]
fn vision_backend() -> anyhow::Result<Arc<dyn VisionLibrary>> {
    bail!("No vision backend is compiled in. Rebuild with `--features opencv`.")
}

/// Split `FOLDER[@ZOOM]`. A suffix that is not a number stays part of the path.
fn parse_folder_arg(arg: &str) -> anyhow::Result<TextureFolderZoomPair> {
    let (path, zoom) = match arg.rsplit_once('@') {
        Some((path, zoom)) => match zoom.parse::<f32>() {
            Ok(zoom) => (path, zoom),
            Err(_) => (arg, 0.0),
        },
        None => (arg, 0.0),
    };

    let folder = std::fs::canonicalize(Path::new(path))
        .with_context(|| format!("Image folder \"{}\" does not exist", path))?;
    Ok(TextureFolderZoomPair::new(folder, zoom))
}

fn load_config(args: &Args) -> anyhow::Result<SolverConfig> {
    let mut config = match &args.config {
        Some(path) => SolverConfig::load(path)
            .with_context(|| format!("Failed to load config \"{}\"", path.display()))?,
        None => SolverConfig::default(),
    };

    if let Some(count) = args.corner_workers {
        config.corner_worker_count = count;
    }
    if let Some(count) = args.calibrate_workers {
        config.calibrate_worker_count = count;
    }
    if let Some(output) = &args.output {
        config.output_root = output.clone();
    }
    if args.write_results {
        config.calibration.write_calibration_result_to_file = true;
    }
    config.debug |= args.debug;

    config.output_root = validate_folder(&config.output_root, &default_output_root())
        .context("Invalid output folder")?;
    Ok(config)
}

fn main() {
    if let Err(err) = try_main() {
        log::error!("{:#}", err);
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}

fn try_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_config = if args.debug {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Logger already initialized: {}", e);
    }

    if args.folders.is_empty() && args.stream_folder.is_none() {
        bail!("Nothing to calibrate; pass at least one image folder or --stream-folder");
    }

    let config = load_config(&args)?;
    let folders = args
        .folders
        .iter()
        .map(|arg| parse_folder_arg(arg))
        .collect::<anyhow::Result<Vec<_>>>()?;

    log::info!("Lens Calibrator starting...");
    let solver = LensSolver::from_config(vision_backend()?, &config);
    solver.start_workers(
        config.corner_worker_count,
        config.calibrate_worker_count,
        config.shut_down_workers_after_completed_tasks,
    )?;

    let (receiver, events) = ChannelEventReceiver::new();
    let mut pending_jobs = 0;

    if !folders.is_empty() {
        let job = solver.process_texture_folders(
            receiver.clone(),
            &folders,
            &config.search,
            &config.calibration,
        )?;
        log::info!("Submitted job {} with {} folders", job.job_id, folders.len());
        pending_jobs += 1;
    }

    if let Some(folder) = &args.stream_folder {
        let job = solver.start_media_stream_calibration(
            receiver.clone(),
            Arc::new(FolderFrameSource::new(folder)),
            &config.search,
            &config.calibration,
            &config.media_stream,
        )?;
        log::info!(
            "Submitted stream job {} sampling \"{}\"",
            job.job_id,
            folder.display()
        );
        pending_jobs += 1;
    }

    let mut failures = 0;
    while pending_jobs > 0 {
        solver.poll();
        while let Ok(event) = events.try_recv() {
            match event {
                ReceivedEvent::CalibrationResult(result) => {
                    if !result.success {
                        failures += 1;
                        log::warn!("Calibration failed for {}", result.base);
                    }
                    println!("{}", serde_json::to_string_pretty(&result.to_record())?);
                }
                ReceivedEvent::JobFinished(_) => pending_jobs -= 1,
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    solver.stop_workers();
    if !solver.context().wait_for_shutdown(SHUTDOWN_TIMEOUT) {
        log::warn!("Workers did not shut down within {:?}", SHUTDOWN_TIMEOUT);
    }
    log::info!("Lens Calibrator exiting");

    if failures > 0 {
        bail!("{} calibrations failed", failures);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_folder_arg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_string_lossy().into_owned();

        let pair = parse_folder_arg(&format!("{}@0.75", path)).unwrap();
        assert_eq!(pair.zoom_level, 0.75);
        assert_eq!(pair.absolute_folder_path, std::fs::canonicalize(dir.path()).unwrap());

        let pair = parse_folder_arg(&path).unwrap();
        assert_eq!(pair.zoom_level, 0.0);
        assert!(pair.use_folder);

        assert!(parse_folder_arg("/does/not/exist@0.5").is_err());
    }

    #[test]
    fn test_cli_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args::parse_from([
            "lens-calibrator",
            "--corner-workers",
            "5",
            "--write-results",
            "--output",
            dir.path().to_str().unwrap(),
            "images@0.5",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.corner_worker_count, 5);
        assert_eq!(config.calibrate_worker_count, 1);
        assert!(config.calibration.write_calibration_result_to_file);
        assert_eq!(config.output_root, dir.path());
        assert_eq!(args.folders, vec!["images@0.5".to_string()]);
    }
}
