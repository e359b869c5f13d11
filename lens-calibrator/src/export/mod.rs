//! Export module for calibration artifacts.

use std::path::{Path, PathBuf};

use image::RgbaImage;

use crate::result::CalibrationResult;

/// Extensions accepted when scanning a folder for calibration images.
pub const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "exr"];

/// Writes calibration artifacts to disk.
pub struct CalibrationExporter;

impl CalibrationExporter {
    /// Write the JSON record for one calibration result.
    pub fn export_json(result: &CalibrationResult, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(&result.to_record())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
    }

    /// Write the record to `explicit`, or to the next free
    /// `calibration-result-N.json` inside `folder`. Returns the written path.
    pub fn export_json_indexed(
        result: &CalibrationResult,
        explicit: Option<&Path>,
        folder: &Path,
    ) -> std::io::Result<PathBuf> {
        let path = match explicit {
            Some(path) if !path.as_os_str().is_empty() => path.to_path_buf(),
            _ => generate_indexed_file_path(folder, "calibration-result", "json")?,
        };

        Self::export_json(result, &path)?;
        Ok(path)
    }

    /// Save an RGBA image, creating the parent directory as needed.
    pub fn export_image(image: &RgbaImage, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        image
            .save(path)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

/// First `{folder}/{name}-{index}.{extension}` that does not exist yet.
/// The folder is created if missing.
pub fn generate_indexed_file_path(
    folder: &Path,
    name: &str,
    extension: &str,
) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(folder)?;

    let mut index = 0usize;
    loop {
        let candidate = folder.join(format!("{}-{}.{}", name, index, extension));
        if !candidate.exists() {
            return Ok(candidate);
        }
        index += 1;
    }
}

/// Resolve an output folder: an empty path falls back to `fallback`, a path
/// naming an existing file is rejected, and missing directories are created.
pub fn validate_folder(folder: &Path, fallback: &Path) -> std::io::Result<PathBuf> {
    let folder = if folder.as_os_str().is_empty() {
        fallback
    } else {
        folder
    };

    if folder.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Expected a folder but found a file: {}", folder.display()),
        ));
    }

    std::fs::create_dir_all(folder)?;
    Ok(folder.to_path_buf())
}

/// Calibration images directly inside `folder`, sorted by path.
pub fn image_files_in_folder(folder: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(folder)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_image_file(path))
        .collect();

    files.sort();
    Ok(files)
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}
