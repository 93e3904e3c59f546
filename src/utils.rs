use glob::{glob, glob_with, MatchOptions};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{DatasetError, Result};
use crate::types::{get_image_extensions_set, IMG_FORMATS};

/// Create a progress bar with the given length and label
pub fn create_progress_bar(len: u64, label: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    let style = ProgressStyle::default_bar()
        .template(&format!(
            "{{spinner:.green}} [{}] [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} ({{eta}})",
            label
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb
}

/// Prepare an output directory for a full regeneration.
///
/// A non-empty directory is deleted and recreated, an empty one is reused
/// and a missing one is created.
pub fn prepare_output_directory(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        let non_empty = fs::read_dir(path)
            .map_err(|e| DatasetError::io(path, e))?
            .next()
            .is_some();
        if non_empty {
            log::warn!(
                "Directory {:?} is not empty. Deleting and recreating it.",
                path
            );
            fs::remove_dir_all(path)
                .and_then(|_| fs::create_dir_all(path))
                .map_err(|e| DatasetError::io(path, e))?;
        } else {
            log::info!("Directory {:?} exists and is empty.", path);
        }
    } else {
        fs::create_dir_all(path).map_err(|e| DatasetError::io(path, e))?;
    }
    Ok(path.to_path_buf())
}

/// True when the file name carries one of the supported image extensions
/// (case-insensitive).
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| get_image_extensions_set().contains(&ext.to_lowercase()))
}

/// Image entries directly inside `dir`, sorted by file name. Anything that
/// is not a directory counts, so a broken link surfaces when it is read.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| DatasetError::io(dir, e))? {
        let path = entry.map_err(|e| DatasetError::io(dir, e))?.path();
        if !path.is_dir() && is_image_file(&path) {
            images.push(path);
        }
    }
    images.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(images)
}

/// Count image files in `dir`, optionally descending into subfolders.
/// A missing directory counts as zero.
pub fn count_images(dir: &Path, recursive: bool) -> usize {
    if !dir.is_dir() {
        log::error!("Directory not found: {}", dir.display());
        return 0;
    }
    if !recursive {
        return list_images(dir).map(|images| images.len()).unwrap_or(0);
    }
    let options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::new()
    };
    IMG_FORMATS
        .iter()
        .map(|ext| format!("{}/**/*.{}", dir.display(), ext))
        .filter_map(|pattern| glob_with(&pattern, options).ok())
        .flat_map(|paths| paths.filter_map(|entry| entry.ok()))
        .filter(|path| path.is_file())
        .count()
}

/// Count the files with the given extension directly inside `dir`.
pub fn count_files_with_extension(dir: &Path, extension: &str) -> usize {
    let pattern = format!("{}/*.{}", dir.display(), extension);
    match glob(&pattern) {
        Ok(paths) => paths.filter_map(|entry| entry.ok()).count(),
        Err(e) => {
            log::error!("Invalid glob pattern {}: {}", pattern, e);
            0
        }
    }
}

/// Find the image `<dir>/<stem>.<ext>`, extension matched case-insensitively.
/// Lowercase names are tried first, in the order of [`IMG_FORMATS`].
pub fn find_image_by_stem(dir: &Path, stem: &str) -> Option<PathBuf> {
    if let Some(path) = IMG_FORMATS
        .iter()
        .map(|ext| dir.join(format!("{}.{}", stem, ext)))
        .find(|path| path.is_file())
    {
        return Some(path);
    }
    let rank = |path: &Path| {
        let ext = path.extension()?.to_str()?.to_lowercase();
        IMG_FORMATS.iter().position(|format| *format == ext)
    };
    fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.file_stem().is_some_and(|s| s == stem) && path.is_file())
        .filter_map(|path| rank(&path).map(|rank| (rank, path)))
        .min()
        .map(|(_, path)| path)
}

/// Zero-padded frame file stem, e.g. `frame_stem(7, 4) == "0007"`.
pub fn frame_stem(index: usize, digits: usize) -> String {
    format!("{:0width$}", index, width = digits)
}
