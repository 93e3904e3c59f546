//! Cross-check of a consolidated folder against the source folders.
//!
//! The expected `global index -> source file` mapping is recomputed with
//! [`plan_global_index`], so a verification run and a consolidation run over
//! the same inputs always agree on which file should hold which image.

use image::GenericImageView;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use crate::config::PipelineConfig;
use crate::consolidate::{consolidated_file_name, plan_global_index};
use crate::error::{DatasetError, Result};
use crate::utils::count_images;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Fails the verification.
    Hard,
    /// Reported, does not fail the verification.
    Warning,
    Info,
}

/// Pixels per unit from a PNG `pHYs` chunk; `unit == 1` means metre.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PixelDensity {
    pub x: u32,
    pub y: u32,
    pub unit: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    MissingSource {
        source_id: String,
        path: PathBuf,
    },
    MissingFile {
        source: PathBuf,
        expected: PathBuf,
    },
    Unreadable {
        path: PathBuf,
        error: String,
    },
    SizeMismatch {
        source: PathBuf,
        consolidated: PathBuf,
        source_size: (u32, u32),
        consolidated_size: (u32, u32),
    },
    ModeMismatch {
        source: PathBuf,
        consolidated: PathBuf,
        source_mode: String,
        consolidated_mode: String,
    },
    DensityMismatch {
        source: PathBuf,
        consolidated: PathBuf,
        source_density: PixelDensity,
        consolidated_density: PixelDensity,
    },
    UnexpectedFiles {
        expected: usize,
        found: usize,
    },
}

impl Finding {
    pub fn severity(&self) -> Severity {
        match self {
            Finding::MissingSource { .. }
            | Finding::MissingFile { .. }
            | Finding::Unreadable { .. }
            | Finding::SizeMismatch { .. } => Severity::Hard,
            Finding::ModeMismatch { .. } => Severity::Warning,
            Finding::DensityMismatch { .. } | Finding::UnexpectedFiles { .. } => Severity::Info,
        }
    }

    pub fn is_hard(&self) -> bool {
        self.severity() == Severity::Hard
    }
}

/// Itemized outcome of [`verify`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationReport {
    /// Number of source files checked.
    pub checked: usize,
    pub findings: Vec<Finding>,
}

impl VerificationReport {
    /// AND over every hard check; warnings and info never fail a report.
    pub fn passed(&self) -> bool {
        !self.findings.iter().any(Finding::is_hard)
    }

    pub fn hard_failures(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|finding| finding.is_hard())
    }

    pub fn log_findings(&self) {
        for finding in &self.findings {
            match finding.severity() {
                Severity::Hard => error!("Consistency check failed: {:?}", finding),
                Severity::Warning => warn!("Consistency warning: {:?}", finding),
                Severity::Info => info!("Consistency note: {:?}", finding),
            }
        }
        info!(
            "Consistency check completed. Total files expected/processed: {}",
            self.checked
        );
        if self.passed() {
            info!("All image files and metadata are consistent.");
        } else {
            error!(
                "Inconsistencies found between original and processed image files ({} hard failures).",
                self.hard_failures().count()
            );
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| DatasetError::io(path, e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self).map_err(|e| {
            DatasetError::io(path, io::Error::new(io::ErrorKind::Other, e))
        })
    }
}

/// Check every expected consolidated file against its source image.
pub fn verify(
    config: &PipelineConfig,
    data_dir: &Path,
    consolidated_dir: &Path,
) -> Result<VerificationReport> {
    let plan = plan_global_index(config, data_dir)?;
    let mut findings: Vec<Finding> = plan
        .missing
        .iter()
        .map(|source| Finding::MissingSource {
            source_id: source.id.clone(),
            path: source.rgb_dir(),
        })
        .collect();

    let pairs: Vec<(PathBuf, PathBuf)> = plan
        .sources
        .iter()
        .flat_map(|source_plan| source_plan.indexed_images())
        .map(|(index, image)| {
            (
                image.clone(),
                consolidated_dir.join(consolidated_file_name(index, image)),
            )
        })
        .collect();

    let pair_findings: Vec<Vec<Finding>> = pairs
        .par_iter()
        .map(|(source, consolidated)| check_pair(source, consolidated))
        .collect();
    findings.extend(pair_findings.into_iter().flatten());

    let expected = pairs.len();
    let found = count_images(consolidated_dir, false);
    if found > expected {
        findings.push(Finding::UnexpectedFiles { expected, found });
    }

    Ok(VerificationReport {
        checked: expected,
        findings,
    })
}

fn check_pair(source: &Path, consolidated: &Path) -> Vec<Finding> {
    if !consolidated.exists() {
        return vec![Finding::MissingFile {
            source: source.to_path_buf(),
            expected: consolidated.to_path_buf(),
        }];
    }

    let (original, processed) = match (image::open(source), image::open(consolidated)) {
        (Ok(original), Ok(processed)) => (original, processed),
        (Err(e), _) => {
            return vec![Finding::Unreadable {
                path: source.to_path_buf(),
                error: e.to_string(),
            }]
        }
        (_, Err(e)) => {
            return vec![Finding::Unreadable {
                path: consolidated.to_path_buf(),
                error: e.to_string(),
            }]
        }
    };

    let source_size = original.dimensions();
    let consolidated_size = processed.dimensions();
    if source_size != consolidated_size {
        return vec![Finding::SizeMismatch {
            source: source.to_path_buf(),
            consolidated: consolidated.to_path_buf(),
            source_size,
            consolidated_size,
        }];
    }

    // Format conversion may legitimately change the mode (RGBA -> RGB).
    if original.color() != processed.color() {
        return vec![Finding::ModeMismatch {
            source: source.to_path_buf(),
            consolidated: consolidated.to_path_buf(),
            source_mode: format!("{:?}", original.color()),
            consolidated_mode: format!("{:?}", processed.color()),
        }];
    }

    match (png_pixel_density(source), png_pixel_density(consolidated)) {
        (Some(source_density), Some(consolidated_density))
            if source_density != consolidated_density =>
        {
            vec![Finding::DensityMismatch {
                source: source.to_path_buf(),
                consolidated: consolidated.to_path_buf(),
                source_density,
                consolidated_density,
            }]
        }
        _ => {
            debug!("Verified file and metadata: {}", consolidated.display());
            Vec::new()
        }
    }
}

/// Pixel density from the `pHYs` chunk of a PNG file. Files that are not
/// readable PNGs, or carry no `pHYs`, yield `None`.
pub fn png_pixel_density(path: &Path) -> Option<PixelDensity> {
    let file = File::open(path).ok()?;
    let reader = png::Decoder::new(BufReader::new(file)).read_info().ok()?;
    let dims = reader.info().pixel_dims?;
    Some(PixelDensity {
        x: dims.xppu,
        y: dims.yppu,
        unit: match dims.unit {
            png::Unit::Meter => 1,
            png::Unit::Unspecified => 0,
        },
    })
}
