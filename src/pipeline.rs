//! Stage drivers used by the command line.
//!
//! Stages run strictly one after another; each one materializes its output
//! on disk before the next starts. Two runs must not share an output folder.

use log::{error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{LabelTarget, PipelineConfig, SplitPolicy};
use crate::consolidate::{
    consolidate, read_consolidated_ground_truth, write_consolidated_ground_truth,
    ConsolidationReport,
};
use crate::error::{DatasetError, Result};
use crate::labels::{
    encode_consolidated_labels, encode_labels, encode_source_labels, LabelLayout, LabelPolicy,
};
use crate::split::{
    build_global_manifest, build_per_source_manifest, output_suffix, write_split, SplitOutputs,
};
use crate::types::ObjectSource;
use crate::utils::count_images;
use crate::verify::{verify, VerificationReport};

/// Locations of the inputs and outputs under one dataset root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetPaths {
    pub root: PathBuf,
    /// Folder holding `<id>/rgb` and `<id>/gt.yml`.
    pub data_dir: PathBuf,
    pub consolidated_dir: PathBuf,
    pub consolidated_gt: PathBuf,
}

impl DatasetPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            data_dir: root.join("data"),
            consolidated_dir: root.join("consolidated"),
            consolidated_gt: root.join("consolidated_gt.yml"),
        }
    }

    pub fn with_consolidated_dir(mut self, dir: Option<&Path>) -> Self {
        if let Some(dir) = dir {
            self.consolidated_dir = dir.to_path_buf();
        }
        self
    }

    pub fn with_consolidated_gt(mut self, path: Option<&Path>) -> Self {
        if let Some(path) = path {
            self.consolidated_gt = path.to_path_buf();
        }
        self
    }
}

/// Consolidate the sources and write the consolidated ground truth.
pub fn run_consolidation(config: &PipelineConfig, paths: &DatasetPaths) -> Result<ConsolidationReport> {
    info!(
        "Consolidating {} into {}",
        paths.data_dir.display(),
        paths.consolidated_dir.display()
    );
    let report = consolidate(config, &paths.data_dir, &paths.consolidated_dir)?;
    write_consolidated_ground_truth(&report.corpus, &paths.consolidated_gt)?;

    report.stats.print_summary();
    info!(
        "Images: {}, annotated frames: {}, frames without annotation: {}",
        report.image_count,
        report.annotation_count(),
        report.index_divergence()
    );
    Ok(report)
}

/// Verify the consolidated folder, optionally saving the report as JSON.
pub fn run_verification(
    config: &PipelineConfig,
    paths: &DatasetPaths,
    report_path: Option<&Path>,
) -> Result<VerificationReport> {
    let report = verify(config, &paths.data_dir, &paths.consolidated_dir)?;
    report.log_findings();
    if let Some(report_path) = report_path {
        report.write_json(report_path)?;
        info!("Verification report written to {}", report_path.display());
    }
    Ok(report)
}

/// Encode labels for the chosen corpus and return how many files were written.
pub fn run_labels(
    config: &PipelineConfig,
    paths: &DatasetPaths,
    target: LabelTarget,
    all_objects: bool,
) -> Result<usize> {
    match target {
        LabelTarget::Sources => {
            let summaries = encode_source_labels(config, &paths.data_dir, all_objects)?;
            Ok(summaries.iter().map(|(_, summary)| summary.written).sum())
        }
        LabelTarget::Consolidated => {
            let ground_truth = read_consolidated_ground_truth(&paths.consolidated_gt)?;
            let summary = encode_labels(
                &ground_truth,
                &LabelLayout::for_consolidated(&paths.consolidated_dir),
                config,
                LabelPolicy::AllObjects,
            )?;
            Ok(summary.written)
        }
    }
}

/// Build and write the split for `policy`. The global policy pools
/// `images_dir`; the per-source policy reads the labeled source folders.
pub fn run_split(
    config: &PipelineConfig,
    paths: &DatasetPaths,
    policy: SplitPolicy,
    images_dir: Option<&Path>,
) -> Result<SplitOutputs> {
    let manifest = match policy {
        SplitPolicy::Global => {
            build_global_manifest(config, images_dir.unwrap_or(paths.consolidated_dir.as_path()))?
        }
        SplitPolicy::PerSource => build_per_source_manifest(config, &paths.data_dir)?,
    };
    write_split(&manifest, &paths.root, output_suffix(policy))
}

/// Every stage in order. Returns the detector config path.
///
/// The global policy labels and splits the consolidated folder; the
/// per-source policy labels the source folders (one object per folder) and
/// splits them stratified. Source images are only removed after a clean
/// verification, and never under the per-source policy, whose manifests
/// point into the source folders.
pub fn run_all(
    config: &PipelineConfig,
    paths: &DatasetPaths,
    policy: SplitPolicy,
    remove_sources: bool,
) -> Result<PathBuf> {
    info!("___Data Preparation___");
    let report = run_consolidation(config, paths)?;
    let verification = run_verification(config, paths, None)?;

    match policy {
        SplitPolicy::Global => {
            encode_consolidated_labels(&report.corpus, &paths.consolidated_dir, config)?;
        }
        SplitPolicy::PerSource => {
            encode_source_labels(config, &paths.data_dir, false)?;
        }
    }
    let outputs = run_split(config, paths, policy, None)?;

    if remove_sources {
        match (policy, verification.passed()) {
            (SplitPolicy::PerSource, _) => {
                warn!("Keeping source images: the per-source manifests point into them.")
            }
            (_, false) => warn!("Keeping source images: verification failed."),
            (SplitPolicy::Global, true) => {
                remove_source_images(config, &paths.data_dir);
            }
        }
    }

    info!(
        "Corpus ready: {} consolidated images, config at {}",
        count_images(&paths.consolidated_dir, false),
        outputs.config_path.display()
    );
    Ok(outputs.config_path)
}

/// Delete the `rgb` folder of every non-excluded source. Failures are
/// logged and the remaining folders are still processed. Returns the number
/// of folders removed.
pub fn remove_source_images(config: &PipelineConfig, data_dir: &Path) -> usize {
    info!("Starting deletion of rgb folders within: {}", data_dir.display());
    let mut removed = 0;
    for id in config.active_source_ids() {
        let rgb = ObjectSource::new(data_dir, &id).rgb_dir();
        if !rgb.is_dir() {
            warn!("RGB folder not found for object {} at {}. Skipping.", id, rgb.display());
            continue;
        }
        match fs::remove_dir_all(&rgb) {
            Ok(()) => {
                info!("Successfully deleted: {}", rgb.display());
                removed += 1;
            }
            Err(e) => error!("{}", DatasetError::io(&rgb, e)),
        }
    }
    info!("Finished deleting rgb folders.");
    removed
}
